//! Byte encoding of [`PersistedState`].
//!
//! JSON with ordered maps, so the same state always encodes to the same bytes.
//! Loading checks the schema version before anything else and then the shape
//! of the aggregate, so drift is reported here and not at some later use.

use serde_json::Value;

use crate::errors::StateError;
use crate::state::models::{PersistedState, STATE_SCHEMA_VERSION};

#[derive(Debug, Clone, Copy, Default)]
pub struct StateSerializer;

impl StateSerializer {
    pub fn schema_version(&self) -> u32 {
        STATE_SCHEMA_VERSION
    }

    pub fn serialize(&self, state: &PersistedState) -> Result<Vec<u8>, StateError> {
        serde_json::to_vec_pretty(state)
            .map_err(|e| StateError::Format(format!("failed to encode state: {e}")))
    }

    pub fn deserialize(&self, bytes: &[u8]) -> Result<PersistedState, StateError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| StateError::Format(format!("not valid JSON: {e}")))?;

        self.check_version(&value)?;

        let state: PersistedState = serde_json::from_value(value)
            .map_err(|e| StateError::Format(format!("unexpected state shape: {e}")))?;

        validate_shape(&state)?;
        Ok(state)
    }

    fn check_version(&self, value: &Value) -> Result<(), StateError> {
        let found = value
            .get("schema_version")
            .and_then(Value::as_u64)
            .ok_or_else(|| StateError::Format("missing schema_version".to_string()))?;

        let found = u32::try_from(found)
            .map_err(|_| StateError::Format(format!("schema_version {found} out of range")))?;

        if found > STATE_SCHEMA_VERSION {
            return Err(StateError::Version {
                found,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        Ok(())
    }
}

fn validate_shape(state: &PersistedState) -> Result<(), StateError> {
    for (kind, cluster) in &state.clusters {
        if cluster.kind != *kind {
            return Err(StateError::Format(format!(
                "cluster stored under '{kind}' declares kind '{}'",
                cluster.kind
            )));
        }
        if cluster.schema_version > STATE_SCHEMA_VERSION {
            return Err(StateError::Version {
                found: cluster.schema_version,
                supported: STATE_SCHEMA_VERSION,
            });
        }
        if let Some(name) = cluster.duplicate_vm_names().into_iter().next() {
            return Err(StateError::Format(format!(
                "VM name '{name}' appears twice in cluster '{kind}'"
            )));
        }
    }

    let (_, duplicates) = state.scan_allocations();
    if let Some((addr, owners)) = duplicates.into_iter().next() {
        let owners: Vec<String> = owners.iter().map(ToString::to_string).collect();
        return Err(StateError::Format(format!(
            "GPU {addr} is assigned to several VMs: {}",
            owners.join(", ")
        )));
    }

    Ok(())
}
