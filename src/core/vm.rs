use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::gpu::pci::PciAddress;
use crate::state::models::{ClusterKind, VmRole};

/// VM lifecycle state. Exactly one per VM at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Undefined,
    Defining,
    Defined,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Destroying,
    Destroyed,
    Error,
}

impl VmState {
    pub const ALL: [VmState; 12] = [
        VmState::Undefined,
        VmState::Defining,
        VmState::Defined,
        VmState::Starting,
        VmState::Running,
        VmState::Pausing,
        VmState::Paused,
        VmState::Stopping,
        VmState::Stopped,
        VmState::Destroying,
        VmState::Destroyed,
        VmState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Defining => "defining",
            Self::Defined => "defined",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Destroying => "destroying",
            Self::Destroyed => "destroyed",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Destroyed)
    }

    /// States that only exist while a hypervisor call is in flight.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Self::Defining | Self::Starting | Self::Pausing | Self::Stopping | Self::Destroying
        )
    }

    /// The single-step transition table.
    pub fn can_transition_to(&self, next: VmState) -> bool {
        use VmState::*;

        if next == Error {
            return !self.is_terminal() && *self != Error;
        }

        matches!(
            (*self, next),
            (Undefined, Defining)
                | (Defining, Defined)
                | (Defined, Starting)
                | (Starting, Running)
                | (Running, Pausing)
                | (Pausing, Paused)
                // resume
                | (Paused, Starting)
                | (Running, Stopping)
                // no-op stop of a VM that never ran
                | (Defined, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Starting)
                | (Defined, Destroying)
                | (Stopped, Destroying)
                // forced cleanup
                | (Error, Destroying)
                | (Destroying, Destroyed)
        )
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for VmState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VmState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown VM state '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VmResources {
    pub cpu_cores: u32,
    pub memory_gb: u32,
}

impl Default for VmResources {
    fn default() -> Self {
        Self {
            cpu_cores: 2,
            memory_gb: 4,
        }
    }
}

/// Everything the hypervisor needs to define a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cluster: ClusterKind,
    pub role: VmRole,
    pub resources: VmResources,
    pub gpus: Vec<PciAddress>,
    pub bridge: Option<String>,
    pub volume_path: Option<PathBuf>,
}
