//! Crash-safe state file.
//!
//! Layout is a single header line followed by the serialized payload:
//!
//! ```text
//! CGCSTATE v1 sha256:<hex digest of payload> <payload length>
//! { ...json... }
//! ```
//!
//! Saves go through a temporary sibling file that is fsynced and renamed over
//! the target, then the directory is fsynced. A crash at any point leaves
//! either the previous file or the new one. The previous file is copied to a
//! timestamped backup first; restoring from a backup is always explicit.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::errors::StateError;
use crate::state::models::PersistedState;
use crate::state::serializer::StateSerializer;

const MAGIC: &str = "CGCSTATE";

/// Durable home of [`PersistedState`].
pub trait StateStore: Send + Sync {
    fn load(&self) -> Result<PersistedState, StateError>;
    fn save(&self, state: &PersistedState) -> Result<(), StateError>;
}

#[derive(Debug, Clone)]
pub struct StateFileManager {
    path: PathBuf,
    max_backups: usize,
    serializer: StateSerializer,
}

impl StateFileManager {
    pub fn new(path: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            path: path.into(),
            max_backups,
            serializer: StateSerializer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string())
    }

    fn encode(&self, state: &PersistedState) -> Result<Vec<u8>, StateError> {
        let payload = self.serializer.serialize(state)?;
        let digest = hex::encode(Sha256::digest(&payload));
        let mut out = format!(
            "{MAGIC} v{} sha256:{digest} {}\n",
            self.serializer.schema_version(),
            payload.len()
        )
        .into_bytes();
        out.extend_from_slice(&payload);
        Ok(out)
    }

    fn decode(&self, path: &Path, bytes: &[u8]) -> Result<PersistedState, StateError> {
        let corrupt = |reason: String| StateError::Corruption {
            path: path.to_path_buf(),
            reason,
        };

        let newline = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| corrupt("missing header line".to_string()))?;
        let header = std::str::from_utf8(&bytes[..newline])
            .map_err(|_| corrupt("header is not UTF-8".to_string()))?;
        let payload = &bytes[newline + 1..];

        let fields: Vec<&str> = header.split(' ').collect();
        let [magic, version, digest, length] = fields.as_slice() else {
            return Err(corrupt(format!("malformed header '{header}'")));
        };
        if *magic != MAGIC {
            return Err(corrupt(format!("unexpected magic '{magic}'")));
        }

        let version: u32 = version
            .strip_prefix('v')
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| corrupt(format!("bad version field '{version}'")))?;
        if version > self.serializer.schema_version() {
            return Err(StateError::Version {
                found: version,
                supported: self.serializer.schema_version(),
            });
        }

        let expected_len: usize = length
            .parse()
            .map_err(|_| corrupt(format!("bad length field '{length}'")))?;
        if payload.len() != expected_len {
            return Err(corrupt(format!(
                "payload is {} bytes, header says {expected_len}",
                payload.len()
            )));
        }

        let expected_digest = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| corrupt(format!("bad digest field '{digest}'")))?;
        let actual_digest = hex::encode(Sha256::digest(payload));
        if actual_digest != expected_digest {
            return Err(corrupt("payload digest mismatch".to_string()));
        }

        self.serializer.deserialize(payload)
    }

    fn read_file(&self, path: &Path) -> Result<PersistedState, StateError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        self.decode(path, &bytes)
    }

    fn backup_current(&self) -> Result<(), StateError> {
        if !self.path.exists() {
            return Ok(());
        }
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.9fZ");
        let backup = self.dir().join(format!("{}.{stamp}.bak", self.file_name()));
        fs::copy(&self.path, &backup)?;
        fs::File::open(&backup)?.sync_all()?;
        debug!(backup = %backup.display(), "Backed up previous state file");
        self.prune_backups()
    }

    fn prune_backups(&self) -> Result<(), StateError> {
        let backups = self.backups()?;
        if backups.len() <= self.max_backups {
            return Ok(());
        }
        let excess = backups.len() - self.max_backups;
        for old in backups.into_iter().take(excess) {
            fs::remove_file(&old)?;
            debug!(backup = %old.display(), "Pruned old state backup");
        }
        Ok(())
    }

    fn list_dir_matching(&self, prefix: &str, suffix: &str) -> Result<Vec<PathBuf>, StateError> {
        let dir = self.dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(prefix) && name.ends_with(suffix) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Backups, oldest first.
    pub fn backups(&self) -> Result<Vec<PathBuf>, StateError> {
        self.list_dir_matching(&format!("{}.", self.file_name()), ".bak")
    }

    pub fn latest_backup(&self) -> Result<Option<PathBuf>, StateError> {
        Ok(self.backups()?.pop())
    }

    /// Load and verify one backup without touching the live file.
    pub fn load_backup(&self, backup: &Path) -> Result<PersistedState, StateError> {
        self.read_file(backup)
    }

    /// Replace the live file with the newest backup that still verifies.
    pub fn restore_latest_backup(&self) -> Result<(PathBuf, PersistedState), StateError> {
        for backup in self.backups()?.into_iter().rev() {
            match self.load_backup(&backup) {
                Ok(state) => {
                    self.write_atomically(&self.encode(&state)?)?;
                    info!(backup = %backup.display(), "Restored state from backup");
                    return Ok((backup, state));
                }
                Err(e) => {
                    warn!(backup = %backup.display(), error = %e, "Skipping unusable backup");
                }
            }
        }
        Err(StateError::NotFound(format!(
            "no usable backup for {}",
            self.path.display()
        )))
    }

    /// Remove temporary files left by a save that never reached its rename.
    pub fn clean_stale_temp_files(&self) -> Result<usize, StateError> {
        let stale = self.list_dir_matching(&format!(".{}.", self.file_name()), ".tmp")?;
        for path in &stale {
            fs::remove_file(path)?;
            info!(path = %path.display(), "Removed stale temporary state file");
        }
        Ok(stale.len())
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), StateError> {
        let dir = self.dir();
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", self.file_name()))
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| StateError::Io(e.error))?;
        sync_dir(&dir)?;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

impl StateStore for StateFileManager {
    fn load(&self) -> Result<PersistedState, StateError> {
        let state = self.read_file(&self.path)?;
        debug!(path = %self.path.display(), clusters = state.clusters.len(), "Loaded state file");
        Ok(state)
    }

    fn save(&self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = self.encode(state)?;
        fs::create_dir_all(self.dir())?;
        self.backup_current()?;
        self.write_atomically(&bytes)?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Persisted state file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::models::{ClusterKind, ClusterState, VmInfo, VmRole};

    fn state_with(vms: &[&str]) -> PersistedState {
        let mut cluster = ClusterState::new(ClusterKind::Hpc, "hpc", None);
        for vm in vms {
            cluster.vms.push(VmInfo::new(*vm, VmRole::Compute));
        }
        let mut state = PersistedState::default();
        state.clusters.insert(ClusterKind::Hpc, cluster);
        state
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFileManager::new(dir.path().join("state.json"), 3);
        assert!(matches!(store.load(), Err(StateError::NotFound(_))));
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFileManager::new(dir.path().join("nested/state.json"), 3);
        let state = state_with(&["hpc-compute-01"]);
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[test]
    fn truncated_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateFileManager::new(&path, 3);
        store.save(&state_with(&["a", "b"])).unwrap();

        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        assert!(matches!(store.load(), Err(StateError::Corruption { .. })));
    }

    #[test]
    fn flipped_byte_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateFileManager::new(&path, 3);
        store.save(&state_with(&["hpc-compute-01"])).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 3;
        bytes[last] ^= 0x20;
        fs::write(&path, &bytes).unwrap();

        assert!(matches!(store.load(), Err(StateError::Corruption { .. })));
    }

    #[test]
    fn leftover_temp_file_is_ignored_and_cleanable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateFileManager::new(&path, 3);
        let state = state_with(&["a"]);
        store.save(&state).unwrap();

        // a save that died before its rename
        fs::write(dir.path().join(".state.json.abc123.tmp"), b"half a payl").unwrap();

        assert_eq!(store.load().unwrap(), state);
        assert_eq!(store.clean_stale_temp_files().unwrap(), 1);
        assert_eq!(store.clean_stale_temp_files().unwrap(), 0);
    }

    #[test]
    fn keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFileManager::new(dir.path().join("state.json"), 2);
        for n in 0..5 {
            store.save(&state_with(&[&format!("vm-{n}")])).unwrap();
        }
        let backups = store.backups().unwrap();
        assert_eq!(backups.len(), 2);

        // newest backup holds the state before the last save
        let latest = store.latest_backup().unwrap().unwrap();
        let previous = store.load_backup(&latest).unwrap();
        assert!(previous.clusters[&ClusterKind::Hpc].vm("vm-3").is_some());
    }

    #[test]
    fn backup_is_byte_identical_to_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateFileManager::new(&path, 3);
        let first = state_with(&["hpc-compute-01"]);
        store.save(&first).unwrap();
        let written = fs::read(&path).unwrap();

        store.save(&state_with(&["hpc-compute-02"])).unwrap();
        let backup = store.latest_backup().unwrap().unwrap();
        assert_eq!(fs::read(&backup).unwrap(), written);
        assert_eq!(store.load_backup(&backup).unwrap(), first);
    }

    #[test]
    fn restores_latest_backup_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateFileManager::new(&path, 3);
        store.save(&state_with(&["first"])).unwrap();
        store.save(&state_with(&["second"])).unwrap();

        fs::write(&path, b"garbage").unwrap();
        assert!(matches!(store.load(), Err(StateError::Corruption { .. })));

        let (_, restored) = store.restore_latest_backup().unwrap();
        assert!(restored.clusters[&ClusterKind::Hpc].vm("first").is_some());
        assert_eq!(store.load().unwrap(), restored);
    }

    #[test]
    fn restore_without_backups_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateFileManager::new(dir.path().join("state.json"), 3);
        assert!(matches!(store.restore_latest_backup(), Err(StateError::NotFound(_))));
    }
}
