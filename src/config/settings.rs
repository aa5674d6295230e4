/*
* Coordinator settings
* --------------------
* Layered, lowest priority first:
*   1. hardcoded defaults (set_default below)
*   2. <CONFIG_PATH>/default.{toml,yaml,json}
*   3. <CONFIG_PATH>/local.{toml,yaml,json}, optional
*   4. environment variables, COORD__SECTION__KEY (e.g. COORD__STATE__PATH)
*
* Sections:
*   server      where the HTTP API listens
*   state       state file location, backup retention, crash recovery
*   hypervisor  libvirt URI and the timeout/retry policy for every call
*   allocation  whether preflight-detected shared GPUs may be populated
*/

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub state: StateSettings,
    pub hypervisor: HypervisorSettings,
    pub allocation: AllocationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub api_prefix: String,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSettings {
    pub path: PathBuf,
    pub max_backups: usize,
    /// Move VMs found mid-transition at startup to `error`.
    pub recover_interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypervisorSettings {
    pub connection_uri: String,
    pub call_timeout_secs: u64,
    pub timeout_retries: u32,
    pub retry_backoff_ms: u64,
    /// ACPI shutdown instead of a hard power-off on stop.
    pub graceful_stop: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSettings {
    pub allow_shared_gpus: bool,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        info!("Loading configuration from path: {}", config_path);

        Self::builder()?
            .add_source(File::with_name(&format!("{config_path}/default")).required(false))
            .add_source(File::with_name(&format!("{config_path}/local")).required(false))
            .add_source(Environment::with_prefix("COORD").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Defaults overlaid with a single explicit file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from file: {}", path.display());

        Self::builder()?
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("COORD").separator("__"))
            .build()?
            .try_deserialize()
    }

    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        let defaults = generate_default_config();

        Config::builder()
            .set_default("server.host", defaults.server.host)?
            .set_default("server.port", defaults.server.port)?
            .set_default("server.api_prefix", defaults.server.api_prefix)?
            .set_default("server.max_body_bytes", defaults.server.max_body_bytes as u64)?
            .set_default("state.path", defaults.state.path.to_string_lossy().into_owned())?
            .set_default("state.max_backups", defaults.state.max_backups as u64)?
            .set_default("state.recover_interrupted", defaults.state.recover_interrupted)?
            .set_default("hypervisor.connection_uri", defaults.hypervisor.connection_uri)?
            .set_default("hypervisor.call_timeout_secs", defaults.hypervisor.call_timeout_secs)?
            .set_default("hypervisor.timeout_retries", defaults.hypervisor.timeout_retries)?
            .set_default("hypervisor.retry_backoff_ms", defaults.hypervisor.retry_backoff_ms)?
            .set_default("hypervisor.graceful_stop", defaults.hypervisor.graceful_stop)?
            .set_default("allocation.allow_shared_gpus", defaults.allocation.allow_shared_gpus)
    }
}

impl Default for Settings {
    fn default() -> Self {
        generate_default_config()
    }
}

pub fn generate_default_config() -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 3000,
            api_prefix: "/api/v1".to_string(),
            max_body_bytes: 1024 * 1024,
        },
        state: StateSettings {
            path: PathBuf::from("/var/lib/cluster-gpu-coordinator/state.json"),
            max_backups: 5,
            recover_interrupted: true,
        },
        hypervisor: HypervisorSettings {
            connection_uri: "qemu:///system".to_string(),
            call_timeout_secs: 120,
            timeout_retries: 2,
            retry_backoff_ms: 500,
            graceful_stop: true,
        },
        allocation: AllocationSettings {
            allow_shared_gpus: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coord.toml");
        std::fs::write(
            &path,
            r#"
[state]
path = "/tmp/coord/state.json"
max_backups = 2

[hypervisor]
call_timeout_secs = 5
"#,
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.state.path, PathBuf::from("/tmp/coord/state.json"));
        assert_eq!(settings.state.max_backups, 2);
        assert!(settings.state.recover_interrupted);
        assert_eq!(settings.hypervisor.call_timeout_secs, 5);
        assert_eq!(settings.hypervisor.connection_uri, "qemu:///system");
        assert_eq!(settings.server.port, 3000);
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let rendered = toml::to_string_pretty(&generate_default_config()).unwrap();
        assert!(rendered.contains("[hypervisor]"));
        assert!(rendered.contains("allow_shared_gpus = true"));
    }
}
