pub mod handlers;

use std::path::PathBuf;

use thiserror::Error;

use crate::core::libvirt::HypervisorError;
use crate::core::vm::VmState;
use crate::gpu::pci::PciAddress;
use crate::state::models::{ClusterKind, GpuOwner};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Gpu(#[from] GpuError),

    #[error(transparent)]
    Vm(#[from] VmError),

    /// The durable write failed and the in-memory change was rolled back.
    #[error("State change not persisted (rolled back): {0}")]
    Persistence(#[source] StateError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("State not found: {0}")]
    NotFound(String),

    #[error("State file {path} is corrupted: {reason}")]
    Corruption { path: PathBuf, reason: String },

    #[error("Malformed state: {0}")]
    Format(String),

    #[error("State schema version {found} is newer than supported version {supported}")]
    Version { found: u32, supported: u32 },

    #[error("State I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum GpuError {
    #[error("GPU {pci_address} requested by {requester} is held by {owner}")]
    Denied {
        pci_address: PciAddress,
        owner: GpuOwner,
        requester: GpuOwner,
    },

    #[error("GPU {pci_address} is already assigned to {owner}")]
    Conflict {
        pci_address: PciAddress,
        owner: GpuOwner,
    },

    #[error("Invalid PCI address '{0}', expected DDDD:BB:DD.F")]
    InvalidAddress(String),
}

#[derive(Error, Debug)]
pub enum VmError {
    #[error("VM {vm} not found in cluster {cluster}")]
    NotFound { cluster: ClusterKind, vm: String },

    #[error("Cluster {0} not found")]
    ClusterNotFound(ClusterKind),

    #[error("Invalid transition for VM {vm}: {from} -> {to}")]
    InvalidTransition {
        vm: String,
        from: VmState,
        to: VmState,
    },

    #[error("Hypervisor operation failed for VM {vm}: {source}")]
    Collaborator {
        vm: String,
        #[source]
        source: HypervisorError,
    },
}

/// Coarse classification used by the API layer and the CLI exit path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Denied,
    InvalidTransition,
    NotFound,
    Persistence,
    Corruption,
    /// The state file could not be read or written.
    Io,
    Collaborator,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Denied => "denied",
            Self::InvalidTransition => "invalid_transition",
            Self::NotFound => "not_found",
            Self::Persistence => "persistence",
            Self::Corruption => "corruption",
            Self::Io => "io",
            Self::Collaborator => "collaborator",
            Self::Config => "config",
        }
    }
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Gpu(GpuError::Denied { .. }) => ErrorKind::Denied,
            Self::Gpu(GpuError::Conflict { .. }) => ErrorKind::Conflict,
            Self::Gpu(GpuError::InvalidAddress(_)) => ErrorKind::Validation,
            Self::Vm(VmError::NotFound { .. }) | Self::Vm(VmError::ClusterNotFound(_)) => {
                ErrorKind::NotFound
            }
            Self::Vm(VmError::InvalidTransition { .. }) => ErrorKind::InvalidTransition,
            Self::Vm(VmError::Collaborator { .. }) => ErrorKind::Collaborator,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::State(StateError::NotFound(_)) => ErrorKind::NotFound,
            Self::State(StateError::Io(_)) => ErrorKind::Io,
            Self::State(_) => ErrorKind::Corruption,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn collaborator(vm: &str, source: HypervisorError) -> Self {
        VmError::Collaborator {
            vm: vm.to_string(),
            source,
        }
        .into()
    }
}

// Result type alias for convenience
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
