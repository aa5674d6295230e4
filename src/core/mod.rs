pub mod libvirt;
pub mod lifecycle;
pub mod vm;

pub use libvirt::{DomainHandle, Hypervisor, HypervisorError, HypervisorState, VirshHypervisor};
pub use lifecycle::{CleanupOutcome, DriftReport, TransitionOutcome, VmLifecycleManager};
pub use vm::{VmResources, VmSpec, VmState};
