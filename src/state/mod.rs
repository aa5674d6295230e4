pub mod cluster_state;
pub mod file_manager;
pub mod models;
pub mod serializer;

pub use cluster_state::{ClusterStateManager, ClusterStatus, IntegrityIssue};
pub use file_manager::{StateFileManager, StateStore};
pub use models::{ClusterKind, ClusterState, GpuOwner, PersistedState, VmInfo, VmRole};
pub use serializer::StateSerializer;
