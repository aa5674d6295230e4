pub mod api;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod core;
pub mod errors;
pub mod gpu;
pub mod state;

// Re-exports
pub use api::routes::{create_router, AppState};
pub use coordinator::Coordinator;
pub use errors::{CoordinatorError, CoordinatorResult};
