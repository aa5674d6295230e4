pub mod cluster;
pub mod settings;

pub use cluster::MergedConfig;
pub use settings::{generate_default_config, Settings};
