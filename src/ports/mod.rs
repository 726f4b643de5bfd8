//! Port traits: the boundaries the core depends on.

pub mod checkpoint_port;
pub mod config_port;
pub mod execution_port;
pub mod market_data_port;
pub mod repository_port;
