//! Adapters: the concrete implementations behind the port traits.

pub mod checkpoint_store;
pub mod csv_data_adapter;
pub mod file_config_adapter;
pub mod memory_repository;
