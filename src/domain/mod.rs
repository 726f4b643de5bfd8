//! Core domain: the order/trade ledger, the engines that drive it, and
//! the configuration they run under. No I/O here; adapters live behind
//! the port traits.

pub mod backtest;
pub mod config_validation;
pub mod error;
pub mod matcher;
pub mod ohlcv;
pub mod order;
pub mod portfolio;
pub mod position;
pub mod scheduler;
pub mod series;
pub mod strategy;
pub mod sweep;
pub mod trade;
