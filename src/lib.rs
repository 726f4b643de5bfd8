//! tradeloop — order/trade ledger, backtest engines and strategy runner.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in
//! [`ports`], concrete implementations in [`adapters`]. The live polling
//! loop lives in [`live`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod live;
pub mod ports;
