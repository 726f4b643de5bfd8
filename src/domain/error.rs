//! Error taxonomy for the ledger, engines and adapters.

use chrono::{DateTime, Utc};

/// Top-level error type for tradeloop.
#[derive(Debug, thiserror::Error)]
pub enum TradeLoopError {
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("insufficient funds: requested {requested}, available {available}")]
    InsufficientFunds { requested: f64, available: f64 },

    #[error("insufficient position in {symbol}: requested {requested}, available {available}")]
    InsufficientPosition {
        symbol: String,
        requested: f64,
        available: f64,
    },

    #[error("no data available for {identifier} as of {as_of}")]
    NoDataAvailable {
        identifier: String,
        as_of: DateTime<Utc>,
    },

    #[error("{entity} {id} is already closed")]
    AlreadyClosed { entity: String, id: usize },

    #[error("external adapter error: {reason}")]
    ExternalAdapter { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&TradeLoopError> for std::process::ExitCode {
    fn from(err: &TradeLoopError) -> Self {
        let code: u8 = match err {
            TradeLoopError::Io(_) => 1,
            TradeLoopError::ConfigParse { .. }
            | TradeLoopError::ConfigMissing { .. }
            | TradeLoopError::ConfigInvalid { .. } => 2,
            TradeLoopError::Storage { .. } => 3,
            TradeLoopError::Validation { .. }
            | TradeLoopError::InsufficientFunds { .. }
            | TradeLoopError::InsufficientPosition { .. }
            | TradeLoopError::AlreadyClosed { .. } => 4,
            TradeLoopError::NoDataAvailable { .. } => 5,
            TradeLoopError::ExternalAdapter { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
