//! Checkpoint port trait: persisted per-date-range backtest results so a
//! sweep can resume instead of recomputing.

use crate::domain::backtest::BacktestSummary;
use crate::domain::error::TradeLoopError;
use crate::domain::sweep::BacktestDateRange;

/// Whether `create_checkpoint` merges into or replaces an existing
/// checkpoint for the same range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointMode {
    #[default]
    Append,
    Overwrite,
}

impl CheckpointMode {
    pub fn parse(value: &str) -> Result<Self, TradeLoopError> {
        match value {
            "append" => Ok(CheckpointMode::Append),
            "overwrite" => Ok(CheckpointMode::Overwrite),
            other => Err(TradeLoopError::Validation {
                reason: format!("unknown checkpoint mode {other:?} (expected append or overwrite)"),
            }),
        }
    }
}

/// What a checkpoint lookup yields: which of the requested strategies
/// already have a stored result for the range, and which still need a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointLookup {
    pub checkpointed: Vec<String>,
    pub results: Vec<BacktestSummary>,
    pub missing: Vec<String>,
}

pub trait CheckpointPort: Sync {
    fn get_checkpoints(
        &self,
        strategy_ids: &[String],
        range: &BacktestDateRange,
    ) -> Result<CheckpointLookup, TradeLoopError>;

    /// Durably records one finished run in the range's session cache, so
    /// an interrupted sweep loses at most the runs still in flight.
    fn stash_partial(
        &self,
        range: &BacktestDateRange,
        summary: &BacktestSummary,
    ) -> Result<(), TradeLoopError>;

    /// Promotes this session's results into the range's checkpoint and
    /// discards the session cache.
    fn create_checkpoint(
        &self,
        range: &BacktestDateRange,
        results: &[BacktestSummary],
    ) -> Result<(), TradeLoopError>;
}
