//! Sweeps: the cross product of strategies and date ranges, run
//! vectorized in parallel, with finished (strategy, range) pairs skipped
//! via checkpoints.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::domain::backtest::{BacktestConfig, BacktestSummary, Backtester};
use crate::domain::error::TradeLoopError;
use crate::domain::series::BacktestMarketDataSource;
use crate::domain::strategy::VectorizedStrategy;
use crate::ports::checkpoint_port::CheckpointPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BacktestDateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BacktestDateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TradeLoopError> {
        if start >= end {
            return Err(TradeLoopError::Validation {
                reason: format!("range start {start} must precede end {end}"),
            });
        }
        Ok(BacktestDateRange { start, end })
    }

    /// Stable identity of the range, used as the checkpoint key.
    pub fn key(&self) -> String {
        format!(
            "{}_{}",
            self.start.format("%Y%m%dT%H%M%SZ"),
            self.end.format("%Y%m%dT%H%M%SZ")
        )
    }
}

/// Outcome of one sweep invocation. `produced` holds only the runs this
/// session computed; `reused` holds what the checkpoints already had.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub produced: Vec<BacktestSummary>,
    pub reused: Vec<BacktestSummary>,
}

/// Runs every strategy over every range, skipping pairs the checkpoint
/// store already has. Missing pairs run vectorized across threads; each
/// finished run is stashed before the range's checkpoint is promoted.
pub fn run_sweep(
    strategies: &[Box<dyn VectorizedStrategy>],
    ranges: &[BacktestDateRange],
    base: &BacktestConfig,
    sources: &HashMap<String, BacktestMarketDataSource>,
    store: &dyn CheckpointPort,
) -> Result<SweepReport, TradeLoopError> {
    let ids: Vec<String> = strategies.iter().map(|s| s.id().to_string()).collect();
    {
        let mut seen = ids.clone();
        seen.sort();
        seen.dedup();
        if seen.len() != ids.len() {
            return Err(TradeLoopError::Validation {
                reason: "sweep strategies must have unique ids".into(),
            });
        }
    }

    // First stage: consult checkpoints, collect the jobs still missing.
    let mut reused = Vec::new();
    let mut jobs: Vec<(usize, usize)> = Vec::new();
    for (range_idx, range) in ranges.iter().enumerate() {
        let lookup = store.get_checkpoints(&ids, range)?;
        info!(
            range = range.key().as_str(),
            checkpointed = lookup.checkpointed.len(),
            missing = lookup.missing.len(),
            "checkpoint lookup"
        );
        reused.extend(lookup.results);
        for id in &lookup.missing {
            let strategy_idx = ids.iter().position(|i| i == id).ok_or_else(|| {
                TradeLoopError::Storage {
                    reason: format!("checkpoint lookup returned unknown strategy {id:?}"),
                }
            })?;
            jobs.push((range_idx, strategy_idx));
        }
    }

    // Second stage: run what is missing, in parallel.
    let produced: Vec<(usize, BacktestSummary)> = jobs
        .par_iter()
        .map(|&(range_idx, strategy_idx)| {
            let range = &ranges[range_idx];
            let config = BacktestConfig {
                start: range.start,
                end: range.end,
                ..base.clone()
            };
            // Private clone so each job gets its own series cursors.
            let sources = sources.clone();
            let result =
                Backtester::new(config).run_vectorized(&*strategies[strategy_idx], &sources)?;
            store.stash_partial(range, &result.summary)?;
            Ok((range_idx, result.summary))
        })
        .collect::<Result<_, TradeLoopError>>()?;

    // Promote each touched range's session into its checkpoint.
    for (range_idx, range) in ranges.iter().enumerate() {
        let results: Vec<BacktestSummary> = produced
            .iter()
            .filter(|(idx, _)| *idx == range_idx)
            .map(|(_, summary)| summary.clone())
            .collect();
        if !results.is_empty() {
            store.create_checkpoint(range, &results)?;
        }
    }

    Ok(SweepReport {
        produced: produced.into_iter().map(|(_, summary)| summary).collect(),
        reused,
    })
}
