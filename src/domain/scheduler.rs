//! Strategy scheduling: per-strategy intervals and data resolution.
//!
//! A strategy that missed several intervals (long backtest gap, live loop
//! stall) runs once and has its clock reset to now. There is no catch-up
//! burst.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use crate::domain::error::TradeLoopError;
use crate::ports::market_data_port::{MarketData, MarketDataSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

/// How often a strategy wants to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub time_unit: TimeUnit,
    pub interval: u32,
}

impl Schedule {
    pub fn new(time_unit: TimeUnit, interval: u32) -> Self {
        Schedule {
            time_unit,
            interval,
        }
    }

    pub fn duration(&self) -> Duration {
        let interval = i64::from(self.interval);
        match self.time_unit {
            TimeUnit::Second => Duration::seconds(interval),
            TimeUnit::Minute => Duration::minutes(interval),
            TimeUnit::Hour => Duration::hours(interval),
            TimeUnit::Day => Duration::days(interval),
        }
    }
}

/// Tracks when each strategy last ran and materializes the data bundle a
/// due strategy receives. Keyed by strategy id.
#[derive(Debug, Default)]
pub struct StrategyScheduler {
    last_runs: HashMap<String, DateTime<Utc>>,
}

impl StrategyScheduler {
    pub fn new() -> Self {
        StrategyScheduler {
            last_runs: HashMap::new(),
        }
    }

    /// A strategy that never ran is due immediately.
    pub fn is_due(&self, strategy_id: &str, schedule: Schedule, now: DateTime<Utc>) -> bool {
        match self.last_runs.get(strategy_id) {
            Some(last) => now - *last >= schedule.duration(),
            None => true,
        }
    }

    /// Records a run at `now`, regardless of how many intervals elapsed.
    pub fn mark_run(&mut self, strategy_id: &str, now: DateTime<Utc>) {
        self.last_runs.insert(strategy_id.to_string(), now);
    }

    pub fn last_run(&self, strategy_id: &str) -> Option<DateTime<Utc>> {
        self.last_runs.get(strategy_id).copied()
    }

    /// Fetches a window and ticker from each requested source. Any
    /// `NoDataAvailable` aborts the whole resolution so the strategy can
    /// be skipped for this tick.
    pub fn resolve(
        &self,
        sources: &HashMap<String, Box<dyn MarketDataSource>>,
        identifiers: &[String],
        now: DateTime<Utc>,
    ) -> Result<MarketData, TradeLoopError> {
        let mut data = MarketData::default();
        for identifier in identifiers {
            let source =
                sources
                    .get(identifier)
                    .ok_or_else(|| TradeLoopError::Validation {
                        reason: format!("unknown data source {identifier:?}"),
                    })?;
            let window = source.get_window(now, source.window_size())?;
            let ticker = source.get_ticker(now)?;
            data.windows.insert(identifier.clone(), window);
            data.tickers.insert(identifier.clone(), ticker);
        }
        Ok(data)
    }

    /// `resolve`, with `NoDataAvailable` downgraded to a skip (`None`).
    pub fn resolve_or_skip(
        &self,
        sources: &HashMap<String, Box<dyn MarketDataSource>>,
        identifiers: &[String],
        strategy_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<MarketData>, TradeLoopError> {
        match self.resolve(sources, identifiers, now) {
            Ok(data) => Ok(Some(data)),
            Err(TradeLoopError::NoDataAvailable { identifier, as_of }) => {
                warn!(
                    strategy = strategy_id,
                    source = identifier.as_str(),
                    %as_of,
                    "no data available yet, skipping tick"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, min, 0).unwrap()
    }

    #[test]
    fn schedule_durations() {
        assert_eq!(
            Schedule::new(TimeUnit::Minute, 15).duration(),
            Duration::minutes(15)
        );
        assert_eq!(
            Schedule::new(TimeUnit::Day, 2).duration(),
            Duration::days(2)
        );
    }

    #[test]
    fn never_run_strategy_is_due() {
        let scheduler = StrategyScheduler::new();
        assert!(scheduler.is_due("sma", Schedule::new(TimeUnit::Hour, 1), ts(0, 0)));
    }

    #[test]
    fn due_exactly_on_the_interval_boundary() {
        let mut scheduler = StrategyScheduler::new();
        let schedule = Schedule::new(TimeUnit::Hour, 1);
        scheduler.mark_run("sma", ts(0, 0));
        assert!(!scheduler.is_due("sma", schedule, ts(0, 59)));
        assert!(scheduler.is_due("sma", schedule, ts(1, 0)));
    }

    #[test]
    fn missed_intervals_do_not_queue_catch_up_runs() {
        let mut scheduler = StrategyScheduler::new();
        let schedule = Schedule::new(TimeUnit::Hour, 1);
        scheduler.mark_run("sma", ts(0, 0));
        // Five intervals elapse, the strategy runs once at hour 5
        assert!(scheduler.is_due("sma", schedule, ts(5, 0)));
        scheduler.mark_run("sma", ts(5, 0));
        assert!(!scheduler.is_due("sma", schedule, ts(5, 30)));
        assert!(scheduler.is_due("sma", schedule, ts(6, 0)));
    }

    #[test]
    fn strategies_are_tracked_independently() {
        let mut scheduler = StrategyScheduler::new();
        let schedule = Schedule::new(TimeUnit::Hour, 1);
        scheduler.mark_run("a", ts(0, 0));
        assert!(!scheduler.is_due("a", schedule, ts(0, 30)));
        assert!(scheduler.is_due("b", schedule, ts(0, 30)));
    }
}
