//! Validated run configuration, assembled from a config port.
//!
//! Raw values come through the port as strings and defaults; everything
//! here either parses into the typed structures the engines take or fails
//! with the exact section/key that is wrong.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::domain::backtest::BacktestConfig;
use crate::domain::error::TradeLoopError;
use crate::domain::ohlcv::TimeFrame;
use crate::domain::order::OrderAmount;
use crate::domain::portfolio::{PortfolioConfiguration, SnapshotInterval};
use crate::domain::scheduler::{Schedule, TimeUnit};
use crate::domain::strategy::SmaCrossover;
use crate::domain::sweep::BacktestDateRange;
use crate::ports::checkpoint_port::CheckpointMode;
use crate::ports::config_port::ConfigPort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    EventDriven,
    Vectorized,
}

/// One CSV-backed candle source declared in the config.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceConfig {
    pub identifier: String,
    pub symbol: String,
    pub time_frame: TimeFrame,
    pub window_size: usize,
    pub file: PathBuf,
}

/// One strategy declaration. Only the SMA crossover is built in.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyConfig {
    pub id: String,
    pub source: String,
    pub symbol: String,
    pub fast: usize,
    pub slow: usize,
    pub schedule: Schedule,
    pub amount_percent: f64,
}

impl StrategyConfig {
    pub fn build(&self) -> Result<SmaCrossover, TradeLoopError> {
        SmaCrossover::new(
            &self.id,
            &self.source,
            &self.symbol,
            self.fast,
            self.slow,
            self.schedule,
            OrderAmount::PercentOfPortfolio(self.amount_percent),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    pub ranges: Vec<BacktestDateRange>,
    pub mode: CheckpointMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub portfolio: PortfolioConfiguration,
    pub backtest: BacktestConfig,
    pub engine: EngineKind,
    pub data_dir: PathBuf,
    pub sources: Vec<DataSourceConfig>,
    pub strategies: Vec<StrategyConfig>,
    pub sweep: Option<SweepConfig>,
}

impl RunConfig {
    pub fn load(config: &dyn ConfigPort) -> Result<Self, TradeLoopError> {
        let portfolio = PortfolioConfiguration {
            market: required(config, "portfolio", "market")?,
            trading_symbol: required(config, "portfolio", "trading_symbol")?,
            initial_balance: positive_double(config, "portfolio", "initial_balance")?,
        };

        let start = datetime(config, "backtest", "start_date")?;
        let end = datetime(config, "backtest", "end_date")?;
        if start >= end {
            return Err(invalid(
                "backtest",
                "end_date",
                format!("end {end} must follow start {start}"),
            ));
        }
        let snapshot_interval = match config.get_string("backtest", "snapshot_interval") {
            Some(value) => SnapshotInterval::parse(&value)
                .map_err(|e| invalid("backtest", "snapshot_interval", e.to_string()))?,
            None => SnapshotInterval::Daily,
        };
        let fee_rate = config.get_double("backtest", "fee_rate", 0.0);
        if !(0.0..1.0).contains(&fee_rate) {
            return Err(invalid(
                "backtest",
                "fee_rate",
                format!("must be within [0, 1), got {fee_rate}"),
            ));
        }
        let backtest = BacktestConfig {
            start,
            end,
            initial_balance: portfolio.initial_balance,
            market: portfolio.market.clone(),
            trading_symbol: portfolio.trading_symbol.clone(),
            fee_rate,
            snapshot_interval,
        };
        let engine = match config
            .get_string("backtest", "engine")
            .unwrap_or_else(|| "event_driven".to_string())
            .as_str()
        {
            "event_driven" => EngineKind::EventDriven,
            "vectorized" => EngineKind::Vectorized,
            other => {
                return Err(invalid(
                    "backtest",
                    "engine",
                    format!("unknown engine {other:?} (expected event_driven or vectorized)"),
                ));
            }
        };

        let data_dir = PathBuf::from(required(config, "data", "csv_dir")?);
        let mut sources = Vec::new();
        for identifier in list(config, "data", "sources")? {
            let section = format!("source.{identifier}");
            let time_frame_raw = required(config, &section, "time_frame")?;
            let time_frame = TimeFrame::parse(&time_frame_raw)
                .map_err(|e| invalid(&section, "time_frame", e.to_string()))?;
            let window_size = config.get_int(&section, "window_size", 50);
            if window_size <= 0 {
                return Err(invalid(
                    &section,
                    "window_size",
                    format!("must be positive, got {window_size}"),
                ));
            }
            sources.push(DataSourceConfig {
                symbol: required(config, &section, "symbol")?,
                time_frame,
                window_size: window_size as usize,
                file: PathBuf::from(required(config, &section, "file")?),
                identifier,
            });
        }
        if sources.is_empty() {
            return Err(invalid("data", "sources", "at least one source required"));
        }

        let mut strategies = Vec::new();
        for id in list(config, "strategies", "ids")? {
            let section = format!("strategy.{id}");
            let kind = required(config, &section, "type")?;
            if kind != "sma_crossover" {
                return Err(invalid(
                    &section,
                    "type",
                    format!("unknown strategy type {kind:?}"),
                ));
            }
            let source = required(config, &section, "source")?;
            let Some(source_cfg) = sources.iter().find(|s| s.identifier == source) else {
                return Err(invalid(
                    &section,
                    "source",
                    format!("undeclared data source {source:?}"),
                ));
            };
            let source_window = source_cfg.window_size;
            let fast = config.get_int(&section, "fast", 10);
            let slow = config.get_int(&section, "slow", 30);
            if fast <= 0 || slow <= 0 || fast >= slow {
                return Err(invalid(
                    &section,
                    "fast",
                    format!("fast {fast} must be positive and shorter than slow {slow}"),
                ));
            }
            let unit = match config
                .get_string(&section, "interval_unit")
                .unwrap_or_else(|| "hour".to_string())
                .as_str()
            {
                "second" => TimeUnit::Second,
                "minute" => TimeUnit::Minute,
                "hour" => TimeUnit::Hour,
                "day" => TimeUnit::Day,
                other => {
                    return Err(invalid(
                        &section,
                        "interval_unit",
                        format!("unknown time unit {other:?}"),
                    ));
                }
            };
            let interval = config.get_int(&section, "interval", 1);
            if interval <= 0 {
                return Err(invalid(
                    &section,
                    "interval",
                    format!("must be positive, got {interval}"),
                ));
            }
            let amount_percent = config.get_double(&section, "amount_percent", 100.0);
            if !(0.0..=100.0).contains(&amount_percent) || amount_percent == 0.0 {
                return Err(invalid(
                    &section,
                    "amount_percent",
                    format!("must be within (0, 100], got {amount_percent}"),
                ));
            }
            let strategy = StrategyConfig {
                id,
                source,
                symbol: required(config, &section, "symbol")?,
                fast: fast as usize,
                slow: slow as usize,
                schedule: Schedule::new(unit, interval as u32),
                amount_percent,
            };
            let needed = strategy.build()?.window_size();
            if source_window < needed {
                return Err(invalid(
                    &section,
                    "slow",
                    format!(
                        "source {:?} serves {source_window} bars per window but the \
                         crossover needs {needed}",
                        strategy.source
                    ),
                ));
            }
            strategies.push(strategy);
        }
        if strategies.is_empty() {
            return Err(invalid(
                "strategies",
                "ids",
                "at least one strategy required",
            ));
        }

        let sweep = match config.get_string("sweep", "ranges") {
            Some(raw) => {
                let mut ranges = Vec::new();
                for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                    let (from, to) = part.split_once("..").ok_or_else(|| {
                        invalid("sweep", "ranges", format!("expected start..end, got {part:?}"))
                    })?;
                    let range = BacktestDateRange::new(
                        parse_datetime(from.trim())
                            .map_err(|e| invalid("sweep", "ranges", e.to_string()))?,
                        parse_datetime(to.trim())
                            .map_err(|e| invalid("sweep", "ranges", e.to_string()))?,
                    )
                    .map_err(|e| invalid("sweep", "ranges", e.to_string()))?;
                    ranges.push(range);
                }
                if ranges.is_empty() {
                    return Err(invalid("sweep", "ranges", "no ranges given"));
                }
                let mode = match config.get_string("sweep", "mode") {
                    Some(value) => CheckpointMode::parse(&value)
                        .map_err(|e| invalid("sweep", "mode", e.to_string()))?,
                    None => CheckpointMode::Append,
                };
                Some(SweepConfig { ranges, mode })
            }
            None => None,
        };

        Ok(RunConfig {
            portfolio,
            backtest,
            engine,
            data_dir,
            sources,
            strategies,
            sweep,
        })
    }
}

fn required(config: &dyn ConfigPort, section: &str, key: &str) -> Result<String, TradeLoopError> {
    config
        .get_string(section, key)
        .ok_or_else(|| TradeLoopError::ConfigMissing {
            section: section.to_string(),
            key: key.to_string(),
        })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> TradeLoopError {
    TradeLoopError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

fn positive_double(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<f64, TradeLoopError> {
    let raw = required(config, section, key)?;
    let value: f64 = raw
        .parse()
        .map_err(|_| invalid(section, key, format!("not a number: {raw:?}")))?;
    if value <= 0.0 {
        return Err(invalid(section, key, format!("must be positive, got {value}")));
    }
    Ok(value)
}

fn list(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Vec<String>, TradeLoopError> {
    Ok(required(config, section, key)?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

fn datetime(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<DateTime<Utc>, TradeLoopError> {
    let raw = required(config, section, key)?;
    parse_datetime(&raw).map_err(|e| invalid(section, key, e.to_string()))
}

/// Accepts RFC 3339 or a bare date (taken as midnight UTC).
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, TradeLoopError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0).unwrap_or_default(),
            Utc,
        ));
    }
    Err(TradeLoopError::Validation {
        reason: format!("unparseable datetime {raw:?} (expected RFC 3339 or YYYY-MM-DD)"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapConfig(HashMap<(String, String), String>);

    impl MapConfig {
        fn new(entries: &[(&str, &str, &str)]) -> Self {
            MapConfig(
                entries
                    .iter()
                    .map(|(s, k, v)| ((s.to_string(), k.to_string()), v.to_string()))
                    .collect(),
            )
        }
    }

    impl ConfigPort for MapConfig {
        fn get_string(&self, section: &str, key: &str) -> Option<String> {
            self.0.get(&(section.to_string(), key.to_string())).cloned()
        }
        fn get_int(&self, section: &str, key: &str, default: i64) -> i64 {
            self.get_string(section, key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        fn get_double(&self, section: &str, key: &str, default: f64) -> f64 {
            self.get_string(section, key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
        fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
            self.get_string(section, key)
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }
    }

    fn base_entries() -> Vec<(&'static str, &'static str, &'static str)> {
        vec![
            ("portfolio", "market", "binance"),
            ("portfolio", "trading_symbol", "EUR"),
            ("portfolio", "initial_balance", "1000"),
            ("backtest", "start_date", "2024-01-01"),
            ("backtest", "end_date", "2024-06-01"),
            ("data", "csv_dir", "./data"),
            ("data", "sources", "btc_1h"),
            ("source.btc_1h", "symbol", "BTC"),
            ("source.btc_1h", "time_frame", "1h"),
            ("source.btc_1h", "file", "btc_1h.csv"),
            ("strategies", "ids", "sma"),
            ("strategy.sma", "type", "sma_crossover"),
            ("strategy.sma", "source", "btc_1h"),
            ("strategy.sma", "symbol", "BTC"),
        ]
    }

    #[test]
    fn minimal_config_loads_with_defaults() {
        let config = MapConfig::new(&base_entries());
        let run = RunConfig::load(&config).unwrap();
        assert_eq!(run.engine, EngineKind::EventDriven);
        assert_eq!(run.backtest.snapshot_interval, SnapshotInterval::Daily);
        assert_eq!(run.sources[0].window_size, 50);
        assert_eq!(run.strategies[0].fast, 10);
        assert_eq!(run.strategies[0].slow, 30);
        assert!(run.sweep.is_none());
        run.strategies[0].build().unwrap();
    }

    #[test]
    fn source_window_must_cover_the_crossover() {
        let mut entries = base_entries();
        entries.push(("source.btc_1h", "window_size", "10"));
        let err = RunConfig::load(&MapConfig::new(&entries)).unwrap_err();
        match err {
            TradeLoopError::ConfigInvalid { section, key, .. } => {
                assert_eq!(section, "strategy.sma");
                assert_eq!(key, "slow");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_key_names_section_and_key() {
        let mut entries = base_entries();
        entries.retain(|(s, k, _)| !(*s == "portfolio" && *k == "market"));
        let err = RunConfig::load(&MapConfig::new(&entries)).unwrap_err();
        match err {
            TradeLoopError::ConfigMissing { section, key } => {
                assert_eq!(section, "portfolio");
                assert_eq!(key, "market");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn inverted_dates_are_rejected() {
        let mut entries = base_entries();
        entries.retain(|(s, k, _)| !(*s == "backtest" && *k == "end_date"));
        entries.push(("backtest", "end_date", "2023-01-01"));
        let err = RunConfig::load(&MapConfig::new(&entries)).unwrap_err();
        assert!(matches!(err, TradeLoopError::ConfigInvalid { .. }));
    }

    #[test]
    fn undeclared_strategy_source_is_rejected() {
        let mut entries = base_entries();
        entries.retain(|(s, k, _)| !(*s == "strategy.sma" && *k == "source"));
        entries.push(("strategy.sma", "source", "eth_1h"));
        let err = RunConfig::load(&MapConfig::new(&entries)).unwrap_err();
        assert!(matches!(err, TradeLoopError::ConfigInvalid { .. }));
    }

    #[test]
    fn sweep_ranges_parse() {
        let mut entries = base_entries();
        entries.push(("sweep", "ranges", "2024-01-01..2024-02-01, 2024-02-01..2024-03-01"));
        entries.push(("sweep", "mode", "overwrite"));
        let run = RunConfig::load(&MapConfig::new(&entries)).unwrap();
        let sweep = run.sweep.unwrap();
        assert_eq!(sweep.ranges.len(), 2);
        assert_eq!(sweep.mode, CheckpointMode::Overwrite);
    }

    #[test]
    fn malformed_sweep_range_is_rejected() {
        let mut entries = base_entries();
        entries.push(("sweep", "ranges", "2024-01-01"));
        let err = RunConfig::load(&MapConfig::new(&entries)).unwrap_err();
        assert!(matches!(err, TradeLoopError::ConfigInvalid { .. }));
    }

    #[test]
    fn parse_datetime_accepts_both_forms() {
        assert!(parse_datetime("2024-01-01").is_ok());
        assert!(parse_datetime("2024-01-01T12:30:00Z").is_ok());
        assert!(parse_datetime("yesterday").is_err());
    }
}
