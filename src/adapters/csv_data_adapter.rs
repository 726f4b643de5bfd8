//! CSV-backed market data source.
//!
//! Expects a header of `datetime,open,high,low,close,volume` with
//! datetimes in RFC 3339 or bare `YYYY-MM-DD`. The whole file is loaded
//! into a candle series up front; lookups never touch the disk again.

use std::fs::File;
use std::path::Path;

use serde::Deserialize;

use crate::domain::config_validation::parse_datetime;
use crate::domain::error::TradeLoopError;
use crate::domain::ohlcv::{OhlcvBar, Ticker, TimeFrame};
use crate::domain::series::{BacktestMarketDataSource, CandleSeries};
use crate::ports::market_data_port::MarketDataSource;
use chrono::{DateTime, Utc};

#[derive(Debug, Deserialize)]
struct CsvRow {
    datetime: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

/// Reads one CSV candle file into a sorted, de-duplicated series.
pub fn load_series(
    path: &Path,
    symbol: &str,
    time_frame: TimeFrame,
) -> Result<CandleSeries, TradeLoopError> {
    let file = File::open(path).map_err(|e| TradeLoopError::Storage {
        reason: format!("failed to open {}: {e}", path.display()),
    })?;
    let mut reader = csv::Reader::from_reader(file);
    let mut bars = Vec::new();
    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.map_err(|e| TradeLoopError::Storage {
            reason: format!("{}: row {}: {e}", path.display(), line + 1),
        })?;
        let datetime = parse_datetime(&row.datetime).map_err(|e| TradeLoopError::Storage {
            reason: format!("{}: row {}: {e}", path.display(), line + 1),
        })?;
        bars.push(OhlcvBar {
            symbol: symbol.to_string(),
            datetime,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }
    if bars.is_empty() {
        return Err(TradeLoopError::Storage {
            reason: format!("{} contains no rows", path.display()),
        });
    }
    Ok(CandleSeries::new(symbol, time_frame, bars))
}

pub struct CsvMarketDataSource {
    identifier: String,
    window_size: usize,
    series: CandleSeries,
}

impl CsvMarketDataSource {
    pub fn load(
        identifier: impl Into<String>,
        path: &Path,
        symbol: &str,
        time_frame: TimeFrame,
        window_size: usize,
    ) -> Result<Self, TradeLoopError> {
        Ok(CsvMarketDataSource {
            identifier: identifier.into(),
            window_size,
            series: load_series(path, symbol, time_frame)?,
        })
    }
}

impl MarketDataSource for CsvMarketDataSource {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn symbol(&self) -> &str {
        self.series.symbol()
    }

    fn time_frame(&self) -> TimeFrame {
        self.series.time_frame()
    }

    fn window_size(&self) -> usize {
        self.window_size
    }

    fn get_window(
        &self,
        as_of: DateTime<Utc>,
        size: usize,
    ) -> Result<Vec<OhlcvBar>, TradeLoopError> {
        self.series.window(as_of, size)
    }

    fn get_ticker(&self, as_of: DateTime<Utc>) -> Result<Ticker, TradeLoopError> {
        self.series.ticker(as_of)
    }

    fn to_backtest_variant(&self) -> Result<BacktestMarketDataSource, TradeLoopError> {
        Ok(BacktestMarketDataSource::new(
            self.identifier.clone(),
            self.window_size,
            self.series.clone(),
        ))
    }
}
