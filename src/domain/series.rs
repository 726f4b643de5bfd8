//! Materialized, monotonically sorted candle series with windowed access.
//!
//! Backtest lookups move forward in time, so the last served index is kept
//! as a cursor and reused: a window near the previous `as_of` costs O(1)
//! amortized instead of a scan from the start.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};

use crate::domain::error::TradeLoopError;
use crate::domain::ohlcv::{OhlcvBar, Ticker, TimeFrame};
use crate::ports::market_data_port::MarketDataSource;

#[derive(Debug)]
pub struct CandleSeries {
    symbol: String,
    time_frame: TimeFrame,
    bars: Vec<OhlcvBar>,
    // The cursor is a hint, not state: any stale value is corrected by
    // index_at, so relaxed ordering is enough.
    cursor: AtomicUsize,
}

impl Clone for CandleSeries {
    fn clone(&self) -> Self {
        CandleSeries {
            symbol: self.symbol.clone(),
            time_frame: self.time_frame,
            bars: self.bars.clone(),
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
        }
    }
}

impl CandleSeries {
    pub fn new(symbol: impl Into<String>, time_frame: TimeFrame, mut bars: Vec<OhlcvBar>) -> Self {
        bars.sort_by_key(|b| b.datetime);
        bars.dedup_by_key(|b| b.datetime);
        CandleSeries {
            symbol: symbol.into(),
            time_frame,
            bars,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn time_frame(&self) -> TimeFrame {
        self.time_frame
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_datetime(&self) -> Option<DateTime<Utc>> {
        self.bars.first().map(|b| b.datetime)
    }

    pub fn last_datetime(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.datetime)
    }

    /// All bars within `[start, end]`, in order.
    pub fn slice(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<OhlcvBar> {
        self.bars
            .iter()
            .filter(|b| b.datetime >= start && b.datetime <= end)
            .cloned()
            .collect()
    }

    /// Index of the last bar at or before `as_of`.
    ///
    /// Fails with `NoDataAvailable` when `as_of` precedes all data.
    fn index_at(&self, as_of: DateTime<Utc>) -> Result<usize, TradeLoopError> {
        let first = self.first_datetime();
        if first.is_none() || as_of < first.unwrap_or(as_of) {
            return Err(TradeLoopError::NoDataAvailable {
                identifier: self.symbol.clone(),
                as_of,
            });
        }
        let mut idx = self.cursor.load(Ordering::Relaxed).min(self.bars.len() - 1);
        if self.bars[idx].datetime > as_of {
            // Cursor is ahead of as_of: a backwards lookup, re-seek.
            idx = self.bars.partition_point(|b| b.datetime <= as_of) - 1;
        } else {
            while idx + 1 < self.bars.len() && self.bars[idx + 1].datetime <= as_of {
                idx += 1;
            }
        }
        self.cursor.store(idx, Ordering::Relaxed);
        Ok(idx)
    }

    /// The last bar at or before `as_of`.
    pub fn bar_at(&self, as_of: DateTime<Utc>) -> Result<&OhlcvBar, TradeLoopError> {
        Ok(&self.bars[self.index_at(as_of)?])
    }

    pub fn last_price(&self, as_of: DateTime<Utc>) -> Result<f64, TradeLoopError> {
        Ok(self.bar_at(as_of)?.close)
    }

    /// Up to `size` bars ending at the last bar at-or-before `as_of`,
    /// walking the time-frame grid backwards. Missing candles are
    /// forward-filled from the nearest preceding row (flat bar at its
    /// close, zero volume); the window is shorter only when the series
    /// starts later.
    pub fn window(&self, as_of: DateTime<Utc>, size: usize) -> Result<Vec<OhlcvBar>, TradeLoopError> {
        let idx = self.index_at(as_of)?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let step = self.time_frame.duration();
        let end = self.bars[idx].datetime;
        let mut out: Vec<OhlcvBar> = Vec::with_capacity(size);
        let mut j = idx as isize;
        for k in 0..size {
            let expected = end - step * (k as i32);
            while j >= 0 && self.bars[j as usize].datetime > expected {
                j -= 1;
            }
            if j < 0 {
                break;
            }
            let bar = &self.bars[j as usize];
            if bar.datetime == expected {
                out.push(bar.clone());
            } else {
                out.push(OhlcvBar {
                    symbol: bar.symbol.clone(),
                    datetime: expected,
                    open: bar.close,
                    high: bar.close,
                    low: bar.close,
                    close: bar.close,
                    volume: 0.0,
                });
            }
        }
        out.reverse();
        Ok(out)
    }

    pub fn ticker(&self, as_of: DateTime<Utc>) -> Result<Ticker, TradeLoopError> {
        let bar = self.bar_at(as_of)?;
        Ok(Ticker {
            symbol: self.symbol.clone(),
            bid: bar.close,
            ask: bar.close,
            datetime: bar.datetime,
        })
    }
}

/// A market data source backed by a pre-materialized series: the backtest
/// variant of any live source, sharing its identifier.
#[derive(Debug, Clone)]
pub struct BacktestMarketDataSource {
    identifier: String,
    window_size: usize,
    series: CandleSeries,
}

impl BacktestMarketDataSource {
    pub fn new(identifier: impl Into<String>, window_size: usize, series: CandleSeries) -> Self {
        BacktestMarketDataSource {
            identifier: identifier.into(),
            window_size,
            series,
        }
    }

    pub fn series(&self) -> &CandleSeries {
        &self.series
    }
}

impl MarketDataSource for BacktestMarketDataSource {
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
        Ok(self.clone())
    }
}
