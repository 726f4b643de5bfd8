//! OHLCV bar, ticker and candle time frame representations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeLoopError;

/// Candle duration of a market data series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeFrame {
    OneMinute,
    FifteenMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl TimeFrame {
    pub fn duration(&self) -> Duration {
        match self {
            TimeFrame::OneMinute => Duration::minutes(1),
            TimeFrame::FifteenMinutes => Duration::minutes(15),
            TimeFrame::OneHour => Duration::hours(1),
            TimeFrame::FourHours => Duration::hours(4),
            TimeFrame::OneDay => Duration::days(1),
        }
    }

    pub fn parse(value: &str) -> Result<Self, TradeLoopError> {
        match value {
            "1m" => Ok(TimeFrame::OneMinute),
            "15m" => Ok(TimeFrame::FifteenMinutes),
            "1h" => Ok(TimeFrame::OneHour),
            "4h" => Ok(TimeFrame::FourHours),
            "1d" => Ok(TimeFrame::OneDay),
            other => Err(TradeLoopError::Validation {
                reason: format!("unknown time frame {other:?} (expected 1m, 15m, 1h, 4h or 1d)"),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFrame::OneMinute => "1m",
            TimeFrame::FifteenMinutes => "15m",
            TimeFrame::OneHour => "1h",
            TimeFrame::FourHours => "4h",
            TimeFrame::OneDay => "1d",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OhlcvBar {
    pub symbol: String,
    pub datetime: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Best bid/ask at a point in time. In backtests both sides are served
/// from the close of the nearest preceding candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub datetime: DateTime<Utc>,
}

impl Ticker {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}
