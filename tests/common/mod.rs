//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use tradeloop::domain::matcher::OrderTradeMatcher;
use tradeloop::domain::ohlcv::{OhlcvBar, TimeFrame};
use tradeloop::domain::order::OrderAmount;
use tradeloop::domain::portfolio::{Portfolio, PortfolioConfiguration};
use tradeloop::domain::scheduler::{Schedule, TimeUnit};
use tradeloop::domain::series::{BacktestMarketDataSource, CandleSeries};
use tradeloop::domain::strategy::SmaCrossover;

/// Hours past 2024-01-01 00:00 UTC; values past 23 roll into later days.
pub fn ts(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::hours(i64::from(hour))
}

pub fn hourly_bars(symbol: &str, closes: &[f64]) -> Vec<OhlcvBar> {
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| OhlcvBar {
            symbol: symbol.to_string(),
            datetime: ts(i as u32),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        })
        .collect()
}

pub fn btc_sources(closes: &[f64]) -> HashMap<String, BacktestMarketDataSource> {
    let series = CandleSeries::new("BTC", TimeFrame::OneHour, hourly_bars("BTC", closes));
    HashMap::from([(
        "btc_1h".to_string(),
        BacktestMarketDataSource::new("btc_1h", 4, series),
    )])
}

pub fn fresh_matcher(balance: f64) -> OrderTradeMatcher {
    OrderTradeMatcher::new(Portfolio::new(&PortfolioConfiguration {
        market: "binance".into(),
        trading_symbol: "EUR".into(),
        initial_balance: balance,
    }))
}

pub fn sma_crossover(id: &str) -> SmaCrossover {
    SmaCrossover::new(
        id,
        "btc_1h",
        "BTC",
        2,
        3,
        Schedule::new(TimeUnit::Hour, 1),
        OrderAmount::Units(1.0),
    )
    .unwrap()
}

/// Downtrend, reversal at hour 4 (entry at 12), collapse at hour 6
/// (exit at 5).
pub const ROUND_TRIP_CLOSES: [f64; 8] = [10.0, 9.0, 8.0, 7.0, 12.0, 13.0, 5.0, 4.0];
