//! Market data source port trait and the resolved data bundle strategies
//! receive.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::error::TradeLoopError;
use crate::domain::ohlcv::{OhlcvBar, Ticker, TimeFrame};
use crate::domain::series::BacktestMarketDataSource;

/// A named supplier of OHLCV windows and tickers for one symbol.
///
/// Live implementations proxy to an exchange and may block on network I/O;
/// callers retry them with bounded backoff. `to_backtest_variant`
/// materializes the same identifier over a pre-loaded series.
pub trait MarketDataSource {
    fn identifier(&self) -> &str;
    fn symbol(&self) -> &str;
    fn time_frame(&self) -> TimeFrame;
    /// Declared lookback: how many bars a strategy wants per invocation.
    fn window_size(&self) -> usize;

    fn get_window(
        &self,
        as_of: DateTime<Utc>,
        size: usize,
    ) -> Result<Vec<OhlcvBar>, TradeLoopError>;

    fn get_ticker(&self, as_of: DateTime<Utc>) -> Result<Ticker, TradeLoopError>;

    fn to_backtest_variant(&self) -> Result<BacktestMarketDataSource, TradeLoopError>;
}

/// Materialized data for one strategy invocation, keyed by data source
/// identifier.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    pub windows: HashMap<String, Vec<OhlcvBar>>,
    pub tickers: HashMap<String, Ticker>,
}

impl MarketData {
    pub fn window(&self, identifier: &str) -> Option<&[OhlcvBar]> {
        self.windows.get(identifier).map(|w| w.as_slice())
    }

    pub fn ticker(&self, identifier: &str) -> Option<&Ticker> {
        self.tickers.get(identifier)
    }
}
