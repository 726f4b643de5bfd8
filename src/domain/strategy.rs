//! Strategy traits and the order-entry context passed to event-driven
//! strategies, plus the built-in SMA crossover.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::domain::error::TradeLoopError;
use crate::domain::matcher::OrderTradeMatcher;
use crate::domain::ohlcv::OhlcvBar;
use crate::domain::order::{OrderAmount, OrderId, OrderSide, OrderType};
use crate::domain::portfolio::Portfolio;
use crate::domain::scheduler::Schedule;
use crate::domain::trade::{Trade, TradeId};
use crate::ports::market_data_port::MarketData;

/// An event-driven strategy: invoked on its schedule with the data it
/// declared, placing orders through the context.
pub trait Strategy {
    fn id(&self) -> &str;
    fn schedule(&self) -> Schedule;
    /// Identifiers of the data sources this strategy wants resolved.
    fn data_sources(&self) -> Vec<String>;

    fn on_tick(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        data: &MarketData,
    ) -> Result<(), TradeLoopError>;
}

/// A strategy that can precompute its entry/exit decisions over a whole
/// series at once. Signal vectors are index-aligned with the input bars.
pub trait VectorizedStrategy: Send + Sync {
    fn id(&self) -> &str;

    /// Sizing applied to every entry the signal vector triggers.
    fn order_amount(&self) -> OrderAmount {
        OrderAmount::PercentOfPortfolio(100.0)
    }

    fn generate_buy_signals(
        &self,
        windows: &HashMap<String, Vec<OhlcvBar>>,
    ) -> Result<HashMap<String, Vec<bool>>, TradeLoopError>;

    fn generate_sell_signals(
        &self,
        windows: &HashMap<String, Vec<OhlcvBar>>,
    ) -> Result<HashMap<String, Vec<bool>>, TradeLoopError>;
}

/// Order entry facade handed to `Strategy::on_tick`. Orders are created
/// against the ledger but left in `Created` state; the surrounding engine
/// submits them (and, in a backtest, decides when they fill).
pub struct StrategyContext<'a> {
    matcher: &'a mut OrderTradeMatcher,
    now: DateTime<Utc>,
    prices: HashMap<String, f64>,
    /// Venue fee per unit notional, applied to immediate fills. Zero in
    /// live mode, where the venue reports real fees.
    fee_rate: f64,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        matcher: &'a mut OrderTradeMatcher,
        now: DateTime<Utc>,
        prices: HashMap<String, f64>,
        fee_rate: f64,
    ) -> Self {
        StrategyContext {
            matcher,
            now,
            prices,
            fee_rate,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.matcher.portfolio
    }

    /// Last known price for a symbol on this tick.
    pub fn price(&self, symbol: &str) -> Result<f64, TradeLoopError> {
        self.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| TradeLoopError::NoDataAvailable {
                identifier: symbol.to_string(),
                as_of: self.now,
            })
    }

    pub fn open_trades(&self, symbol: &str) -> Vec<TradeId> {
        self.matcher.open_trades(symbol)
    }

    pub fn trade(&self, id: TradeId) -> Result<&Trade, TradeLoopError> {
        self.matcher.trade(id)
    }

    pub fn market_buy(
        &mut self,
        symbol: &str,
        amount: OrderAmount,
    ) -> Result<OrderId, TradeLoopError> {
        let price = self.price(symbol)?;
        self.matcher.create_order(
            symbol,
            OrderSide::Buy,
            OrderType::Market,
            amount,
            None,
            price,
            self.now,
        )
    }

    pub fn limit_buy(
        &mut self,
        symbol: &str,
        amount: OrderAmount,
        limit_price: f64,
    ) -> Result<OrderId, TradeLoopError> {
        let price = self.price(symbol)?;
        self.matcher.create_order(
            symbol,
            OrderSide::Buy,
            OrderType::Limit,
            amount,
            Some(limit_price),
            price,
            self.now,
        )
    }

    pub fn market_sell(&mut self, symbol: &str, units: f64) -> Result<OrderId, TradeLoopError> {
        let price = self.price(symbol)?;
        self.matcher.create_order(
            symbol,
            OrderSide::Sell,
            OrderType::Market,
            OrderAmount::Units(units),
            None,
            price,
            self.now,
        )
    }

    pub fn limit_sell(
        &mut self,
        symbol: &str,
        units: f64,
        limit_price: f64,
    ) -> Result<OrderId, TradeLoopError> {
        let price = self.price(symbol)?;
        self.matcher.create_order(
            symbol,
            OrderSide::Sell,
            OrderType::Limit,
            OrderAmount::Units(units),
            Some(limit_price),
            price,
            self.now,
        )
    }

    /// Sells the trade's remaining amount at the current market price.
    pub fn close_trade(&mut self, trade_id: TradeId) -> Result<OrderId, TradeLoopError> {
        let symbol = self.matcher.trade(trade_id)?.symbol.clone();
        let price = self.price(&symbol)?;
        let fee = self.matcher.sellable(trade_id) * price * self.fee_rate;
        self.matcher.close_trade(trade_id, price, fee, self.now)
    }
}

/// Simple moving average of the last `period` closes, if enough bars.
pub fn sma(bars: &[OhlcvBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }
    let sum: f64 = bars[bars.len() - period..].iter().map(|b| b.close).sum();
    Some(sum / period as f64)
}

/// Long-only SMA crossover: buy when the fast average crosses above the
/// slow one, close every open trade when it crosses back below.
#[derive(Debug, Clone)]
pub struct SmaCrossover {
    id: String,
    source: String,
    symbol: String,
    fast: usize,
    slow: usize,
    schedule: Schedule,
    amount: OrderAmount,
}

impl SmaCrossover {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        symbol: impl Into<String>,
        fast: usize,
        slow: usize,
        schedule: Schedule,
        amount: OrderAmount,
    ) -> Result<Self, TradeLoopError> {
        if fast == 0 || slow == 0 || fast >= slow {
            return Err(TradeLoopError::Validation {
                reason: format!("fast period {fast} must be shorter than slow period {slow}"),
            });
        }
        Ok(SmaCrossover {
            id: id.into(),
            source: source.into(),
            symbol: symbol.into(),
            fast,
            slow,
            schedule,
            amount,
        })
    }

    /// Bars the crossover needs per tick: the slow average plus one bar
    /// of history for the previous value.
    pub fn window_size(&self) -> usize {
        self.slow + 1
    }

    /// Crossover state at the end of `bars`: (crossed up, crossed down).
    fn cross(&self, bars: &[OhlcvBar]) -> (bool, bool) {
        if bars.len() < self.slow + 1 {
            return (false, false);
        }
        let prev = &bars[..bars.len() - 1];
        let (Some(fast_now), Some(slow_now), Some(fast_prev), Some(slow_prev)) = (
            sma(bars, self.fast),
            sma(bars, self.slow),
            sma(prev, self.fast),
            sma(prev, self.slow),
        ) else {
            return (false, false);
        };
        let up = fast_prev <= slow_prev && fast_now > slow_now;
        let down = fast_prev >= slow_prev && fast_now < slow_now;
        (up, down)
    }
}

impl Strategy for SmaCrossover {
    fn id(&self) -> &str {
        &self.id
    }

    fn schedule(&self) -> Schedule {
        self.schedule
    }

    fn data_sources(&self) -> Vec<String> {
        vec![self.source.clone()]
    }

    fn on_tick(
        &mut self,
        ctx: &mut StrategyContext<'_>,
        data: &MarketData,
    ) -> Result<(), TradeLoopError> {
        let Some(window) = data.window(&self.source) else {
            return Ok(());
        };
        let (up, down) = self.cross(window);
        if up && ctx.open_trades(&self.symbol).is_empty() {
            ctx.market_buy(&self.symbol, self.amount)?;
        } else if down {
            for trade_id in ctx.open_trades(&self.symbol) {
                ctx.close_trade(trade_id)?;
            }
        }
        Ok(())
    }
}

impl VectorizedStrategy for SmaCrossover {
    fn id(&self) -> &str {
        &self.id
    }

    fn order_amount(&self) -> OrderAmount {
        self.amount
    }

    fn generate_buy_signals(
        &self,
        windows: &HashMap<String, Vec<OhlcvBar>>,
    ) -> Result<HashMap<String, Vec<bool>>, TradeLoopError> {
        self.signals(windows, true)
    }

    fn generate_sell_signals(
        &self,
        windows: &HashMap<String, Vec<OhlcvBar>>,
    ) -> Result<HashMap<String, Vec<bool>>, TradeLoopError> {
        self.signals(windows, false)
    }
}

impl SmaCrossover {
    fn signals(
        &self,
        windows: &HashMap<String, Vec<OhlcvBar>>,
        up: bool,
    ) -> Result<HashMap<String, Vec<bool>>, TradeLoopError> {
        let bars = windows
            .get(&self.source)
            .ok_or_else(|| TradeLoopError::Validation {
                reason: format!("missing window for data source {:?}", self.source),
            })?;
        let signals = (0..bars.len())
            .map(|i| {
                let (crossed_up, crossed_down) = self.cross(&bars[..=i]);
                if up { crossed_up } else { crossed_down }
            })
            .collect();
        Ok(HashMap::from([(self.source.clone(), signals)]))
    }
}
