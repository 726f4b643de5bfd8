//! Backtest engines over pre-materialized candle series.
//!
//! The event-driven engine replays the live loop: a simulated clock ticks
//! on the strategy's schedule, resting orders are matched against bars,
//! and the strategy places orders through the same context it would use
//! live. The vectorized engine precomputes signal vectors and walks the
//! bars once. Market orders placed on a tick fill at that bar's close in
//! both engines, so the two produce the same ledger for the same signals.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::domain::error::TradeLoopError;
use crate::domain::matcher::OrderTradeMatcher;
use crate::domain::order::{Order, OrderSide, OrderStatus, OrderType};
use crate::domain::portfolio::{Portfolio, PortfolioConfiguration, SnapshotInterval};
use crate::domain::scheduler::StrategyScheduler;
use crate::domain::series::BacktestMarketDataSource;
use crate::domain::strategy::{Strategy, StrategyContext, VectorizedStrategy};
use crate::domain::trade::Trade;
use crate::ports::market_data_port::MarketDataSource;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_balance: f64,
    pub market: String,
    pub trading_symbol: String,
    /// Simulated venue fee as a fraction of fill notional.
    pub fee_rate: f64,
    pub snapshot_interval: SnapshotInterval,
}

impl BacktestConfig {
    fn portfolio_configuration(&self) -> PortfolioConfiguration {
        PortfolioConfiguration {
            market: self.market.clone(),
            trading_symbol: self.trading_symbol.clone(),
            initial_balance: self.initial_balance,
        }
    }

    fn validate(&self) -> Result<(), TradeLoopError> {
        if self.start >= self.end {
            return Err(TradeLoopError::Validation {
                reason: format!("start {} must precede end {}", self.start, self.end),
            });
        }
        if self.initial_balance <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!(
                    "initial balance must be positive, got {}",
                    self.initial_balance
                ),
            });
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(TradeLoopError::Validation {
                reason: format!("fee rate must be within [0, 1), got {}", self.fee_rate),
            });
        }
        Ok(())
    }
}

/// Headline numbers of one finished run; what gets checkpointed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub strategy_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_balance: f64,
    pub final_net_size: f64,
    pub growth: f64,
    pub growth_rate: f64,
    pub total_net_gain: f64,
    pub realized: f64,
    pub orders: usize,
    pub trades_opened: usize,
    pub trades_closed: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BacktestResult {
    pub summary: BacktestSummary,
    pub portfolio: Portfolio,
    pub orders: Vec<Order>,
    pub trades: Vec<Trade>,
}

pub struct Backtester {
    config: BacktestConfig,
}

impl Backtester {
    pub fn new(config: BacktestConfig) -> Self {
        Backtester { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Replays the live loop over historical data on the strategy's
    /// schedule.
    pub fn run_event_driven(
        &self,
        strategy: &mut dyn Strategy,
        sources: &HashMap<String, BacktestMarketDataSource>,
    ) -> Result<BacktestResult, TradeLoopError> {
        self.config.validate()?;
        let step = strategy.schedule().duration();
        if step <= Duration::zero() {
            return Err(TradeLoopError::Validation {
                reason: "strategy schedule must have a positive interval".into(),
            });
        }
        info!(
            strategy = strategy.id(),
            start = %self.config.start,
            end = %self.config.end,
            "starting event-driven backtest"
        );

        let mut matcher = OrderTradeMatcher::new(Portfolio::new(
            &self.config.portfolio_configuration(),
        ));
        let mut scheduler = StrategyScheduler::new();
        let identifiers = strategy.data_sources();
        let boxed: HashMap<String, Box<dyn MarketDataSource>> = sources
            .iter()
            .map(|(k, v)| (k.clone(), Box::new(v.clone()) as Box<dyn MarketDataSource>))
            .collect();

        let mut now = self.config.start;
        let mut last_snapshot_day: Option<NaiveDate> = None;
        while now <= self.config.end {
            let mut filled = self.fill_resting_orders(&mut matcher, sources, now)?;

            if scheduler.is_due(strategy.id(), strategy.schedule(), now) {
                if let Some(data) =
                    scheduler.resolve_or_skip(&boxed, &identifiers, strategy.id(), now)?
                {
                    let prices: HashMap<String, f64> = data
                        .tickers
                        .values()
                        .map(|t| (t.symbol.clone(), t.bid))
                        .collect();
                    let created_from = matcher.orders().len();
                    let mut ctx = StrategyContext::new(
                        &mut matcher,
                        now,
                        prices.clone(),
                        self.config.fee_rate,
                    );
                    strategy.on_tick(&mut ctx, &data)?;
                    scheduler.mark_run(strategy.id(), now);

                    // Submit what the strategy created; market orders fill
                    // against this tick's close, limit orders rest.
                    for id in created_from..matcher.orders().len() {
                        let order = matcher.order(id)?;
                        if order.is_terminal() {
                            filled = true;
                            continue;
                        }
                        let (order_type, symbol, amount) =
                            (order.order_type, order.symbol.clone(), order.amount);
                        matcher.submit_order(id, None, now)?;
                        if order_type == OrderType::Market {
                            let price = prices.get(&symbol).copied().ok_or_else(|| {
                                TradeLoopError::NoDataAvailable {
                                    identifier: symbol.clone(),
                                    as_of: now,
                                }
                            })?;
                            let fee = amount * price * self.config.fee_rate;
                            if matcher.record_fill(id, amount, price, fee, now)?.is_some() {
                                filled = true;
                            }
                        }
                    }
                }
            }

            self.maybe_snapshot(&mut matcher, now, filled, &mut last_snapshot_day);
            now += step;
        }
        Ok(self.finish(strategy.id(), matcher))
    }

    /// Precomputes signal vectors and walks the bars once. Entries are
    /// suppressed while a trade is open; exits close every open trade.
    pub fn run_vectorized(
        &self,
        strategy: &dyn VectorizedStrategy,
        sources: &HashMap<String, BacktestMarketDataSource>,
    ) -> Result<BacktestResult, TradeLoopError> {
        self.config.validate()?;
        info!(
            strategy = strategy.id(),
            start = %self.config.start,
            end = %self.config.end,
            "starting vectorized backtest"
        );

        let mut windows: HashMap<String, Vec<_>> = HashMap::new();
        for (identifier, source) in sources {
            windows.insert(
                identifier.clone(),
                source.series().slice(self.config.start, self.config.end),
            );
        }
        let buys = strategy.generate_buy_signals(&windows)?;
        let sells = strategy.generate_sell_signals(&windows)?;
        for (identifier, bars) in &windows {
            for signals in [buys.get(identifier), sells.get(identifier)] {
                if signals.map(|s| s.len()) != Some(bars.len()) {
                    return Err(TradeLoopError::Validation {
                        reason: format!(
                            "signal vector for {identifier:?} is not aligned with its bars"
                        ),
                    });
                }
            }
        }

        // Merge the per-source timelines into one chronological pass.
        let mut events: Vec<(DateTime<Utc>, &String, usize)> = Vec::new();
        for (identifier, bars) in &windows {
            for (i, bar) in bars.iter().enumerate() {
                events.push((bar.datetime, identifier, i));
            }
        }
        events.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let mut matcher = OrderTradeMatcher::new(Portfolio::new(
            &self.config.portfolio_configuration(),
        ));
        let mut last_snapshot_day: Option<NaiveDate> = None;
        for (now, identifier, i) in events {
            let bar = &windows[identifier][i];
            let buy = buys[identifier][i];
            let sell = sells[identifier][i];
            let open = matcher.open_trades(&bar.symbol);
            let mut filled = false;
            if buy && open.is_empty() {
                let id = matcher.create_order(
                    &bar.symbol,
                    OrderSide::Buy,
                    OrderType::Market,
                    strategy.order_amount(),
                    None,
                    bar.close,
                    now,
                )?;
                matcher.submit_order(id, None, now)?;
                let amount = matcher.order(id)?.amount;
                let fee = amount * bar.close * self.config.fee_rate;
                matcher.record_fill(id, amount, bar.close, fee, now)?;
                debug!(symbol = bar.symbol.as_str(), price = bar.close, "entry");
                filled = true;
            } else if sell && !open.is_empty() {
                for trade_id in open {
                    let fee = matcher.sellable(trade_id) * bar.close * self.config.fee_rate;
                    matcher.close_trade(trade_id, bar.close, fee, now)?;
                }
                debug!(symbol = bar.symbol.as_str(), price = bar.close, "exit");
                filled = true;
            }
            self.maybe_snapshot(&mut matcher, now, filled, &mut last_snapshot_day);
        }
        Ok(self.finish(strategy.id(), matcher))
    }

    /// Matches resting orders against the bar covering `now`: limit buys
    /// fill at their price once the bar trades through it, limit sells
    /// likewise, and resting market orders fill at the bar open.
    fn fill_resting_orders(
        &self,
        matcher: &mut OrderTradeMatcher,
        sources: &HashMap<String, BacktestMarketDataSource>,
        now: DateTime<Utc>,
    ) -> Result<bool, TradeLoopError> {
        let mut any = false;
        for id in matcher.resting_order_ids() {
            let order = matcher.order(id)?;
            if order.status == OrderStatus::Created {
                continue;
            }
            let (symbol, side, order_type, price, amount) = (
                order.symbol.clone(),
                order.side,
                order.order_type,
                order.price,
                order.amount,
            );
            let Some(source) = sources.values().find(|s| s.symbol() == symbol) else {
                continue;
            };
            let bar = match source.series().bar_at(now) {
                Ok(bar) => bar.clone(),
                Err(TradeLoopError::NoDataAvailable { .. }) => continue,
                Err(err) => return Err(err),
            };
            let fill_price = match order_type {
                OrderType::Market => Some(bar.open),
                OrderType::Limit => match side {
                    OrderSide::Buy if bar.low <= price => Some(price),
                    OrderSide::Sell if bar.high >= price => Some(price),
                    _ => None,
                },
            };
            if let Some(fill_price) = fill_price {
                let fee = amount * fill_price * self.config.fee_rate;
                if matcher
                    .record_fill(id, amount, fill_price, fee, now)?
                    .is_some()
                {
                    any = true;
                }
            }
        }
        Ok(any)
    }

    fn maybe_snapshot(
        &self,
        matcher: &mut OrderTradeMatcher,
        now: DateTime<Utc>,
        filled: bool,
        last_day: &mut Option<NaiveDate>,
    ) {
        match self.config.snapshot_interval {
            SnapshotInterval::EveryTick => matcher.portfolio.record_snapshot(now),
            SnapshotInterval::OnFill => {
                if filled {
                    matcher.portfolio.record_snapshot(now);
                }
            }
            SnapshotInterval::Daily => {
                let day = now.date_naive();
                if *last_day != Some(day) {
                    matcher.portfolio.record_snapshot(now);
                    *last_day = Some(day);
                }
            }
        }
    }

    fn finish(&self, strategy_id: &str, matcher: OrderTradeMatcher) -> BacktestResult {
        let (portfolio, orders, trades) = matcher.into_parts();
        let final_net_size = portfolio.net_size();
        let growth = final_net_size - self.config.initial_balance;
        let summary = BacktestSummary {
            strategy_id: strategy_id.to_string(),
            start: self.config.start,
            end: self.config.end,
            initial_balance: self.config.initial_balance,
            final_net_size,
            growth,
            growth_rate: growth / self.config.initial_balance,
            total_net_gain: portfolio.total_net_gain,
            realized: portfolio.realized,
            orders: orders.len(),
            trades_opened: trades.len(),
            trades_closed: trades.iter().filter(|t| t.is_closed()).count(),
        };
        info!(
            strategy = strategy_id,
            final_net_size, growth, "backtest finished"
        );
        BacktestResult {
            summary,
            portfolio,
            orders,
            trades,
        }
    }
}
