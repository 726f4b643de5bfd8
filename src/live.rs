//! Live trading loop: polls venue order state into the ledger, runs due
//! strategies, and places what they created. One thread, one tick at a
//! time; transient venue failures are retried with exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::domain::error::TradeLoopError;
use crate::domain::matcher::OrderTradeMatcher;
use crate::domain::order::{OrderId, OrderStatus};
use crate::domain::scheduler::StrategyScheduler;
use crate::domain::strategy::{Strategy, StrategyContext};
use crate::ports::execution_port::OrderExecutor;
use crate::ports::market_data_port::MarketDataSource;

/// Bounded exponential backoff for venue calls.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    /// Runs `f`, retrying transient failures (venue and I/O errors) with
    /// doubling delays. Domain errors are returned immediately.
    pub fn retry<T, F>(&self, what: &str, mut f: F) -> Result<T, TradeLoopError>
    where
        F: FnMut() -> Result<T, TradeLoopError>,
    {
        let mut delay = self.base_delay;
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(err @ (TradeLoopError::ExternalAdapter { .. } | TradeLoopError::Io(_))) => {
                    if attempt >= self.attempts.max(1) {
                        return Err(err);
                    }
                    warn!(what, attempt, %err, "transient failure, retrying");
                    thread::sleep(delay);
                    delay *= 2;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub struct LiveTrader {
    matcher: OrderTradeMatcher,
    scheduler: StrategyScheduler,
    strategies: Vec<Box<dyn Strategy>>,
    sources: HashMap<String, Box<dyn MarketDataSource>>,
    executor: Box<dyn OrderExecutor>,
    backoff: BackoffPolicy,
    poll_interval: Duration,
}

impl LiveTrader {
    pub fn new(
        matcher: OrderTradeMatcher,
        strategies: Vec<Box<dyn Strategy>>,
        sources: HashMap<String, Box<dyn MarketDataSource>>,
        executor: Box<dyn OrderExecutor>,
        backoff: BackoffPolicy,
        poll_interval: Duration,
    ) -> Self {
        LiveTrader {
            matcher,
            scheduler: StrategyScheduler::new(),
            strategies,
            sources,
            executor,
            backoff,
            poll_interval,
        }
    }

    pub fn matcher(&self) -> &OrderTradeMatcher {
        &self.matcher
    }

    /// One pass: venue state in, strategy decisions out.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        self.sync_orders(now)?;
        self.run_due_strategies(now)?;
        self.place_created_orders(now)?;
        Ok(())
    }

    /// Polls every placed, non-terminal order and folds the venue's view
    /// into the ledger. A tick that folds a fill in appends a portfolio
    /// snapshot, so the snapshot sequence tracks live net-worth changes.
    fn sync_orders(&mut self, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        let mut filled = false;
        for id in self.matcher.resting_order_ids() {
            let order = self.matcher.order(id)?;
            if order.external_id.is_none() {
                continue;
            }
            let order = order.clone();
            let status = self
                .backoff
                .retry("fetch order status", || self.executor.fetch_status(&order))?;

            if status.filled_amount > order.filled_amount {
                let report = self.matcher.record_fill(
                    id,
                    status.filled_amount,
                    status.fill_price,
                    status.fee,
                    now,
                )?;
                filled |= report.is_some();
            } else if status.status == OrderStatus::Pending
                && self.matcher.order(id)?.status == OrderStatus::Open
            {
                self.matcher.mark_pending(id, now)?;
            }
            if status.status.is_terminal()
                && status.status != OrderStatus::Closed
                && !self.matcher.order(id)?.is_terminal()
            {
                info!(order = id, status = ?status.status, "venue ended order");
                self.matcher.cancel_order(id, now)?;
            }
        }
        if filled {
            self.matcher.portfolio.record_snapshot(now);
        }
        Ok(())
    }

    /// Cancels an order at the venue, then releases its ledger effects.
    /// Orders the venue never saw are canceled locally.
    pub fn cancel_order(&mut self, id: OrderId, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        let order = self.matcher.order(id)?.clone();
        if order.is_terminal() {
            return Err(TradeLoopError::AlreadyClosed {
                entity: "order".into(),
                id,
            });
        }
        if order.external_id.is_some() {
            self.backoff
                .retry("cancel order", || self.executor.cancel(&order))?;
        }
        self.matcher.cancel_order(id, now)
    }

    fn run_due_strategies(&mut self, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        for strategy in &mut self.strategies {
            if !self
                .scheduler
                .is_due(strategy.id(), strategy.schedule(), now)
            {
                continue;
            }
            let identifiers = strategy.data_sources();
            let Some(data) =
                self.scheduler
                    .resolve_or_skip(&self.sources, &identifiers, strategy.id(), now)?
            else {
                continue;
            };
            let prices: HashMap<String, f64> = data
                .tickers
                .values()
                .map(|t| (t.symbol.clone(), t.mid()))
                .collect();
            let mut ctx = StrategyContext::new(&mut self.matcher, now, prices, 0.0);
            strategy.on_tick(&mut ctx, &data)?;
            self.scheduler.mark_run(strategy.id(), now);
        }
        Ok(())
    }

    /// Hands newly created orders to the venue. An order that cannot be
    /// placed stays in `Created` and is tried again next tick.
    fn place_created_orders(&mut self, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        let created: Vec<OrderId> = self
            .matcher
            .orders()
            .iter()
            .filter(|o| o.status == OrderStatus::Created)
            .map(|o| o.id)
            .collect();
        for id in created {
            let order = self.matcher.order(id)?.clone();
            let external_id = self
                .backoff
                .retry("place order", || self.executor.place(&order))?;
            info!(order = id, external = external_id.as_str(), "order placed");
            self.matcher.submit_order(id, Some(external_id), now)?;
        }
        Ok(())
    }

    /// Ticks until `shutdown` is set. Tick errors are logged, not fatal;
    /// the next tick re-reads venue state and converges.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!(strategies = self.strategies.len(), "live loop starting");
        while !shutdown.load(Ordering::Relaxed) {
            if let Err(err) = self.tick(Utc::now()) {
                error!(%err, "tick failed");
            }
            thread::sleep(self.poll_interval);
        }
        info!("live loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ohlcv::{OhlcvBar, TimeFrame};
    use crate::domain::order::{Order, OrderAmount};
    use crate::domain::portfolio::{Portfolio, PortfolioConfiguration};
    use crate::domain::scheduler::{Schedule, TimeUnit};
    use crate::domain::series::{BacktestMarketDataSource, CandleSeries};
    use crate::domain::strategy::SmaCrossover;
    use crate::ports::execution_port::ExecutionStatus;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
    }

    /// Fills everything at the order price once `pending_polls` status
    /// polls have answered with a venue-side Pending acknowledgement.
    struct InstantFillExecutor {
        placed: RefCell<Vec<String>>,
        canceled: Rc<RefCell<Vec<String>>>,
        fail_places: RefCell<u32>,
        pending_polls: RefCell<u32>,
    }

    impl InstantFillExecutor {
        fn new() -> Self {
            InstantFillExecutor {
                placed: RefCell::new(Vec::new()),
                canceled: Rc::new(RefCell::new(Vec::new())),
                fail_places: RefCell::new(0),
                pending_polls: RefCell::new(0),
            }
        }
    }

    impl OrderExecutor for InstantFillExecutor {
        fn place(&mut self, order: &Order) -> Result<String, TradeLoopError> {
            let mut failures = self.fail_places.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                return Err(TradeLoopError::ExternalAdapter {
                    reason: "venue unavailable".into(),
                });
            }
            let external = format!("ext-{}", order.id);
            self.placed.borrow_mut().push(external.clone());
            Ok(external)
        }

        fn cancel(&mut self, order: &Order) -> Result<(), TradeLoopError> {
            self.canceled
                .borrow_mut()
                .push(order.external_id.clone().unwrap_or_default());
            Ok(())
        }

        fn fetch_status(&self, order: &Order) -> Result<ExecutionStatus, TradeLoopError> {
            let mut pending = self.pending_polls.borrow_mut();
            if *pending > 0 {
                *pending -= 1;
                return Ok(ExecutionStatus {
                    status: OrderStatus::Pending,
                    filled_amount: 0.0,
                    fill_price: order.price,
                    fee: 0.0,
                });
            }
            Ok(ExecutionStatus {
                status: OrderStatus::Closed,
                filled_amount: order.amount,
                fill_price: order.price,
                fee: 0.0,
            })
        }
    }

    fn trader(executor: InstantFillExecutor) -> LiveTrader {
        let matcher = OrderTradeMatcher::new(Portfolio::new(&PortfolioConfiguration {
            market: "binance".into(),
            trading_symbol: "EUR".into(),
            initial_balance: 1000.0,
        }));
        // Reversal series: fast SMA crosses above slow at the last bar
        let closes = [10.0, 9.0, 8.0, 7.0, 12.0];
        let bars: Vec<OhlcvBar> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| OhlcvBar {
                symbol: "BTC".into(),
                datetime: ts(i as u32),
                open: close,
                high: close,
                low: close,
                close,
                volume: 1.0,
            })
            .collect();
        let series = CandleSeries::new("BTC", TimeFrame::OneHour, bars);
        let sources: HashMap<String, Box<dyn MarketDataSource>> = HashMap::from([(
            "btc_1h".to_string(),
            Box::new(BacktestMarketDataSource::new("btc_1h", 5, series))
                as Box<dyn MarketDataSource>,
        )]);
        let strategy = SmaCrossover::new(
            "sma",
            "btc_1h",
            "BTC",
            2,
            3,
            Schedule::new(TimeUnit::Hour, 1),
            OrderAmount::Units(1.0),
        )
        .unwrap();
        LiveTrader::new(
            matcher,
            vec![Box::new(strategy)],
            sources,
            Box::new(executor),
            BackoffPolicy {
                attempts: 3,
                base_delay: Duration::ZERO,
            },
            Duration::from_millis(1),
        )
    }

    #[test]
    fn tick_places_strategy_orders_and_next_tick_syncs_fills() {
        let mut trader = trader(InstantFillExecutor::new());

        trader.tick(ts(4)).unwrap();
        let order = &trader.matcher().orders()[0];
        assert_eq!(order.status, OrderStatus::Open);
        assert_eq!(order.external_id.as_deref(), Some("ext-0"));

        // Next tick polls the venue and folds the fill in
        trader.tick(ts(5)).unwrap();
        let order = &trader.matcher().orders()[0];
        assert_eq!(order.status, OrderStatus::Closed);
        assert_abs_diff_eq!(order.filled_amount, 1.0);
        assert_eq!(trader.matcher().open_trades("BTC").len(), 1);
    }

    #[test]
    fn fill_sync_appends_a_portfolio_snapshot() {
        let mut trader = trader(InstantFillExecutor::new());

        trader.tick(ts(4)).unwrap();
        assert!(trader.matcher().portfolio.snapshots.is_empty());

        trader.tick(ts(5)).unwrap();
        let snapshots = &trader.matcher().portfolio.snapshots;
        assert_eq!(snapshots.len(), 1);
        assert_abs_diff_eq!(snapshots[0].net_size, 1000.0);
    }

    #[test]
    fn venue_pending_ack_is_reflected_until_the_fill() {
        let executor = InstantFillExecutor::new();
        *executor.pending_polls.borrow_mut() = 1;
        let mut trader = trader(executor);

        trader.tick(ts(4)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Open);

        trader.tick(ts(5)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Pending);

        trader.tick(ts(6)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Closed);
    }

    #[test]
    fn cancel_order_reaches_the_venue_and_frees_the_reservation() {
        let executor = InstantFillExecutor::new();
        let canceled = Rc::clone(&executor.canceled);
        let mut trader = trader(executor);

        trader.tick(ts(4)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Open);

        trader.cancel_order(0, ts(5)).unwrap();
        assert_eq!(canceled.borrow().as_slice(), ["ext-0".to_string()]);
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Canceled);
        assert_abs_diff_eq!(trader.matcher().portfolio.reserved, 0.0);
        assert_abs_diff_eq!(trader.matcher().portfolio.unallocated, 1000.0);

        let err = trader.cancel_order(0, ts(6)).unwrap_err();
        assert!(matches!(err, TradeLoopError::AlreadyClosed { .. }));
    }

    #[test]
    fn placement_retries_transient_failures() {
        let executor = InstantFillExecutor::new();
        *executor.fail_places.borrow_mut() = 2;
        let mut trader = trader(executor);

        trader.tick(ts(4)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Open);
    }

    #[test]
    fn placement_gives_up_after_bounded_attempts() {
        let executor = InstantFillExecutor::new();
        *executor.fail_places.borrow_mut() = 10;
        let mut trader = trader(executor);

        let err = trader.tick(ts(4)).unwrap_err();
        assert!(matches!(err, TradeLoopError::ExternalAdapter { .. }));
        // Order survives as Created and is retried on the next tick
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Created);
        trader.tick(ts(4)).unwrap();
        assert_eq!(trader.matcher().orders()[0].status, OrderStatus::Open);
    }

    #[test]
    fn retry_does_not_touch_domain_errors() {
        let policy = BackoffPolicy {
            attempts: 5,
            base_delay: Duration::ZERO,
        };
        let mut calls = 0;
        let result: Result<(), _> = policy.retry("op", || {
            calls += 1;
            Err(TradeLoopError::Validation {
                reason: "bad".into(),
            })
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
