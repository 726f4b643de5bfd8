//! Portfolio ledger: unallocated cash, reserved cash, per-symbol positions
//! and running aggregates. Pure bookkeeping, no I/O.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeLoopError;
use crate::domain::order::AMOUNT_EPSILON;
use crate::domain::position::Position;

/// Immutable per-run portfolio configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioConfiguration {
    pub market: String,
    pub trading_symbol: String,
    pub initial_balance: f64,
}

/// When the backtest engine appends portfolio snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotInterval {
    EveryTick,
    Daily,
    OnFill,
}

impl SnapshotInterval {
    pub fn parse(value: &str) -> Result<Self, TradeLoopError> {
        match value {
            "every_tick" => Ok(SnapshotInterval::EveryTick),
            "daily" => Ok(SnapshotInterval::Daily),
            "on_fill" => Ok(SnapshotInterval::OnFill),
            other => Err(TradeLoopError::Validation {
                reason: format!(
                    "unknown snapshot interval {other:?} (expected every_tick, daily or on_fill)"
                ),
            }),
        }
    }
}

/// Immutable point-in-time record of portfolio net worth. The append-only
/// snapshot sequence is the sole input to downstream metric computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub datetime: DateTime<Utc>,
    pub unallocated: f64,
    pub positions_cost: f64,
    pub net_size: f64,
    pub total_net_gain: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    pub market: String,
    pub trading_symbol: String,
    /// Free cash, not reserved by any resting order.
    pub unallocated: f64,
    /// Cash reserved by resting BUY orders.
    pub reserved: f64,
    /// Realized P&L over all SELL fills (proceeds minus cost basis and fees).
    pub realized: f64,
    /// Cost basis of everything sold so far.
    pub total_cost: f64,
    /// Proceeds of everything sold so far.
    pub total_revenue: f64,
    /// Sum of net gain over all trades, re-derived by the matcher.
    pub total_net_gain: f64,
    pub positions: HashMap<String, Position>,
    pub snapshots: Vec<PortfolioSnapshot>,
}

impl Portfolio {
    pub fn new(config: &PortfolioConfiguration) -> Self {
        Portfolio {
            market: config.market.clone(),
            trading_symbol: config.trading_symbol.clone(),
            unallocated: config.initial_balance,
            reserved: 0.0,
            realized: 0.0,
            total_cost: 0.0,
            total_revenue: 0.0,
            total_net_gain: 0.0,
            positions: HashMap::new(),
            snapshots: Vec::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Lazily creates the position the first time a symbol is referenced.
    pub fn position_mut(&mut self, symbol: &str) -> &mut Position {
        self.positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position::new(symbol))
    }

    pub fn positions_cost(&self) -> f64 {
        self.positions.values().map(|p| p.cost).sum()
    }

    /// Unallocated plus reserved plus the value of all positions at cost.
    pub fn net_size(&self) -> f64 {
        self.unallocated + self.reserved + self.positions_cost()
    }

    pub fn deposit(&mut self, amount: f64, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        if amount <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("deposit must be positive, got {amount}"),
            });
        }
        self.unallocated += amount;
        self.record_snapshot(now);
        Ok(())
    }

    pub fn withdraw(&mut self, amount: f64, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        if amount <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("withdrawal must be positive, got {amount}"),
            });
        }
        if amount > self.unallocated + AMOUNT_EPSILON {
            return Err(TradeLoopError::InsufficientFunds {
                requested: amount,
                available: self.unallocated,
            });
        }
        self.unallocated -= amount;
        self.record_snapshot(now);
        Ok(())
    }

    /// Moves cash from unallocated into the reserved bucket. Fails without
    /// mutating when the reservation would overdraw unallocated.
    pub fn reserve(&mut self, amount: f64) -> Result<(), TradeLoopError> {
        if amount > self.unallocated + AMOUNT_EPSILON {
            return Err(TradeLoopError::InsufficientFunds {
                requested: amount,
                available: self.unallocated,
            });
        }
        self.unallocated -= amount;
        self.reserved += amount;
        Ok(())
    }

    /// Returns reserved cash to unallocated (order canceled or over-reserved).
    pub fn release(&mut self, amount: f64) {
        let amount = amount.min(self.reserved);
        self.reserved -= amount;
        self.unallocated += amount;
    }

    /// Applies a BUY fill: converts the reservation made at `reserve_price`
    /// into position cost at `fill_price`. A cheaper fill refunds the
    /// difference to unallocated; a dearer one draws the shortfall from it.
    pub fn apply_buy_fill(
        &mut self,
        symbol: &str,
        amount: f64,
        fill_price: f64,
        reserve_price: f64,
        fee: f64,
    ) {
        let reserved_part = amount * reserve_price;
        let cost = amount * fill_price;
        self.reserved = (self.reserved - reserved_part).max(0.0);
        self.unallocated += reserved_part - cost - fee;
        self.position_mut(symbol).apply_buy(amount, fill_price);
    }

    /// Applies a SELL fill: credits proceeds, releases cost basis and
    /// updates the realized aggregates.
    pub fn apply_sell_fill(
        &mut self,
        symbol: &str,
        amount: f64,
        fill_price: f64,
        fee: f64,
    ) -> Result<(), TradeLoopError> {
        let released = self.position_mut(symbol).apply_sell(amount)?;
        let proceeds = amount * fill_price;
        self.unallocated += proceeds - fee;
        self.total_revenue += proceeds;
        self.total_cost += released;
        self.realized += proceeds - released - fee;
        Ok(())
    }

    pub fn record_snapshot(&mut self, now: DateTime<Utc>) {
        self.snapshots.push(PortfolioSnapshot {
            datetime: now,
            unallocated: self.unallocated,
            positions_cost: self.positions_cost(),
            net_size: self.net_size(),
            total_net_gain: self.total_net_gain,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn config() -> PortfolioConfiguration {
        PortfolioConfiguration {
            market: "binance".into(),
            trading_symbol: "EUR".into(),
            initial_balance: 1000.0,
        }
    }

    #[test]
    fn new_portfolio_holds_initial_balance() {
        let portfolio = Portfolio::new(&config());
        assert_abs_diff_eq!(portfolio.unallocated, 1000.0);
        assert_abs_diff_eq!(portfolio.net_size(), 1000.0);
        assert!(portfolio.positions.is_empty());
        assert!(portfolio.snapshots.is_empty());
    }

    #[test]
    fn reserve_and_release_conserve_net_size() {
        let mut portfolio = Portfolio::new(&config());
        portfolio.reserve(400.0).unwrap();
        assert_abs_diff_eq!(portfolio.unallocated, 600.0);
        assert_abs_diff_eq!(portfolio.reserved, 400.0);
        assert_abs_diff_eq!(portfolio.net_size(), 1000.0);

        portfolio.release(400.0);
        assert_abs_diff_eq!(portfolio.unallocated, 1000.0);
        assert_abs_diff_eq!(portfolio.reserved, 0.0);
    }

    #[test]
    fn reserve_never_overdraws() {
        let mut portfolio = Portfolio::new(&config());
        let err = portfolio.reserve(1001.0).unwrap_err();
        assert!(matches!(err, TradeLoopError::InsufficientFunds { .. }));
        assert_abs_diff_eq!(portfolio.unallocated, 1000.0);
        assert_abs_diff_eq!(portfolio.reserved, 0.0);
    }

    #[test]
    fn buy_fill_moves_reservation_into_position_cost() {
        let mut portfolio = Portfolio::new(&config());
        portfolio.reserve(10.0).unwrap();
        portfolio.apply_buy_fill("BTC", 1.0, 10.0, 10.0, 0.0);

        assert_abs_diff_eq!(portfolio.unallocated, 990.0);
        assert_abs_diff_eq!(portfolio.reserved, 0.0);
        let pos = portfolio.position("BTC").unwrap();
        assert_abs_diff_eq!(pos.amount, 1.0);
        assert_abs_diff_eq!(pos.cost, 10.0);
        assert_abs_diff_eq!(portfolio.net_size(), 1000.0);
    }

    #[test]
    fn cheaper_fill_refunds_difference() {
        let mut portfolio = Portfolio::new(&config());
        portfolio.reserve(10.0).unwrap();
        portfolio.apply_buy_fill("BTC", 1.0, 8.0, 10.0, 0.0);

        assert_abs_diff_eq!(portfolio.unallocated, 992.0);
        assert_abs_diff_eq!(portfolio.position("BTC").unwrap().cost, 8.0);
        assert_abs_diff_eq!(portfolio.net_size(), 1000.0);
    }

    #[test]
    fn sell_fill_updates_aggregates() {
        let mut portfolio = Portfolio::new(&config());
        portfolio.reserve(10.0).unwrap();
        portfolio.apply_buy_fill("BTC", 1.0, 10.0, 10.0, 0.0);
        portfolio.apply_sell_fill("BTC", 1.0, 20.0, 0.0).unwrap();

        assert_abs_diff_eq!(portfolio.unallocated, 1010.0);
        assert_abs_diff_eq!(portfolio.realized, 10.0);
        assert_abs_diff_eq!(portfolio.total_revenue, 20.0);
        assert_abs_diff_eq!(portfolio.total_cost, 10.0);
        assert!(portfolio.position("BTC").unwrap().is_empty());
    }

    #[test]
    fn sell_fill_fee_reduces_realized() {
        let mut portfolio = Portfolio::new(&config());
        portfolio.reserve(10.0).unwrap();
        portfolio.apply_buy_fill("BTC", 1.0, 10.0, 10.0, 0.0);
        portfolio.apply_sell_fill("BTC", 1.0, 20.0, 0.5).unwrap();
        assert_abs_diff_eq!(portfolio.realized, 9.5);
        assert_abs_diff_eq!(portfolio.unallocated, 1009.5);
    }

    #[test]
    fn deposit_and_withdraw_append_snapshots() {
        let mut portfolio = Portfolio::new(&config());
        let now = Utc::now();
        portfolio.deposit(500.0, now).unwrap();
        portfolio.withdraw(200.0, now).unwrap();
        assert_abs_diff_eq!(portfolio.unallocated, 1300.0);
        assert_eq!(portfolio.snapshots.len(), 2);
        assert_abs_diff_eq!(portfolio.snapshots[0].net_size, 1500.0);
        assert_abs_diff_eq!(portfolio.snapshots[1].net_size, 1300.0);
    }

    #[test]
    fn withdraw_rejects_overdraw() {
        let mut portfolio = Portfolio::new(&config());
        let err = portfolio.withdraw(2000.0, Utc::now()).unwrap_err();
        assert!(matches!(err, TradeLoopError::InsufficientFunds { .. }));
        assert!(portfolio.snapshots.is_empty());
    }
}
