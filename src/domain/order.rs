//! Order lifecycle: an intent to buy or sell an amount of a target symbol
//! against the portfolio's trading symbol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::TradeLoopError;

pub type OrderId = usize;

/// Tolerance for amount comparisons throughout the ledger.
pub const AMOUNT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Created,
    Open,
    Pending,
    Closed,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal orders are immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Closed
                | OrderStatus::Canceled
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }
}

/// Convenience sizing for order creation, resolved against the portfolio's
/// current unallocated balance and the order price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OrderAmount {
    /// Fixed number of units of the target symbol.
    Units(f64),
    /// Spend this much of the trading symbol.
    TradingSymbol(f64),
    /// Spend this percentage (0..=100) of the unallocated balance.
    PercentOfPortfolio(f64),
}

impl OrderAmount {
    pub fn resolve(&self, unallocated: f64, price: f64) -> Result<f64, TradeLoopError> {
        if price <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("price must be positive, got {price}"),
            });
        }
        let units = match *self {
            OrderAmount::Units(units) => units,
            OrderAmount::TradingSymbol(spend) => spend / price,
            OrderAmount::PercentOfPortfolio(pct) => {
                if !(0.0..=100.0).contains(&pct) {
                    return Err(TradeLoopError::Validation {
                        reason: format!("percentage must be within 0..=100, got {pct}"),
                    });
                }
                unallocated * (pct / 100.0) / price
            }
        };
        if units <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("order amount must resolve to a positive size, got {units}"),
            });
        }
        Ok(units)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Limit price, or the reservation price for market orders.
    pub price: f64,
    pub amount: f64,
    pub filled_amount: f64,
    /// Cumulative value of all fills (sum of fill delta times fill price).
    pub filled_value: f64,
    /// Cumulative fee charged by the venue, in the trading symbol.
    pub fee: f64,
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn remaining_amount(&self) -> f64 {
        (self.amount - self.filled_amount).max(0.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_filled(&self) -> bool {
        self.remaining_amount() <= AMOUNT_EPSILON
    }

    /// Volume-weighted fill price; the order price until the first fill.
    pub fn avg_fill_price(&self) -> f64 {
        if self.filled_amount > AMOUNT_EPSILON {
            self.filled_value / self.filled_amount
        } else {
            self.price
        }
    }
}
