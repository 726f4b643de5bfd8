//! Trade: one opening BUY order plus the SELL orders that reduce it,
//! tracked as a unit independent of how many raw orders compose it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::order::{AMOUNT_EPSILON, OrderId};

pub type TradeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    Created,
    Open,
    Closed,
}

/// Invariant: `filled_amount + remaining == amount` at every observation
/// point. Both are re-derived from the constituent orders on every fill
/// notification, never incremented in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    /// The opening BUY order.
    pub order_id: OrderId,
    pub symbol: String,
    pub status: TradeStatus,
    /// Original amount (the opening order's amount, shrunk on cancel).
    pub amount: f64,
    /// Amount closed so far by SELL fills allocated to this trade.
    pub filled_amount: f64,
    /// Unclosed amount; zero only when the trade is closed.
    pub remaining: f64,
    pub open_price: f64,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// Realized gain over the sold portion, fees included.
    pub net_gain: f64,
}

impl Trade {
    pub fn new(
        id: TradeId,
        order_id: OrderId,
        symbol: impl Into<String>,
        amount: f64,
        open_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Trade {
            id,
            order_id,
            symbol: symbol.into(),
            status: TradeStatus::Created,
            amount,
            filled_amount: 0.0,
            remaining: amount,
            open_price,
            opened_at,
            closed_at: None,
            net_gain: 0.0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == TradeStatus::Closed || self.remaining <= AMOUNT_EPSILON
    }
}
