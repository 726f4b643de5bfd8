//! Order executor port trait (live mode only).

use crate::domain::error::TradeLoopError;
use crate::domain::order::{Order, OrderStatus};

/// Venue-side view of an order, polled by the live loop.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStatus {
    pub status: OrderStatus,
    /// Cumulative filled amount reported by the venue.
    pub filled_amount: f64,
    /// Volume-weighted price of the filled amount.
    pub fill_price: f64,
    /// Cumulative fee, in the trading symbol.
    pub fee: f64,
}

pub trait OrderExecutor {
    /// Places the order with the venue and returns its external id.
    fn place(&mut self, order: &Order) -> Result<String, TradeLoopError>;

    fn cancel(&mut self, order: &Order) -> Result<(), TradeLoopError>;

    fn fetch_status(&self, order: &Order) -> Result<ExecutionStatus, TradeLoopError>;
}
