//! Position: running amount and weighted cost of one symbol in a portfolio.

use serde::{Deserialize, Serialize};

use crate::domain::error::TradeLoopError;
use crate::domain::order::AMOUNT_EPSILON;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub amount: f64,
    /// Weighted acquisition cost of the held amount, in the trading symbol.
    pub cost: f64,
}

impl Position {
    pub fn new(symbol: impl Into<String>) -> Self {
        Position {
            symbol: symbol.into(),
            amount: 0.0,
            cost: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.amount <= AMOUNT_EPSILON
    }

    /// Weighted average acquisition price of the held amount.
    pub fn avg_price(&self) -> f64 {
        if self.amount > AMOUNT_EPSILON {
            self.cost / self.amount
        } else {
            0.0
        }
    }

    pub fn apply_buy(&mut self, amount: f64, price: f64) {
        self.amount += amount;
        self.cost += amount * price;
    }

    /// Reduces the position and returns the cost basis released by the sale.
    ///
    /// A sale that would drive the amount negative is a validation failure,
    /// never a silent clamp.
    pub fn apply_sell(&mut self, amount: f64) -> Result<f64, TradeLoopError> {
        if amount > self.amount + AMOUNT_EPSILON {
            return Err(TradeLoopError::InsufficientPosition {
                symbol: self.symbol.clone(),
                requested: amount,
                available: self.amount,
            });
        }
        let released = amount * self.avg_price();
        self.amount = (self.amount - amount).max(0.0);
        self.cost = (self.cost - released).max(0.0);
        if self.is_empty() {
            // Flush rounding residue so a flat position carries no cost.
            self.amount = 0.0;
            self.cost = 0.0;
        }
        Ok(released)
    }
}
