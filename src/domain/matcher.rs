//! Order/trade matcher: accepts order lifecycle transitions, keeps the
//! portfolio ledger consistent, and matches SELL fills against open
//! buy-derived trades oldest-opened-first (FIFO).
//!
//! Trade state is always re-derived from the full set of constituent
//! orders' fills rather than incremented in place, so repeated or replayed
//! fill notifications converge to the same state.

use chrono::{DateTime, Utc};

use crate::domain::error::TradeLoopError;
use crate::domain::order::{
    AMOUNT_EPSILON, Order, OrderAmount, OrderId, OrderSide, OrderStatus, OrderType,
};
use crate::domain::portfolio::Portfolio;
use crate::domain::trade::{Trade, TradeId, TradeStatus};

/// One order's share of one trade. BUY links carry the trade's full
/// amount; SELL links carry the FIFO allotment taken from that trade.
#[derive(Debug, Clone)]
struct TradeLink {
    order_id: OrderId,
    trade_id: TradeId,
    allotted: f64,
}

/// Outcome of a fill notification, for snapshot policies and logging.
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub delta: f64,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderTradeMatcher {
    pub portfolio: Portfolio,
    orders: Vec<Order>,
    trades: Vec<Trade>,
    links: Vec<TradeLink>,
}

impl OrderTradeMatcher {
    pub fn new(portfolio: Portfolio) -> Self {
        OrderTradeMatcher {
            portfolio,
            orders: Vec::new(),
            trades: Vec::new(),
            links: Vec::new(),
        }
    }

    pub fn orders(&self) -> &[Order] {
        &self.orders
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn order(&self, id: OrderId) -> Result<&Order, TradeLoopError> {
        self.orders.get(id).ok_or_else(|| TradeLoopError::Validation {
            reason: format!("unknown order id {id}"),
        })
    }

    pub fn trade(&self, id: TradeId) -> Result<&Trade, TradeLoopError> {
        self.trades.get(id).ok_or_else(|| TradeLoopError::Validation {
            reason: format!("unknown trade id {id}"),
        })
    }

    /// Ids of orders the venue (or simulator) may still fill.
    pub fn resting_order_ids(&self) -> Vec<OrderId> {
        self.orders
            .iter()
            .filter(|o| !o.is_terminal())
            .map(|o| o.id)
            .collect()
    }

    /// Open trades for a symbol, oldest-opened-first.
    pub fn open_trades(&self, symbol: &str) -> Vec<TradeId> {
        let mut ids: Vec<TradeId> = self
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && t.status == TradeStatus::Open)
            .map(|t| t.id)
            .collect();
        ids.sort_by(|a, b| {
            let ta = &self.trades[*a];
            let tb = &self.trades[*b];
            ta.opened_at.cmp(&tb.opened_at).then(ta.id.cmp(&tb.id))
        });
        ids
    }

    /// How much of a sell order's cumulative fill is allocated to one
    /// trade: the order's FIFO allotments absorb the fill in creation
    /// order.
    fn allocated_fill(&self, sell: &Order, trade_id: TradeId) -> f64 {
        let mut unassigned = sell.filled_amount;
        for link in self.links.iter().filter(|l| l.order_id == sell.id) {
            let take = unassigned.min(link.allotted);
            if link.trade_id == trade_id {
                return take;
            }
            unassigned -= take;
        }
        0.0
    }

    /// Amount of a trade still available for new SELL orders: the opening
    /// order's filled amount minus what resting or completed sells have
    /// already committed. Canceled sells only count what actually filled.
    pub fn sellable(&self, trade_id: TradeId) -> f64 {
        let trade = &self.trades[trade_id];
        if trade.is_closed() {
            return 0.0;
        }
        let buy_filled = self.orders[trade.order_id].filled_amount.min(trade.amount);
        let mut committed = 0.0;
        for link in self.links.iter().filter(|l| l.trade_id == trade_id) {
            let order = &self.orders[link.order_id];
            if order.side != OrderSide::Sell {
                continue;
            }
            if order.is_terminal() && order.status != OrderStatus::Closed {
                committed += self.allocated_fill(order, trade_id);
            } else {
                committed += link.allotted;
            }
        }
        (buy_filled - committed).max(0.0)
    }

    /// Validates and creates an order, reserving funds (BUY, plus one new
    /// trade) or position (SELL, FIFO allotments across open trades).
    ///
    /// `market_price` is the current price used to resolve convenience
    /// amounts and to reserve for market orders.
    pub fn create_order(
        &mut self,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        amount: OrderAmount,
        limit_price: Option<f64>,
        market_price: f64,
        now: DateTime<Utc>,
    ) -> Result<OrderId, TradeLoopError> {
        if market_price <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("market price must be positive, got {market_price}"),
            });
        }
        let price = match order_type {
            OrderType::Limit => {
                let price = limit_price.ok_or_else(|| TradeLoopError::Validation {
                    reason: "limit order requires a price".into(),
                })?;
                if price <= 0.0 {
                    return Err(TradeLoopError::Validation {
                        reason: format!("limit price must be positive, got {price}"),
                    });
                }
                price
            }
            OrderType::Market => market_price,
        };

        let units = match side {
            OrderSide::Buy => amount.resolve(self.portfolio.unallocated, price)?,
            OrderSide::Sell => match amount {
                OrderAmount::Units(units) if units > 0.0 => units,
                OrderAmount::Units(units) => {
                    return Err(TradeLoopError::Validation {
                        reason: format!("sell amount must be positive, got {units}"),
                    });
                }
                _ => {
                    return Err(TradeLoopError::Validation {
                        reason: "sell orders are sized in units of the target symbol".into(),
                    });
                }
            },
        };

        let id = self.orders.len();
        let mut new_links = Vec::new();
        match side {
            OrderSide::Buy => {
                self.portfolio.reserve(units * price)?;
                let trade_id = self.trades.len();
                self.trades
                    .push(Trade::new(trade_id, id, symbol, units, price, now));
                new_links.push(TradeLink {
                    order_id: id,
                    trade_id,
                    allotted: units,
                });
            }
            OrderSide::Sell => {
                let open = self.open_trades(symbol);
                let available: f64 = open.iter().map(|&tid| self.sellable(tid)).sum();
                if units > available + AMOUNT_EPSILON {
                    return Err(TradeLoopError::InsufficientPosition {
                        symbol: symbol.to_string(),
                        requested: units,
                        available,
                    });
                }
                let mut unallotted = units;
                for tid in open {
                    if unallotted <= AMOUNT_EPSILON {
                        break;
                    }
                    let take = self.sellable(tid).min(unallotted);
                    if take <= AMOUNT_EPSILON {
                        continue;
                    }
                    new_links.push(TradeLink {
                        order_id: id,
                        trade_id: tid,
                        allotted: take,
                    });
                    unallotted -= take;
                }
            }
        }
        self.orders.push(Order {
            id,
            symbol: symbol.to_string(),
            side,
            order_type,
            status: OrderStatus::Created,
            price,
            amount: units,
            filled_amount: 0.0,
            filled_value: 0.0,
            fee: 0.0,
            external_id: None,
            created_at: now,
            updated_at: now,
        });
        self.links.extend(new_links);
        Ok(id)
    }

    /// Marks a created order as submitted to the venue (or simulator).
    pub fn submit_order(
        &mut self,
        id: OrderId,
        external_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TradeLoopError> {
        let order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| TradeLoopError::Validation {
                reason: format!("unknown order id {id}"),
            })?;
        if order.is_terminal() {
            return Err(TradeLoopError::AlreadyClosed {
                entity: "order".into(),
                id,
            });
        }
        order.status = OrderStatus::Open;
        order.external_id = external_id;
        order.updated_at = now;
        Ok(())
    }

    /// Records the venue's acknowledgement that a submitted order is
    /// queued but not yet live on the book.
    pub fn mark_pending(&mut self, id: OrderId, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        let order = self
            .orders
            .get_mut(id)
            .ok_or_else(|| TradeLoopError::Validation {
                reason: format!("unknown order id {id}"),
            })?;
        if order.is_terminal() {
            return Err(TradeLoopError::AlreadyClosed {
                entity: "order".into(),
                id,
            });
        }
        order.status = OrderStatus::Pending;
        order.updated_at = now;
        Ok(())
    }

    /// Cancels a non-terminal order, releasing the unfilled BUY
    /// reservation or freeing the SELL allotments for future orders.
    pub fn cancel_order(&mut self, id: OrderId, now: DateTime<Utc>) -> Result<(), TradeLoopError> {
        let order = self.order(id)?;
        if order.is_terminal() {
            return Err(TradeLoopError::AlreadyClosed {
                entity: "order".into(),
                id,
            });
        }
        let side = order.side;
        let refund = order.remaining_amount() * order.price;
        let filled = order.filled_amount;

        let order = &mut self.orders[id];
        order.status = OrderStatus::Canceled;
        order.updated_at = now;

        match side {
            OrderSide::Buy => {
                self.portfolio.release(refund);
                if let Some(tid) = self.trades.iter().position(|t| t.order_id == id) {
                    // The trade shrinks to what actually filled.
                    self.trades[tid].amount = filled;
                    self.derive_trade(tid, now);
                }
            }
            OrderSide::Sell => {
                let affected: Vec<TradeId> = self
                    .links
                    .iter()
                    .filter(|l| l.order_id == id)
                    .map(|l| l.trade_id)
                    .collect();
                for tid in affected {
                    self.derive_trade(tid, now);
                }
            }
        }
        self.refresh_total_net_gain();
        Ok(())
    }

    /// Applies a fill notification carrying the venue's cumulative filled
    /// amount. A replay with an unchanged cumulative amount is a no-op.
    pub fn record_fill(
        &mut self,
        id: OrderId,
        cumulative_filled: f64,
        fill_price: f64,
        fee: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<FillReport>, TradeLoopError> {
        let order = self.order(id)?;
        if order.is_terminal() {
            if (cumulative_filled - order.filled_amount).abs() <= AMOUNT_EPSILON {
                return Ok(None);
            }
            return Err(TradeLoopError::AlreadyClosed {
                entity: "order".into(),
                id,
            });
        }
        if fill_price <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("fill price must be positive, got {fill_price}"),
            });
        }
        if cumulative_filled > order.amount + AMOUNT_EPSILON {
            return Err(TradeLoopError::Validation {
                reason: format!(
                    "fill of {cumulative_filled} exceeds order amount {}",
                    order.amount
                ),
            });
        }
        let delta = cumulative_filled - order.filled_amount;
        if delta < -AMOUNT_EPSILON {
            return Err(TradeLoopError::Validation {
                reason: "fill notifications must carry a monotone cumulative amount".into(),
            });
        }
        let fee_delta = (fee - order.fee).max(0.0);
        if delta <= AMOUNT_EPSILON && fee_delta <= AMOUNT_EPSILON {
            return Ok(None);
        }

        let side = order.side;
        let symbol = order.symbol.clone();
        let reserve_price = order.price;
        if side == OrderSide::Sell {
            let held = self
                .portfolio
                .position(&symbol)
                .map(|p| p.amount)
                .unwrap_or(0.0);
            if delta > held + AMOUNT_EPSILON {
                return Err(TradeLoopError::InsufficientPosition {
                    symbol,
                    requested: delta,
                    available: held,
                });
            }
        }

        let order = &mut self.orders[id];
        order.filled_amount = cumulative_filled;
        order.filled_value += delta * fill_price;
        order.fee = order.fee.max(fee);
        order.updated_at = now;
        order.status = if order.is_filled() {
            OrderStatus::Closed
        } else {
            OrderStatus::Open
        };

        if delta > AMOUNT_EPSILON {
            match side {
                OrderSide::Buy => self.portfolio.apply_buy_fill(
                    &symbol,
                    delta,
                    fill_price,
                    reserve_price,
                    fee_delta,
                ),
                OrderSide::Sell => {
                    self.portfolio
                        .apply_sell_fill(&symbol, delta, fill_price, fee_delta)?;
                }
            }
        } else {
            // Fee-only update still reduces free cash.
            self.portfolio.unallocated -= fee_delta;
        }

        let affected: Vec<TradeId> = self
            .links
            .iter()
            .filter(|l| l.order_id == id)
            .map(|l| l.trade_id)
            .collect();
        for tid in affected {
            self.derive_trade(tid, now);
        }
        self.refresh_total_net_gain();

        Ok(Some(FillReport {
            order_id: id,
            symbol,
            side,
            delta,
            price: fill_price,
        }))
    }

    /// Forces the remaining open amount of a trade to be sold at the
    /// current market price in one synthetic market SELL order. `fee` is
    /// the venue fee for that sell, zero when unknown.
    pub fn close_trade(
        &mut self,
        trade_id: TradeId,
        market_price: f64,
        fee: f64,
        now: DateTime<Utc>,
    ) -> Result<OrderId, TradeLoopError> {
        let trade = self.trade(trade_id)?;
        if trade.is_closed() {
            return Err(TradeLoopError::AlreadyClosed {
                entity: "trade".into(),
                id: trade_id,
            });
        }
        let symbol = trade.symbol.clone();
        let remaining = trade.remaining;
        let amount = self.sellable(trade_id);
        if amount <= AMOUNT_EPSILON {
            return Err(TradeLoopError::InsufficientPosition {
                symbol,
                requested: remaining,
                available: amount,
            });
        }
        if market_price <= 0.0 {
            return Err(TradeLoopError::Validation {
                reason: format!("market price must be positive, got {market_price}"),
            });
        }
        let id = self.orders.len();
        self.orders.push(Order {
            id,
            symbol: symbol.clone(),
            side: OrderSide::Sell,
            order_type: OrderType::Market,
            status: OrderStatus::Created,
            price: market_price,
            amount,
            filled_amount: 0.0,
            filled_value: 0.0,
            fee: 0.0,
            external_id: None,
            created_at: now,
            updated_at: now,
        });
        self.links.push(TradeLink {
            order_id: id,
            trade_id,
            allotted: amount,
        });
        self.submit_order(id, None, now)?;
        self.record_fill(id, amount, market_price, fee, now)?;
        Ok(id)
    }

    /// Re-derives one trade's filled/remaining/net_gain/status from the
    /// full set of its constituent orders. Idempotent by construction.
    fn derive_trade(&mut self, trade_id: TradeId, now: DateTime<Utc>) {
        let trade = &self.trades[trade_id];
        let buy = &self.orders[trade.order_id];
        let buy_filled = buy.filled_amount.min(trade.amount);
        let open_price = if buy.filled_amount > AMOUNT_EPSILON {
            buy.avg_fill_price()
        } else {
            trade.open_price
        };

        let mut sold = 0.0;
        let mut sold_value = 0.0;
        let mut sell_fees = 0.0;
        for link in self.links.iter().filter(|l| l.trade_id == trade_id) {
            let order = &self.orders[link.order_id];
            if order.side != OrderSide::Sell {
                continue;
            }
            let alloc = self.allocated_fill(order, trade_id);
            if alloc > AMOUNT_EPSILON {
                sold += alloc;
                sold_value += alloc * order.avg_fill_price();
                if order.filled_amount > AMOUNT_EPSILON {
                    sell_fees += order.fee * (alloc / order.filled_amount);
                }
            }
        }
        let buy_fee_part = if buy.filled_amount > AMOUNT_EPSILON {
            buy.fee * (sold / buy.filled_amount)
        } else {
            0.0
        };

        let trade = &mut self.trades[trade_id];
        trade.open_price = open_price;
        trade.filled_amount = sold;
        trade.remaining = (trade.amount - sold).max(0.0);
        trade.net_gain = sold_value - sold * open_price - sell_fees - buy_fee_part;
        if trade.remaining <= AMOUNT_EPSILON {
            trade.status = TradeStatus::Closed;
            if trade.closed_at.is_none() {
                trade.closed_at = Some(now);
            }
        } else if buy_filled > AMOUNT_EPSILON {
            trade.status = TradeStatus::Open;
            trade.closed_at = None;
        } else {
            trade.status = TradeStatus::Created;
        }
    }

    fn refresh_total_net_gain(&mut self) {
        self.portfolio.total_net_gain = self.trades.iter().map(|t| t.net_gain).sum();
    }

    /// Consumes the matcher, yielding the final ledger state.
    pub fn into_parts(self) -> (Portfolio, Vec<Order>, Vec<Trade>) {
        (self.portfolio, self.orders, self.trades)
    }
}
