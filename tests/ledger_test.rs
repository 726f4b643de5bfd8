//! Ledger integration tests.
//!
//! Tests cover:
//! - The canonical buy/sell round trip against a fresh portfolio
//! - FIFO association of sells across multiple open trades
//! - Idempotent fill replay and terminal-state immutability
//! - Property: filled + remaining == amount after arbitrary fill walks
//! - Property: net size is conserved when fills happen at the entry price

mod common;

use approx::assert_abs_diff_eq;
use common::*;
use proptest::prelude::*;
use tradeloop::domain::error::TradeLoopError;
use tradeloop::domain::order::{OrderAmount, OrderSide, OrderType};
use tradeloop::domain::trade::TradeStatus;

#[test]
fn canonical_round_trip() {
    // 1000 EUR portfolio, buy 1 BTC at 10, sell it at 20
    let mut matcher = fresh_matcher(1000.0);
    let buy = matcher
        .create_order(
            "BTC",
            OrderSide::Buy,
            OrderType::Limit,
            OrderAmount::Units(1.0),
            Some(10.0),
            10.0,
            ts(0),
        )
        .unwrap();
    assert_abs_diff_eq!(matcher.portfolio.unallocated, 990.0);
    assert_abs_diff_eq!(matcher.portfolio.reserved, 10.0);

    matcher.submit_order(buy, None, ts(0)).unwrap();
    matcher.record_fill(buy, 1.0, 10.0, 0.0, ts(0)).unwrap();
    assert_abs_diff_eq!(matcher.portfolio.reserved, 0.0);
    assert_abs_diff_eq!(matcher.portfolio.position("BTC").unwrap().amount, 1.0);
    assert_abs_diff_eq!(matcher.portfolio.net_size(), 1000.0);

    let sell = matcher
        .create_order(
            "BTC",
            OrderSide::Sell,
            OrderType::Limit,
            OrderAmount::Units(1.0),
            Some(20.0),
            20.0,
            ts(1),
        )
        .unwrap();
    matcher.submit_order(sell, None, ts(1)).unwrap();
    matcher.record_fill(sell, 1.0, 20.0, 0.0, ts(1)).unwrap();

    assert_abs_diff_eq!(matcher.portfolio.unallocated, 1010.0);
    assert_abs_diff_eq!(matcher.portfolio.realized, 10.0);
    assert_abs_diff_eq!(matcher.portfolio.total_net_gain, 10.0);
    let trade = &matcher.trades()[0];
    assert_eq!(trade.status, TradeStatus::Closed);
    assert_abs_diff_eq!(trade.net_gain, 10.0);
}

fn open_filled_buy(matcher: &mut tradeloop::domain::matcher::OrderTradeMatcher, amount: f64, price: f64, hour: u32) {
    let id = matcher
        .create_order(
            "BTC",
            OrderSide::Buy,
            OrderType::Limit,
            OrderAmount::Units(amount),
            Some(price),
            price,
            ts(hour),
        )
        .unwrap();
    matcher.submit_order(id, None, ts(hour)).unwrap();
    matcher.record_fill(id, amount, price, 0.0, ts(hour)).unwrap();
}

mod fifo {
    use super::*;

    #[test]
    fn sell_drains_trades_oldest_first() {
        let mut matcher = fresh_matcher(1000.0);
        open_filled_buy(&mut matcher, 1.0, 10.0, 0);
        open_filled_buy(&mut matcher, 1.0, 11.0, 1);
        open_filled_buy(&mut matcher, 1.0, 12.0, 2);

        let sell = matcher
            .create_order(
                "BTC",
                OrderSide::Sell,
                OrderType::Limit,
                OrderAmount::Units(2.5),
                Some(20.0),
                20.0,
                ts(3),
            )
            .unwrap();
        matcher.submit_order(sell, None, ts(3)).unwrap();
        matcher.record_fill(sell, 2.5, 20.0, 0.0, ts(3)).unwrap();

        let trades = matcher.trades();
        assert_eq!(trades[0].status, TradeStatus::Closed);
        assert_eq!(trades[1].status, TradeStatus::Closed);
        assert_eq!(trades[2].status, TradeStatus::Open);
        assert_abs_diff_eq!(trades[2].remaining, 0.5);
        assert_abs_diff_eq!(trades[0].net_gain, 10.0);
        assert_abs_diff_eq!(trades[1].net_gain, 9.0);
        assert_abs_diff_eq!(trades[2].net_gain, 0.5 * 8.0);
    }

    #[test]
    fn resting_sell_blocks_a_second_sell_of_the_same_units() {
        let mut matcher = fresh_matcher(1000.0);
        open_filled_buy(&mut matcher, 1.0, 10.0, 0);

        matcher
            .create_order(
                "BTC",
                OrderSide::Sell,
                OrderType::Limit,
                OrderAmount::Units(1.0),
                Some(20.0),
                20.0,
                ts(1),
            )
            .unwrap();
        let err = matcher
            .create_order(
                "BTC",
                OrderSide::Sell,
                OrderType::Limit,
                OrderAmount::Units(1.0),
                Some(21.0),
                21.0,
                ts(1),
            )
            .unwrap_err();
        assert!(matches!(err, TradeLoopError::InsufficientPosition { .. }));
    }
}

mod idempotence {
    use super::*;

    #[test]
    fn replayed_fill_is_a_no_op() {
        let mut matcher = fresh_matcher(1000.0);
        open_filled_buy(&mut matcher, 1.0, 10.0, 0);

        let portfolio = matcher.portfolio.clone();
        let trades = matcher.trades().to_vec();
        let orders = matcher.orders().to_vec();

        // Same cumulative amount again, later timestamp
        assert!(matcher.record_fill(0, 1.0, 10.0, 0.0, ts(9)).unwrap().is_none());
        assert_eq!(matcher.portfolio, portfolio);
        assert_eq!(matcher.trades(), trades.as_slice());
        assert_eq!(matcher.orders(), orders.as_slice());
    }

    #[test]
    fn closing_a_closed_trade_fails_without_side_effects() {
        let mut matcher = fresh_matcher(1000.0);
        open_filled_buy(&mut matcher, 1.0, 10.0, 0);
        matcher.close_trade(0, 15.0, 0.0, ts(1)).unwrap();

        let portfolio = matcher.portfolio.clone();
        let trades = matcher.trades().to_vec();
        let err = matcher.close_trade(0, 99.0, 0.0, ts(2)).unwrap_err();
        assert!(matches!(err, TradeLoopError::AlreadyClosed { .. }));
        assert_eq!(matcher.portfolio, portfolio);
        assert_eq!(matcher.trades(), trades.as_slice());
    }

    #[test]
    fn new_fill_on_terminal_order_is_rejected() {
        let mut matcher = fresh_matcher(1000.0);
        open_filled_buy(&mut matcher, 1.0, 10.0, 0);
        let err = matcher.record_fill(0, 0.5, 10.0, 0.0, ts(1)).unwrap_err();
        assert!(matches!(err, TradeLoopError::AlreadyClosed { .. }));
    }
}

proptest! {
    /// Walking an order's cumulative fill up in arbitrary steps keeps
    /// trade.filled + trade.remaining == trade.amount at every step.
    #[test]
    fn filled_plus_remaining_is_invariant(fractions in prop::collection::vec(0.0f64..=1.0, 1..8)) {
        let mut matcher = fresh_matcher(1000.0);
        let amount = 2.0;
        let buy = matcher
            .create_order(
                "BTC",
                OrderSide::Buy,
                OrderType::Limit,
                OrderAmount::Units(amount),
                Some(10.0),
                10.0,
                ts(0),
            )
            .unwrap();
        matcher.submit_order(buy, None, ts(0)).unwrap();
        matcher.record_fill(buy, amount, 10.0, 0.0, ts(0)).unwrap();

        let sell = matcher
            .create_order(
                "BTC",
                OrderSide::Sell,
                OrderType::Limit,
                OrderAmount::Units(amount),
                Some(12.0),
                12.0,
                ts(1),
            )
            .unwrap();
        matcher.submit_order(sell, None, ts(1)).unwrap();

        let mut cumulative: f64 = 0.0;
        for (step, fraction) in fractions.iter().enumerate() {
            cumulative = (cumulative + fraction * amount).min(amount);
            if cumulative <= 0.0 {
                continue;
            }
            matcher
                .record_fill(sell, cumulative, 12.0, 0.0, ts(2 + step as u32))
                .unwrap();
            let trade = &matcher.trades()[0];
            prop_assert!((trade.filled_amount + trade.remaining - trade.amount).abs() < 1e-9);
        }
    }

    /// Buying and fully selling back at the entry price with no fees
    /// returns the portfolio to its initial net size.
    #[test]
    fn flat_round_trip_conserves_net_size(
        amounts in prop::collection::vec(0.1f64..2.0, 1..5),
        price in 1.0f64..100.0,
    ) {
        let mut matcher = fresh_matcher(10_000.0);
        for (i, &amount) in amounts.iter().enumerate() {
            let id = matcher
                .create_order(
                    "BTC",
                    OrderSide::Buy,
                    OrderType::Limit,
                    OrderAmount::Units(amount),
                    Some(price),
                    price,
                    ts(i as u32),
                )
                .unwrap();
            matcher.submit_order(id, None, ts(i as u32)).unwrap();
            matcher.record_fill(id, amount, price, 0.0, ts(i as u32)).unwrap();
        }
        prop_assert!((matcher.portfolio.net_size() - 10_000.0).abs() < 1e-6);

        let total: f64 = amounts.iter().sum();
        let sell = matcher
            .create_order(
                "BTC",
                OrderSide::Sell,
                OrderType::Limit,
                OrderAmount::Units(total),
                Some(price),
                price,
                ts(20),
            )
            .unwrap();
        matcher.submit_order(sell, None, ts(20)).unwrap();
        matcher.record_fill(sell, total, price, 0.0, ts(20)).unwrap();

        prop_assert!((matcher.portfolio.net_size() - 10_000.0).abs() < 1e-6);
        prop_assert!(matcher.portfolio.total_net_gain.abs() < 1e-6);
        for trade in matcher.trades() {
            prop_assert_eq!(trade.status, TradeStatus::Closed);
        }
    }
}
