//! Property-based and deterministic replay tests.
//!
//! Replays generated order streams into a book and asserts the structural
//! invariants: quantity conservation, no crossed book at rest, positive
//! trade quantities, and trades always printing at a resting price level.

use atlas_trading_engine::order_book::OrderBook;
use atlas_trading_engine::order_gen::{Generator, GeneratorConfig};
use atlas_trading_engine::types::{OrderStatus, Side};
use proptest::prelude::*;
use rust_decimal::Decimal;

fn assert_not_crossed(book: &mut OrderBook) {
    if let (Some(bid), Some(ask)) = (book.best_bid(), book.best_ask()) {
        assert!(bid < ask, "crossed book at rest: bid {} >= ask {}", bid, ask);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(50))]

    /// After replaying any generated stream, the book is uncrossed, every
    /// report conserves quantity, and every trade is positive and priced.
    #[test]
    fn replay_invariants_hold(seed in 0u64..100_000u64, num_orders in 10usize..150usize) {
        let mut generator = Generator::new(GeneratorConfig {
            seed,
            num_orders,
            ..Default::default()
        });
        let mut book = OrderBook::new("AAPL");
        let mut next_trade_id = 1u64;
        for order in generator.all_orders() {
            let out = book.add_order(order, next_trade_id);
            next_trade_id += out.trades.len() as u64;

            for trade in &out.trades {
                prop_assert!(trade.quantity > 0, "trade quantity must be positive");
                prop_assert!(trade.price > Decimal::ZERO, "trade price must be positive");
                prop_assert!(trade.buy_order_id != trade.sell_order_id);
            }
            for report in &out.reports {
                prop_assert_eq!(
                    report.order.filled() + report.order.remaining,
                    report.order.quantity,
                    "filled + remaining must equal quantity"
                );
                if let Some(qty) = report.last_quantity {
                    prop_assert!(qty > 0);
                }
            }
            assert_not_crossed(&mut book);
        }
        // Everything still resting is active with positive remainder.
        let (bids, asks) = book.depth(usize::MAX);
        for (_, qty) in bids.iter().chain(asks.iter()) {
            prop_assert!(*qty > 0);
        }
    }

    /// A trade's price always equals the resting side's quoted level, which
    /// for an aggressive buy means at or below its limit and for a sell at
    /// or above.
    #[test]
    fn aggressor_never_trades_through_its_limit(seed in 0u64..50_000u64) {
        let mut generator = Generator::new(GeneratorConfig {
            seed,
            num_orders: 60,
            limit_ratio: 1.0,
            ..Default::default()
        });
        let mut book = OrderBook::new("AAPL");
        for order in generator.all_orders() {
            let limit_price = order.price;
            let side = order.side;
            let out = book.add_order(order, 1);
            for trade in &out.trades {
                if trade.aggressor_side == side {
                    match side {
                        Side::Buy => prop_assert!(trade.price <= limit_price),
                        Side::Sell => prop_assert!(trade.price >= limit_price),
                    }
                }
            }
        }
    }
}

/// Same seed, same stream, same outcome.
#[test]
fn deterministic_replay_same_seed_same_outcome() {
    let config = GeneratorConfig {
        seed: 999,
        num_orders: 80,
        ..Default::default()
    };

    let run = |config: GeneratorConfig| {
        let mut book = OrderBook::new("AAPL");
        let mut trades = 0usize;
        let mut reports = 0usize;
        let mut volume = 0u64;
        let mut terminal = 0usize;
        for order in Generator::new(config).all_orders() {
            let out = book.add_order(order, (trades + 1) as u64);
            trades += out.trades.len();
            reports += out.reports.len();
            volume += out.trades.iter().map(|t| t.quantity).sum::<u64>();
            terminal += out
                .reports
                .iter()
                .filter(|s| s.order.status.is_terminal())
                .count();
        }
        (trades, reports, volume, terminal)
    };

    assert_eq!(run(config.clone()), run(config));
}

/// Terminal statuses from replay are only ever Filled, Cancelled (IOC), or
/// Rejected (market exhaustion / FOK).
#[test]
fn replay_terminal_statuses_are_well_formed() {
    let mut generator = Generator::new(GeneratorConfig {
        seed: 4242,
        num_orders: 200,
        ..Default::default()
    });
    let mut book = OrderBook::new("AAPL");
    for order in generator.all_orders() {
        let out = book.add_order(order, 1);
        for report in out.reports {
            match report.order.status {
                OrderStatus::Filled => assert_eq!(report.order.remaining, 0),
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    assert!(report.reason.is_some(), "terminal without a reason")
                }
                OrderStatus::New | OrderStatus::PartiallyFilled => {}
            }
        }
    }
}
