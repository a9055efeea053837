//! Per-symbol order book: a bid side, an ask side, parked stop orders, and
//! the continuous matching algorithm.
//!
//! Matching is price-time priority with price improvement to the aggressor:
//! each trade executes at the resting order's price, and prices cross on
//! `buy >= sell`. Residual handling follows time-in-force: market residuals
//! are rejected (a market order never rests), IOC residuals are cancelled,
//! FOK is pre-scanned and rejected whole if it cannot fill completely, and
//! limit residuals rest. Stop and stop-limit orders park in trigger ladders
//! and are promoted to market/limit aggressors when the last trade price
//! crosses their trigger; promotion cascades until no further stop fires.

use crate::book_side::BookSide;
use crate::types::{
    epoch_millis, ExecType, Order, OrderId, OrderKind, OrderStatus, Quantity, Side, Symbol, Trade,
    TradeId,
};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Reason text for rejections and cancellations the book itself decides.
pub mod reason {
    pub const MARKET_UNFILLED: &str = "market: insufficient liquidity";
    pub const FOK_UNFILLED: &str = "fok: insufficient liquidity";
    pub const IOC_RESIDUAL: &str = "ioc: residual cancelled";
}

/// One ordered state change produced by matching; the engine turns each
/// seed into an execution report.
#[derive(Clone, Debug)]
pub struct ReportSeed {
    /// Snapshot of the order just after the state change.
    pub order: Order,
    pub exec_type: ExecType,
    pub last_price: Option<Decimal>,
    pub last_quantity: Option<Quantity>,
    pub counter_order_id: Option<OrderId>,
    pub reason: Option<String>,
}

impl ReportSeed {
    fn ack(order: Order) -> Self {
        Self {
            order,
            exec_type: ExecType::New,
            last_price: None,
            last_quantity: None,
            counter_order_id: None,
            reason: None,
        }
    }

    fn terminal(order: Order, exec_type: ExecType, reason: &str) -> Self {
        Self {
            order,
            exec_type,
            last_price: None,
            last_quantity: None,
            counter_order_id: None,
            reason: Some(reason.to_string()),
        }
    }
}

/// Everything one request did to the book.
#[derive(Debug, Default)]
pub struct MatchOutcome {
    pub trades: Vec<Trade>,
    pub reports: Vec<ReportSeed>,
}

/// Order book for a single symbol.
#[derive(Debug)]
pub struct OrderBook {
    symbol: Symbol,
    bids: BookSide,
    asks: BookSide,
    /// Parked buy stops; a level triggers once the last trade price is at or
    /// above its key.
    buy_stops: BTreeMap<Decimal, VecDeque<Order>>,
    /// Parked sell stops; a level triggers once the last trade price is at
    /// or below its key.
    sell_stops: BTreeMap<Decimal, VecDeque<Order>>,
    stop_index: HashMap<OrderId, (Side, Decimal)>,
    last_trade: Option<(Decimal, Quantity)>,
}

impl OrderBook {
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            bids: BookSide::new(Side::Buy),
            asks: BookSide::new(Side::Sell),
            buy_stops: BTreeMap::new(),
            sell_stops: BTreeMap::new(),
            stop_index: HashMap::new(),
            last_trade: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Runs `order` through matching; residuals rest, cancel, or reject per
    /// time-in-force, then any newly triggered stops are promoted and run.
    /// Trade ids are assigned from `next_trade_id` upward.
    pub fn add_order(&mut self, order: Order, next_trade_id: u64) -> MatchOutcome {
        debug_assert_eq!(order.symbol, self.symbol);
        let mut out = MatchOutcome::default();
        let mut next_tid = next_trade_id;

        match order.kind {
            OrderKind::Stop | OrderKind::StopLimit if !self.triggers_now(&order) => {
                out.reports.push(ReportSeed::ack(order.clone()));
                self.park_stop(order);
            }
            _ => {
                let mut order = order;
                if matches!(order.kind, OrderKind::Stop | OrderKind::StopLimit) {
                    promote(&mut order);
                }
                self.run_aggressor(order, &mut next_tid, &mut out, true);
            }
        }
        self.run_stop_triggers(&mut next_tid, &mut out);
        out
    }

    /// Cancels a resting or parked order. Returns the cancelled order, or
    /// `None` when the id is unknown or already terminal (terminal orders
    /// leave the book immediately, so they are never found here).
    pub fn cancel_order(&mut self, order_id: OrderId) -> Option<Order> {
        if let Some(mut o) = self
            .bids
            .remove(order_id)
            .or_else(|| self.asks.remove(order_id))
        {
            o.status = OrderStatus::Cancelled;
            return Some(o);
        }
        let (side, trigger) = self.stop_index.remove(&order_id)?;
        let ladder = match side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        };
        let queue = ladder.get_mut(&trigger)?;
        let pos = queue.iter().position(|o| o.order_id == order_id)?;
        let mut o = queue.remove(pos)?;
        if queue.is_empty() {
            ladder.remove(&trigger);
        }
        o.status = OrderStatus::Cancelled;
        Some(o)
    }

    /// Looks an order up in either side or the parked stops.
    pub fn find(&self, order_id: OrderId) -> Option<&Order> {
        if let Some(o) = self.bids.order(order_id).or_else(|| self.asks.order(order_id)) {
            return Some(o);
        }
        let (side, trigger) = *self.stop_index.get(&order_id)?;
        let ladder = match side {
            Side::Buy => &self.buy_stops,
            Side::Sell => &self.sell_stops,
        };
        ladder
            .get(&trigger)?
            .iter()
            .find(|o| o.order_id == order_id)
    }

    pub fn best_bid(&mut self) -> Option<Decimal> {
        self.bids.best_price()
    }

    pub fn best_ask(&mut self) -> Option<Decimal> {
        self.asks.best_price()
    }

    pub fn best_bid_quantity(&mut self) -> Quantity {
        self.bids.best_quantity()
    }

    pub fn best_ask_quantity(&mut self) -> Quantity {
        self.asks.best_quantity()
    }

    /// Aggregated (price, quantity) ladders: bids best-first, asks
    /// best-first.
    pub fn depth(&self, levels: usize) -> (Vec<(Decimal, Quantity)>, Vec<(Decimal, Quantity)>) {
        (self.bids.depth(levels), self.asks.depth(levels))
    }

    /// Resting plus parked order count, for per-symbol risk limits.
    pub fn order_count(&self) -> usize {
        self.bids.len() + self.asks.len() + self.stop_index.len()
    }

    pub fn last_trade(&self) -> Option<(Decimal, Quantity)> {
        self.last_trade
    }

    fn triggers_now(&self, order: &Order) -> bool {
        let Some((last, _)) = self.last_trade else {
            return false;
        };
        let Some(stop) = order.stop_price else {
            return false;
        };
        match order.side {
            Side::Buy => last >= stop,
            Side::Sell => last <= stop,
        }
    }

    fn park_stop(&mut self, order: Order) {
        // Validated upstream; a stop without a trigger never gets here.
        let trigger = order.stop_price.unwrap_or_default();
        self.stop_index
            .insert(order.order_id, (order.side, trigger));
        let ladder = match order.side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        };
        ladder.entry(trigger).or_default().push_back(order);
    }

    /// Promotes and runs every stop whose trigger the last trade price has
    /// crossed, until the book settles.
    fn run_stop_triggers(&mut self, next_tid: &mut u64, out: &mut MatchOutcome) {
        loop {
            let Some((last, _)) = self.last_trade else {
                return;
            };
            let popped = self
                .pop_stop_at_or_below(last, Side::Buy)
                .or_else(|| self.pop_stop_at_or_above(last, Side::Sell));
            let Some(mut order) = popped else {
                return;
            };
            self.stop_index.remove(&order.order_id);
            promote(&mut order);
            self.run_aggressor(order, next_tid, out, false);
        }
    }

    fn pop_stop_at_or_below(&mut self, last: Decimal, side: Side) -> Option<Order> {
        debug_assert_eq!(side, Side::Buy);
        let (&trigger, _) = self.buy_stops.range(..=last).next()?;
        let queue = self.buy_stops.get_mut(&trigger)?;
        let order = queue.pop_front();
        if queue.is_empty() {
            self.buy_stops.remove(&trigger);
        }
        order
    }

    fn pop_stop_at_or_above(&mut self, last: Decimal, side: Side) -> Option<Order> {
        debug_assert_eq!(side, Side::Sell);
        let (&trigger, _) = self.sell_stops.range(last..).next()?;
        let queue = self.sell_stops.get_mut(&trigger)?;
        let order = queue.pop_front();
        if queue.is_empty() {
            self.sell_stops.remove(&trigger);
        }
        order
    }

    /// Continuous matching for one aggressor, emitting trades and ordered
    /// report seeds (ack, fills, terminal residual).
    fn run_aggressor(
        &mut self,
        mut order: Order,
        next_tid: &mut u64,
        out: &mut MatchOutcome,
        emit_ack: bool,
    ) {
        let limit = if order.is_market() {
            None
        } else {
            Some(order.price)
        };
        let opposite = match order.side {
            Side::Buy => &mut self.asks,
            Side::Sell => &mut self.bids,
        };

        if order.time_in_force == crate::types::TimeInForce::Fok {
            let available = opposite.available_at_or_better(limit);
            if available < order.remaining {
                order.status = OrderStatus::Rejected;
                out.reports
                    .push(ReportSeed::terminal(order, ExecType::Rejected, reason::FOK_UNFILLED));
                return;
            }
        }
        if order.is_market() && opposite.available_at_or_better(None) == 0 {
            order.status = OrderStatus::Rejected;
            out.reports
                .push(ReportSeed::terminal(order, ExecType::Rejected, reason::MARKET_UNFILLED));
            return;
        }

        if emit_ack {
            out.reports.push(ReportSeed::ack(order.clone()));
        }

        let mut last_trade = self.last_trade;
        while order.remaining > 0 {
            let Some(best_id) = opposite.best_id() else {
                break;
            };
            let resting_price = match opposite.order(best_id) {
                Some(o) => o.price,
                None => break,
            };
            if let Some(limit) = limit {
                let crossed = match order.side {
                    Side::Buy => limit >= resting_price,
                    Side::Sell => resting_price >= limit,
                };
                if !crossed {
                    break;
                }
            }

            let resting = opposite
                .order_mut(best_id)
                .expect("best_id points at a live order");
            let qty = order.remaining.min(resting.remaining);
            resting.fill(qty);
            let resting_snapshot = resting.clone();
            order.fill(qty);

            let (buy_id, sell_id) = match order.side {
                Side::Buy => (order.order_id, best_id),
                Side::Sell => (best_id, order.order_id),
            };
            out.trades.push(Trade {
                trade_id: TradeId(*next_tid),
                symbol: self.symbol.clone(),
                buy_order_id: buy_id,
                sell_order_id: sell_id,
                price: resting_price,
                quantity: qty,
                aggressor_side: order.side,
                timestamp: epoch_millis(),
            });
            *next_tid += 1;
            last_trade = Some((resting_price, qty));

            let resting_exec = if resting_snapshot.remaining == 0 {
                ExecType::Fill
            } else {
                ExecType::PartialFill
            };
            out.reports.push(ReportSeed {
                order: resting_snapshot.clone(),
                exec_type: resting_exec,
                last_price: Some(resting_price),
                last_quantity: Some(qty),
                counter_order_id: Some(order.order_id),
                reason: None,
            });
            out.reports.push(ReportSeed {
                order: order.clone(),
                exec_type: if order.remaining == 0 {
                    ExecType::Fill
                } else {
                    ExecType::PartialFill
                },
                last_price: Some(resting_price),
                last_quantity: Some(qty),
                counter_order_id: Some(best_id),
                reason: None,
            });

            if resting_snapshot.remaining == 0 {
                opposite.remove(best_id);
            }
        }
        self.last_trade = last_trade;

        if order.remaining > 0 {
            if order.is_market() {
                order.status = OrderStatus::Rejected;
                out.reports.push(ReportSeed::terminal(
                    order,
                    ExecType::Rejected,
                    reason::MARKET_UNFILLED,
                ));
            } else if order.time_in_force == crate::types::TimeInForce::Ioc {
                order.status = OrderStatus::Cancelled;
                out.reports.push(ReportSeed::terminal(
                    order,
                    ExecType::Cancelled,
                    reason::IOC_RESIDUAL,
                ));
            } else {
                // Day/GTC limit residual rests at the tail of its level.
                match order.side {
                    Side::Buy => self.bids.insert(order),
                    Side::Sell => self.asks.insert(order),
                }
            }
        }
    }
}

fn promote(order: &mut Order) {
    match order.kind {
        OrderKind::Stop => {
            order.kind = OrderKind::Market;
            order.price = Decimal::ZERO;
        }
        OrderKind::StopLimit => order.kind = OrderKind::Limit,
        _ => {}
    }
}
