//! Core data model: orders, trades, and the enums shared by book, engine,
//! session, and gateway.
//!
//! Identifiers are newtype wrappers. Prices are [`rust_decimal::Decimal`];
//! quantities are whole units (`u64`). An [`Order`] is an immutable intent
//! plus mutable residual state (`remaining`, `status`); `filled()` is always
//! `quantity - remaining`.

use rust_decimal::Decimal;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Traded instrument name, e.g. "AAPL".
pub type Symbol = String;
/// Opaque identity of the submitting party (one per connection).
pub type ClientId = String;
/// Whole-unit order quantity.
pub type Quantity = u64;

/// Engine-assigned order identifier, monotonically increasing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct OrderId(pub u64);

/// Execution report identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ExecId(pub u64);

/// Trade identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TradeId(pub u64);

/// Order side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// FIX tag 54 value.
    pub fn to_fix(self) -> &'static str {
        match self {
            Side::Buy => "1",
            Side::Sell => "2",
        }
    }

    pub fn from_fix(s: &str) -> Option<Side> {
        match s {
            "1" => Some(Side::Buy),
            "2" => Some(Side::Sell),
            _ => None,
        }
    }
}

/// Order kind (FIX OrdType, tag 40).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
}

impl OrderKind {
    pub fn to_fix(self) -> &'static str {
        match self {
            OrderKind::Market => "1",
            OrderKind::Limit => "2",
            OrderKind::Stop => "3",
            OrderKind::StopLimit => "4",
        }
    }

    pub fn from_fix(s: &str) -> Option<OrderKind> {
        match s {
            "1" => Some(OrderKind::Market),
            "2" => Some(OrderKind::Limit),
            "3" => Some(OrderKind::Stop),
            "4" => Some(OrderKind::StopLimit),
            _ => None,
        }
    }
}

/// Order lifecycle status (FIX OrdStatus, tag 39).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    /// Terminal orders are never resurrected.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn to_fix(self) -> &'static str {
        match self {
            OrderStatus::New => "0",
            OrderStatus::PartiallyFilled => "1",
            OrderStatus::Filled => "2",
            OrderStatus::Cancelled => "4",
            OrderStatus::Rejected => "8",
        }
    }
}

/// Time-in-force (FIX tag 59).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TimeInForce {
    /// Good for the trading day.
    Day,
    /// Good till cancel.
    Gtc,
    /// Immediate or cancel: fill what is available, cancel the rest.
    Ioc,
    /// Fill or kill: fill entirely or reject with no partial fills.
    Fok,
}

impl TimeInForce {
    pub fn to_fix(self) -> &'static str {
        match self {
            TimeInForce::Day => "0",
            TimeInForce::Gtc => "1",
            TimeInForce::Ioc => "3",
            TimeInForce::Fok => "4",
        }
    }

    pub fn from_fix(s: &str) -> Option<TimeInForce> {
        match s {
            "0" => Some(TimeInForce::Day),
            "1" => Some(TimeInForce::Gtc),
            "3" => Some(TimeInForce::Ioc),
            "4" => Some(TimeInForce::Fok),
            _ => None,
        }
    }
}

/// Execution report kind (FIX ExecType, tag 150).
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecType {
    New,
    PartialFill,
    Fill,
    Cancelled,
    Rejected,
}

impl ExecType {
    pub fn to_fix(self) -> &'static str {
        match self {
            ExecType::New => "0",
            ExecType::PartialFill => "1",
            ExecType::Fill => "2",
            ExecType::Cancelled => "4",
            ExecType::Rejected => "8",
        }
    }
}

/// An order: the client's intent plus its residual state.
///
/// `price` is zero for market orders and positive for limit orders.
/// `stop_price` is set only for stop and stop-limit orders. `arrival_ts` is
/// a monotonic timestamp assigned at ingestion; it breaks ties within a
/// price level.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub client_id: ClientId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    pub stop_price: Option<Decimal>,
    pub quantity: Quantity,
    pub remaining: Quantity,
    pub status: OrderStatus,
    pub time_in_force: TimeInForce,
    pub arrival_ts: u64,
}

impl Order {
    /// Builds a new order in status `New` with `remaining == quantity` and a
    /// fresh arrival timestamp.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        order_id: OrderId,
        client_id: impl Into<ClientId>,
        symbol: impl Into<Symbol>,
        side: Side,
        kind: OrderKind,
        price: Decimal,
        quantity: Quantity,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            order_id,
            client_id: client_id.into(),
            symbol: symbol.into(),
            side,
            kind,
            price,
            stop_price: None,
            quantity,
            remaining: quantity,
            status: OrderStatus::New,
            time_in_force,
            arrival_ts: monotonic_nanos(),
        }
    }

    pub fn filled(&self) -> Quantity {
        self.quantity - self.remaining
    }

    pub fn is_buy(&self) -> bool {
        self.side == Side::Buy
    }

    pub fn is_market(&self) -> bool {
        self.kind == OrderKind::Market
    }

    pub fn is_limit(&self) -> bool {
        self.kind == OrderKind::Limit
    }

    /// Active orders may still trade; terminal orders may not.
    pub fn is_active(&self) -> bool {
        matches!(self.status, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Consumes `qty` from the remaining quantity and advances the status to
    /// `PartiallyFilled` or `Filled`. `qty` must not exceed `remaining`.
    pub fn fill(&mut self, qty: Quantity) {
        debug_assert!(qty > 0 && qty <= self.remaining);
        self.remaining -= qty;
        self.status = if self.remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }
}

/// One match between a buy order and a sell order.
///
/// The price is the resting order's price (price improvement goes to the
/// aggressor).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Trade {
    pub trade_id: TradeId,
    pub symbol: Symbol,
    pub buy_order_id: OrderId,
    pub sell_order_id: OrderId,
    pub price: Decimal,
    pub quantity: Quantity,
    pub aggressor_side: Side,
    pub timestamp: u64,
}

/// Monotonic nanoseconds since process start. Used for arrival timestamps;
/// only ordering matters, not the epoch.
pub fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Milliseconds since the Unix epoch, for externally visible timestamps.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(qty: u64) -> Order {
        Order::new(
            OrderId(1),
            "c1",
            "AAPL",
            Side::Buy,
            OrderKind::Limit,
            Decimal::from(100),
            qty,
            TimeInForce::Day,
        )
    }

    #[test]
    fn fill_advances_status_and_conserves_quantity() {
        let mut o = order(10);
        assert_eq!(o.status, OrderStatus::New);
        o.fill(4);
        assert_eq!(o.status, OrderStatus::PartiallyFilled);
        assert_eq!(o.filled(), 4);
        assert_eq!(o.remaining, 6);
        o.fill(6);
        assert_eq!(o.status, OrderStatus::Filled);
        assert_eq!(o.filled() + o.remaining, o.quantity);
        assert!(o.is_terminal());
    }

    #[test]
    fn fix_value_round_trips() {
        for side in [Side::Buy, Side::Sell] {
            assert_eq!(Side::from_fix(side.to_fix()), Some(side));
        }
        for kind in [
            OrderKind::Market,
            OrderKind::Limit,
            OrderKind::Stop,
            OrderKind::StopLimit,
        ] {
            assert_eq!(OrderKind::from_fix(kind.to_fix()), Some(kind));
        }
        for tif in [
            TimeInForce::Day,
            TimeInForce::Gtc,
            TimeInForce::Ioc,
            TimeInForce::Fok,
        ] {
            assert_eq!(TimeInForce::from_fix(tif.to_fix()), Some(tif));
        }
    }

    #[test]
    fn arrival_timestamps_are_monotone() {
        let a = monotonic_nanos();
        let b = monotonic_nanos();
        assert!(b >= a);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
    }
}
