//! # Atlas Trading Engine
//!
//! Single-venue electronic trading engine: a FIX tag-value gateway over
//! TCP, sequence-numbered heartbeat-driven sessions, and a price-time
//! priority matching engine with one matching thread.
//!
//! ## Layers
//!
//! Bytes flow codec -> session -> gateway -> engine queue -> matching
//! worker -> book, and execution reports flow back the same way. The
//! [`fix`] module owns the wire format and conversation state, [`gateway`]
//! maps client identity to orders and sessions, and [`engine`] owns every
//! [`order_book::OrderBook`] behind a single writer thread.
//!
//! ## Example
//!
//! ```rust
//! use atlas_trading_engine::engine::{MatchingEngine, RiskLimits};
//! use atlas_trading_engine::types::{Order, OrderKind, OrderStatus, Side, TimeInForce};
//! use rust_decimal::Decimal;
//!
//! let (engine, _events) = MatchingEngine::new(RiskLimits::default());
//! let sell = Order::new(
//!     engine.allocate_order_id(),
//!     "maker",
//!     "AAPL",
//!     Side::Sell,
//!     OrderKind::Limit,
//!     Decimal::from(100),
//!     10,
//!     TimeInForce::Day,
//! );
//! let reports = engine.process_order_sync(sell);
//! assert_eq!(reports[0].status, OrderStatus::New);
//! ```

pub mod acceptor;
pub mod api;
pub mod book_side;
pub mod config;
pub mod engine;
pub mod error;
pub mod fix;
pub mod gateway;
pub mod order_book;
pub mod order_gen;
pub mod types;

pub use config::EngineConfig;
pub use engine::{
    EngineEvent, EngineRequest, ExecutionReport, MarketDataSnapshot, MatchingEngine, RiskLimits,
};
pub use error::{CodecError, EngineError, GatewayError, SessionError};
pub use gateway::Gateway;
pub use order_book::{MatchOutcome, OrderBook};
pub use types::{
    ExecId, ExecType, Order, OrderId, OrderKind, OrderStatus, Quantity, Side, Symbol,
    TimeInForce, Trade, TradeId,
};
