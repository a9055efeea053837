//! Matching engine: the dispatcher that owns every order book.
//!
//! External callers push [`EngineRequest`]s onto a FIFO queue; one worker
//! thread drains it and is the sole writer to book state and the order
//! index. Each request is validated, risk-gated, matched, measured against a
//! soft time budget, counted into the statistics, and turned into
//! [`ExecutionReport`]s published on the engine event bus. Readers (depth,
//! market data, order lookup) take the shared books lock and then the
//! targeted book's mutex; events are only emitted after all book locks are
//! released.

use crate::error::EngineError;
use crate::order_book::{OrderBook, ReportSeed};
use crate::types::{
    epoch_millis, ClientId, ExecId, ExecType, Order, OrderId, OrderKind, OrderStatus, Quantity,
    Side, Symbol,
};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{info, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long the worker blocks on the queue before re-checking the shutdown
/// flag.
const QUEUE_POLL: Duration = Duration::from_millis(100);

/// Read-mostly risk gate parameters.
#[derive(Clone, Debug)]
pub struct RiskLimits {
    pub enabled: bool,
    pub max_order_price: Decimal,
    pub max_order_quantity: Quantity,
    pub max_orders_per_symbol: usize,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            max_order_price: Decimal::from(10_000),
            max_order_quantity: 1_000_000,
            max_orders_per_symbol: 10_000,
        }
    }
}

/// A unit of work for the matching thread.
#[derive(Clone, Debug)]
pub enum EngineRequest {
    NewOrder(Order),
    Cancel {
        order_id: OrderId,
        reason: String,
    },
    /// Cancel + new at this layer; the replacement keeps the order id but
    /// loses queue priority.
    Modify {
        order_id: OrderId,
        new_price: Decimal,
        new_quantity: Quantity,
    },
}

/// The externalized view of one order state change.
#[derive(Clone, Debug, serde::Serialize)]
pub struct ExecutionReport {
    pub exec_id: ExecId,
    pub order_id: OrderId,
    pub counter_order_id: Option<OrderId>,
    pub client_id: ClientId,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub price: Decimal,
    pub exec_type: ExecType,
    pub status: OrderStatus,
    pub original_quantity: Quantity,
    pub filled_quantity: Quantity,
    pub remaining_quantity: Quantity,
    pub last_price: Option<Decimal>,
    pub last_quantity: Option<Quantity>,
    pub reject_reason: Option<String>,
    pub timestamp: u64,
}

/// Top-of-book plus last trade for one symbol.
#[derive(Clone, Debug, serde::Serialize)]
pub struct MarketDataSnapshot {
    pub symbol: Symbol,
    pub bid_price: Option<Decimal>,
    pub bid_quantity: Quantity,
    pub ask_price: Option<Decimal>,
    pub ask_quantity: Quantity,
    pub last_trade_price: Option<Decimal>,
    pub last_trade_quantity: Quantity,
    pub timestamp: u64,
}

/// Events published by the matching thread. Subscribers poll the channel;
/// the matching thread never waits on them.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Execution(ExecutionReport),
    MarketData(MarketDataSnapshot),
    Error(String),
}

/// Lock-free counters; every field is an atomic.
#[derive(Debug)]
pub struct EngineStatistics {
    orders_processed: AtomicU64,
    trades_executed: AtomicU64,
    orders_rejected: AtomicU64,
    total_volume: AtomicU64,
    total_value_cents: AtomicU64,
    min_processing_ns: AtomicU64,
    max_processing_ns: AtomicU64,
    total_processing_ns: AtomicU64,
}

impl EngineStatistics {
    fn new() -> Self {
        Self {
            orders_processed: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            orders_rejected: AtomicU64::new(0),
            total_volume: AtomicU64::new(0),
            total_value_cents: AtomicU64::new(0),
            min_processing_ns: AtomicU64::new(u64::MAX),
            max_processing_ns: AtomicU64::new(0),
            total_processing_ns: AtomicU64::new(0),
        }
    }

    fn record_request(&self, elapsed_ns: u64) {
        self.orders_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ns.fetch_add(elapsed_ns, Ordering::Relaxed);
        let mut current = self.min_processing_ns.load(Ordering::Relaxed);
        while elapsed_ns < current {
            match self.min_processing_ns.compare_exchange_weak(
                current,
                elapsed_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
        let mut current = self.max_processing_ns.load(Ordering::Relaxed);
        while elapsed_ns > current {
            match self.max_processing_ns.compare_exchange_weak(
                current,
                elapsed_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }

    fn record_trade(&self, quantity: Quantity, price: Decimal) {
        self.trades_executed.fetch_add(1, Ordering::Relaxed);
        self.total_volume.fetch_add(quantity, Ordering::Relaxed);
        let cents = (price * Decimal::from(quantity) * Decimal::from(100))
            .to_u64()
            .unwrap_or(0);
        self.total_value_cents.fetch_add(cents, Ordering::Relaxed);
    }

    fn record_reject(&self) {
        self.orders_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.orders_processed.store(0, Ordering::Relaxed);
        self.trades_executed.store(0, Ordering::Relaxed);
        self.orders_rejected.store(0, Ordering::Relaxed);
        self.total_volume.store(0, Ordering::Relaxed);
        self.total_value_cents.store(0, Ordering::Relaxed);
        self.min_processing_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_processing_ns.store(0, Ordering::Relaxed);
        self.total_processing_ns.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        let orders = self.orders_processed.load(Ordering::Relaxed);
        let total_ns = self.total_processing_ns.load(Ordering::Relaxed);
        let min = self.min_processing_ns.load(Ordering::Relaxed);
        StatisticsSnapshot {
            orders_processed: orders,
            trades_executed: self.trades_executed.load(Ordering::Relaxed),
            orders_rejected: self.orders_rejected.load(Ordering::Relaxed),
            total_volume: self.total_volume.load(Ordering::Relaxed),
            total_value_cents: self.total_value_cents.load(Ordering::Relaxed),
            min_processing_ns: if min == u64::MAX { 0 } else { min },
            max_processing_ns: self.max_processing_ns.load(Ordering::Relaxed),
            average_processing_us: if orders == 0 {
                0.0
            } else {
                total_ns as f64 / orders as f64 / 1000.0
            },
        }
    }
}

/// Point-in-time copy of the statistics counters.
#[derive(Clone, Debug, serde::Serialize)]
pub struct StatisticsSnapshot {
    pub orders_processed: u64,
    pub trades_executed: u64,
    pub orders_rejected: u64,
    pub total_volume: u64,
    pub total_value_cents: u64,
    pub min_processing_ns: u64,
    pub max_processing_ns: u64,
    pub average_processing_us: f64,
}

/// State shared between the engine handle, the worker thread, and the
/// synchronous processing path.
struct Shared {
    books: RwLock<HashMap<Symbol, Arc<Mutex<OrderBook>>>>,
    order_index: Mutex<HashMap<OrderId, Symbol>>,
    /// Serializes all mutation so the worker and the sync path never write
    /// books concurrently.
    write_gate: Mutex<()>,
    event_tx: Sender<EngineEvent>,
    stats: EngineStatistics,
    risk: RiskLimits,
    soft_budget: Duration,
    next_trade_id: AtomicU64,
    next_exec_id: AtomicU64,
}

impl Shared {
    /// Runs one request to completion and publishes its events. Returns the
    /// reports for callers on the synchronous path.
    fn process(&self, request: EngineRequest) -> Vec<ExecutionReport> {
        let gate = self.write_gate.lock().unwrap_or_else(|e| e.into_inner());
        let started = Instant::now();
        let (reports, market_data) = match request {
            EngineRequest::NewOrder(order) => self.handle_new_order(order),
            EngineRequest::Cancel { order_id, reason } => self.handle_cancel(order_id, &reason),
            EngineRequest::Modify {
                order_id,
                new_price,
                new_quantity,
            } => self.handle_modify(order_id, new_price, new_quantity),
        };
        let elapsed = started.elapsed();
        drop(gate);

        self.stats.record_request(elapsed.as_nanos() as u64);
        for report in &reports {
            if report.status == OrderStatus::Rejected {
                self.stats.record_reject();
            }
        }
        if elapsed > self.soft_budget {
            let text = format!(
                "request processing took {}us, over the {}us soft budget",
                elapsed.as_micros(),
                self.soft_budget.as_micros()
            );
            warn!("{}", text);
            let _ = self.event_tx.send(EngineEvent::Error(text));
        }
        for report in &reports {
            let _ = self.event_tx.send(EngineEvent::Execution(report.clone()));
        }
        if let Some(md) = market_data {
            let _ = self.event_tx.send(EngineEvent::MarketData(md));
        }
        reports
    }

    fn handle_new_order(&self, order: Order) -> (Vec<ExecutionReport>, Option<MarketDataSnapshot>) {
        if let Err(why) = validate_order(&order) {
            return (
                vec![self.report_for_order(&order, ExecType::Rejected, OrderStatus::Rejected, Some(format!("validation: {}", why)))],
                None,
            );
        }
        if self.risk.enabled {
            if let Err(why) = self.risk_check(&order) {
                return (
                    vec![self.report_for_order(&order, ExecType::Rejected, OrderStatus::Rejected, Some(format!("risk: {}", why)))],
                    None,
                );
            }
        }

        let book = self.get_or_create_book(&order.symbol);
        self.order_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(order.order_id, order.symbol.clone());

        let (outcome, md) = {
            let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
            let base = self.next_trade_id.load(Ordering::Acquire);
            let outcome = book.add_order(order, base);
            self.next_trade_id
                .store(base + outcome.trades.len() as u64, Ordering::Release);
            let md = snapshot_book(&mut book);
            (outcome, md)
        };

        for trade in &outcome.trades {
            self.stats.record_trade(trade.quantity, trade.price);
        }
        let reports: Vec<ExecutionReport> = outcome
            .reports
            .into_iter()
            .map(|seed| self.report_from_seed(seed))
            .collect();
        self.purge_terminal(&reports);
        (reports, Some(md))
    }

    fn handle_cancel(
        &self,
        order_id: OrderId,
        reason: &str,
    ) -> (Vec<ExecutionReport>, Option<MarketDataSnapshot>) {
        let symbol = self
            .order_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&order_id)
            .cloned();
        let Some(symbol) = symbol else {
            return (vec![self.unknown_order_reject(order_id, "order not found")], None);
        };
        let Some(book) = self.get_book(&symbol) else {
            return (vec![self.unknown_order_reject(order_id, "order not found")], None);
        };

        let (cancelled, md) = {
            let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
            let cancelled = book.cancel_order(order_id);
            let md = snapshot_book(&mut book);
            (cancelled, md)
        };
        match cancelled {
            Some(order) => {
                self.order_index
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&order_id);
                let report = self.report_for_order(
                    &order,
                    ExecType::Cancelled,
                    OrderStatus::Cancelled,
                    Some(reason.to_string()),
                );
                (vec![report], Some(md))
            }
            None => (
                vec![self.unknown_order_reject(order_id, "order not found or terminal")],
                None,
            ),
        }
    }

    /// Modify is cancel + new: the replacement keeps the engine order id and
    /// a fresh arrival timestamp, so it re-enters its level at the tail.
    fn handle_modify(
        &self,
        order_id: OrderId,
        new_price: Decimal,
        new_quantity: Quantity,
    ) -> (Vec<ExecutionReport>, Option<MarketDataSnapshot>) {
        let symbol = self
            .order_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&order_id)
            .cloned();
        let Some(symbol) = symbol else {
            return (vec![self.unknown_order_reject(order_id, "order not found")], None);
        };
        let Some(book) = self.get_book(&symbol) else {
            return (vec![self.unknown_order_reject(order_id, "order not found")], None);
        };

        let cancelled = {
            let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
            book.cancel_order(order_id)
        };
        let Some(original) = cancelled else {
            return (
                vec![self.unknown_order_reject(order_id, "order not found or terminal")],
                None,
            );
        };

        let cancel_report = self.report_for_order(
            &original,
            ExecType::Cancelled,
            OrderStatus::Cancelled,
            Some("replaced".to_string()),
        );

        let mut replacement = Order::new(
            original.order_id,
            original.client_id.clone(),
            original.symbol.clone(),
            original.side,
            original.kind,
            new_price,
            new_quantity,
            original.time_in_force,
        );
        replacement.stop_price = original.stop_price;

        let (mut reports, md) = self.handle_new_order(replacement);
        reports.insert(0, cancel_report);
        (reports, md)
    }

    fn risk_check(&self, order: &Order) -> Result<(), String> {
        let gating_price = order.stop_price.unwrap_or(order.price);
        if gating_price > self.risk.max_order_price {
            return Err(format!(
                "price {} exceeds maximum {}",
                gating_price, self.risk.max_order_price
            ));
        }
        if order.quantity > self.risk.max_order_quantity {
            return Err(format!(
                "quantity {} exceeds maximum {}",
                order.quantity, self.risk.max_order_quantity
            ));
        }
        if let Some(book) = self.get_book(&order.symbol) {
            let open = book.lock().unwrap_or_else(|e| e.into_inner()).order_count();
            if open >= self.risk.max_orders_per_symbol {
                return Err(format!(
                    "symbol {} already has {} open orders (limit {})",
                    order.symbol, open, self.risk.max_orders_per_symbol
                ));
            }
        }
        Ok(())
    }

    fn get_book(&self, symbol: &str) -> Option<Arc<Mutex<OrderBook>>> {
        self.books
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(symbol)
            .cloned()
    }

    fn get_or_create_book(&self, symbol: &str) -> Arc<Mutex<OrderBook>> {
        if let Some(book) = self.get_book(symbol) {
            return book;
        }
        let mut books = self.books.write().unwrap_or_else(|e| e.into_inner());
        books
            .entry(symbol.to_string())
            .or_insert_with(|| {
                info!("created order book for {}", symbol);
                Arc::new(Mutex::new(OrderBook::new(symbol)))
            })
            .clone()
    }

    fn purge_terminal(&self, reports: &[ExecutionReport]) {
        let mut index = self.order_index.lock().unwrap_or_else(|e| e.into_inner());
        for report in reports {
            if report.status.is_terminal() {
                index.remove(&report.order_id);
            }
        }
    }

    fn report_from_seed(&self, seed: ReportSeed) -> ExecutionReport {
        ExecutionReport {
            exec_id: self.next_exec_id(),
            order_id: seed.order.order_id,
            counter_order_id: seed.counter_order_id,
            client_id: seed.order.client_id.clone(),
            symbol: seed.order.symbol.clone(),
            side: seed.order.side,
            kind: seed.order.kind,
            price: seed.order.price,
            exec_type: seed.exec_type,
            status: seed.order.status,
            original_quantity: seed.order.quantity,
            filled_quantity: seed.order.filled(),
            remaining_quantity: seed.order.remaining,
            last_price: seed.last_price,
            last_quantity: seed.last_quantity,
            reject_reason: seed.reason,
            timestamp: epoch_millis(),
        }
    }

    fn report_for_order(
        &self,
        order: &Order,
        exec_type: ExecType,
        status: OrderStatus,
        reason: Option<String>,
    ) -> ExecutionReport {
        ExecutionReport {
            exec_id: self.next_exec_id(),
            order_id: order.order_id,
            counter_order_id: None,
            client_id: order.client_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            kind: order.kind,
            price: order.price,
            exec_type,
            status,
            original_quantity: order.quantity,
            filled_quantity: order.filled(),
            remaining_quantity: order.remaining,
            last_price: None,
            last_quantity: None,
            reject_reason: reason,
            timestamp: epoch_millis(),
        }
    }

    fn unknown_order_reject(&self, order_id: OrderId, reason: &str) -> ExecutionReport {
        ExecutionReport {
            exec_id: self.next_exec_id(),
            order_id,
            counter_order_id: None,
            client_id: ClientId::new(),
            symbol: Symbol::new(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: Decimal::ZERO,
            exec_type: ExecType::Rejected,
            status: OrderStatus::Rejected,
            original_quantity: 0,
            filled_quantity: 0,
            remaining_quantity: 0,
            last_price: None,
            last_quantity: None,
            reject_reason: Some(reason.to_string()),
            timestamp: epoch_millis(),
        }
    }

    fn next_exec_id(&self) -> ExecId {
        ExecId(self.next_exec_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn validate_order(order: &Order) -> Result<(), String> {
    if order.symbol.is_empty() {
        return Err("empty symbol".to_string());
    }
    if order.quantity == 0 {
        return Err("zero quantity".to_string());
    }
    match order.kind {
        OrderKind::Market => {
            if !order.price.is_zero() {
                return Err("market order must not carry a price".to_string());
            }
        }
        OrderKind::Limit => {
            if order.price <= Decimal::ZERO {
                return Err("limit order requires a positive price".to_string());
            }
        }
        OrderKind::Stop => {
            if !order.price.is_zero() {
                return Err("stop order must not carry a limit price".to_string());
            }
            if order.stop_price.unwrap_or_default() <= Decimal::ZERO {
                return Err("stop order requires a positive stop price".to_string());
            }
        }
        OrderKind::StopLimit => {
            if order.price <= Decimal::ZERO {
                return Err("stop-limit order requires a positive price".to_string());
            }
            if order.stop_price.unwrap_or_default() <= Decimal::ZERO {
                return Err("stop-limit order requires a positive stop price".to_string());
            }
        }
    }
    Ok(())
}

fn snapshot_book(book: &mut OrderBook) -> MarketDataSnapshot {
    let (last_trade_price, last_trade_quantity) = match book.last_trade() {
        Some((p, q)) => (Some(p), q),
        None => (None, 0),
    };
    MarketDataSnapshot {
        symbol: book.symbol().to_string(),
        bid_price: book.best_bid(),
        bid_quantity: book.best_bid_quantity(),
        ask_price: book.best_ask(),
        ask_quantity: book.best_ask_quantity(),
        last_trade_price,
        last_trade_quantity,
        timestamp: epoch_millis(),
    }
}

/// The engine handle: queue producer side, lifecycle, and read-only queries.
pub struct MatchingEngine {
    shared: Arc<Shared>,
    request_tx: Sender<EngineRequest>,
    request_rx: Receiver<EngineRequest>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    next_order_id: AtomicU64,
}

impl MatchingEngine {
    /// Builds an engine and the receiving end of its event bus.
    pub fn new(risk: RiskLimits) -> (Self, Receiver<EngineEvent>) {
        let (request_tx, request_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let engine = Self {
            shared: Arc::new(Shared {
                books: RwLock::new(HashMap::new()),
                order_index: Mutex::new(HashMap::new()),
                write_gate: Mutex::new(()),
                event_tx,
                stats: EngineStatistics::new(),
                risk,
                soft_budget: Duration::from_millis(1),
                next_trade_id: AtomicU64::new(1),
                next_exec_id: AtomicU64::new(1),
            }),
            request_tx,
            request_rx,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            next_order_id: AtomicU64::new(1),
        };
        (engine, event_rx)
    }

    /// Engine-assigned order ids are monotonically increasing.
    pub fn allocate_order_id(&self) -> OrderId {
        OrderId(self.next_order_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Spawns the matching worker. Re-entrant: a second start is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("engine already running");
            return;
        }
        let shared = Arc::clone(&self.shared);
        let running = Arc::clone(&self.running);
        let rx = self.request_rx.clone();
        let handle = std::thread::Builder::new()
            .name("matching-worker".to_string())
            .spawn(move || {
                info!("matching worker started");
                while running.load(Ordering::Acquire) {
                    match rx.recv_timeout(QUEUE_POLL) {
                        Ok(request) => {
                            shared.process(request);
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("matching worker stopped");
            })
            .expect("spawn matching worker");
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Cooperative shutdown: the worker finishes its current request,
    /// observes the flag, and exits. Pending queued requests are dropped.
    /// Re-entrant: a second stop is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
        let mut dropped = 0usize;
        while self.request_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("dropped {} queued requests at shutdown", dropped);
        }
    }

    /// Queues a request for the matching thread. Never blocks beyond the
    /// queue push.
    pub fn submit(&self, request: EngineRequest) -> Result<(), EngineError> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        self.request_tx
            .send(request)
            .map_err(|_| EngineError::QueueClosed)
    }

    pub fn submit_order(&self, order: Order) -> Result<(), EngineError> {
        self.submit(EngineRequest::NewOrder(order))
    }

    pub fn cancel_order(&self, order_id: OrderId, reason: &str) -> Result<(), EngineError> {
        self.submit(EngineRequest::Cancel {
            order_id,
            reason: reason.to_string(),
        })
    }

    pub fn modify_order(
        &self,
        order_id: OrderId,
        new_price: Decimal,
        new_quantity: Quantity,
    ) -> Result<(), EngineError> {
        self.submit(EngineRequest::Modify {
            order_id,
            new_price,
            new_quantity,
        })
    }

    /// Processes an order inline on the caller's thread, serialized against
    /// the worker. Reports are returned and also published on the event bus.
    pub fn process_order_sync(&self, order: Order) -> Vec<ExecutionReport> {
        self.shared.process(EngineRequest::NewOrder(order))
    }

    pub fn cancel_order_sync(&self, order_id: OrderId, reason: &str) -> Vec<ExecutionReport> {
        self.shared.process(EngineRequest::Cancel {
            order_id,
            reason: reason.to_string(),
        })
    }

    pub fn modify_order_sync(
        &self,
        order_id: OrderId,
        new_price: Decimal,
        new_quantity: Quantity,
    ) -> Vec<ExecutionReport> {
        self.shared.process(EngineRequest::Modify {
            order_id,
            new_price,
            new_quantity,
        })
    }

    /// Top-of-book snapshot for one symbol.
    pub fn market_data(&self, symbol: &str) -> Option<MarketDataSnapshot> {
        let book = self.shared.get_book(symbol)?;
        let mut book = book.lock().unwrap_or_else(|e| e.into_inner());
        Some(snapshot_book(&mut book))
    }

    /// Aggregated (bids, asks) depth ladders for one symbol.
    pub fn depth(
        &self,
        symbol: &str,
        levels: usize,
    ) -> Option<(Vec<(Decimal, Quantity)>, Vec<(Decimal, Quantity)>)> {
        let book = self.shared.get_book(symbol)?;
        let book = book.lock().unwrap_or_else(|e| e.into_inner());
        Some(book.depth(levels))
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        self.shared
            .books
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Looks up a live (resting or parked) order via the order index.
    pub fn find_order(&self, order_id: OrderId) -> Option<Order> {
        let symbol = self
            .shared
            .order_index
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&order_id)
            .cloned()?;
        let book = self.shared.get_book(&symbol)?;
        let book = book.lock().unwrap_or_else(|e| e.into_inner());
        book.find(order_id).cloned()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn reset_statistics(&self) {
        self.shared.stats.reset();
    }
}

impl Drop for MatchingEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeInForce;

    fn engine() -> (MatchingEngine, Receiver<EngineEvent>) {
        MatchingEngine::new(RiskLimits::default())
    }

    fn limit(engine: &MatchingEngine, side: Side, price: i64, qty: u64) -> Order {
        Order::new(
            engine.allocate_order_id(),
            "c1",
            "AAPL",
            side,
            OrderKind::Limit,
            Decimal::from(price),
            qty,
            TimeInForce::Day,
        )
    }

    #[test]
    fn validation_failures_produce_rejects_with_reason() {
        let (eng, _rx) = engine();

        let mut no_symbol = limit(&eng, Side::Buy, 100, 10);
        no_symbol.symbol.clear();
        let reports = eng.process_order_sync(no_symbol);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, OrderStatus::Rejected);
        assert!(reports[0].reject_reason.as_deref().unwrap().starts_with("validation:"));

        let mut zero_qty = limit(&eng, Side::Buy, 100, 10);
        zero_qty.quantity = 0;
        zero_qty.remaining = 0;
        let reports = eng.process_order_sync(zero_qty);
        assert_eq!(reports[0].status, OrderStatus::Rejected);

        let mut priced_market = limit(&eng, Side::Buy, 100, 10);
        priced_market.kind = OrderKind::Market;
        let reports = eng.process_order_sync(priced_market);
        assert_eq!(reports[0].status, OrderStatus::Rejected);

        let mut free_limit = limit(&eng, Side::Buy, 0, 10);
        free_limit.price = Decimal::ZERO;
        let reports = eng.process_order_sync(free_limit);
        assert_eq!(reports[0].status, OrderStatus::Rejected);
    }

    #[test]
    fn risk_limits_gate_price_and_quantity() {
        let (eng, _rx) = MatchingEngine::new(RiskLimits {
            enabled: true,
            max_order_price: Decimal::from(100),
            max_order_quantity: 50,
            max_orders_per_symbol: 10,
        });

        let pricey = limit(&eng, Side::Buy, 101, 10);
        let reports = eng.process_order_sync(pricey);
        assert!(reports[0].reject_reason.as_deref().unwrap().starts_with("risk:"));

        let big = limit(&eng, Side::Buy, 99, 51);
        let reports = eng.process_order_sync(big);
        assert!(reports[0].reject_reason.as_deref().unwrap().starts_with("risk:"));

        let fine = limit(&eng, Side::Buy, 99, 50);
        let reports = eng.process_order_sync(fine);
        assert_eq!(reports[0].status, OrderStatus::New);
    }

    #[test]
    fn per_symbol_open_order_limit() {
        let (eng, _rx) = MatchingEngine::new(RiskLimits {
            enabled: true,
            max_orders_per_symbol: 2,
            ..RiskLimits::default()
        });
        for price in [95, 96] {
            let reports = eng.process_order_sync(limit(&eng, Side::Buy, price, 1));
            assert_eq!(reports[0].status, OrderStatus::New);
        }
        let reports = eng.process_order_sync(limit(&eng, Side::Buy, 97, 1));
        assert_eq!(reports[0].status, OrderStatus::Rejected);
        assert!(reports[0].reject_reason.as_deref().unwrap().contains("open orders"));
    }

    #[test]
    fn cross_emits_reports_for_both_parties_and_updates_stats() {
        let (eng, _rx) = engine();
        let sell = limit(&eng, Side::Sell, 100, 10);
        let sell_id = sell.order_id;
        eng.process_order_sync(sell);
        let buy = limit(&eng, Side::Buy, 100, 10);
        let buy_id = buy.order_id;
        let reports = eng.process_order_sync(buy);

        assert!(reports.iter().any(|r| r.order_id == sell_id && r.status == OrderStatus::Filled));
        assert!(reports.iter().any(|r| r.order_id == buy_id && r.status == OrderStatus::Filled));

        let stats = eng.statistics();
        assert_eq!(stats.orders_processed, 2);
        assert_eq!(stats.trades_executed, 1);
        assert_eq!(stats.total_volume, 10);
        assert_eq!(stats.total_value_cents, 100 * 10 * 100);

        // Both orders terminal: the index no longer resolves them.
        assert!(eng.find_order(sell_id).is_none());
        assert!(eng.find_order(buy_id).is_none());
    }

    #[test]
    fn exec_ids_are_unique_and_increasing() {
        let (eng, _rx) = engine();
        eng.process_order_sync(limit(&eng, Side::Sell, 100, 5));
        let reports = eng.process_order_sync(limit(&eng, Side::Buy, 100, 5));
        let ids: Vec<u64> = reports.iter().map(|r| r.exec_id.0).collect();
        assert!(ids.len() >= 3, "ack plus two fills");
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn cancel_unknown_order_rejects() {
        let (eng, _rx) = engine();
        let reports = eng.cancel_order_sync(OrderId(999), "user requested");
        assert_eq!(reports[0].status, OrderStatus::Rejected);
        assert_eq!(reports[0].reject_reason.as_deref(), Some("order not found"));
    }

    #[test]
    fn cancel_resting_order_then_cancel_again() {
        let (eng, _rx) = engine();
        let order = limit(&eng, Side::Buy, 100, 10);
        let id = order.order_id;
        eng.process_order_sync(order);

        let reports = eng.cancel_order_sync(id, "user requested");
        assert_eq!(reports[0].status, OrderStatus::Cancelled);
        assert_eq!(reports[0].reject_reason.as_deref(), Some("user requested"));

        let reports = eng.cancel_order_sync(id, "again");
        assert_eq!(reports[0].status, OrderStatus::Rejected);
    }

    #[test]
    fn modify_is_cancel_plus_new_keeping_order_id() {
        let (eng, _rx) = engine();
        let order = limit(&eng, Side::Buy, 100, 10);
        let id = order.order_id;
        eng.process_order_sync(order);

        let reports = eng.modify_order_sync(id, Decimal::from(101), 5);
        assert_eq!(reports[0].status, OrderStatus::Cancelled);
        assert_eq!(reports[0].reject_reason.as_deref(), Some("replaced"));
        let ack = &reports[1];
        assert_eq!(ack.order_id, id);
        assert_eq!(ack.status, OrderStatus::New);
        assert_eq!(ack.price, Decimal::from(101));
        assert_eq!(ack.original_quantity, 5);

        let live = eng.find_order(id).unwrap();
        assert_eq!(live.price, Decimal::from(101));
        assert_eq!(live.remaining, 5);
    }

    #[test]
    fn async_path_delivers_reports_through_event_bus() {
        let (eng, rx) = engine();
        eng.start();
        let order = limit(&eng, Side::Buy, 100, 10);
        let id = order.order_id;
        eng.submit_order(order).unwrap();

        let mut saw_ack = false;
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(100)) {
                Ok(EngineEvent::Execution(report)) if report.order_id == id => {
                    assert_eq!(report.status, OrderStatus::New);
                    saw_ack = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => continue,
            }
        }
        assert!(saw_ack, "execution report arrived via event bus");
        eng.stop();
        assert!(!eng.is_running());
        assert_eq!(eng.submit_order(limit(&eng, Side::Buy, 1, 1)), Err(EngineError::NotRunning));
    }

    #[test]
    fn stop_is_reentrant() {
        let (eng, _rx) = engine();
        eng.start();
        eng.stop();
        eng.stop();
        eng.start();
        eng.stop();
    }

    #[test]
    fn market_data_reflects_book_state() {
        let (eng, _rx) = engine();
        eng.process_order_sync(limit(&eng, Side::Buy, 99, 5));
        eng.process_order_sync(limit(&eng, Side::Sell, 101, 7));
        let md = eng.market_data("AAPL").unwrap();
        assert_eq!(md.bid_price, Some(Decimal::from(99)));
        assert_eq!(md.bid_quantity, 5);
        assert_eq!(md.ask_price, Some(Decimal::from(101)));
        assert_eq!(md.ask_quantity, 7);
        assert_eq!(md.last_trade_price, None);
        assert!(eng.market_data("MSFT").is_none());
    }

    #[test]
    fn depth_query_aggregates_levels() {
        let (eng, _rx) = engine();
        eng.process_order_sync(limit(&eng, Side::Buy, 99, 5));
        eng.process_order_sync(limit(&eng, Side::Buy, 99, 3));
        eng.process_order_sync(limit(&eng, Side::Buy, 98, 4));
        let (bids, asks) = eng.depth("AAPL", 5).unwrap();
        assert_eq!(bids, vec![(Decimal::from(99), 8), (Decimal::from(98), 4)]);
        assert!(asks.is_empty());
    }
}
