//! Gateway glue: maps client identity to (session, open-order table),
//! turns application messages into engine requests, and routes execution
//! reports back to the originating client with its correlation tag.
//!
//! The transport is a byte-duplex pipe: the acceptor registers sessions and
//! installs a send function; the gateway never touches sockets directly.

use crate::engine::{EngineEvent, ExecutionReport, MatchingEngine};
use crate::error::GatewayError;
use crate::fix::codec::{fix_utc_timestamp, msg_type, tags, FixMessage};
use crate::fix::session::FixSession;
use crate::types::{ClientId, Order, OrderId, OrderKind, Side, Symbol, TimeInForce};
use log::{debug, error, warn};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Writes one frame to one client's transport; returns false when the pipe
/// is gone.
pub type SendFn = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// What the gateway remembers about one open order.
#[derive(Clone, Debug)]
struct OrderEntry {
    client_id: ClientId,
    cl_ord_id: String,
    symbol: Symbol,
    side: Side,
}

/// Translation and routing layer between sessions and the engine.
pub struct Gateway {
    engine: Arc<MatchingEngine>,
    sessions: Mutex<HashMap<ClientId, Arc<Mutex<FixSession>>>>,
    open_orders: Mutex<HashMap<OrderId, OrderEntry>>,
    by_client: Mutex<HashMap<(ClientId, String), OrderId>>,
    send_fn: Mutex<Option<SendFn>>,
}

impl Gateway {
    pub fn new(engine: Arc<MatchingEngine>) -> Self {
        Self {
            engine,
            sessions: Mutex::new(HashMap::new()),
            open_orders: Mutex::new(HashMap::new()),
            by_client: Mutex::new(HashMap::new()),
            send_fn: Mutex::new(None),
        }
    }

    /// Installs the transport write function. The acceptor calls this once
    /// at startup.
    pub fn set_send_fn(&self, f: SendFn) {
        *self.send_fn.lock().unwrap_or_else(|e| e.into_inner()) = Some(f);
    }

    pub fn register_session(&self, client_id: &str, session: Arc<Mutex<FixSession>>) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id.to_string(), session);
    }

    /// Drops the session for a disconnected client. Open-order mappings
    /// stay until their orders go terminal; reports for a gone client are
    /// dropped with a log line.
    pub fn unregister_session(&self, client_id: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(client_id);
    }

    pub fn session(&self, client_id: &str) -> Option<Arc<Mutex<FixSession>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(client_id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn session_ids(&self) -> Vec<ClientId> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn open_order_count(&self) -> usize {
        self.open_orders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Entry point for application messages a session forwarded upstream.
    pub fn on_application_message(&self, client_id: &str, msg: &FixMessage) {
        match msg.msg_type() {
            Some(msg_type::NEW_ORDER_SINGLE) => self.handle_new_order_single(client_id, msg),
            Some(msg_type::ORDER_CANCEL_REQUEST) => self.handle_order_cancel_request(client_id, msg),
            other => {
                let e = GatewayError::Unsupported(other.unwrap_or("").to_string());
                warn!("client {}: {}", client_id, e);
                self.send_reject(client_id, msg, &e.to_string());
            }
        }
    }

    /// Routes engine events: execution reports go back to their clients,
    /// engine errors go to the log. Market data is not routed here; the
    /// binary forwards it to the market-data topic.
    pub fn on_engine_event(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Execution(report) => self.route_execution(report),
            EngineEvent::MarketData(_) => {}
            EngineEvent::Error(text) => error!("engine error: {}", text),
        }
    }

    /// Delivers one execution report to the originating client. Terminal
    /// reports tear the mapping down after routing.
    pub fn route_execution(&self, report: &ExecutionReport) {
        let entry = self
            .open_orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&report.order_id)
            .cloned();
        let Some(entry) = entry else {
            debug!("no client mapping for order {:?}; dropping report", report.order_id);
            return;
        };
        if report.status.is_terminal() {
            self.open_orders
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&report.order_id);
            self.by_client
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&(entry.client_id.clone(), entry.cl_ord_id.clone()));
        }
        let msg = execution_report_to_fix(report, &entry);
        self.send_to_client(&entry.client_id, msg);
    }

    /// Drains and writes a session's queued outbound frames. The acceptor
    /// calls this after feeding inbound bytes and after timer ticks.
    pub fn flush_session(&self, client_id: &str) {
        let Some(session) = self.session(client_id) else {
            return;
        };
        let frames = session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take_outbound();
        self.write_frames(client_id, frames);
    }

    fn handle_new_order_single(&self, client_id: &str, msg: &FixMessage) {
        let order = match self.order_from_new_order_single(client_id, msg) {
            Ok(order) => order,
            Err(e) => {
                warn!("client {}: bad NewOrderSingle: {}", client_id, e);
                self.send_reject(client_id, msg, &e.to_string());
                return;
            }
        };
        let cl_ord_id = msg.get(tags::CL_ORD_ID).unwrap_or_default().to_string();
        let entry = OrderEntry {
            client_id: client_id.to_string(),
            cl_ord_id: cl_ord_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
        };
        self.open_orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(order.order_id, entry);
        self.by_client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((client_id.to_string(), cl_ord_id), order.order_id);

        let order_id = order.order_id;
        if self.engine.submit_order(order).is_err() {
            self.open_orders
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&order_id);
            self.by_client
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, id| *id != order_id);
            self.send_reject(client_id, msg, "engine shutting down");
        }
    }

    fn handle_order_cancel_request(&self, client_id: &str, msg: &FixMessage) {
        let Some(orig_cl_ord_id) = msg.get(tags::ORIG_CL_ORD_ID) else {
            self.send_reject(client_id, msg, "missing field: OrigClOrdID (41)");
            return;
        };
        let order_id = self
            .by_client
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(client_id.to_string(), orig_cl_ord_id.to_string()))
            .copied();
        let Some(order_id) = order_id else {
            self.send_reject(client_id, msg, "order not found");
            return;
        };
        if self.engine.cancel_order(order_id, "client requested").is_err() {
            self.send_reject(client_id, msg, "engine shutting down");
        }
    }

    fn order_from_new_order_single(
        &self,
        client_id: &str,
        msg: &FixMessage,
    ) -> Result<Order, GatewayError> {
        msg.get(tags::CL_ORD_ID)
            .filter(|v| !v.is_empty())
            .ok_or(GatewayError::MissingField("ClOrdID (11)"))?;
        let symbol = msg
            .get(tags::SYMBOL)
            .filter(|v| !v.is_empty())
            .ok_or(GatewayError::MissingField("Symbol (55)"))?;
        let side_raw = msg
            .get(tags::SIDE)
            .ok_or(GatewayError::MissingField("Side (54)"))?;
        let side = Side::from_fix(side_raw).ok_or_else(|| GatewayError::InvalidField {
            field: "Side (54)",
            value: side_raw.to_string(),
        })?;
        let qty_raw = msg
            .get(tags::ORDER_QTY)
            .ok_or(GatewayError::MissingField("OrderQty (38)"))?;
        let quantity: u64 = qty_raw.parse().map_err(|_| GatewayError::InvalidField {
            field: "OrderQty (38)",
            value: qty_raw.to_string(),
        })?;
        let kind_raw = msg.get(tags::ORD_TYPE).unwrap_or("2");
        let kind = OrderKind::from_fix(kind_raw).ok_or_else(|| GatewayError::InvalidField {
            field: "OrdType (40)",
            value: kind_raw.to_string(),
        })?;
        let price = match kind {
            OrderKind::Limit | OrderKind::StopLimit => {
                let raw = msg
                    .get(tags::PRICE)
                    .ok_or(GatewayError::MissingField("Price (44)"))?;
                raw.parse().map_err(|_| GatewayError::InvalidField {
                    field: "Price (44)",
                    value: raw.to_string(),
                })?
            }
            OrderKind::Market | OrderKind::Stop => Decimal::ZERO,
        };
        let stop_price = match kind {
            OrderKind::Stop | OrderKind::StopLimit => {
                let raw = msg
                    .get(tags::STOP_PX)
                    .ok_or(GatewayError::MissingField("StopPx (99)"))?;
                Some(raw.parse().map_err(|_| GatewayError::InvalidField {
                    field: "StopPx (99)",
                    value: raw.to_string(),
                })?)
            }
            _ => None,
        };
        let time_in_force = msg
            .get(tags::TIME_IN_FORCE)
            .and_then(TimeInForce::from_fix)
            .unwrap_or(TimeInForce::Day);

        let mut order = Order::new(
            self.engine.allocate_order_id(),
            client_id,
            symbol,
            side,
            kind,
            price,
            quantity,
            time_in_force,
        );
        order.stop_price = stop_price;
        Ok(order)
    }

    /// Synthesizes a rejected execution report locally, echoing the
    /// original's correlation fields.
    fn send_reject(&self, client_id: &str, original: &FixMessage, reason: &str) {
        let mut msg = FixMessage::new(msg_type::EXECUTION_REPORT);
        for tag in [tags::CL_ORD_ID, tags::SYMBOL, tags::SIDE, tags::ORDER_QTY] {
            if let Some(value) = original.get(tag) {
                msg.set(tag, value);
            }
        }
        msg.set(tags::EXEC_ID, "0");
        msg.set(tags::ORDER_ID, "0");
        msg.set(tags::ORD_STATUS, "8");
        msg.set(tags::EXEC_TYPE, "8");
        msg.set(tags::CUM_QTY, "0");
        msg.set(tags::LEAVES_QTY, "0");
        msg.set(tags::TEXT, reason);
        msg.set(tags::TRANSACT_TIME, fix_utc_timestamp());
        self.send_to_client(client_id, msg);
    }

    fn send_to_client(&self, client_id: &str, msg: FixMessage) {
        let Some(session) = self.session(client_id) else {
            warn!("client {} has no session; dropping outbound message", client_id);
            return;
        };
        let frames = {
            let mut session = session.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = session.send_application(msg) {
                warn!("client {}: cannot send: {}", client_id, e);
                return;
            }
            session.take_outbound()
        };
        self.write_frames(client_id, frames);
    }

    fn write_frames(&self, client_id: &str, frames: Vec<Vec<u8>>) {
        if frames.is_empty() {
            return;
        }
        let send_fn = self.send_fn.lock().unwrap_or_else(|e| e.into_inner());
        let Some(send) = send_fn.as_ref() else {
            warn!("no transport send function installed; dropping {} frames", frames.len());
            return;
        };
        for frame in frames {
            if !send(client_id, &frame) {
                warn!("transport write to {} failed", client_id);
                break;
            }
        }
    }
}

/// Builds the outbound ExecutionReport (35=8) for one engine report.
fn execution_report_to_fix(report: &ExecutionReport, entry: &OrderEntry) -> FixMessage {
    let mut msg = FixMessage::new(msg_type::EXECUTION_REPORT);
    msg.set(tags::CL_ORD_ID, entry.cl_ord_id.clone());
    msg.set(tags::CUM_QTY, report.filled_quantity.to_string());
    msg.set(tags::EXEC_ID, report.exec_id.0.to_string());
    msg.set(tags::ORDER_ID, report.order_id.0.to_string());
    msg.set(tags::ORDER_QTY, report.original_quantity.to_string());
    msg.set(tags::ORD_STATUS, report.status.to_fix());
    msg.set(tags::ORD_TYPE, report.kind.to_fix());
    msg.set(tags::SIDE, entry.side.to_fix());
    msg.set(tags::SYMBOL, entry.symbol.clone());
    msg.set(tags::LEAVES_QTY, report.remaining_quantity.to_string());
    msg.set(tags::EXEC_TYPE, report.exec_type.to_fix());
    msg.set(tags::TRANSACT_TIME, fix_utc_timestamp());
    if report.price > Decimal::ZERO {
        msg.set(tags::PRICE, report.price.to_string());
    }
    if let Some(last_quantity) = report.last_quantity {
        msg.set(tags::LAST_QTY, last_quantity.to_string());
    }
    if let Some(last_price) = report.last_price {
        msg.set(tags::LAST_PX, last_price.to_string());
    }
    if let Some(reason) = &report.reject_reason {
        msg.set(tags::TEXT, reason.clone());
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RiskLimits;
    use crate::fix::codec::Codec;
    use crate::fix::session::{SessionConfig, FixSession};
    use std::time::{Duration, Instant};

    struct Harness {
        gateway: Arc<Gateway>,
        engine: Arc<MatchingEngine>,
        events: crossbeam_channel::Receiver<EngineEvent>,
        wire: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    }

    fn harness() -> Harness {
        let (engine, events) = MatchingEngine::new(RiskLimits::default());
        let engine = Arc::new(engine);
        engine.start();
        let gateway = Arc::new(Gateway::new(engine.clone()));
        let wire: Arc<Mutex<Vec<(String, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = wire.clone();
        gateway.set_send_fn(Box::new(move |client, bytes| {
            sink.lock().unwrap().push((client.to_string(), bytes.to_vec()));
            true
        }));
        Harness {
            gateway,
            engine,
            events,
            wire,
        }
    }

    /// Registers a logged-in session for `client`.
    fn connect(h: &Harness, client: &str) {
        let mut session = FixSession::new(SessionConfig::acceptor("ENGINE"), Codec::default());
        let codec = Codec::default();
        let mut logon = FixMessage::new(msg_type::LOGON);
        logon.set(tags::BEGIN_STRING, codec.begin_string());
        logon.set(tags::SENDER_COMP_ID, client);
        logon.set(tags::TARGET_COMP_ID, "ENGINE");
        logon.set(tags::MSG_SEQ_NUM, "1");
        session.on_bytes(&codec.encode(&logon).unwrap()).unwrap();
        session.take_outbound();
        h.gateway.register_session(client, Arc::new(Mutex::new(session)));
    }

    fn new_order_single(cl_ord_id: &str, side: &str, qty: &str, price: &str) -> FixMessage {
        let mut msg = FixMessage::new(msg_type::NEW_ORDER_SINGLE);
        msg.set(tags::CL_ORD_ID, cl_ord_id);
        msg.set(tags::SYMBOL, "AAPL");
        msg.set(tags::SIDE, side);
        msg.set(tags::ORDER_QTY, qty);
        msg.set(tags::ORD_TYPE, "2");
        msg.set(tags::PRICE, price);
        msg.set(tags::TIME_IN_FORCE, "0");
        msg
    }

    /// Pumps engine events into the gateway: waits for the first event,
    /// then keeps going until the bus stays quiet.
    fn pump(h: &Harness) {
        let mut timeout = Duration::from_millis(500);
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            match h.events.recv_timeout(timeout) {
                Ok(event) => {
                    h.gateway.on_engine_event(&event);
                    timeout = Duration::from_millis(100);
                }
                Err(_) => break,
            }
        }
    }

    fn decoded_wire(h: &Harness) -> Vec<(String, FixMessage)> {
        let codec = Codec::default();
        h.wire
            .lock()
            .unwrap()
            .iter()
            .map(|(client, bytes)| (client.clone(), codec.decode(bytes).unwrap()))
            .collect()
    }

    #[test]
    fn new_order_single_is_acked_with_client_correlation_tag() {
        let h = harness();
        connect(&h, "alice");
        h.gateway
            .on_application_message("alice", &new_order_single("ord-1", "1", "10", "100"));
        pump(&h);

        let frames = decoded_wire(&h);
        assert!(!frames.is_empty());
        let (client, ack) = &frames[0];
        assert_eq!(client, "alice");
        assert_eq!(ack.msg_type(), Some(msg_type::EXECUTION_REPORT));
        assert_eq!(ack.get(tags::CL_ORD_ID), Some("ord-1"));
        assert_eq!(ack.get(tags::ORD_STATUS), Some("0"));
        assert_eq!(ack.get(tags::EXEC_TYPE), Some("0"));
        assert_eq!(ack.get(tags::LEAVES_QTY), Some("10"));
        assert_eq!(h.gateway.open_order_count(), 1);
        h.engine.stop();
    }

    #[test]
    fn reports_are_routed_per_client_and_terminal_mappings_drop() {
        let h = harness();
        connect(&h, "alice");
        connect(&h, "bob");
        h.gateway
            .on_application_message("alice", &new_order_single("a-1", "2", "10", "100"));
        h.gateway
            .on_application_message("bob", &new_order_single("b-1", "1", "10", "100"));
        pump(&h);

        let frames = decoded_wire(&h);
        let alice_final = frames
            .iter()
            .filter(|(c, _)| c == "alice")
            .last()
            .expect("alice got reports");
        let bob_final = frames
            .iter()
            .filter(|(c, _)| c == "bob")
            .last()
            .expect("bob got reports");
        assert_eq!(alice_final.1.get(tags::ORD_STATUS), Some("2"), "seller filled");
        assert_eq!(bob_final.1.get(tags::ORD_STATUS), Some("2"), "buyer filled");
        assert_eq!(bob_final.1.get(tags::LAST_PX), Some("100"));
        assert_eq!(h.gateway.open_order_count(), 0, "terminal mappings removed");
        h.engine.stop();
    }

    #[test]
    fn cancel_request_round_trip() {
        let h = harness();
        connect(&h, "alice");
        h.gateway
            .on_application_message("alice", &new_order_single("ord-1", "1", "10", "100"));
        pump(&h);

        let mut cancel = FixMessage::new(msg_type::ORDER_CANCEL_REQUEST);
        cancel.set(tags::ORIG_CL_ORD_ID, "ord-1");
        h.gateway.on_application_message("alice", &cancel);
        pump(&h);

        let frames = decoded_wire(&h);
        let last = &frames.last().unwrap().1;
        assert_eq!(last.get(tags::ORD_STATUS), Some("4"));
        assert_eq!(last.get(tags::CL_ORD_ID), Some("ord-1"));
        assert_eq!(h.gateway.open_order_count(), 0);
        h.engine.stop();
    }

    #[test]
    fn cancel_for_unknown_order_rejects_locally() {
        let h = harness();
        connect(&h, "alice");
        let mut cancel = FixMessage::new(msg_type::ORDER_CANCEL_REQUEST);
        cancel.set(tags::ORIG_CL_ORD_ID, "nope");
        h.gateway.on_application_message("alice", &cancel);

        let frames = decoded_wire(&h);
        assert_eq!(frames.len(), 1);
        let reject = &frames[0].1;
        assert_eq!(reject.get(tags::ORD_STATUS), Some("8"));
        assert_eq!(reject.get(tags::TEXT), Some("order not found"));
        h.engine.stop();
    }

    #[test]
    fn unsupported_application_type_rejects() {
        let h = harness();
        connect(&h, "alice");
        let odd = FixMessage::new("j");
        h.gateway.on_application_message("alice", &odd);
        let frames = decoded_wire(&h);
        assert!(frames[0]
            .1
            .get(tags::TEXT)
            .unwrap()
            .contains("unsupported message type"));
        h.engine.stop();
    }

    #[test]
    fn missing_required_order_field_rejects() {
        let h = harness();
        connect(&h, "alice");
        let mut msg = new_order_single("ord-1", "1", "10", "100");
        msg.remove(tags::ORDER_QTY);
        h.gateway.on_application_message("alice", &msg);
        let frames = decoded_wire(&h);
        assert!(frames[0].1.get(tags::TEXT).unwrap().contains("OrderQty"));
        assert_eq!(h.gateway.open_order_count(), 0);
        h.engine.stop();
    }

    #[test]
    fn engine_down_rejects_with_shutdown_text() {
        let h = harness();
        connect(&h, "alice");
        h.engine.stop();
        h.gateway
            .on_application_message("alice", &new_order_single("ord-1", "1", "10", "100"));
        let frames = decoded_wire(&h);
        assert_eq!(frames[0].1.get(tags::TEXT), Some("engine shutting down"));
        assert_eq!(h.gateway.open_order_count(), 0);
    }
}
