//! Session layer: login state machine, sequence numbers, heartbeats, and
//! resend handling.
//!
//! A session is the single authority on transport-level message validity;
//! it holds no business semantics. Admin messages (Logon, Logout, Heartbeat,
//! TestRequest, ResendRequest, SequenceReset) are absorbed here; application
//! messages are handed back to the owning reader once the session is logged
//! in. The session never calls out: outbound frames accumulate in a queue
//! the owner drains and writes to its transport.

use crate::error::{CodecError, SessionError};
use crate::fix::codec::{fix_utc_timestamp, msg_type, tags, Codec, FixMessage};
use crate::types::epoch_millis;
use log::{debug, warn};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Consecutive codec failures tolerated before the session gives up on the
/// connection.
const CODEC_FAILURE_LIMIT: u32 = 3;

/// Inbound silence beyond `interval * HEARTBEAT_EXPIRY_FACTOR` is a
/// heartbeat timeout.
const HEARTBEAT_EXPIRY_FACTOR: f64 = 1.2;

/// Conversation state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    PendingLogon,
    LoggedIn,
    PendingLogout,
    LoggedOut,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::PendingLogon => "pending_logon",
            SessionState::LoggedIn => "logged_in",
            SessionState::PendingLogout => "pending_logout",
            SessionState::LoggedOut => "logged_out",
            SessionState::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static parameters of a session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub sender_comp_id: String,
    /// May be empty on an accepted session; it is adopted from the first
    /// inbound message's SenderCompID and enforced afterwards.
    pub target_comp_id: String,
    pub heartbeat_interval: Duration,
    /// Ring of sent application messages kept for ResendRequest replay.
    pub resend_store_capacity: usize,
}

impl SessionConfig {
    pub fn new(sender_comp_id: impl Into<String>, target_comp_id: impl Into<String>) -> Self {
        Self {
            sender_comp_id: sender_comp_id.into(),
            target_comp_id: target_comp_id.into(),
            heartbeat_interval: Duration::from_secs(30),
            resend_store_capacity: 1024,
        }
    }

    /// Acceptor-side session: the counterparty identifies itself at logon.
    pub fn acceptor(sender_comp_id: impl Into<String>) -> Self {
        Self::new(sender_comp_id, "")
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// One FIX conversation over one connection.
pub struct FixSession {
    codec: Codec,
    sender_comp_id: String,
    target_comp_id: String,
    heartbeat_interval: Duration,
    resend_store_capacity: usize,
    state: SessionState,
    out_seq: u64,
    expected_in_seq: u64,
    last_sent: Instant,
    last_received: Instant,
    test_request_outstanding: bool,
    consecutive_codec_failures: u32,
    sent_app_store: VecDeque<(u64, FixMessage)>,
    outbound: VecDeque<Vec<u8>>,
    inbound_buffer: Vec<u8>,
    messages_sent: u64,
    messages_received: u64,
}

impl FixSession {
    pub fn new(config: SessionConfig, codec: Codec) -> Self {
        let now = Instant::now();
        Self {
            codec,
            sender_comp_id: config.sender_comp_id,
            target_comp_id: config.target_comp_id,
            heartbeat_interval: config.heartbeat_interval,
            resend_store_capacity: config.resend_store_capacity,
            state: SessionState::Disconnected,
            out_seq: 1,
            expected_in_seq: 1,
            last_sent: now,
            last_received: now,
            test_request_outstanding: false,
            consecutive_codec_failures: 0,
            sent_app_store: VecDeque::new(),
            outbound: VecDeque::new(),
            inbound_buffer: Vec::new(),
            messages_sent: 0,
            messages_received: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sender_comp_id(&self) -> &str {
        &self.sender_comp_id
    }

    pub fn target_comp_id(&self) -> &str {
        &self.target_comp_id
    }

    pub fn expected_in_seq(&self) -> u64 {
        self.expected_in_seq
    }

    pub fn next_out_seq(&self) -> u64 {
        self.out_seq
    }

    pub fn messages_sent(&self) -> u64 {
        self.messages_sent
    }

    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// True once the owning transport should close the connection.
    pub fn should_disconnect(&self) -> bool {
        matches!(self.state, SessionState::LoggedOut | SessionState::Error)
    }

    /// Starts a logon as the initiating side.
    pub fn initiate(&mut self, username: &str, password: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::BadState {
                action: "initiate logon",
                state: self.state.as_str(),
            });
        }
        let mut logon = FixMessage::new(msg_type::LOGON);
        logon.set(tags::ENCRYPT_METHOD, "0");
        logon.set(
            tags::HEART_BT_INT,
            self.heartbeat_interval.as_secs().to_string(),
        );
        if !username.is_empty() {
            logon.set(tags::USERNAME, username);
        }
        if !password.is_empty() {
            logon.set(tags::PASSWORD, password);
        }
        self.state = SessionState::PendingLogon;
        self.stamp_and_send(logon, false);
        Ok(())
    }

    /// Starts an orderly logout.
    pub fn logout(&mut self, reason: &str) -> Result<(), SessionError> {
        if self.state != SessionState::LoggedIn {
            return Err(SessionError::BadState {
                action: "initiate logout",
                state: self.state.as_str(),
            });
        }
        let mut msg = FixMessage::new(msg_type::LOGOUT);
        if !reason.is_empty() {
            msg.set(tags::TEXT, reason);
        }
        self.state = SessionState::PendingLogout;
        self.stamp_and_send(msg, false);
        Ok(())
    }

    /// Feeds raw transport bytes in. Complete frames are decoded and run
    /// through the session; application messages that survive admin
    /// absorption and sequencing are returned for the gateway.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Result<Vec<FixMessage>, SessionError> {
        self.inbound_buffer.extend_from_slice(bytes);
        let mut applications = Vec::new();
        loop {
            match self.codec.extract_frame(&self.inbound_buffer) {
                Ok(Some(len)) => {
                    let frame: Vec<u8> = self.inbound_buffer.drain(..len).collect();
                    match self.codec.decode(&frame) {
                        Ok(msg) => {
                            self.consecutive_codec_failures = 0;
                            if let Some(app) = self.on_message(msg)? {
                                applications.push(app);
                            }
                        }
                        Err(e) => self.record_codec_failure(e)?,
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    // The stream cannot resynchronize from here.
                    self.inbound_buffer.clear();
                    self.record_codec_failure(e)?;
                    break;
                }
            }
        }
        Ok(applications)
    }

    /// Runs one decoded message through CompID checks, sequencing, and admin
    /// handling. Returns the message back when it is application traffic to
    /// forward upstream.
    pub fn on_message(&mut self, msg: FixMessage) -> Result<Option<FixMessage>, SessionError> {
        self.messages_received += 1;
        self.last_received = Instant::now();
        self.test_request_outstanding = false;

        if let Some(sender) = msg.get(tags::SENDER_COMP_ID) {
            if self.target_comp_id.is_empty() {
                self.target_comp_id = sender.to_string();
                debug!("session {}: adopted counterparty {}", self.sender_comp_id, sender);
            } else if sender != self.target_comp_id {
                warn!(
                    "session {}: CompID mismatch, expected {:?} got {:?}; dropping message",
                    self.sender_comp_id, self.target_comp_id, sender
                );
                return Ok(None);
            }
        }
        if let Some(target) = msg.get(tags::TARGET_COMP_ID) {
            if !target.is_empty() && target != self.sender_comp_id {
                warn!(
                    "session {}: message addressed to {:?}; dropping",
                    self.sender_comp_id, target
                );
                return Ok(None);
            }
        }

        // SequenceReset repositions the inbound stream and bypasses normal
        // sequencing.
        if msg.msg_type() == Some(msg_type::SEQUENCE_RESET) {
            match msg.get(tags::NEW_SEQ_NO).and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(new_seq) => {
                    debug!("session {}: sequence reset to {}", self.sender_comp_id, new_seq);
                    self.expected_in_seq = new_seq;
                }
                None => warn!("session {}: SequenceReset without usable NewSeqNo", self.sender_comp_id),
            }
            return Ok(None);
        }

        match msg.seq_num() {
            None => {
                warn!("session {}: message without MsgSeqNum; dropping", self.sender_comp_id);
                return Ok(None);
            }
            Some(received) if received < self.expected_in_seq => {
                debug!(
                    "session {}: duplicate seq {} (expected {}); dropping",
                    self.sender_comp_id, received, self.expected_in_seq
                );
                return Ok(None);
            }
            Some(received) => {
                if received > self.expected_in_seq {
                    warn!(
                        "session {}: sequence gap, expected {} got {}",
                        self.sender_comp_id, self.expected_in_seq, received
                    );
                    self.send_resend_request(self.expected_in_seq, received - 1);
                }
                self.expected_in_seq = received + 1;
            }
        }

        if msg.is_admin() {
            self.handle_admin(&msg);
            return Ok(None);
        }

        if self.state != SessionState::LoggedIn {
            warn!(
                "session {}: application message in state {}; discarding",
                self.sender_comp_id, self.state
            );
            self.state = SessionState::Error;
            return Err(SessionError::NotLoggedIn);
        }
        Ok(Some(msg))
    }

    /// Stamps and sends an application message. The message is stored for
    /// potential retransmission.
    pub fn send_application(&mut self, msg: FixMessage) -> Result<(), SessionError> {
        if self.state != SessionState::LoggedIn {
            return Err(SessionError::BadState {
                action: "send application message",
                state: self.state.as_str(),
            });
        }
        self.stamp_and_send(msg, true);
        Ok(())
    }

    /// Drives heartbeat emission and liveness checks. Call periodically;
    /// an `Err` means the session expired and the transport should close.
    pub fn check_timers(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::LoggedIn || self.heartbeat_interval.is_zero() {
            return Ok(());
        }
        if now.duration_since(self.last_sent) >= self.heartbeat_interval {
            self.send_heartbeat(None);
        }
        let silence = now.duration_since(self.last_received);
        if silence > self.heartbeat_interval.mul_f64(HEARTBEAT_EXPIRY_FACTOR) {
            self.state = SessionState::Error;
            return Err(SessionError::HeartbeatTimeout {
                silence_ms: silence.as_millis() as u64,
                interval_ms: self.heartbeat_interval.as_millis() as u64,
            });
        }
        if silence >= self.heartbeat_interval && !self.test_request_outstanding {
            let mut req = FixMessage::new(msg_type::TEST_REQUEST);
            req.set(tags::TEST_REQ_ID, format!("TR{}", epoch_millis()));
            self.stamp_and_send(req, false);
            self.test_request_outstanding = true;
        }
        Ok(())
    }

    /// Serialized frames waiting to be written to the transport.
    pub fn take_outbound(&mut self) -> Vec<Vec<u8>> {
        self.outbound.drain(..).collect()
    }

    /// Drops all conversation state back to a fresh, disconnected session.
    pub fn reset(&mut self) {
        self.state = SessionState::Disconnected;
        self.out_seq = 1;
        self.expected_in_seq = 1;
        self.sent_app_store.clear();
        self.outbound.clear();
        self.inbound_buffer.clear();
        self.consecutive_codec_failures = 0;
        self.test_request_outstanding = false;
        self.last_sent = Instant::now();
        self.last_received = self.last_sent;
        self.messages_sent = 0;
        self.messages_received = 0;
    }

    fn record_codec_failure(&mut self, error: CodecError) -> Result<(), SessionError> {
        self.consecutive_codec_failures += 1;
        warn!(
            "session {}: codec failure {}/{}: {}",
            self.sender_comp_id, self.consecutive_codec_failures, CODEC_FAILURE_LIMIT, error
        );
        if self.consecutive_codec_failures >= CODEC_FAILURE_LIMIT {
            self.state = SessionState::Error;
            return Err(SessionError::CodecFailures {
                consecutive: self.consecutive_codec_failures,
                last: error,
            });
        }
        Ok(())
    }

    fn handle_admin(&mut self, msg: &FixMessage) {
        match msg.msg_type() {
            Some(msg_type::LOGON) => self.handle_logon(msg),
            Some(msg_type::LOGOUT) => self.handle_logout(),
            Some(msg_type::HEARTBEAT) => {
                // Inbound liveness timer was refreshed in on_message.
            }
            Some(msg_type::TEST_REQUEST) => {
                let test_req_id = msg.get(tags::TEST_REQ_ID).map(str::to_string);
                self.send_heartbeat(test_req_id.as_deref());
            }
            Some(msg_type::RESEND_REQUEST) => self.handle_resend_request(msg),
            other => warn!("session {}: unhandled admin type {:?}", self.sender_comp_id, other),
        }
    }

    fn handle_logon(&mut self, msg: &FixMessage) {
        match self.state {
            SessionState::PendingLogon => {
                // Response to the logon we initiated.
                self.adopt_heartbeat_interval(msg);
                self.state = SessionState::LoggedIn;
                let now = Instant::now();
                self.last_sent = now;
                self.last_received = now;
            }
            SessionState::Disconnected => {
                // Counterparty-initiated logon; acknowledge it.
                self.adopt_heartbeat_interval(msg);
                self.state = SessionState::LoggedIn;
                let mut response = FixMessage::new(msg_type::LOGON);
                response.set(tags::ENCRYPT_METHOD, "0");
                response.set(
                    tags::HEART_BT_INT,
                    self.heartbeat_interval.as_secs().to_string(),
                );
                self.stamp_and_send(response, false);
            }
            state => warn!(
                "session {}: unexpected Logon in state {}",
                self.sender_comp_id, state
            ),
        }
    }

    fn handle_logout(&mut self) {
        match self.state {
            SessionState::PendingLogout => {
                self.state = SessionState::LoggedOut;
            }
            SessionState::LoggedIn => {
                let mut ack = FixMessage::new(msg_type::LOGOUT);
                ack.set(tags::TEXT, "logout acknowledged");
                self.stamp_and_send(ack, false);
                self.state = SessionState::LoggedOut;
            }
            state => warn!(
                "session {}: Logout in unexpected state {}",
                self.sender_comp_id, state
            ),
        }
    }

    fn handle_resend_request(&mut self, msg: &FixMessage) {
        let begin = msg.get(tags::BEGIN_SEQ_NO).and_then(|v| v.trim().parse::<u64>().ok());
        let end = msg.get(tags::END_SEQ_NO).and_then(|v| v.trim().parse::<u64>().ok());
        let (begin, end) = match (begin, end) {
            (Some(b), Some(e)) if b <= e => (b, e),
            _ => {
                warn!("session {}: unusable ResendRequest range", self.sender_comp_id);
                return;
            }
        };
        let mut replayed = 0u64;
        let mut frames = Vec::new();
        for (seq, stored) in &self.sent_app_store {
            if *seq < begin || *seq > end {
                continue;
            }
            let mut dup = stored.clone();
            dup.set(tags::POSS_DUP_FLAG, "Y");
            match self.codec.encode(&dup) {
                Ok(bytes) => {
                    frames.push(bytes);
                    replayed += 1;
                }
                Err(e) => warn!("session {}: resend encode failed: {}", self.sender_comp_id, e),
            }
        }
        self.outbound.extend(frames);
        if replayed < end - begin + 1 {
            warn!(
                "session {}: resend [{}, {}] replayed only {} messages (rest evicted or admin)",
                self.sender_comp_id, begin, end, replayed
            );
        }
    }

    fn adopt_heartbeat_interval(&mut self, msg: &FixMessage) {
        if let Some(secs) = msg.get(tags::HEART_BT_INT).and_then(|v| v.trim().parse::<u64>().ok()) {
            if secs > 0 {
                self.heartbeat_interval = Duration::from_secs(secs);
            }
        }
    }

    fn send_heartbeat(&mut self, test_req_id: Option<&str>) {
        let mut hb = FixMessage::new(msg_type::HEARTBEAT);
        if let Some(id) = test_req_id {
            hb.set(tags::TEST_REQ_ID, id);
        }
        self.stamp_and_send(hb, false);
    }

    fn send_resend_request(&mut self, begin: u64, end: u64) {
        let mut req = FixMessage::new(msg_type::RESEND_REQUEST);
        req.set(tags::BEGIN_SEQ_NO, begin.to_string());
        req.set(tags::END_SEQ_NO, end.to_string());
        self.stamp_and_send(req, false);
    }

    /// Fills in the envelope and session header, serializes, and queues the
    /// frame. Outbound sequence numbers are strictly increasing and
    /// gap-free: they advance only here.
    fn stamp_and_send(&mut self, mut msg: FixMessage, store: bool) {
        let seq = self.out_seq;
        msg.set(tags::BEGIN_STRING, self.codec.begin_string());
        msg.set(tags::SENDER_COMP_ID, self.sender_comp_id.clone());
        if !self.target_comp_id.is_empty() {
            msg.set(tags::TARGET_COMP_ID, self.target_comp_id.clone());
        }
        msg.set(tags::MSG_SEQ_NUM, seq.to_string());
        msg.set(tags::SENDING_TIME, fix_utc_timestamp());
        match self.codec.encode(&msg) {
            Ok(bytes) => {
                self.outbound.push_back(bytes);
                self.out_seq += 1;
                self.messages_sent += 1;
                self.last_sent = Instant::now();
                if store {
                    if self.sent_app_store.len() >= self.resend_store_capacity {
                        self.sent_app_store.pop_front();
                    }
                    self.sent_app_store.push_back((seq, msg));
                }
            }
            Err(e) => warn!("session {}: encode failed: {}", self.sender_comp_id, e),
        }
    }
}
