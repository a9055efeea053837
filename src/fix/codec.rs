//! FIX tag-value wire codec: encode, strict/lenient decode, and stream
//! framing.
//!
//! A message is `tag=value` records separated by SOH (0x01), wrapped in the
//! envelope `8=BeginString | 9=BodyLength | 35=MsgType | body... |
//! 10=CheckSum`. BodyLength counts the bytes from after BodyLength's
//! delimiter up to CheckSum's tag; CheckSum is the byte sum of everything
//! before its own tag, mod 256, zero-padded to three digits. Body records
//! are emitted in ascending tag order. A configurable `|` delimiter is
//! accepted on decode for hand-written test input.

use crate::error::CodecError;
use std::collections::BTreeMap;
use std::io::Write;

/// Standard FIX field delimiter.
pub const SOH: u8 = 0x01;

/// Tag numbers consumed by this engine.
pub mod tags {
    pub const BEGIN_SEQ_NO: u32 = 7;
    pub const BEGIN_STRING: u32 = 8;
    pub const BODY_LENGTH: u32 = 9;
    pub const CHECK_SUM: u32 = 10;
    pub const CL_ORD_ID: u32 = 11;
    pub const CUM_QTY: u32 = 14;
    pub const END_SEQ_NO: u32 = 16;
    pub const EXEC_ID: u32 = 17;
    pub const LAST_PX: u32 = 31;
    pub const LAST_QTY: u32 = 32;
    pub const MSG_SEQ_NUM: u32 = 34;
    pub const MSG_TYPE: u32 = 35;
    pub const NEW_SEQ_NO: u32 = 36;
    pub const ORDER_ID: u32 = 37;
    pub const ORDER_QTY: u32 = 38;
    pub const ORD_STATUS: u32 = 39;
    pub const ORD_TYPE: u32 = 40;
    pub const ORIG_CL_ORD_ID: u32 = 41;
    pub const POSS_DUP_FLAG: u32 = 43;
    pub const PRICE: u32 = 44;
    pub const SENDER_COMP_ID: u32 = 49;
    pub const SENDING_TIME: u32 = 52;
    pub const SIDE: u32 = 54;
    pub const SYMBOL: u32 = 55;
    pub const TARGET_COMP_ID: u32 = 56;
    pub const TEXT: u32 = 58;
    pub const TIME_IN_FORCE: u32 = 59;
    pub const TRANSACT_TIME: u32 = 60;
    pub const ENCRYPT_METHOD: u32 = 98;
    pub const STOP_PX: u32 = 99;
    pub const HEART_BT_INT: u32 = 108;
    pub const TEST_REQ_ID: u32 = 112;
    pub const EXEC_TYPE: u32 = 150;
    pub const LEAVES_QTY: u32 = 151;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

/// MsgType (tag 35) values.
pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const RESEND_REQUEST: &str = "2";
    pub const SEQUENCE_RESET: &str = "4";
    pub const LOGOUT: &str = "5";
    pub const EXECUTION_REPORT: &str = "8";
    pub const LOGON: &str = "A";
    pub const NEW_ORDER_SINGLE: &str = "D";
    pub const ORDER_CANCEL_REQUEST: &str = "F";
}

/// A FIX message as an ordered tag -> value record set.
///
/// `BTreeMap` keeps body records in ascending tag order, which is exactly
/// the order the encoder must emit them in.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FixMessage {
    fields: BTreeMap<u32, String>,
}

impl FixMessage {
    /// Empty message with only MsgType set. The envelope's BeginString is
    /// stamped by the session (or must be set by the caller) before encode.
    pub fn new(msg_type: &str) -> Self {
        let mut msg = Self::default();
        msg.set(tags::MSG_TYPE, msg_type);
        msg
    }

    pub fn set(&mut self, tag: u32, value: impl Into<String>) -> &mut Self {
        self.fields.insert(tag, value.into());
        self
    }

    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(String::as_str)
    }

    pub fn has(&self, tag: u32) -> bool {
        self.fields.contains_key(&tag)
    }

    pub fn remove(&mut self, tag: u32) -> Option<String> {
        self.fields.remove(&tag)
    }

    /// Records in ascending tag order.
    pub fn fields(&self) -> impl Iterator<Item = (u32, &str)> {
        self.fields.iter().map(|(t, v)| (*t, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn msg_type(&self) -> Option<&str> {
        self.get(tags::MSG_TYPE)
    }

    pub fn seq_num(&self) -> Option<u64> {
        self.get(tags::MSG_SEQ_NUM)?.trim().parse().ok()
    }

    /// Admin messages maintain the session; everything else is application
    /// traffic forwarded upstream.
    pub fn is_admin(&self) -> bool {
        matches!(
            self.msg_type(),
            Some(
                msg_type::HEARTBEAT
                    | msg_type::TEST_REQUEST
                    | msg_type::RESEND_REQUEST
                    | msg_type::SEQUENCE_RESET
                    | msg_type::LOGOUT
                    | msg_type::LOGON
            )
        )
    }
}

/// Encoder/decoder with a BeginString allow-list and an optional extra
/// delimiter accepted on decode (test mode).
#[derive(Clone, Debug)]
pub struct Codec {
    accepted_versions: Vec<String>,
    test_delimiter: Option<u8>,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            accepted_versions: vec!["FIX.4.2".to_string(), "FIX.4.4".to_string()],
            test_delimiter: None,
        }
    }
}

impl Codec {
    pub fn new(accepted_versions: Vec<String>, test_delimiter: Option<u8>) -> Self {
        debug_assert!(!accepted_versions.is_empty());
        Self {
            accepted_versions,
            test_delimiter,
        }
    }

    /// The BeginString stamped on outbound messages (first accepted version).
    pub fn begin_string(&self) -> &str {
        &self.accepted_versions[0]
    }

    /// Serializes `msg` with computed BodyLength and CheckSum. Requires
    /// BeginString and MsgType to be present and non-empty; BodyLength and
    /// CheckSum in the input are ignored.
    pub fn encode(&self, msg: &FixMessage) -> Result<Vec<u8>, CodecError> {
        let begin = msg
            .get(tags::BEGIN_STRING)
            .filter(|v| !v.is_empty())
            .ok_or(CodecError::MissingRequiredField(tags::BEGIN_STRING))?;
        let mt = msg
            .get(tags::MSG_TYPE)
            .filter(|v| !v.is_empty())
            .ok_or(CodecError::MissingRequiredField(tags::MSG_TYPE))?;

        let mut body: Vec<u8> = Vec::with_capacity(64);
        let _ = write!(body, "35={}\x01", mt);
        for (tag, value) in msg.fields() {
            if matches!(
                tag,
                tags::BEGIN_STRING | tags::BODY_LENGTH | tags::MSG_TYPE | tags::CHECK_SUM
            ) {
                continue;
            }
            let _ = write!(body, "{}={}\x01", tag, value);
        }

        let header = format!("8={}\x019={}\x01", begin, body.len());
        let sum: u32 = header
            .bytes()
            .chain(body.iter().copied())
            .map(u32::from)
            .sum();
        let mut out = Vec::with_capacity(header.len() + body.len() + 7);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        let _ = write!(out, "10={:03}\x01", sum % 256);
        Ok(out)
    }

    /// Strict decode: full envelope validation including checksum.
    pub fn decode(&self, raw: &[u8]) -> Result<FixMessage, CodecError> {
        self.decode_with(raw, true)
    }

    /// Lenient decode: skips the checksum check. For replay and fuzz
    /// harnesses; strict decode is the default everywhere else.
    pub fn decode_lenient(&self, raw: &[u8]) -> Result<FixMessage, CodecError> {
        self.decode_with(raw, false)
    }

    fn decode_with(&self, raw: &[u8], verify_checksum: bool) -> Result<FixMessage, CodecError> {
        if raw.is_empty() {
            return Err(CodecError::EmptyInput);
        }
        let delim = self.detect_delimiter(raw);

        let mut msg = FixMessage::default();
        // Byte offset of the CheckSum record's tag; the checksum covers
        // every byte before it.
        let mut checksum_at: Option<usize> = None;
        let mut pos = 0usize;
        while pos < raw.len() {
            let eq = match raw[pos..].iter().position(|&b| b == b'=') {
                Some(p) => pos + p,
                None => break,
            };
            let tag_str = std::str::from_utf8(&raw[pos..eq])
                .map_err(|_| CodecError::BadTag(String::from_utf8_lossy(&raw[pos..eq]).into_owned()))?;
            let tag: u32 = tag_str
                .parse()
                .map_err(|_| CodecError::BadTag(tag_str.to_string()))?;
            let end = raw[eq + 1..]
                .iter()
                .position(|&b| b == delim)
                .map(|p| eq + 1 + p)
                .unwrap_or(raw.len());
            let value = String::from_utf8_lossy(&raw[eq + 1..end]).into_owned();
            msg.set(tag, value);
            pos = end + 1;
            if tag == tags::CHECK_SUM {
                checksum_at = Some(eq - tag_str.len());
                break;
            }
        }

        let begin = msg
            .get(tags::BEGIN_STRING)
            .ok_or(CodecError::BadEnvelope("missing BeginString (8)"))?;
        if !self.accepted_versions.iter().any(|v| v == begin) {
            return Err(CodecError::BadVersion(begin.to_string()));
        }
        let len_str = msg
            .get(tags::BODY_LENGTH)
            .ok_or(CodecError::BadEnvelope("missing BodyLength (9)"))?;
        if len_str.is_empty() || !len_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodecError::BadLength(len_str.to_string()));
        }
        msg.get(tags::MSG_TYPE)
            .filter(|v| !v.is_empty())
            .ok_or(CodecError::BadEnvelope("missing MsgType (35)"))?;
        let declared = msg
            .get(tags::CHECK_SUM)
            .ok_or(CodecError::BadEnvelope("missing CheckSum (10)"))?;

        if verify_checksum {
            let end = checksum_at.unwrap_or(raw.len());
            let computed = raw[..end].iter().map(|&b| u32::from(b)).sum::<u32>() % 256;
            let matches = declared
                .trim()
                .parse::<u32>()
                .map(|d| d == computed)
                .unwrap_or(false);
            if !matches {
                return Err(CodecError::BadChecksum {
                    declared: declared.to_string(),
                    computed,
                });
            }
        }
        Ok(msg)
    }

    /// Looks for one complete message at the start of `buf`.
    ///
    /// Returns `Ok(Some(len))` with the frame length when a full message
    /// (through CheckSum's delimiter) is buffered, `Ok(None)` when more
    /// bytes are needed, and `Err` when the buffer start can never become a
    /// valid message (resynchronization is not attempted; the session layer
    /// decides whether to disconnect).
    pub fn extract_frame(&self, buf: &[u8]) -> Result<Option<usize>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }
        if !buf.starts_with(b"8=") {
            if buf.len() >= 2 {
                return Err(CodecError::BadEnvelope("stream does not start with BeginString (8)"));
            }
            return Ok(None);
        }
        let delim = self.detect_delimiter(buf);
        let d0 = match buf.iter().position(|&b| b == delim) {
            Some(p) => p,
            None => return Ok(None),
        };
        let rest = &buf[d0 + 1..];
        if rest.len() < 2 {
            return Ok(None);
        }
        if !rest.starts_with(b"9=") {
            return Err(CodecError::BadEnvelope("BodyLength (9) must follow BeginString"));
        }
        let d1 = match rest.iter().position(|&b| b == delim) {
            Some(p) => p,
            None => return Ok(None),
        };
        let len_str = std::str::from_utf8(&rest[2..d1]).unwrap_or("");
        let body_len: usize = len_str
            .parse()
            .map_err(|_| CodecError::BadLength(len_str.to_string()))?;
        let body_start = d0 + 1 + d1 + 1;
        let body_end = body_start + body_len;
        // CheckSum trailer: "10=" + three digits + delimiter.
        if buf.len() < body_end + 7 {
            return Ok(None);
        }
        if &buf[body_end..body_end + 3] != b"10=" {
            return Err(CodecError::BadEnvelope("CheckSum (10) must follow body"));
        }
        Ok(Some(body_end + 7))
    }

    fn detect_delimiter(&self, raw: &[u8]) -> u8 {
        if raw.contains(&SOH) {
            return SOH;
        }
        match self.test_delimiter {
            Some(d) if raw.contains(&d) => d,
            _ => SOH,
        }
    }
}

/// Current UTC time in FIX SendingTime format, `YYYYMMDD-HH:MM:SS`.
pub fn fix_utc_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    const SECS_PER_DAY: u64 = 86_400;
    let (y, mo, d) = days_to_ymd((secs / SECS_PER_DAY) as i64);
    let t = secs % SECS_PER_DAY;
    format!(
        "{:04}{:02}{:02}-{:02}:{:02}:{:02}",
        y,
        mo,
        d,
        t / 3600,
        (t % 3600) / 60,
        t % 60
    )
}

// Civil-date conversion (days since 1970-01-01 to y/m/d).
fn days_to_ymd(days: i64) -> (u32, u32, u32) {
    let z = days + 719_468;
    let era = (if z >= 0 { z } else { z - 146_096 }) / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = (yoe + era * 400) as u32 + 1;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::default()
    }

    fn sample_order_message() -> FixMessage {
        let mut m = FixMessage::new(msg_type::NEW_ORDER_SINGLE);
        m.set(tags::BEGIN_STRING, "FIX.4.2");
        m.set(tags::SENDER_COMP_ID, "C");
        m.set(tags::TARGET_COMP_ID, "S");
        m.set(tags::MSG_SEQ_NUM, "1");
        m.set(tags::CL_ORD_ID, "X");
        m.set(tags::SYMBOL, "AAPL");
        m.set(tags::SIDE, "1");
        m.set(tags::ORDER_QTY, "100");
        m.set(tags::ORD_TYPE, "2");
        m.set(tags::PRICE, "150.50");
        m
    }

    #[test]
    fn encode_then_decode_round_trips_non_envelope_tags() {
        let input = sample_order_message();
        let bytes = codec().encode(&input).unwrap();
        let decoded = codec().decode(&bytes).unwrap();
        for (tag, value) in input.fields() {
            assert_eq!(decoded.get(tag), Some(value), "tag {}", tag);
        }
    }

    #[test]
    fn encode_requires_envelope_tags() {
        let mut no_begin = FixMessage::new("D");
        no_begin.set(tags::CL_ORD_ID, "X");
        assert_eq!(
            codec().encode(&no_begin),
            Err(CodecError::MissingRequiredField(tags::BEGIN_STRING))
        );

        let mut no_type = FixMessage::default();
        no_type.set(tags::BEGIN_STRING, "FIX.4.2");
        assert_eq!(
            codec().encode(&no_type),
            Err(CodecError::MissingRequiredField(tags::MSG_TYPE))
        );
    }

    #[test]
    fn checksum_is_byte_sum_mod_256_zero_padded() {
        let bytes = codec().encode(&sample_order_message()).unwrap();
        let tail = &bytes[bytes.len() - 7..];
        assert_eq!(&tail[..3], b"10=");
        let declared: u32 = std::str::from_utf8(&tail[3..6]).unwrap().parse().unwrap();
        let computed: u32 = bytes[..bytes.len() - 7]
            .iter()
            .map(|&b| u32::from(b))
            .sum::<u32>()
            % 256;
        assert_eq!(declared, computed);
        assert_eq!(tail[6], SOH);
    }

    #[test]
    fn body_length_spans_msg_type_through_checksum_tag() {
        let bytes = codec().encode(&sample_order_message()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let after_9 = text.find("9=").unwrap() + 2;
        let len_end = text[after_9..].find('\x01').unwrap() + after_9;
        let body_len: usize = text[after_9..len_end].parse().unwrap();
        let body_start = len_end + 1;
        let checksum_start = text.rfind("10=").unwrap();
        assert_eq!(body_len, checksum_start - body_start);
    }

    #[test]
    fn body_records_are_in_ascending_tag_order() {
        let bytes = codec().encode(&sample_order_message()).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        let mut tags_seen = Vec::new();
        for record in text.split('\x01').filter(|r| !r.is_empty()).skip(3) {
            let tag: u32 = record.split('=').next().unwrap().parse().unwrap();
            if tag != tags::CHECK_SUM {
                tags_seen.push(tag);
            }
        }
        let mut sorted = tags_seen.clone();
        sorted.sort_unstable();
        assert_eq!(tags_seen, sorted);
    }

    #[test]
    fn decode_rejects_empty_input() {
        assert_eq!(codec().decode(b""), Err(CodecError::EmptyInput));
    }

    #[test]
    fn decode_rejects_non_integer_tag() {
        let raw = b"8=FIX.4.2\x01xx=1\x01";
        assert!(matches!(codec().decode(raw), Err(CodecError::BadTag(_))));
    }

    #[test]
    fn decode_rejects_unknown_version() {
        let mut m = sample_order_message();
        m.set(tags::BEGIN_STRING, "FIX.5.0");
        let lenient = Codec::new(vec!["FIX.5.0".into()], None);
        let bytes = lenient.encode(&m).unwrap();
        assert_eq!(
            codec().decode(&bytes),
            Err(CodecError::BadVersion("FIX.5.0".into()))
        );
    }

    #[test]
    fn decode_rejects_missing_envelope() {
        // No BodyLength, no CheckSum.
        let raw = b"8=FIX.4.2\x0135=D\x01";
        assert!(matches!(
            codec().decode(raw),
            Err(CodecError::BadEnvelope(_))
        ));
    }

    #[test]
    fn decode_rejects_non_decimal_body_length() {
        let raw = b"8=FIX.4.2\x019=abc\x0135=D\x0110=000\x01";
        assert!(matches!(codec().decode(raw), Err(CodecError::BadLength(_))));
    }

    #[test]
    fn strict_rejects_and_lenient_accepts_corrupted_checksum() {
        let bytes = codec().encode(&sample_order_message()).unwrap();
        let mut corrupted = bytes.clone();
        let n = corrupted.len();
        // Flip one checksum digit.
        corrupted[n - 2] = if corrupted[n - 2] == b'0' { b'1' } else { b'0' };
        assert!(matches!(
            codec().decode(&corrupted),
            Err(CodecError::BadChecksum { .. })
        ));
        let msg = codec().decode_lenient(&corrupted).unwrap();
        assert_eq!(msg.msg_type(), Some("D"));
    }

    #[test]
    fn decode_accepts_pipe_delimiter_in_test_mode() {
        let c = Codec::new(vec!["FIX.4.2".into()], Some(b'|'));
        let raw = b"8=FIX.4.2|9=5|35=D|10=000|";
        let msg = c.decode_lenient(raw).unwrap();
        assert_eq!(msg.msg_type(), Some("D"));
        // Without test mode the pipe input has no records at all.
        assert!(codec().decode_lenient(raw).is_err());
    }

    #[test]
    fn extract_frame_handles_partial_and_complete_messages() {
        let c = codec();
        let bytes = c.encode(&sample_order_message()).unwrap();
        for cut in [1, 5, bytes.len() / 2, bytes.len() - 1] {
            assert_eq!(c.extract_frame(&bytes[..cut]).unwrap(), None, "cut {}", cut);
        }
        assert_eq!(c.extract_frame(&bytes).unwrap(), Some(bytes.len()));

        // Two back-to-back messages: first frame length only.
        let mut two = bytes.clone();
        two.extend_from_slice(&bytes);
        assert_eq!(c.extract_frame(&two).unwrap(), Some(bytes.len()));
    }

    #[test]
    fn extract_frame_rejects_garbage_prefix() {
        assert!(codec().extract_frame(b"GET / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn admin_classification() {
        for t in ["0", "1", "2", "4", "5", "A"] {
            assert!(FixMessage::new(t).is_admin(), "{} is admin", t);
        }
        for t in ["D", "F", "8"] {
            assert!(!FixMessage::new(t).is_admin(), "{} is application", t);
        }
    }

    #[test]
    fn sending_time_has_fix_shape() {
        let ts = fix_utc_timestamp();
        assert_eq!(ts.len(), 17);
        assert_eq!(&ts[8..9], "-");
    }
}
