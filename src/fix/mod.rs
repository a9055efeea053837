//! FIX tag-value protocol layer: the wire codec and the session state
//! machine.
//!
//! [`codec`] handles bytes (envelope, checksum, framing); [`session`]
//! handles the conversation (logon, sequence numbers, heartbeats, resend).

pub mod codec;
pub mod session;

pub use codec::{fix_utc_timestamp, msg_type, tags, Codec, FixMessage, SOH};
pub use session::{FixSession, SessionConfig, SessionState};
