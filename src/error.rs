//! Error taxonomy, one enum per subsystem.
//!
//! Codec and session failures stay local to the connection that produced
//! them. Validation and risk failures never surface here; they become
//! rejected execution reports addressed to the originator.

use thiserror::Error;

/// Wire codec failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty input")]
    EmptyInput,
    #[error("bad tag: {0:?}")]
    BadTag(String),
    #[error("bad envelope: {0}")]
    BadEnvelope(&'static str),
    #[error("unsupported BeginString: {0:?}")]
    BadVersion(String),
    #[error("bad BodyLength: {0:?}")]
    BadLength(String),
    #[error("checksum mismatch: declared {declared:?}, computed {computed:03}")]
    BadChecksum { declared: String, computed: u32 },
    #[error("missing required field: tag {0}")]
    MissingRequiredField(u32),
}

/// Session-protocol failures. Most are logged and absorbed; the ones
/// returned to the owning reader mean the connection should be closed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("cannot {action} in state {state}")]
    BadState { action: &'static str, state: &'static str },
    #[error("application message received while not logged in")]
    NotLoggedIn,
    #[error("heartbeat timeout: no inbound message for {silence_ms} ms (interval {interval_ms} ms)")]
    HeartbeatTimeout { silence_ms: u64, interval_ms: u64 },
    #[error("{consecutive} consecutive codec failures, last: {last}")]
    CodecFailures { consecutive: u32, last: CodecError },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Matching-engine failures visible to callers of the submit API.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("engine is not running")]
    NotRunning,
    #[error("request queue closed")]
    QueueClosed,
}

/// Gateway translation failures. These are mapped to rejected execution
/// reports for the client; raw details never leak into reject text.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unsupported message type {0:?}")]
    Unsupported(String),
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_render_their_kind() {
        assert_eq!(CodecError::EmptyInput.to_string(), "empty input");
        let e = CodecError::BadChecksum {
            declared: "017".into(),
            computed: 18,
        };
        assert!(e.to_string().contains("017"));
        assert!(e.to_string().contains("018"));
    }

    #[test]
    fn session_error_wraps_codec_error() {
        let e: SessionError = CodecError::EmptyInput.into();
        assert_eq!(e, SessionError::Codec(CodecError::EmptyInput));
    }
}
