//! Error handling for the camstream client
//!
//! Two error types live here:
//!
//! - [`StreamError`] for everything that crosses a public API boundary
//!   (transport, HTTP control calls, configuration, invalid state).
//! - [`DecodeError`] for a single malformed inbound message. Decode errors
//!   are contained by the pipeline: they are logged and the message is
//!   dropped, the stream keeps going.
//!
//! A referenced overlay point that is missing for a frame is not an error at
//! all; see [`crate::overlay::ResolutionGap`].
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! Socket-level failures. These always funnel into the connection manager's
//! single path to `Disconnected` and, unless the user asked for the close,
//! into a scheduled reconnect.
//!
//! ### Protocol Violations
//! Well-formed messages that reference state the client does not have, for
//! example an observation for a camera that never produced a frame. The
//! router degrades to ignoring the observation.
//!
//! ### HTTP Errors
//! Failures of the companion control API (`detect`, `record/start`, ...).
//!
//! ```rust
//! use camstream_protocol::{Result, StreamError};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse()
//!         .map_err(|_| StreamError::Configuration(format!("invalid port: {}", raw)))
//! }
//!
//! assert!(parse_port("8006").is_ok());
//! assert!(matches!(parse_port("x"), Err(StreamError::Configuration(_))));
//! ```

use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors that can occur while talking to a capture server
#[derive(Error, Debug)]
pub enum StreamError {
    /// I/O error (sockets, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol or socket error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP client error from the companion control API
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Control endpoint answered with a non-success status
    #[error("HTTP {status} from {endpoint}: {body}")]
    HttpStatus {
        /// Endpoint URL
        endpoint: String,
        /// Status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Transport-level failure that is not a raw socket error
    #[error("Transport error: {0}")]
    Transport(String),

    /// A single inbound message could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Message was well formed but inconsistent with known state
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Operation needs an open connection
    #[error("Not connected")]
    NotConnected,

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StreamError {
    /// Whether the failure is worth retrying by reconnecting
    pub fn is_recoverable(&self) -> bool {
        match self {
            StreamError::Io(_)
            | StreamError::WebSocket(_)
            | StreamError::Transport(_)
            | StreamError::Timeout(_)
            | StreamError::NotConnected => true,
            StreamError::Http(e) => e.is_connect() || e.is_timeout(),
            StreamError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether an operator must change something before retrying helps
    pub fn requires_user_action(&self) -> bool {
        matches!(self, StreamError::Configuration(_))
    }

    /// Human readable message for status lines and CLI output
    pub fn user_message(&self) -> String {
        match self {
            StreamError::NotConnected => {
                "Not connected to the capture server. Is it running?".to_string()
            }
            StreamError::Transport(msg) | StreamError::Timeout(msg) => {
                format!("{}. Connection may be unstable.", msg)
            }
            StreamError::WebSocket(e) => format!("Stream connection error: {}.", e),
            StreamError::Http(e) if e.is_connect() => {
                "Cannot reach the capture server's control API.".to_string()
            }
            StreamError::HttpStatus {
                endpoint, status, ..
            } => format!("Server rejected request to {} ({}).", endpoint, status),
            StreamError::Configuration(msg) => {
                format!("Configuration error: {}. Check your settings.", msg)
            }
            other => other.to_string(),
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        StreamError::InvalidState(msg.into())
    }

    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        StreamError::ProtocolViolation(msg.into())
    }
}

/// A single inbound message that could not be turned into a typed value
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("buffer too short: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("empty message")]
    Empty,

    #[error("unknown binary message type tag {0}")]
    UnknownTypeTag(u8),

    #[error("expected type tag {expected} at offset {offset}, found {found}")]
    UnexpectedTypeTag { offset: usize, expected: u8, found: u8 },

    #[error("invalid camera count {0}")]
    InvalidCameraCount(i32),

    #[error("invalid frame number {0}")]
    InvalidFrameNumber(i64),

    #[error("invalid payload length {0}")]
    InvalidPayloadLength(i64),

    #[error("payload of {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown payload kind {0}")]
    UnknownPayloadKind(u8),

    #[error("invalid camera id: {0}")]
    InvalidCameraId(String),

    #[error("malformed JSON: {0}")]
    Json(String),

    #[error("unrecognised message shape: {0}")]
    UnknownShape(String),

    #[error("invalid base64 image for camera {camera_id}: {reason}")]
    Base64 { camera_id: String, reason: String },

    #[error("legacy JSON frame payloads are disabled")]
    LegacyFormatDisabled,
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self {
        DecodeError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StreamError::NotConnected;
        assert_eq!(error.to_string(), "Not connected");

        let error = StreamError::ProtocolViolation("unknown camera cam9".to_string());
        assert_eq!(error.to_string(), "Protocol violation: unknown camera cam9");

        let error = StreamError::HttpStatus {
            endpoint: "http://localhost:8006/health".to_string(),
            status: 503,
            body: "down".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "HTTP 503 from http://localhost:8006/health: down"
        );
    }

    #[test]
    fn test_decode_error_wraps() {
        let error: StreamError = DecodeError::UnknownTypeTag(9).into();
        assert!(matches!(error, StreamError::Decode(DecodeError::UnknownTypeTag(9))));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(StreamError::Transport("reset".to_string()).is_recoverable());
        assert!(StreamError::Timeout("open".to_string()).is_recoverable());
        assert!(StreamError::NotConnected.is_recoverable());
        assert!(!StreamError::Configuration("bad".to_string()).is_recoverable());
        assert!(StreamError::Configuration("bad".to_string()).requires_user_action());

        let server_error = StreamError::HttpStatus {
            endpoint: "x".to_string(),
            status: 502,
            body: String::new(),
        };
        assert!(server_error.is_recoverable());

        let client_error = StreamError::HttpStatus {
            endpoint: "x".to_string(),
            status: 422,
            body: String::new(),
        };
        assert!(!client_error.is_recoverable());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let decode: DecodeError = json_error.into();
        assert!(matches!(decode, DecodeError::Json(_)));
    }
}
