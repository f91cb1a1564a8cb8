//! Connection Events
//!
//! Events emitted by the connection manager for stream lifecycle changes and
//! inbound traffic.

use crate::protocol::RawMessage;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Lifecycle of the streaming connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// Connection event types
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The state machine moved
    StateChanged {
        /// New state
        state: ConnectionState,
    },

    /// The stream opened
    Connected {
        /// Endpoint URL
        url: String,
    },

    /// The stream closed, cleanly or not
    Disconnected {
        /// Reason for disconnection (if known)
        reason: Option<String>,
        /// Whether a reconnect will be scheduled
        will_reconnect: bool,
    },

    /// A message arrived
    MessageReceived(RawMessage),

    /// A transport error occurred; a `Disconnected` event follows
    ConnectionError {
        /// Error message
        message: String,
    },

    /// A reconnect timer was armed
    ReconnectScheduled {
        /// Consecutive attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },

    /// The attempt limit was reached; no further reconnects
    ReconnectGaveUp {
        /// Attempts made
        attempts: u32,
    },
}
