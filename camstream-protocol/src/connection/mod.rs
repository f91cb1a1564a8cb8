//! Streaming connection to the capture server
//!
//! [`ConnectionManager`] opens the WebSocket, keeps it alive and reconnects
//! with exponential backoff. Everything it observes is published as a
//! [`ConnectionEvent`].

pub mod events;
pub mod manager;

pub use events::{ConnectionEvent, ConnectionState};
pub use manager::{
    ConnectionConfig, ConnectionHandle, ConnectionManager, ConnectionStats, KEEP_ALIVE_INTERVAL,
};
