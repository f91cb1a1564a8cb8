//! Camstream Protocol
//!
//! Client side of a multi-camera frame streaming protocol: a resilient
//! WebSocket connection, binary and JSON frame decoding, a latest-value
//! frame router with per-camera liveness, and an overlay compiler that turns
//! landmark observations into drawable primitives.

pub mod connection;
pub mod control;
pub mod overlay;
pub mod pipeline;
pub mod points;
pub mod protocol;
pub mod recovery;
pub mod router;

mod error;
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStats,
};
pub use control::{ControlClient, ServerEndpoints};
pub use error::{DecodeError, Result, StreamError};
pub use overlay::{DrawablePrimitive, OverlayCompiler, OverlayTopology};
pub use pipeline::{FramePipeline, PipelineStats};
pub use points::{Point, PointObservation};
pub use protocol::{FrameDecoder, FrameEnvelope, OutboundMessage, RawMessage};
pub use recovery::ReconnectionStrategy;
pub use router::{CameraMetadata, FrameRouter, FrameUpdate, RouterConfig, Subscription};

/// Version of the binary frame envelope this crate reads and writes
pub const WIRE_VERSION: u32 = 1;
