//! Wire protocol: binary frame codecs, text messages, decoder

pub mod binary;
pub mod decoder;
pub mod message;
pub mod observation;

pub use binary::{FrameEnvelope, MultiFramePayload, PayloadKind, DEFAULT_MAX_PAYLOAD_BYTES};
pub use decoder::{DecodedMessage, DecoderConfig, FrameDecoder, RawMessage};
pub use message::{ControlMessage, FramerateUpdate, LogRecord, OutboundMessage};
pub use observation::{
    CharucoObservation, MediapipeObservation, Observation, ObservationBundle,
};
