//! Frame protocol decoder
//!
//! Turns one raw transport message into one typed value. Binary messages are
//! dispatched on their leading type tag, text messages on their JSON shape.
//! Every failure is a [`DecodeError`] for that message alone; the caller logs
//! it and keeps reading.

use super::binary::{
    FrameEnvelope, MultiFramePayload, PayloadKind, DEFAULT_MAX_PAYLOAD_BYTES,
    FRAME_ENVELOPE_TYPE, PAYLOAD_HEADER_TYPE,
};
use super::message::{ControlMessage, PING, PONG};
use super::observation::{Observation, ObservationBundle};
use crate::router::clock::{Clock, SystemClock};
use crate::DecodeError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Marker value of the legacy all-in-one JSON frame payload
pub const LEGACY_PAYLOAD_TYPE: &str = "FrontendFramePayload";

/// One message as it came off the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMessage {
    Binary(Vec<u8>),
    Text(String),
}

impl RawMessage {
    pub fn len(&self) -> usize {
        match self {
            RawMessage::Binary(b) => b.len(),
            RawMessage::Text(t) => t.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A successfully decoded message
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    /// Single-camera envelope
    Frame(FrameEnvelope),
    /// All cameras for one multi-frame number
    Frames(MultiFramePayload),
    /// Detector output keyed by camera id
    Observations(ObservationBundle),
    Control(ControlMessage),
}

/// Decoder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Upper bound for a single frame payload
    pub max_payload_bytes: usize,
    /// Accept the legacy base64 JSON frame payload
    pub accept_legacy_json_frames: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            accept_legacy_json_frames: false,
        }
    }
}

#[derive(Deserialize)]
struct LegacyFramePayload {
    #[serde(default)]
    multi_frame_number: u64,
    jpeg_images: BTreeMap<String, Option<String>>,
}

/// Stateless message decoder
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    config: DecoderConfig,
    clock: Arc<dyn Clock>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DecoderConfig::default())
    }
}

impl FrameDecoder {
    pub fn new(config: DecoderConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Use `clock` to stamp frames whose wire format has no capture time
    pub fn with_clock(config: DecoderConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn decode(&self, raw: &RawMessage) -> Result<DecodedMessage, DecodeError> {
        match raw {
            RawMessage::Binary(bytes) => self.decode_binary(bytes),
            RawMessage::Text(text) => self.decode_text(text),
        }
    }

    pub fn decode_binary(&self, bytes: &[u8]) -> Result<DecodedMessage, DecodeError> {
        let tag = *bytes.first().ok_or(DecodeError::Empty)?;

        match tag {
            FRAME_ENVELOPE_TYPE => {
                let frame = FrameEnvelope::decode(bytes, self.config.max_payload_bytes)?;
                trace!(
                    "Decoded frame {} from {} ({} bytes)",
                    frame.frame_number,
                    frame.camera_id,
                    frame.payload.len()
                );
                Ok(DecodedMessage::Frame(frame))
            }
            PAYLOAD_HEADER_TYPE => {
                let bundle = MultiFramePayload::decode(
                    bytes,
                    self.config.max_payload_bytes,
                    self.clock.now_ns(),
                )?;
                trace!(
                    "Decoded bundle {} with {} cameras",
                    bundle.frame_number,
                    bundle.frames.len()
                );
                Ok(DecodedMessage::Frames(bundle))
            }
            other => Err(DecodeError::UnknownTypeTag(other)),
        }
    }

    pub fn decode_text(&self, text: &str) -> Result<DecodedMessage, DecodeError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(DecodeError::Empty);
        }
        if trimmed == PING {
            return Ok(DecodedMessage::Control(ControlMessage::Ping));
        }
        if trimmed == PONG {
            return Ok(DecodedMessage::Control(ControlMessage::Pong));
        }

        let value: Value = serde_json::from_str(trimmed)?;
        let Value::Object(object) = value else {
            return Err(DecodeError::UnknownShape(
                "top-level JSON value is not an object".to_string(),
            ));
        };

        if let Some(message_type) = object.get("message_type").and_then(Value::as_str) {
            let message_type = message_type.to_string();
            let control = ControlMessage::from_tagged(&message_type, Value::Object(object))?;
            return Ok(DecodedMessage::Control(control));
        }

        if object.get("type").and_then(Value::as_str) == Some(LEGACY_PAYLOAD_TYPE) {
            return self.decode_legacy(object);
        }

        self.decode_observations(object)
    }

    fn decode_observations(
        &self,
        object: Map<String, Value>,
    ) -> Result<DecodedMessage, DecodeError> {
        if object.is_empty() {
            return Err(DecodeError::UnknownShape("empty JSON object".to_string()));
        }
        let all_tagged = object.values().all(|v| {
            v.get("message_type").and_then(Value::as_str).is_some()
        });
        if !all_tagged {
            return Err(DecodeError::UnknownShape(
                "JSON object is neither a control message nor an observation bundle".to_string(),
            ));
        }

        // A camera whose observation can't be parsed (for example a detector
        // this client has no model for) is dropped on its own.
        let mut bundle = ObservationBundle::new();
        let mut first_error = None;
        for (key, value) in object {
            match serde_json::from_value::<Observation>(value) {
                Ok(observation) => {
                    if key != observation.camera_id() {
                        warn!(
                            "Observation keyed by camera {} claims camera {}",
                            key,
                            observation.camera_id()
                        );
                    }
                    bundle.insert(key, observation);
                }
                Err(e) => {
                    warn!("Dropping observation for camera {}: {}", key, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if bundle.is_empty() => Err(e.into()),
            _ => Ok(DecodedMessage::Observations(bundle)),
        }
    }

    fn decode_legacy(&self, object: Map<String, Value>) -> Result<DecodedMessage, DecodeError> {
        if !self.config.accept_legacy_json_frames {
            return Err(DecodeError::LegacyFormatDisabled);
        }

        let payload: LegacyFramePayload = serde_json::from_value(Value::Object(object))?;
        let received_at_ns = self.clock.now_ns();
        let mut frames = Vec::with_capacity(payload.jpeg_images.len());

        for (camera_id, image) in payload.jpeg_images {
            let Some(image) = image else {
                continue;
            };
            let encoded = image
                .split_once("base64,")
                .map(|(_, data)| data)
                .unwrap_or(image.as_str());
            let bytes = STANDARD.decode(encoded).map_err(|e| DecodeError::Base64 {
                camera_id: camera_id.clone(),
                reason: e.to_string(),
            })?;
            if bytes.len() > self.config.max_payload_bytes {
                return Err(DecodeError::PayloadTooLarge {
                    size: bytes.len(),
                    max: self.config.max_payload_bytes,
                });
            }

            frames.push(FrameEnvelope {
                camera_id,
                frame_number: payload.multi_frame_number,
                capture_timestamp_ns: received_at_ns,
                payload_kind: PayloadKind::Jpeg,
                image_width: 0,
                image_height: 0,
                payload: bytes,
            });
        }

        Ok(DecodedMessage::Frames(MultiFramePayload {
            frame_number: payload.multi_frame_number,
            frames,
        }))
    }
}
