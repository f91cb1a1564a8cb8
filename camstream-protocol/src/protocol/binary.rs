//! Binary frame codecs
//!
//! Two binary shapes arrive on the stream, told apart by the first byte:
//!
//! ```text
//! Single-camera envelope (type 3), 56 byte header:
//!   type(1) | kind(1) | pad(6) | frame_number u64 | capture_ts_ns u64 |
//!   camera_id [16] | width u32 | height u32 | payload_len u32 | pad(4) | payload
//!
//! Multi-camera bundle:
//!   header  (type 0, 24B): type(1) | pad(7) | frame_number i64 | cameras i32 | pad(4)
//!   frame×N (type 1, 56B): type(1) | pad(7) | frame_number i64 | camera_id [16] |
//!                          camera_index i32 | width i32 | height i32 |
//!                          channels i32 | jpeg_len i32 | pad(4) | jpeg
//!   footer  (type 2, 24B): same layout as the header
//! ```
//!
//! All integers are little-endian. Camera ids are NUL-padded ASCII.

use crate::DecodeError;
use tracing::{trace, warn};

pub const PAYLOAD_HEADER_TYPE: u8 = 0;
pub const FRAME_HEADER_TYPE: u8 = 1;
pub const PAYLOAD_FOOTER_TYPE: u8 = 2;
pub const FRAME_ENVELOPE_TYPE: u8 = 3;

pub const PAYLOAD_HEADER_SIZE: usize = 24;
pub const FRAME_HEADER_SIZE: usize = 56;
pub const PAYLOAD_FOOTER_SIZE: usize = 24;
pub const FRAME_ENVELOPE_HEADER_SIZE: usize = 56;

/// Width of the fixed camera id field
pub const CAMERA_ID_LEN: usize = 16;

/// Default upper bound for a single frame payload (32 MiB)
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Encoding of the bytes carried by a [`FrameEnvelope`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Jpeg,
    Raw,
}

impl PayloadKind {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(PayloadKind::Jpeg),
            1 => Ok(PayloadKind::Raw),
            other => Err(DecodeError::UnknownPayloadKind(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PayloadKind::Jpeg => 0,
            PayloadKind::Raw => 1,
        }
    }
}

/// One camera's single frame payload plus identifying metadata
///
/// Immutable once decoded. The router hands subscribers an `Arc` to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEnvelope {
    pub camera_id: String,
    pub frame_number: u64,
    pub capture_timestamp_ns: u64,
    pub payload_kind: PayloadKind,
    pub image_width: u32,
    pub image_height: u32,
    pub payload: Vec<u8>,
}

impl FrameEnvelope {
    /// Create a JPEG envelope with unknown image dimensions
    pub fn jpeg(
        camera_id: impl Into<String>,
        frame_number: u64,
        capture_timestamp_ns: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            frame_number,
            capture_timestamp_ns,
            payload_kind: PayloadKind::Jpeg,
            image_width: 0,
            image_height: 0,
            payload,
        }
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        self.image_width = width;
        self.image_height = height;
        self
    }

    /// Serialize to the single-camera wire layout
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        let camera_id = encode_camera_id(&self.camera_id)?;
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| DecodeError::InvalidPayloadLength(self.payload.len() as i64))?;

        let mut bytes = Vec::with_capacity(FRAME_ENVELOPE_HEADER_SIZE + self.payload.len());
        bytes.push(FRAME_ENVELOPE_TYPE);
        bytes.push(self.payload_kind.as_u8());
        bytes.extend_from_slice(&[0u8; 6]);
        bytes.extend_from_slice(&self.frame_number.to_le_bytes());
        bytes.extend_from_slice(&self.capture_timestamp_ns.to_le_bytes());
        bytes.extend_from_slice(&camera_id);
        bytes.extend_from_slice(&self.image_width.to_le_bytes());
        bytes.extend_from_slice(&self.image_height.to_le_bytes());
        bytes.extend_from_slice(&payload_len.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 4]);
        bytes.extend_from_slice(&self.payload);

        Ok(bytes)
    }

    /// Parse the single-camera wire layout
    pub fn decode(bytes: &[u8], max_payload_bytes: usize) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);

        reader.expect_tag(FRAME_ENVELOPE_TYPE)?;
        let payload_kind = PayloadKind::from_u8(reader.u8()?)?;
        reader.skip(6)?;
        let frame_number = reader.u64()?;
        let capture_timestamp_ns = reader.u64()?;
        let camera_id = reader.camera_id()?;
        let image_width = reader.u32()?;
        let image_height = reader.u32()?;
        let payload_len = reader.u32()? as usize;
        reader.skip(4)?;

        if payload_len > max_payload_bytes {
            return Err(DecodeError::PayloadTooLarge {
                size: payload_len,
                max: max_payload_bytes,
            });
        }
        let payload = reader.take(payload_len)?.to_vec();

        if reader.remaining() > 0 {
            trace!(
                "Ignoring {} trailing bytes after frame {} from {}",
                reader.remaining(),
                frame_number,
                camera_id
            );
        }

        Ok(Self {
            camera_id,
            frame_number,
            capture_timestamp_ns,
            payload_kind,
            image_width,
            image_height,
            payload,
        })
    }
}

/// All cameras' frames for one multi-frame number
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFramePayload {
    pub frame_number: u64,
    pub frames: Vec<FrameEnvelope>,
}

impl MultiFramePayload {
    /// Serialize to the bundle wire layout, footer included
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        let frame_number = i64::try_from(self.frame_number)
            .map_err(|_| DecodeError::InvalidFrameNumber(i64::MAX))?;
        let cameras = i32::try_from(self.frames.len())
            .map_err(|_| DecodeError::InvalidCameraCount(i32::MAX))?;

        let mut bytes = Vec::new();
        write_bundle_marker(&mut bytes, PAYLOAD_HEADER_TYPE, frame_number, cameras);

        for (index, frame) in self.frames.iter().enumerate() {
            let jpeg_len = i32::try_from(frame.payload.len())
                .map_err(|_| DecodeError::InvalidPayloadLength(frame.payload.len() as i64))?;

            bytes.push(FRAME_HEADER_TYPE);
            bytes.extend_from_slice(&[0u8; 7]);
            bytes.extend_from_slice(&(frame.frame_number as i64).to_le_bytes());
            bytes.extend_from_slice(&encode_camera_id(&frame.camera_id)?);
            bytes.extend_from_slice(&(index as i32).to_le_bytes());
            bytes.extend_from_slice(&(frame.image_width as i32).to_le_bytes());
            bytes.extend_from_slice(&(frame.image_height as i32).to_le_bytes());
            bytes.extend_from_slice(&3i32.to_le_bytes());
            bytes.extend_from_slice(&jpeg_len.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 4]);
            bytes.extend_from_slice(&frame.payload);
        }

        write_bundle_marker(&mut bytes, PAYLOAD_FOOTER_TYPE, frame_number, cameras);
        Ok(bytes)
    }

    /// Parse a bundle
    ///
    /// The bundle format carries no capture clock, so every frame gets
    /// `received_at_ns` as its capture timestamp. A missing footer is
    /// tolerated; a footer that disagrees with the header is logged.
    pub fn decode(
        bytes: &[u8],
        max_payload_bytes: usize,
        received_at_ns: u64,
    ) -> Result<Self, DecodeError> {
        let mut reader = ByteReader::new(bytes);

        reader.expect_tag(PAYLOAD_HEADER_TYPE)?;
        reader.skip(7)?;
        let frame_number = reader.i64()?;
        let cameras = reader.i32()?;
        reader.skip(4)?;

        if frame_number < 0 {
            return Err(DecodeError::InvalidFrameNumber(frame_number));
        }
        // Each camera needs at least a header, so the count is bounded by
        // the bytes actually present.
        if cameras <= 0 || cameras as usize > reader.remaining() / FRAME_HEADER_SIZE {
            return Err(DecodeError::InvalidCameraCount(cameras));
        }

        let mut frames = Vec::with_capacity(cameras as usize);
        for _ in 0..cameras {
            reader.expect_tag(FRAME_HEADER_TYPE)?;
            reader.skip(7)?;
            let camera_frame_number = reader.i64()?;
            let camera_id = reader.camera_id()?;
            let camera_index = reader.i32()?;
            let width = reader.i32()?;
            let height = reader.i32()?;
            let _channels = reader.i32()?;
            let jpeg_len = reader.i32()?;
            reader.skip(4)?;

            if camera_frame_number < 0 {
                return Err(DecodeError::InvalidFrameNumber(camera_frame_number));
            }
            if jpeg_len <= 0 {
                return Err(DecodeError::InvalidPayloadLength(jpeg_len as i64));
            }
            let jpeg_len = jpeg_len as usize;
            if jpeg_len > max_payload_bytes {
                return Err(DecodeError::PayloadTooLarge {
                    size: jpeg_len,
                    max: max_payload_bytes,
                });
            }
            let payload = reader.take(jpeg_len)?.to_vec();

            trace!(
                "Bundle {}: camera {} (index {}) {} bytes",
                frame_number,
                camera_id,
                camera_index,
                jpeg_len
            );

            frames.push(FrameEnvelope {
                camera_id,
                frame_number: camera_frame_number as u64,
                capture_timestamp_ns: received_at_ns,
                payload_kind: PayloadKind::Jpeg,
                image_width: width.max(0) as u32,
                image_height: height.max(0) as u32,
                payload,
            });
        }

        if reader.remaining() >= PAYLOAD_FOOTER_SIZE {
            reader.expect_tag(PAYLOAD_FOOTER_TYPE)?;
            reader.skip(7)?;
            let footer_frame = reader.i64()?;
            let footer_cameras = reader.i32()?;
            if footer_frame != frame_number || footer_cameras != cameras {
                warn!(
                    "Bundle footer mismatch: header frame {} cameras {}, footer frame {} cameras {}",
                    frame_number, cameras, footer_frame, footer_cameras
                );
            }
        } else {
            trace!("Bundle {} arrived without footer", frame_number);
        }

        Ok(Self {
            frame_number: frame_number as u64,
            frames,
        })
    }
}

fn write_bundle_marker(bytes: &mut Vec<u8>, tag: u8, frame_number: i64, cameras: i32) {
    bytes.push(tag);
    bytes.extend_from_slice(&[0u8; 7]);
    bytes.extend_from_slice(&frame_number.to_le_bytes());
    bytes.extend_from_slice(&cameras.to_le_bytes());
    bytes.extend_from_slice(&[0u8; 4]);
}

fn encode_camera_id(camera_id: &str) -> Result<[u8; CAMERA_ID_LEN], DecodeError> {
    if camera_id.is_empty() || camera_id.len() > CAMERA_ID_LEN || !camera_id.is_ascii() {
        return Err(DecodeError::InvalidCameraId(camera_id.to_string()));
    }
    let mut field = [0u8; CAMERA_ID_LEN];
    field[..camera_id.len()].copy_from_slice(camera_id.as_bytes());
    Ok(field)
}

/// Bounds-checked little-endian cursor over a message buffer
struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::Truncated {
                offset: self.offset,
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn skip(&mut self, len: usize) -> Result<(), DecodeError> {
        self.take(len).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), DecodeError> {
        let offset = self.offset;
        let found = self.u8()?;
        if found != expected {
            return Err(DecodeError::UnexpectedTypeTag {
                offset,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn camera_id(&mut self) -> Result<String, DecodeError> {
        let raw: [u8; CAMERA_ID_LEN] = self.array()?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(CAMERA_ID_LEN);
        let id = String::from_utf8_lossy(&raw[..end]).into_owned();
        if id.is_empty() || !raw[..end].is_ascii() {
            return Err(DecodeError::InvalidCameraId(id));
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> FrameEnvelope {
        FrameEnvelope::jpeg("cam1", 42, 1_000_000, vec![0xFF, 0xD8, 0xFF, 0xD9])
            .with_dimensions(640, 480)
    }

    #[test]
    fn test_envelope_header_size() {
        let bytes = sample_envelope().encode().unwrap();
        assert_eq!(bytes.len(), FRAME_ENVELOPE_HEADER_SIZE + 4);
        assert_eq!(bytes[0], FRAME_ENVELOPE_TYPE);
        assert_eq!(&bytes[24..28], b"cam1");
        assert_eq!(bytes[28], 0);
    }

    #[test]
    fn test_envelope_decode() {
        let bytes = sample_envelope().encode().unwrap();
        let decoded = FrameEnvelope::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES).unwrap();
        assert_eq!(decoded, sample_envelope());
    }

    #[test]
    fn test_envelope_truncated_payload() {
        let bytes = sample_envelope().encode().unwrap();
        let err = FrameEnvelope::decode(&bytes[..bytes.len() - 1], DEFAULT_MAX_PAYLOAD_BYTES)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { offset: 56, needed: 4, available: 3 }));
    }

    #[test]
    fn test_envelope_payload_limit() {
        let bytes = sample_envelope().encode().unwrap();
        let err = FrameEnvelope::decode(&bytes, 2).unwrap_err();
        assert_eq!(err, DecodeError::PayloadTooLarge { size: 4, max: 2 });
    }

    #[test]
    fn test_envelope_unknown_kind() {
        let mut bytes = sample_envelope().encode().unwrap();
        bytes[1] = 7;
        let err = FrameEnvelope::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES).unwrap_err();
        assert_eq!(err, DecodeError::UnknownPayloadKind(7));
    }

    #[test]
    fn test_camera_id_validation() {
        let long = FrameEnvelope::jpeg("a-very-long-camera-name", 1, 0, vec![1]);
        assert!(matches!(long.encode(), Err(DecodeError::InvalidCameraId(_))));

        let mut bytes = sample_envelope().encode().unwrap();
        bytes[24..40].fill(0);
        assert!(matches!(
            FrameEnvelope::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES),
            Err(DecodeError::InvalidCameraId(_))
        ));
    }

    #[test]
    fn test_bundle_decode_uses_receive_time() {
        let bundle = MultiFramePayload {
            frame_number: 7,
            frames: vec![
                FrameEnvelope::jpeg("0", 7, 0, vec![1, 2, 3]).with_dimensions(320, 240),
                FrameEnvelope::jpeg("1", 7, 0, vec![4, 5]).with_dimensions(320, 240),
            ],
        };
        let bytes = bundle.encode().unwrap();
        assert_eq!(
            bytes.len(),
            PAYLOAD_HEADER_SIZE + 2 * FRAME_HEADER_SIZE + 5 + PAYLOAD_FOOTER_SIZE
        );

        let decoded = MultiFramePayload::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES, 99).unwrap();
        assert_eq!(decoded.frame_number, 7);
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.frames[1].camera_id, "1");
        assert_eq!(decoded.frames[1].payload, vec![4, 5]);
        assert!(decoded.frames.iter().all(|f| f.capture_timestamp_ns == 99));
    }

    #[test]
    fn test_bundle_without_footer() {
        let bundle = MultiFramePayload {
            frame_number: 3,
            frames: vec![FrameEnvelope::jpeg("0", 3, 0, vec![9])],
        };
        let bytes = bundle.encode().unwrap();
        let without_footer = &bytes[..bytes.len() - PAYLOAD_FOOTER_SIZE];

        let decoded =
            MultiFramePayload::decode(without_footer, DEFAULT_MAX_PAYLOAD_BYTES, 0).unwrap();
        assert_eq!(decoded.frames.len(), 1);
    }

    #[test]
    fn test_bundle_rejects_zero_cameras() {
        let mut bytes = Vec::new();
        write_bundle_marker(&mut bytes, PAYLOAD_HEADER_TYPE, 1, 0);
        assert_eq!(
            MultiFramePayload::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES, 0),
            Err(DecodeError::InvalidCameraCount(0))
        );
    }

    #[test]
    fn test_bundle_camera_count_exceeding_buffer() {
        let mut bytes = Vec::new();
        write_bundle_marker(&mut bytes, PAYLOAD_HEADER_TYPE, 1, i32::MAX);
        assert_eq!(
            MultiFramePayload::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES, 0),
            Err(DecodeError::InvalidCameraCount(i32::MAX))
        );

        let bundle = MultiFramePayload {
            frame_number: 1,
            frames: vec![FrameEnvelope::jpeg("0", 1, 0, vec![1, 2, 3, 4])],
        };
        let mut bytes = bundle.encode().unwrap();
        bytes[16..20].copy_from_slice(&3i32.to_le_bytes());
        assert_eq!(
            MultiFramePayload::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES, 0),
            Err(DecodeError::InvalidCameraCount(3))
        );
    }

    #[test]
    fn test_bundle_jpeg_overrun() {
        let bundle = MultiFramePayload {
            frame_number: 1,
            frames: vec![FrameEnvelope::jpeg("0", 1, 0, vec![1, 2, 3, 4])],
        };
        let mut bytes = bundle.encode().unwrap();
        // jpeg_len sits at offset 24 + 48 in the first frame header
        bytes[72..76].copy_from_slice(&1000i32.to_le_bytes());

        assert!(matches!(
            MultiFramePayload::decode(&bytes, DEFAULT_MAX_PAYLOAD_BYTES, 0),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
