//! Text messages
//!
//! Inbound control messages carry a top-level `message_type`. Outbound
//! messages carry a top-level `type`, matching what the server expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heartbeat request, sent as a bare text frame
pub const PING: &str = "ping";
/// Heartbeat response, sent as a bare text frame
pub const PONG: &str = "pong";

/// Low-frequency control traffic from the server
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Ping,
    Pong,
    FramerateUpdate(FramerateUpdate),
    LogRecord(LogRecord),
    /// Authoritative list of cameras in the active group
    CameraRoster { camera_ids: Vec<String> },
    /// Well-formed JSON with a `message_type` this client does not handle
    Unknown { message_type: String, body: Value },
}

impl ControlMessage {
    /// Build from a JSON object already known to carry `message_type`
    pub fn from_tagged(message_type: &str, body: Value) -> Result<Self, serde_json::Error> {
        Ok(match message_type {
            "framerate_update" => ControlMessage::FramerateUpdate(serde_json::from_value(body)?),
            "log_record" => ControlMessage::LogRecord(serde_json::from_value(body)?),
            "camera_roster" => {
                let roster: CameraRoster = serde_json::from_value(body)?;
                ControlMessage::CameraRoster {
                    camera_ids: roster.camera_ids,
                }
            }
            other => ControlMessage::Unknown {
                message_type: other.to_string(),
                body,
            },
        })
    }
}

/// Framerate summaries, kept as opaque JSON for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramerateUpdate {
    #[serde(default)]
    pub camera_group_id: Option<String>,
    #[serde(default)]
    pub backend_framerate: Option<Value>,
    #[serde(default)]
    pub frontend_framerate: Option<Value>,
}

/// A log line relayed from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    #[serde(default)]
    pub levelname: String,
    #[serde(default, alias = "msg")]
    pub message: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Deserialize)]
struct CameraRoster {
    camera_ids: Vec<String>,
}

/// Messages the client sends over the stream
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Hello { message: String },
    FrameAck { camera_id: String, frame_number: u64 },
    Ping,
    Pong,
    Text(String),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundJson<'a> {
    Hello {
        message: &'a str,
    },
    FrameAck {
        camera_id: &'a str,
        frame_number: u64,
    },
}

impl OutboundMessage {
    pub fn hello(message: impl Into<String>) -> Self {
        OutboundMessage::Hello {
            message: message.into(),
        }
    }

    pub fn frame_ack(camera_id: impl Into<String>, frame_number: u64) -> Self {
        OutboundMessage::FrameAck {
            camera_id: camera_id.into(),
            frame_number,
        }
    }

    /// Render as the text frame that goes on the wire
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        match self {
            OutboundMessage::Hello { message } => {
                serde_json::to_string(&OutboundJson::Hello { message })
            }
            OutboundMessage::FrameAck {
                camera_id,
                frame_number,
            } => serde_json::to_string(&OutboundJson::FrameAck {
                camera_id,
                frame_number: *frame_number,
            }),
            OutboundMessage::Ping => Ok(PING.to_string()),
            OutboundMessage::Pong => Ok(PONG.to_string()),
            OutboundMessage::Text(text) => Ok(text.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_ack_json() {
        let text = OutboundMessage::frame_ack("cam1", 17).to_text().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "frame_ack", "camera_id": "cam1", "frame_number": 17})
        );
    }

    #[test]
    fn test_hello_json() {
        let text = OutboundMessage::hello("camstream client").to_text().unwrap();
        assert!(text.contains(r#""type":"hello""#));
    }

    #[test]
    fn test_heartbeats_are_bare_text() {
        assert_eq!(OutboundMessage::Ping.to_text().unwrap(), "ping");
        assert_eq!(OutboundMessage::Pong.to_text().unwrap(), "pong");
    }

    #[test]
    fn test_log_record_accepts_msg_alias() {
        let msg = ControlMessage::from_tagged(
            "log_record",
            json!({"message_type": "log_record", "levelname": "INFO", "msg": "started", "name": "server"}),
        )
        .unwrap();
        match msg {
            ControlMessage::LogRecord(record) => {
                assert_eq!(record.levelname, "INFO");
                assert_eq!(record.message, "started");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let msg = ControlMessage::from_tagged("whatever", json!({"message_type": "whatever"}))
            .unwrap();
        assert!(matches!(msg, ControlMessage::Unknown { ref message_type, .. } if message_type == "whatever"));
    }

    #[test]
    fn test_roster_requires_ids() {
        assert!(ControlMessage::from_tagged("camera_roster", json!({})).is_err());
    }
}
