//! Topic-multiplexed JSON wire protocol.
//!
//! Messages are exchanged as `[join_ref, ref, topic, event, payload]`
//! arrays (the framing this implementation always sends) or as
//! `{"join_ref":…, "ref":…, "topic":…, "event":…, "payload":…}` objects
//! (accepted on decode, since some backend versions use it). Binary
//! media frames are never sent as raw WebSocket binary frames — they
//! are base64-encoded and carried as ordinary JSON payloads; see
//! [`FrameEnvelope`].

use base64::Engine as _;
use rc_encode::{CodecTag, Frame};
use serde_json::{json, Value};
use thiserror::Error;

/// Reserved protocol events.
pub mod events {
    pub const PHX_JOIN: &str = "phx_join";
    pub const PHX_REPLY: &str = "phx_reply";
    pub const PHX_HEARTBEAT: &str = "phx_heartbeat";
    pub const SESSION_STOPPED: &str = "session_stopped";
    pub const MEDIA_FRAME: &str = "media_frame";
    pub const MEDIA_METADATA: &str = "media_metadata";
    pub const CONTROL_EVENT: &str = "control_event";
    pub const START_SESSION: &str = "start_session";
    pub const DEVICE_EVENT: &str = "device_event";
}

/// A single topic-protocol message, framing-agnostic.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Message {
    #[must_use]
    pub fn new(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// `status` field of a `phx_reply` payload, if this message is one.
    #[must_use]
    pub fn reply_status(&self) -> Option<ReplyStatus> {
        if self.event != events::PHX_REPLY {
            return None;
        }
        match self.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Some(ReplyStatus::Ok),
            Some("error") => Some(ReplyStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("malformed JSON: {0}")]
    Json(String),
    #[error("message did not match either known framing")]
    UnknownFraming,
    #[error("base64 payload did not decode: {0}")]
    Base64(String),
    #[error("frame envelope `size` did not match the decoded payload length")]
    SizeMismatch,
}

/// Encodes and decodes topic-protocol messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireCodec;

impl WireCodec {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encode a message using array framing: this implementation's only
    /// outbound wire format.
    #[must_use]
    pub fn encode(&self, msg: &Message) -> String {
        let array = json!([
            msg.join_ref,
            msg.msg_ref,
            msg.topic,
            msg.event,
            msg.payload,
        ]);
        array.to_string()
    }

    /// Decode a message from either array or object framing. Unknown
    /// fields on an object-framed message are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::Json`] if `text` is not valid JSON, or
    /// [`WireError::UnknownFraming`] if it parses but matches neither
    /// framing.
    pub fn decode(&self, text: &str) -> Result<Message, WireError> {
        let value: Value = serde_json::from_str(text).map_err(|e| WireError::Json(e.to_string()))?;

        match value {
            Value::Array(ref elems) if elems.len() == 5 => {
                let join_ref = as_opt_string(&elems[0]);
                let msg_ref = as_opt_string(&elems[1]);
                let topic = elems[2].as_str().ok_or(WireError::UnknownFraming)?.to_string();
                let event = elems[3].as_str().ok_or(WireError::UnknownFraming)?.to_string();
                let payload = elems[4].clone();
                Ok(Message::new(join_ref, msg_ref, topic, event, payload))
            }
            Value::Object(ref map) if map.contains_key("topic") && map.contains_key("event") => {
                let join_ref = map.get("join_ref").and_then(as_opt_string_ref);
                let msg_ref = map.get("ref").and_then(as_opt_string_ref);
                let topic = map
                    .get("topic")
                    .and_then(Value::as_str)
                    .ok_or(WireError::UnknownFraming)?
                    .to_string();
                let event = map
                    .get("event")
                    .and_then(Value::as_str)
                    .ok_or(WireError::UnknownFraming)?
                    .to_string();
                let payload = map.get("payload").cloned().unwrap_or(Value::Null);
                Ok(Message::new(join_ref, msg_ref, topic, event, payload))
            }
            _ => Err(WireError::UnknownFraming),
        }
    }
}

fn as_opt_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_opt_string_ref(v: &Value) -> Option<String> {
    as_opt_string(v)
}

/// `"idr"` for a keyframe, `"p"` for a predicted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Idr,
    P,
}

impl FrameType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idr => "idr",
            Self::P => "p",
        }
    }
}

/// The `media_frame` payload shape: base64 data plus framing metadata.
/// Always sent as a JSON text message, never raw WebSocket binary.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEnvelope {
    pub data_b64: String,
    pub frame_type: FrameType,
    pub codec: CodecTag,
    pub timestamp_ms: u64,
    pub size: usize,
}

impl FrameEnvelope {
    #[must_use]
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            data_b64: base64::engine::general_purpose::STANDARD.encode(&frame.payload),
            frame_type: if frame.is_keyframe {
                FrameType::Idr
            } else {
                FrameType::P
            },
            codec: frame.codec,
            timestamp_ms: frame.timestamp_ms,
            size: frame.payload.len(),
        }
    }

    #[must_use]
    pub fn to_payload(&self) -> Value {
        json!({
            "data": self.data_b64,
            "frame_type": self.frame_type.as_str(),
            "codec": self.codec.as_str(),
            "timestamp": self.timestamp_ms,
            "size": self.size,
        })
    }

    /// # Errors
    ///
    /// Returns [`WireError::Base64`] if `data` is not valid base64, or
    /// [`WireError::SizeMismatch`] if the decoded length disagrees with
    /// the declared `size` field.
    pub fn from_payload(payload: &Value) -> Result<Self, WireError> {
        let data_b64 = payload
            .get("data")
            .and_then(Value::as_str)
            .ok_or(WireError::UnknownFraming)?
            .to_string();
        let frame_type = match payload.get("frame_type").and_then(Value::as_str) {
            Some("idr") => FrameType::Idr,
            Some("p") => FrameType::P,
            _ => return Err(WireError::UnknownFraming),
        };
        let codec = match payload.get("codec").and_then(Value::as_str) {
            Some("h264") => CodecTag::H264,
            Some("mjpeg") => CodecTag::Mjpeg,
            _ => return Err(WireError::UnknownFraming),
        };
        let timestamp_ms = payload
            .get("timestamp")
            .and_then(Value::as_u64)
            .ok_or(WireError::UnknownFraming)?;
        let size = payload
            .get("size")
            .and_then(Value::as_u64)
            .ok_or(WireError::UnknownFraming)? as usize;

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&data_b64)
            .map_err(|e| WireError::Base64(e.to_string()))?;
        if decoded.len() != size {
            return Err(WireError::SizeMismatch);
        }

        Ok(Self {
            data_b64,
            frame_type,
            codec,
            timestamp_ms,
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn round_trips_array_framed_message() {
        let codec = WireCodec::new();
        let msg = Message::new(
            Some("1".to_string()),
            Some("1".to_string()),
            "device_rc:AAAA",
            events::PHX_JOIN,
            json!({"token": "secret"}),
        );
        let wire = codec.encode(&msg);
        assert!(wire.starts_with('['));
        let decoded = codec.decode(&wire).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decodes_object_framed_message() {
        let codec = WireCodec::new();
        let text = r#"{"join_ref":"1","ref":"2","topic":"device_rc:AAAA","event":"phx_reply","payload":{"status":"ok"}}"#;
        let msg = codec.decode(text).unwrap();
        assert_eq!(msg.topic, "device_rc:AAAA");
        assert_eq!(msg.event, events::PHX_REPLY);
        assert_eq!(msg.reply_status(), Some(ReplyStatus::Ok));
    }

    #[test]
    fn object_framing_ignores_unknown_fields() {
        let codec = WireCodec::new();
        let text = r#"{"topic":"t","event":"e","payload":{},"join_ref":null,"ref":null,"extra_field":123}"#;
        let msg = codec.decode(text).unwrap();
        assert_eq!(msg.topic, "t");
    }

    #[test]
    fn malformed_json_is_rejected() {
        let codec = WireCodec::new();
        assert!(matches!(codec.decode("not json"), Err(WireError::Json(_))));
    }

    #[test]
    fn s1_first_outbound_message_is_array_framed_join() {
        let codec = WireCodec::new();
        let msg = Message::new(
            Some("1".to_string()),
            Some("1".to_string()),
            "device_rc:AAAA",
            events::PHX_JOIN,
            json!({"token": Value::Null}),
        );
        let wire = codec.encode(&msg);
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert!(parsed.is_array());
        assert_eq!(parsed[3], "phx_join");
        assert_eq!(parsed[2], "device_rc:AAAA");
    }

    #[test]
    fn frame_envelope_round_trips() {
        let frame = Frame {
            payload: Bytes::from_static(b"hello-codec-bytes"),
            is_keyframe: true,
            codec: CodecTag::H264,
            timestamp_ms: 42,
        };
        let envelope = FrameEnvelope::from_frame(&frame);
        let payload = envelope.to_payload();
        let decoded = FrameEnvelope::from_payload(&payload).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Idr);
        assert_eq!(decoded.codec, CodecTag::H264);
        assert_eq!(decoded.timestamp_ms, 42);
        assert_eq!(decoded.size, frame.payload.len());
    }

    #[test]
    fn frame_envelope_data_length_matches_base64_expansion() {
        let frame = Frame {
            payload: Bytes::from_static(b"abcde"), // 5 bytes
            is_keyframe: false,
            codec: CodecTag::Mjpeg,
            timestamp_ms: 0,
        };
        let envelope = FrameEnvelope::from_frame(&frame);
        let expected_len = 4 * envelope.size.div_ceil(3);
        assert_eq!(envelope.data_b64.len(), expected_len);
    }

    #[test]
    fn frame_envelope_rejects_size_mismatch() {
        let mut payload = FrameEnvelope::from_frame(&Frame {
            payload: Bytes::from_static(b"abc"),
            is_keyframe: true,
            codec: CodecTag::H264,
            timestamp_ms: 0,
        })
        .to_payload();
        payload["size"] = json!(999);
        assert_eq!(
            FrameEnvelope::from_payload(&payload),
            Err(WireError::SizeMismatch)
        );
    }
}
