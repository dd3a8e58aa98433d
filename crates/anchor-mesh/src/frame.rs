//! Frames and wire codecs.
//!
//! The mesh currently speaks JSON on the wire with a binary framing
//! implemented behind the same trait: `{type u8, lane u16, flags u16,
//! length u32, payload}` big-endian, the metadata carried inside the
//! payload's leading JSON header block. Framing is pluggable per link so
//! the wire format can change without touching lanes or links.

use anchor::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Control frames never exceed this size on lane 0.
pub const CONTROL_FRAME_CAP: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    #[default]
    Data,
    Control,
    Heartbeat,
    Ack,
    WindowUpdate,
    Reset,
}

impl FrameType {
    pub(crate) fn wire_tag(self) -> u8 {
        match self {
            FrameType::Data => 0,
            FrameType::Control => 1,
            FrameType::Heartbeat => 2,
            FrameType::Ack => 3,
            FrameType::WindowUpdate => 4,
            FrameType::Reset => 5,
        }
    }

    pub(crate) fn from_wire_tag(tag: u8) -> Result<FrameType> {
        Ok(match tag {
            0 => FrameType::Data,
            1 => FrameType::Control,
            2 => FrameType::Heartbeat,
            3 => FrameType::Ack,
            4 => FrameType::WindowUpdate,
            5 => FrameType::Reset,
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "unknown frame type tag {other}"
                )))
            }
        })
    }
}

/// Routing annotations carried end-to-end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingInfo {
    #[serde(default)]
    pub path_id: String,
    #[serde(default)]
    pub hop_count: u32,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub priority: u8,
}

/// The unit of mesh transport on a lane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub lane: u16,
    /// Stream the frame belongs to, for multi-frame data.
    #[serde(default)]
    pub stream_id: u64,
    pub sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_sequence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_total: Option<u32>,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Unix milliseconds at send.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    #[serde(default)]
    pub routing: RoutingInfo,
}

mod payload_base64 {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

impl Frame {
    pub fn data(lane: u16, stream_id: u64, sequence: u64, payload: Vec<u8>) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            lane,
            stream_id,
            sequence,
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Frame::default()
        }
    }

    pub fn control(sequence: u64, payload: Vec<u8>) -> Frame {
        Frame {
            frame_type: FrameType::Control,
            lane: 0,
            sequence,
            payload,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Frame::default()
        }
    }

    pub fn heartbeat(lane: u16, sequence: u64) -> Frame {
        Frame {
            frame_type: FrameType::Heartbeat,
            lane,
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Frame::default()
        }
    }

    /// Ack for a heartbeat or data frame.
    pub fn ack(lane: u16, sequence: u64) -> Frame {
        Frame {
            frame_type: FrameType::Ack,
            lane,
            sequence,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            ..Frame::default()
        }
    }

    /// Encoded payload size; the cap check uses the payload, not the
    /// envelope, so both codecs agree on admission.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Pluggable wire framing.
pub trait FrameCodec: Send + Sync {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Frame>;

    /// Whether encoded frames ride text or binary WebSocket messages.
    fn is_text(&self) -> bool;
}

/// Present wire format: one JSON object per WebSocket text message.
#[derive(Default)]
pub struct JsonFrameCodec;

impl FrameCodec for JsonFrameCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(frame)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn is_text(&self) -> bool {
        true
    }
}

/// Reserved binary framing: `type u8 | lane u16 | flags u16 | length u32 |
/// payload` big-endian, where the payload is a JSON header block followed
/// by `0x00` and the raw frame payload.
#[derive(Default)]
pub struct BinaryFrameCodec;

const HEADER_LEN: usize = 1 + 2 + 2 + 4;

#[derive(Serialize, Deserialize)]
struct BinaryHeader {
    stream_id: u64,
    sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_sequence: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chunk_total: Option<u32>,
    #[serde(default)]
    tenant_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    headers: BTreeMap<String, String>,
    timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    checksum: Option<u32>,
    #[serde(default)]
    routing: RoutingInfo,
}

impl FrameCodec for BinaryFrameCodec {
    fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let header = BinaryHeader {
            stream_id: frame.stream_id,
            sequence: frame.sequence,
            chunk_sequence: frame.chunk_sequence,
            chunk_total: frame.chunk_total,
            tenant_id: frame.tenant_id.clone(),
            headers: frame.headers.clone(),
            timestamp_ms: frame.timestamp_ms,
            checksum: frame.checksum,
            routing: frame.routing.clone(),
        };
        let header_bytes = serde_json::to_vec(&header)?;
        let body_len = header_bytes.len() + 1 + frame.payload.len();
        let mut out = Vec::with_capacity(HEADER_LEN + body_len);
        out.push(frame.frame_type.wire_tag());
        out.extend_from_slice(&frame.lane.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes()); // flags, reserved
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        out.extend_from_slice(&header_bytes);
        out.push(0);
        out.extend_from_slice(&frame.payload);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Frame> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidConfiguration(format!(
                "binary frame truncated at {} bytes",
                bytes.len()
            )));
        }
        let frame_type = FrameType::from_wire_tag(bytes[0])?;
        let lane = u16::from_be_bytes([bytes[1], bytes[2]]);
        let length = u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]) as usize;
        let body = &bytes[HEADER_LEN..];
        if body.len() != length {
            return Err(Error::InvalidConfiguration(format!(
                "binary frame length mismatch: header {length}, body {}",
                body.len()
            )));
        }
        let split = body
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| Error::InvalidConfiguration("binary frame missing header break".into()))?;
        let header: BinaryHeader = serde_json::from_slice(&body[..split])?;
        Ok(Frame {
            frame_type,
            lane,
            stream_id: header.stream_id,
            sequence: header.sequence,
            chunk_sequence: header.chunk_sequence,
            chunk_total: header.chunk_total,
            tenant_id: header.tenant_id,
            payload: body[split + 1..].to_vec(),
            headers: header.headers,
            timestamp_ms: header.timestamp_ms,
            checksum: header.checksum,
            routing: header.routing,
        })
    }

    fn is_text(&self) -> bool {
        false
    }
}

/// First message on every new WebSocket: both fields are required,
/// unknown capabilities are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: String,
    pub link_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: String,
}

impl Handshake {
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() || self.link_id.is_empty() {
            return Err(Error::InvalidConfiguration(
                "handshake requires node_id and link_id".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        let mut frame = Frame::data(2, 7, 42, b"payload bytes".to_vec());
        frame.tenant_id = "tenant_a".into();
        frame.headers.insert("content-type".into(), "bytes".into());
        frame.routing = RoutingInfo {
            path_id: "p1".into(),
            hop_count: 3,
            ttl: 16,
            priority: 1,
        };
        frame.chunk_sequence = Some(1);
        frame.chunk_total = Some(4);
        frame
    }

    #[test]
    fn json_codec_round_trip() {
        let codec = JsonFrameCodec;
        let frame = sample_frame();
        let decoded = codec.decode(&codec.encode(&frame).unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert!(codec.is_text());
    }

    #[test]
    fn binary_codec_round_trip() {
        let codec = BinaryFrameCodec;
        let frame = sample_frame();
        let encoded = codec.encode(&frame).unwrap();
        assert_eq!(encoded[0], 0, "data frame tag");
        assert_eq!(u16::from_be_bytes([encoded[1], encoded[2]]), 2);
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, frame);
        assert!(!codec.is_text());
    }

    #[test]
    fn binary_codec_rejects_truncation_and_bad_tags() {
        let codec = BinaryFrameCodec;
        assert!(codec.decode(&[1, 2, 3]).is_err());

        let mut encoded = codec.encode(&sample_frame()).unwrap();
        encoded[0] = 99;
        assert!(codec.decode(&encoded).is_err());

        let mut short = codec.encode(&sample_frame()).unwrap();
        short.truncate(short.len() - 1);
        assert!(codec.decode(&short).is_err());
    }

    #[test]
    fn handshake_requires_both_ids() {
        let ok = Handshake {
            node_id: "node_a".into(),
            link_id: "link_1".into(),
            capabilities: vec!["compression".into(), "unknown-cap".into()],
            version: "1".into(),
        };
        assert!(ok.validate().is_ok());

        let missing = Handshake {
            node_id: String::new(),
            link_id: "link_1".into(),
            capabilities: Vec::new(),
            version: String::new(),
        };
        assert!(missing.validate().is_err());
    }
}
