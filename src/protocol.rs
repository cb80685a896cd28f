//! Wire protocol between the capture producer and the reconstructing host.
//!
//! Every message travels in one envelope:
//!
//! ```json
//! { "type": "NODES", "payload": { "nodes": [...] }, "sequenceNumber": 3, "timestamp": 1700000000000 }
//! ```
//!
//! Decoding happens in two steps. The envelope is read with an opaque
//! payload, then the payload is parsed according to `type`. Unknown types
//! decode to [`Message::Unknown`] rather than failing, so newer producers can
//! talk to older hosts.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::ir::IrNode;
use crate::{Error, Result};

/// Opaque design-token map handed to the host's variable registry
pub type TokenMap = serde_json::Map<String, serde_json::Value>;

/// A font the page uses, keyed by family and style
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontRequest {
    pub family: String,
    #[serde(default = "default_font_style")]
    pub style: String,
}

fn default_font_style() -> String {
    "Regular".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontsPayload {
    #[serde(default)]
    pub fonts: Vec<FontRequest>,
    /// Raw `@font-face` descriptors, passed through untouched
    #[serde(default)]
    pub font_faces: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodesPayload {
    pub nodes: Vec<IrNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageChunk {
    pub node_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    pub current: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Totals the producer declares when it has sent everything
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteSummary {
    pub total_nodes: u64,
    pub total_images: u64,
    pub inline_images: u64,
    pub streamed_images: u64,
}

/// Decoded message body
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Tokens(TokenMap),
    Fonts(FontsPayload),
    Nodes(NodesPayload),
    ImageChunk(ImageChunk),
    Progress(Progress),
    Error(ErrorPayload),
    Complete(CompleteSummary),
    /// A message type this build does not understand
    Unknown { kind: String },
}

impl Message {
    /// The `type` tag used on the wire
    pub fn kind(&self) -> &str {
        match self {
            Message::Tokens(_) => "TOKENS",
            Message::Fonts(_) => "FONTS",
            Message::Nodes(_) => "NODES",
            Message::ImageChunk(_) => "IMAGE_CHUNK",
            Message::Progress(_) => "PROGRESS",
            Message::Error(_) => "ERROR",
            Message::Complete(_) => "COMPLETE",
            Message::Unknown { kind } => kind,
        }
    }

    fn payload_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            Message::Tokens(map) => serde_json::Value::Object(map.clone()),
            Message::Fonts(p) => serde_json::to_value(p)?,
            Message::Nodes(p) => serde_json::to_value(p)?,
            Message::ImageChunk(p) => serde_json::to_value(p)?,
            Message::Progress(p) => serde_json::to_value(p)?,
            Message::Error(p) => serde_json::to_value(p)?,
            Message::Complete(p) => serde_json::to_value(p)?,
            Message::Unknown { .. } => serde_json::Value::Null,
        };
        Ok(value)
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Nodes(p) => write!(f, "NODES({})", p.nodes.len()),
            Message::ImageChunk(c) => write!(
                f,
                "IMAGE_CHUNK({} {}/{})",
                c.node_id,
                c.chunk_index + 1,
                c.total_chunks
            ),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// One framed message with its ordering metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub message: Message,
    pub sequence_number: u64,
    /// Milliseconds since the Unix epoch at send time
    pub timestamp: Option<u64>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
    sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
}

fn decode_payload<T: serde::de::DeserializeOwned>(kind: &str, payload: serde_json::Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::TransportDecode(format!("{kind} payload: {e}")))
}

impl Envelope {
    pub fn new(message: Message, sequence_number: u64) -> Self {
        Self {
            message,
            sequence_number,
            timestamp: Some(now_millis()),
        }
    }

    /// Decode one envelope from its JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(text)
            .map_err(|e| Error::TransportDecode(format!("envelope: {e}")))?;
        let kind = wire.kind.as_str();
        let message = match kind {
            "TOKENS" => match wire.payload {
                serde_json::Value::Object(map) => Message::Tokens(map),
                serde_json::Value::Null => Message::Tokens(TokenMap::new()),
                other => {
                    return Err(Error::TransportDecode(format!(
                        "TOKENS payload must be an object, got {other}"
                    )))
                }
            },
            "FONTS" => Message::Fonts(decode_payload(kind, wire.payload)?),
            "NODES" => Message::Nodes(decode_payload(kind, wire.payload)?),
            "IMAGE_CHUNK" => Message::ImageChunk(decode_payload(kind, wire.payload)?),
            "PROGRESS" => Message::Progress(decode_payload(kind, wire.payload)?),
            "ERROR" => Message::Error(decode_payload(kind, wire.payload)?),
            "COMPLETE" => Message::Complete(decode_payload(kind, wire.payload)?),
            other => Message::Unknown {
                kind: other.to_string(),
            },
        };
        Ok(Envelope {
            message,
            sequence_number: wire.sequence_number,
            timestamp: wire.timestamp,
        })
    }

    /// Encode as a single line of JSON
    pub fn to_json(&self) -> Result<String> {
        let wire = WireEnvelope {
            kind: self.message.kind().to_string(),
            payload: self.message.payload_value()?,
            sequence_number: self.sequence_number,
            timestamp: self.timestamp,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        BASE64
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
