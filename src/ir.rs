//! Intermediate representation of captured page nodes.
//!
//! The upstream extractor produces loosely typed records (`RawNode`) with
//! optional fields everywhere. They are validated exactly once, when a message
//! is decoded, into an [`IrNode`]. Everything downstream (stacking, scene
//! building, the coordinator) can then assume well-formed input.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::{Error, Result};

/// Declared geometry of a node, in CSS pixels relative to the page.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    fn is_well_formed(&self) -> bool {
        [self.x, self.y, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

/// What kind of native primitive a node maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Frame,
    Text,
    Image,
    Vector,
    Rectangle,
    /// Stand-in for an image whose bytes never arrived
    Placeholder,
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Frame => write!(f, "frame"),
            NodeKind::Text => write!(f, "text"),
            NodeKind::Image => write!(f, "image"),
            NodeKind::Vector => write!(f, "vector"),
            NodeKind::Rectangle => write!(f, "rectangle"),
            NodeKind::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// CSS `position`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    #[default]
    Static,
    Relative,
    Absolute,
    Fixed,
    Sticky,
}

/// CSS `isolation`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    #[default]
    Auto,
    Isolate,
}

/// CSS `z-index`: either `auto` or an integer stack level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZIndex {
    #[default]
    Auto,
    Value(i32),
}

impl ZIndex {
    /// Stack level used for sorting; `auto` stacks at level 0.
    pub fn level(self) -> i32 {
        match self {
            ZIndex::Auto => 0,
            ZIndex::Value(z) => z,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ZIndex::Value(_))
    }
}

/// Stacking inputs as pre-resolved by the extractor
#[derive(Debug, Clone, PartialEq)]
pub struct StackingInputs {
    pub position: Position,
    pub z_index: ZIndex,
    /// Always within `0.0..=1.0`
    pub opacity: f32,
    pub has_transform: bool,
    pub has_filter: bool,
    pub has_clip_path: bool,
    pub has_perspective: bool,
    pub isolation: Isolation,
    /// Upstream decided this element is promoted to its own compositing layer
    pub forces_layer: bool,
    /// Explicit document-root marker
    pub is_root: bool,
}

impl Default for StackingInputs {
    fn default() -> Self {
        Self {
            position: Position::Static,
            z_index: ZIndex::Auto,
            opacity: 1.0,
            has_transform: false,
            has_filter: false,
            has_clip_path: false,
            has_perspective: false,
            isolation: Isolation::Auto,
            forces_layer: false,
            is_root: false,
        }
    }
}

/// Reference to an image whose bytes are streamed as separate chunks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageChunkRef {
    pub total_size: u64,
    pub total_chunks: u32,
    pub chunk_size: u32,
    /// Hex SHA-256 of the complete asset, when the producer computed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ImageChunkRef {
    fn validate(&self, node_id: &str) -> Result<()> {
        if self.total_chunks == 0 || self.chunk_size == 0 {
            return Err(Error::InvalidNode(format!(
                "{node_id}: imageChunkRef needs non-zero totalChunks and chunkSize"
            )));
        }
        let expected = self.total_size.div_ceil(u64::from(self.chunk_size)).max(1);
        if expected != u64::from(self.total_chunks) {
            return Err(Error::InvalidNode(format!(
                "{node_id}: imageChunkRef declares {} chunks but {} bytes at {} per chunk needs {}",
                self.total_chunks, self.total_size, self.chunk_size, expected
            )));
        }
        Ok(())
    }
}

/// Wire form of `z-index`: a number, or a string such as `"auto"` or `"10"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawZIndex {
    Number(i32),
    Text(String),
}

/// Node record exactly as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawNode {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub rect: Option<Rect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_index: Option<RawZIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opacity: Option<f32>,
    #[serde(default)]
    pub has_transform: bool,
    #[serde(default)]
    pub has_filter: bool,
    #[serde(default)]
    pub has_clip_path: bool,
    #[serde(default)]
    pub has_perspective: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isolation: Option<Isolation>,
    #[serde(default)]
    pub forces_layer: bool,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_chunk_ref: Option<ImageChunkRef>,
    /// Base64-encoded image bytes small enough to travel with the node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// A validated captured node.
///
/// Serializes through [`RawNode`], so decoding a message into an `IrNode`
/// runs validation as part of deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct IrNode {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: NodeKind,
    pub rect: Rect,
    pub stacking: StackingInputs,
    pub image_chunk_ref: Option<ImageChunkRef>,
    pub inline_image: Option<Vec<u8>>,
    pub text: Option<String>,
}

impl IrNode {
    /// A plain frame with default stacking inputs
    pub fn new(id: impl Into<String>, parent_id: Option<&str>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.map(str::to_string),
            kind: NodeKind::Frame,
            rect: Rect::default(),
            stacking: StackingInputs::default(),
            image_chunk_ref: None,
            inline_image: None,
            text: None,
        }
    }

    /// Whether this node waits on chunked image bytes that are not attached yet
    pub fn awaits_streamed_image(&self) -> bool {
        self.image_chunk_ref.is_some() && self.inline_image.is_none()
    }

    /// Attach fully assembled bytes, making the node ready to materialize
    pub fn with_image(mut self, bytes: Vec<u8>) -> Self {
        self.inline_image = Some(bytes);
        self
    }

    /// Rectangle stand-in sized to this node's declared bounds
    pub fn placeholder(&self) -> Self {
        Self {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            kind: NodeKind::Placeholder,
            rect: self.rect,
            stacking: self.stacking.clone(),
            image_chunk_ref: None,
            inline_image: None,
            text: None,
        }
    }
}

fn parse_z_index(node_id: &str, raw: Option<RawZIndex>) -> Result<ZIndex> {
    match raw {
        None => Ok(ZIndex::Auto),
        Some(RawZIndex::Number(z)) => Ok(ZIndex::Value(z)),
        Some(RawZIndex::Text(s)) => {
            let s = s.trim();
            if s.is_empty() || s.eq_ignore_ascii_case("auto") {
                Ok(ZIndex::Auto)
            } else {
                s.parse::<i32>()
                    .map(ZIndex::Value)
                    .map_err(|_| Error::InvalidNode(format!("{node_id}: bad zIndex '{s}'")))
            }
        }
    }
}

impl TryFrom<RawNode> for IrNode {
    type Error = Error;

    fn try_from(raw: RawNode) -> Result<Self> {
        if raw.id.trim().is_empty() {
            return Err(Error::InvalidNode("empty node id".to_string()));
        }
        let id = raw.id;
        if raw.parent_id.as_deref() == Some(id.as_str()) {
            return Err(Error::InvalidNode(format!("{id}: node is its own parent")));
        }

        let rect = raw.rect.unwrap_or_default();
        if !rect.is_well_formed() {
            return Err(Error::InvalidNode(format!("{id}: malformed rect {rect:?}")));
        }

        let opacity = match raw.opacity {
            Some(o) if o.is_nan() => {
                return Err(Error::InvalidNode(format!("{id}: opacity is NaN")));
            }
            Some(o) => o.clamp(0.0, 1.0),
            None => 1.0,
        };

        if let Some(chunk_ref) = &raw.image_chunk_ref {
            chunk_ref.validate(&id)?;
        }
        if raw.image_chunk_ref.is_some() && raw.inline_image.is_some() {
            return Err(Error::InvalidNode(format!(
                "{id}: both inline image bytes and a chunk reference"
            )));
        }
        let inline_image = raw
            .inline_image
            .map(|b64| {
                BASE64
                    .decode(b64.as_bytes())
                    .map_err(|e| Error::InvalidNode(format!("{id}: inline image: {e}")))
            })
            .transpose()?;

        let stacking = StackingInputs {
            position: raw.position.unwrap_or_default(),
            z_index: parse_z_index(&id, raw.z_index)?,
            opacity,
            has_transform: raw.has_transform,
            has_filter: raw.has_filter,
            has_clip_path: raw.has_clip_path,
            has_perspective: raw.has_perspective,
            isolation: raw.isolation.unwrap_or_default(),
            forces_layer: raw.forces_layer,
            is_root: raw.is_root,
        };

        Ok(IrNode {
            parent_id: raw.parent_id.filter(|p| !p.is_empty()),
            id,
            kind: raw.kind,
            rect,
            stacking,
            image_chunk_ref: raw.image_chunk_ref,
            inline_image,
            text: raw.text,
        })
    }
}

impl From<IrNode> for RawNode {
    fn from(node: IrNode) -> Self {
        let s = node.stacking;
        RawNode {
            id: node.id,
            parent_id: node.parent_id,
            kind: node.kind,
            rect: Some(node.rect),
            position: (s.position != Position::Static).then_some(s.position),
            z_index: match s.z_index {
                ZIndex::Auto => None,
                ZIndex::Value(z) => Some(RawZIndex::Number(z)),
            },
            opacity: (s.opacity < 1.0).then_some(s.opacity),
            has_transform: s.has_transform,
            has_filter: s.has_filter,
            has_clip_path: s.has_clip_path,
            has_perspective: s.has_perspective,
            isolation: (s.isolation == Isolation::Isolate).then_some(Isolation::Isolate),
            forces_layer: s.forces_layer,
            is_root: s.is_root,
            image_chunk_ref: node.image_chunk_ref,
            inline_image: node.inline_image.map(|b| BASE64.encode(b)),
            text: node.text,
        }
    }
}
