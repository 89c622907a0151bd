//! Stored records and the snapshot view sent to clients on connect.
//!
//! Annotation types double as their own storage records: they are bincode
//! encoded into RocksDB and JSON encoded (camelCase) onto the wire. Layers and
//! editors carry extra bookkeeping (position, stable id, compressed content)
//! that never leaves the store, so they have separate record types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name given to the editor pane created alongside a new workspace.
pub const DEFAULT_EDITOR_NAME: &str = "Passage 1";

/// Arrow style used when a client never picked one.
pub const DEFAULT_ARROW_STYLE: &str = "solid";

/// Highlight subtype tag. Reserved; every highlight currently uses it.
pub const DEFAULT_HIGHLIGHT_TYPE: &str = "highlight";

// ─── Snapshot / wire types ────────────────────────────────────────────

/// Full workspace state, sent once to every new connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceState {
    pub workspace_id: String,
    /// Ordered by layer position
    pub layers: Vec<Layer>,
    /// Ordered by editor index
    pub editors: Vec<Editor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Layer {
    pub id: String,
    pub name: String,
    pub color: String,
    pub visible: bool,
    pub highlights: Vec<Highlight>,
    pub arrows: Vec<Arrow>,
    pub underlines: Vec<Underline>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: String,
    pub editor_index: i64,
    pub from: i64,
    pub to: i64,
    pub text: String,
    pub annotation: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// One end of an arrow: a text range inside one editor pane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrowEndpoint {
    pub editor_index: i64,
    pub from: i64,
    pub to: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Arrow {
    pub id: String,
    pub from: ArrowEndpoint,
    pub to: ArrowEndpoint,
    pub arrow_style: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Underline {
    pub id: String,
    pub editor_index: i64,
    pub from: i64,
    pub to: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Editor {
    pub index: i64,
    pub name: String,
    pub visible: bool,
    /// Structured document; `null` until the first content update
    pub content_json: Option<Value>,
}

// ─── Storage records ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WorkspaceRecord {
    /// Seconds since epoch
    pub created_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct LayerRecord {
    pub id: String,
    pub name: String,
    pub color: String,
    pub visible: bool,
    pub position: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EditorRecord {
    /// Server-assigned, never reused
    pub id: u64,
    pub index: i64,
    pub name: String,
    pub visible: bool,
    /// LZ4-compressed JSON text
    pub content: Option<Vec<u8>>,
}

/// Per-layer annotation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationCounts {
    pub highlights: usize,
    pub arrows: usize,
    pub underlines: usize,
}

impl AnnotationCounts {
    pub fn total(&self) -> usize {
        self.highlights + self.arrows + self.underlines
    }
}
