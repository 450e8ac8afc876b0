//! Document snapshots and content normalization.
//!
//! Hosts hand us initial content in whatever shape their storage produced:
//! a full `{"type":"doc"}` node, a bare array of blocks, a single block,
//! a markup string, or nothing at all. [`normalize`] turns every one of
//! those into a [`Snapshot`] the surface and the replica understand.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use serde_json::{json, Map, Value};

/// A structured document: an ordered list of JSON block nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub blocks: Vec<Value>,
}

impl Document {
    pub fn new(blocks: Vec<Value>) -> Self {
        Self { blocks }
    }

    /// A document holding one empty paragraph, the editor's idea of blank.
    pub fn empty() -> Self {
        Self {
            blocks: vec![json!({ "type": "paragraph" })],
        }
    }

    /// No blocks at all, or exactly one paragraph without content.
    pub fn is_structurally_empty(&self) -> bool {
        match self.blocks.as_slice() {
            [] => true,
            [only] => {
                only.get("type").and_then(Value::as_str) == Some("paragraph")
                    && only
                        .get("content")
                        .and_then(Value::as_array)
                        .is_none_or(|c| c.is_empty())
            }
            _ => false,
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The `{"type":"doc","content":[...]}` form.
    pub fn to_value(&self) -> Value {
        json!({ "type": "doc", "content": self.blocks })
    }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut doc = serializer.serialize_struct("Document", 2)?;
        doc.serialize_field("type", "doc")?;
        doc.serialize_field("content", &self.blocks)?;
        doc.end()
    }
}

/// What moves between the sync core and the editing surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Document(Document),
    /// Serialized markup; only the surface's own parser understands it.
    Markup(String),
}

impl From<Document> for Snapshot {
    fn from(doc: Document) -> Self {
        Snapshot::Document(doc)
    }
}

/// Normalize arbitrary initial content. Never fails.
pub fn normalize(content: &Value) -> Snapshot {
    match content {
        Value::Null | Value::Bool(false) => Snapshot::Document(Document::empty()),
        Value::Number(n) if n.as_f64() == Some(0.0) => Snapshot::Document(Document::empty()),
        Value::String(s) if s.is_empty() => Snapshot::Document(Document::empty()),
        Value::String(s) => Snapshot::Markup(s.clone()),
        Value::Array(blocks) => {
            log::debug!("Wrapping {} bare blocks into a document", blocks.len());
            Snapshot::Document(Document::new(blocks.clone()))
        }
        Value::Object(node) => Snapshot::Document(normalize_node(node)),
        other => {
            log::warn!("Unrecognized content {other}, using an empty document");
            Snapshot::Document(Document::empty())
        }
    }
}

fn normalize_node(node: &Map<String, Value>) -> Document {
    let content = node.get("content").and_then(Value::as_array);
    if node.get("type").and_then(Value::as_str) == Some("doc") {
        return Document::new(content.cloned().unwrap_or_default());
    }
    match content {
        Some(blocks) => {
            log::debug!("Rewrapping non-doc node with {} children", blocks.len());
            Document::new(blocks.clone())
        }
        None => Document::new(vec![Value::Object(node.clone())]),
    }
}

/// Number of top-level blocks in raw content: the array length, or the
/// length of an object's `content` array. Everything else counts as zero.
pub fn block_count(content: &Value) -> usize {
    match content {
        Value::Array(blocks) => blocks.len(),
        Value::Object(node) => node
            .get("content")
            .and_then(Value::as_array)
            .map_or(0, Vec::len),
        _ => 0,
    }
}

/// Whether the host actually supplied initial content. `null`, `false`,
/// `0` and `""` count as absent.
pub fn is_present(content: &Value) -> bool {
    match content {
        Value::Null | Value::Bool(false) => false,
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}
