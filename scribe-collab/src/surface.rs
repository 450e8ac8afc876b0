//! The editing surface, as far as the sync core is concerned.
//!
//! The surface (a rich-text editor, a terminal buffer, ...) is bound to the
//! replica by the host. The core only ever needs to read its content and,
//! once, replace it.

use serde_json::{json, Value};
use std::sync::Mutex;

use crate::content::{Document, Snapshot};
use crate::lock;

pub trait EditorSurface: Send + Sync {
    fn get_content(&self) -> Snapshot;

    /// Replace the content. Markup is parsed by the surface itself.
    fn set_content(&self, content: Snapshot);
}

/// Turns markup into a document the way a surface would.
pub type MarkupParser = fn(&str) -> Document;

/// One paragraph per non-blank line.
pub fn plain_text_parser(markup: &str) -> Document {
    let blocks: Vec<Value> = markup
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| json!({"type": "paragraph", "content": [{"type": "text", "text": line}]}))
        .collect();
    if blocks.is_empty() {
        Document::empty()
    } else {
        Document::new(blocks)
    }
}

/// In-memory surface, for headless hosts and tests.
pub struct BufferSurface {
    content: Mutex<Document>,
    parser: MarkupParser,
    writes: Mutex<usize>,
}

impl BufferSurface {
    pub fn new() -> Self {
        Self::with_parser(plain_text_parser)
    }

    pub fn with_parser(parser: MarkupParser) -> Self {
        Self {
            content: Mutex::new(Document::empty()),
            parser,
            writes: Mutex::new(0),
        }
    }

    pub fn document(&self) -> Document {
        lock(&self.content).clone()
    }

    /// How many times `set_content` was called.
    pub fn write_count(&self) -> usize {
        *lock(&self.writes)
    }
}

impl Default for BufferSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl EditorSurface for BufferSurface {
    fn get_content(&self) -> Snapshot {
        Snapshot::Document(self.document())
    }

    fn set_content(&self, content: Snapshot) {
        let document = match content {
            Snapshot::Document(doc) => doc,
            Snapshot::Markup(markup) => (self.parser)(&markup),
        };
        *lock(&self.content) = document;
        *lock(&self.writes) += 1;
    }
}
