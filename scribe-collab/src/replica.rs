//! The session's CRDT replica.
//!
//! A yrs `Doc` holding one shared array, `blocks`, whose entries are the
//! document's top-level block nodes serialized as JSON strings. Block
//! granularity is what reconciliation reasons about; finer-grained editing
//! happens inside the host editor and is carried here as whole-block
//! replacements.
//!
//! ```text
//! local write ──► transaction ──► v1 update ──► update listeners ──► transport
//! remote update ─────────────────► apply (listeners not notified)
//! ```

use serde_json::Value;
use std::sync::Mutex;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Any, Array, ArrayRef, Doc, Out, ReadTxn, StateVector, Transact, Update};

use crate::content::Document;
use crate::error::{CollabError, CollabResult};
use crate::listeners::{ListenerId, ListenerSet};
use crate::lock;

const BLOCKS: &str = "blocks";

/// CRDT document shared by every participant of a room.
pub struct Replica {
    doc: Mutex<Option<Doc>>,
    update_listeners: ListenerSet<[u8]>,
}

impl Replica {
    pub fn new() -> Self {
        Self {
            doc: Mutex::new(Some(Doc::new())),
            update_listeners: ListenerSet::new(),
        }
    }

    fn with_doc<T>(&self, f: impl FnOnce(&Doc) -> CollabResult<T>) -> CollabResult<T> {
        let guard = lock(&self.doc);
        let doc = guard.as_ref().ok_or(CollabError::ReplicaReleased)?;
        f(doc)
    }

    fn blocks(doc: &Doc) -> ArrayRef {
        doc.get_or_insert_array(BLOCKS)
    }

    /// Current content as a structured document.
    pub fn document(&self) -> CollabResult<Document> {
        self.with_doc(|doc| {
            let blocks = Self::blocks(doc);
            let txn = doc.transact();
            let parsed = blocks
                .iter(&txn)
                .filter_map(|out| match out {
                    Out::Any(Any::String(raw)) => match serde_json::from_str::<Value>(&raw) {
                        Ok(block) => Some(block),
                        Err(e) => {
                            log::warn!("Skipping malformed block in replica: {e}");
                            None
                        }
                    },
                    _ => None,
                })
                .collect();
            Ok(Document::new(parsed))
        })
    }

    pub fn block_count(&self) -> CollabResult<usize> {
        self.with_doc(|doc| {
            let blocks = Self::blocks(doc);
            let txn = doc.transact();
            Ok(blocks.len(&txn) as usize)
        })
    }

    /// Replace the whole content in one transaction.
    ///
    /// Update listeners receive the resulting update; it is also returned.
    pub fn replace_document(&self, document: &Document) -> CollabResult<Vec<u8>> {
        let serialized = serialize_blocks(&document.blocks)?;
        let update = self.with_doc(|doc| {
            let blocks = Self::blocks(doc);
            let mut txn = doc.transact_mut();
            let len = blocks.len(&txn);
            if len > 0 {
                blocks.remove_range(&mut txn, 0, len);
            }
            for block in serialized {
                blocks.push_back(&mut txn, block);
            }
            Ok(txn.encode_update_v1())
        })?;
        self.update_listeners.emit(&update);
        Ok(update)
    }

    /// Append one block as a local edit.
    pub fn push_block(&self, block: &Value) -> CollabResult<Vec<u8>> {
        let serialized =
            serde_json::to_string(block).map_err(|e| CollabError::Serialization(e.to_string()))?;
        let update = self.with_doc(|doc| {
            let blocks = Self::blocks(doc);
            let mut txn = doc.transact_mut();
            blocks.push_back(&mut txn, serialized);
            Ok(txn.encode_update_v1())
        })?;
        self.update_listeners.emit(&update);
        Ok(update)
    }

    /// Integrate an update that arrived from the network. Update listeners
    /// are not notified; the update is already known to the room.
    pub fn apply_remote_update(&self, update: &[u8]) -> CollabResult<()> {
        let update = Update::decode_v1(update)?;
        self.with_doc(|doc| {
            let mut txn = doc.transact_mut();
            let _ = txn.apply_update(update);
            Ok(())
        })
    }

    /// Encoded state vector, for a SyncStep1 frame.
    pub fn state_vector(&self) -> CollabResult<Vec<u8>> {
        self.with_doc(|doc| Ok(doc.transact().state_vector().encode_v1()))
    }

    /// Everything the holder of `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        let remote = StateVector::decode_v1(remote_state_vector)?;
        self.with_doc(|doc| Ok(doc.transact().encode_diff_v1(&remote)))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> CollabResult<Vec<u8>> {
        self.with_doc(|doc| {
            Ok(doc
                .transact()
                .encode_state_as_update_v1(&StateVector::default()))
        })
    }

    /// Subscribe to updates produced by local writes.
    pub fn on_update(&self, listener: impl Fn(&[u8]) + Send + Sync + 'static) -> ListenerId {
        self.update_listeners.add(listener)
    }

    pub fn off_update(&self, id: ListenerId) -> CollabResult<()> {
        if self.update_listeners.remove(id) {
            Ok(())
        } else {
            Err(CollabError::UnknownListener(id))
        }
    }

    /// Drop the underlying document. Returns `false` if already released.
    pub fn release(&self) -> bool {
        let released = lock(&self.doc).take().is_some();
        if released {
            self.update_listeners.clear();
        }
        released
    }

    pub fn is_released(&self) -> bool {
        lock(&self.doc).is_none()
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

fn serialize_blocks(blocks: &[Value]) -> CollabResult<Vec<String>> {
    blocks
        .iter()
        .map(|b| serde_json::to_string(b).map_err(|e| CollabError::Serialization(e.to_string())))
        .collect()
}
