//! Binary protocol spoken between peers and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ connection_id │ room     │ clock    │ payload  │
//! │ 1 byte   │ varint u64    │ string   │ varint   │ variable │
//! └──────────┴───────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Document payloads are raw yrs v1 updates / state vectors. Presence
//! payloads are JSON so the presence shape can evolve without breaking
//! older peers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CollabError, CollabResult};
use crate::presence::PresenceState;

/// Identifies one live connection (one browser tab, one CLI process).
///
/// Random, at most 53 bits wide so it survives a round-trip through JSON
/// numbers on the browser side.
pub type ConnectionId = u64;

const CONNECTION_ID_MASK: u64 = (1 << 53) - 1;

/// Draw a fresh, non-zero connection id.
pub fn new_connection_id() -> ConnectionId {
    loop {
        let id = (Uuid::new_v4().as_u128() as u64) & CONNECTION_ID_MASK;
        if id != 0 {
            return id;
        }
    }
}

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the relay for what we are missing
    SyncStep1 = 1,
    /// Yrs diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental replica update
    Update = 3,
    /// JSON presence state of the sender
    Presence = 4,
    /// Ask every peer in the room to re-announce its presence
    PresenceQuery = 5,
    /// Sender is leaving; drop its presence
    PresenceRemoved = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
}

/// Top-level protocol frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub connection_id: ConnectionId,
    pub room: String,
    /// Per-sender counter, increases with every update sent
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn frame(
        msg_type: MessageType,
        connection_id: ConnectionId,
        room: &str,
        clock: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            connection_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn sync_step1(connection_id: ConnectionId, room: &str, state_vector: Vec<u8>) -> Self {
        Self::frame(MessageType::SyncStep1, connection_id, room, 0, state_vector)
    }

    pub fn sync_step2(connection_id: ConnectionId, room: &str, diff: Vec<u8>) -> Self {
        Self::frame(MessageType::SyncStep2, connection_id, room, 0, diff)
    }

    pub fn update(connection_id: ConnectionId, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::frame(MessageType::Update, connection_id, room, clock, update)
    }

    /// Presence announcement. A default state announces a connection
    /// with no participant.
    pub fn presence(
        connection_id: ConnectionId,
        room: &str,
        state: &PresenceState,
    ) -> CollabResult<Self> {
        let payload =
            serde_json::to_vec(state).map_err(|e| CollabError::Serialization(e.to_string()))?;
        Ok(Self::frame(MessageType::Presence, connection_id, room, 0, payload))
    }

    pub fn presence_query(connection_id: ConnectionId, room: &str) -> Self {
        Self::frame(MessageType::PresenceQuery, connection_id, room, 0, Vec::new())
    }

    pub fn presence_removed(connection_id: ConnectionId, room: &str) -> Self {
        Self::frame(MessageType::PresenceRemoved, connection_id, room, 0, Vec::new())
    }

    pub fn ping(connection_id: ConnectionId, room: &str) -> Self {
        Self::frame(MessageType::Ping, connection_id, room, 0, Vec::new())
    }

    pub fn pong(connection_id: ConnectionId, room: &str) -> Self {
        Self::frame(MessageType::Pong, connection_id, room, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> CollabResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> CollabResult<Self> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CollabError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the presence payload.
    pub fn presence_state(&self) -> CollabResult<PresenceState> {
        if self.msg_type != MessageType::Presence {
            return Err(CollabError::InvalidMessageType);
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}
