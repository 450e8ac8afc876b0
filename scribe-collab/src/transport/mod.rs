//! Transports move replica updates and presence between a session and
//! its room.
//!
//! ```text
//!            ┌──────────────────── Transport ────────────────────┐
//! Replica ◄──┤ PeerState (handshake, sync, presence, queue)     │
//!            │        ▲                    │                     │
//!            │        │ SyncMessage        ▼ SyncMessage         │
//!            │   ┌────┴────────────────────────────┐             │
//!            │   │ link: websocket  |  MemoryRelay │             │
//!            └───┴─────────────────────────────────┴─────────────┘
//! ```
//!
//! Both implementations share [`peer::PeerState`]; they differ only in how
//! frames reach the relay.

pub mod memory;
pub mod peer;
pub mod queue;
pub mod websocket;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::TransportConfig;
use crate::error::CollabResult;
use crate::listeners::ListenerId;
use crate::presence::{PresenceChange, PresenceState};
use crate::protocol::ConnectionId;
use crate::replica::Replica;
use crate::room::RoomId;

pub use memory::{MemoryRelay, MemoryTransport, RelayStats};
pub use queue::OfflineQueue;
pub use websocket::{reconnect_delay, WebSocketConnector, WsTransport};

/// Link state as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Something a transport reports to its listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    /// `true` once the replica has caught up with the room after a
    /// (re)connect, `false` when the link drops.
    Synced(bool),
    PresenceChanged(PresenceChange),
}

/// Listener subscription filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Status,
    Synced,
    Presence,
}

impl TransportEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransportEvent::Status(_) => EventKind::Status,
            TransportEvent::Synced(_) => EventKind::Synced,
            TransportEvent::PresenceChanged(_) => EventKind::Presence,
        }
    }
}

pub type TransportListener = Box<dyn Fn(&TransportEvent) + Send + Sync>;

/// A connection between one replica and one room.
pub trait Transport: Send + Sync {
    fn room(&self) -> &str;

    /// Id this transport announces itself under.
    fn connection_id(&self) -> ConnectionId;

    /// Start connecting. Idempotent. Needs a Tokio runtime.
    fn connect(&self) -> CollabResult<()>;

    fn status(&self) -> ConnectionStatus;

    fn is_synced(&self) -> bool;

    /// Subscribe to events of one kind.
    fn on(&self, kind: EventKind, listener: TransportListener) -> ListenerId;

    fn off(&self, id: ListenerId) -> CollabResult<()>;

    /// Set (or clear) what we announce about ourselves. Announced right
    /// away when connected and on every (re)connect.
    fn set_local_presence(&self, state: Option<PresenceState>);

    /// Presence of every known connection, our own included.
    fn presence_states(&self) -> BTreeMap<ConnectionId, PresenceState>;

    /// Forward a local replica update; queued while disconnected.
    fn send_update(&self, update: &[u8]) -> CollabResult<()>;

    /// Leave the room and stop reconnecting. Idempotent.
    fn destroy(&self) -> CollabResult<()>;

    fn is_destroyed(&self) -> bool;
}

/// Builds transports for sessions.
pub trait TransportConnector: Send + Sync {
    /// Create a transport for `room`, bound to `replica`, without
    /// starting it.
    fn create(
        &self,
        endpoint: &str,
        room: &RoomId,
        replica: Arc<Replica>,
        config: &TransportConfig,
    ) -> CollabResult<Arc<dyn Transport>>;
}
