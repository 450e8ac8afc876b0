//! In-process relay and transport.
//!
//! [`MemoryRelay`] plays the part of the websocket relay inside the same
//! process: one authoritative replica and one broadcast group per room.
//! Handy for embedding several editors in one host, and for tests.
//!
//! Relay rules:
//! - `SyncStep1` is answered directly with a `SyncStep2` diff
//! - `Update` is applied to the room replica, then fanned out
//! - everything else is fanned out unchanged
//!
//! Fan-out reaches the sender too; peers drop frames carrying their own
//! connection id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};

use super::peer::PeerState;
use super::{ConnectionStatus, EventKind, Transport, TransportConnector, TransportListener};
use crate::config::TransportConfig;
use crate::content::Document;
use crate::error::{CollabError, CollabResult};
use crate::listeners::ListenerId;
use crate::lock;
use crate::presence::PresenceState;
use crate::protocol::{ConnectionId, MessageType, SyncMessage};
use crate::replica::Replica;
use crate::room::RoomId;

/// Connection id the relay uses for frames it authors.
pub const RELAY_CONNECTION_ID: ConnectionId = 0;

const DEFAULT_ROOM_CAPACITY: usize = 256;

/// Per-room counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub messages_relayed: u64,
    pub messages_dropped: u64,
    pub updates_applied: u64,
    pub active_peers: usize,
}

struct RelayRoom {
    name: String,
    replica: Replica,
    sender: broadcast::Sender<Arc<SyncMessage>>,
    peers: Mutex<HashSet<ConnectionId>>,
    relayed: AtomicU64,
    dropped: AtomicU64,
    applied: AtomicU64,
}

impl RelayRoom {
    fn new(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            name: name.to_string(),
            replica: Replica::new(),
            sender,
            peers: Mutex::new(HashSet::new()),
            relayed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            applied: AtomicU64::new(0),
        }
    }

    fn fan_out(&self, msg: SyncMessage) {
        self.sender.send(Arc::new(msg)).unwrap_or(0);
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Handle one frame sent by `peer`.
    fn route(&self, msg: SyncMessage, peer: &PeerState) {
        match msg.msg_type {
            MessageType::SyncStep1 => match self.replica.encode_diff(&msg.payload) {
                Ok(diff) => {
                    peer.handle(SyncMessage::sync_step2(RELAY_CONNECTION_ID, &self.name, diff))
                }
                Err(e) => log::warn!("[{}] Bad state vector from {}: {e}", self.name, msg.connection_id),
            },
            MessageType::Update => match self.replica.apply_remote_update(&msg.payload) {
                Ok(()) => {
                    self.applied.fetch_add(1, Ordering::Relaxed);
                    self.fan_out(msg);
                }
                Err(e) => log::warn!("[{}] Dropping bad update from {}: {e}", self.name, msg.connection_id),
            },
            _ => self.fan_out(msg),
        }
    }

    fn stats(&self) -> RelayStats {
        RelayStats {
            messages_relayed: self.relayed.load(Ordering::Relaxed),
            messages_dropped: self.dropped.load(Ordering::Relaxed),
            updates_applied: self.applied.load(Ordering::Relaxed),
            active_peers: lock(&self.peers).len(),
        }
    }
}

/// Shared, cloneable handle to an in-process relay.
#[derive(Clone)]
pub struct MemoryRelay {
    rooms: Arc<Mutex<HashMap<String, Arc<RelayRoom>>>>,
    capacity: usize,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ROOM_CAPACITY)
    }

    /// `capacity` frames are buffered per peer before a slow peer lags.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            capacity,
        }
    }

    fn room(&self, name: &str) -> Arc<RelayRoom> {
        lock(&self.rooms)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RelayRoom::new(name, self.capacity)))
            .clone()
    }

    /// Register `peer` in `name`, creating the room if needed.
    fn join(&self, name: &str, peer: ConnectionId) -> Arc<RelayRoom> {
        let mut rooms = lock(&self.rooms);
        let room = rooms
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RelayRoom::new(name, self.capacity)))
            .clone();
        lock(&room.peers).insert(peer);
        room
    }

    /// Unregister `peer`. A room left with no peers and no content is
    /// dropped; seeded or edited rooms stay.
    fn leave(&self, name: &str, peer: ConnectionId) {
        let mut rooms = lock(&self.rooms);
        let Some(room) = rooms.get(name) else {
            return;
        };
        let idle = {
            let mut peers = lock(&room.peers);
            peers.remove(&peer);
            peers.is_empty()
        };
        if idle && room.replica.block_count().is_ok_and(|n| n == 0) {
            log::debug!("[{name}] Last peer left, dropping room");
            rooms.remove(name);
        }
    }

    fn existing(&self, name: &str) -> Option<Arc<RelayRoom>> {
        lock(&self.rooms).get(name).cloned()
    }

    /// Pre-populate a room, as if someone had edited it earlier. The room
    /// outlives its peers from then on.
    pub fn seed(&self, room: &str, document: &Document) -> CollabResult<()> {
        self.room(room).replica.replace_document(document)?;
        Ok(())
    }

    /// The room's authoritative content.
    pub fn room_document(&self, room: &str) -> CollabResult<Document> {
        match self.existing(room) {
            Some(r) => r.replica.document(),
            None => Ok(Document::new(Vec::new())),
        }
    }

    pub fn peer_count(&self, room: &str) -> usize {
        self.existing(room).map_or(0, |r| lock(&r.peers).len())
    }

    pub fn stats(&self, room: &str) -> Option<RelayStats> {
        self.existing(room).map(|r| r.stats())
    }

    pub fn room_count(&self) -> usize {
        lock(&self.rooms).len()
    }

    /// A transport into `room`, not yet connected.
    pub fn transport(&self, room: &str, replica: Arc<Replica>, queue_capacity: usize) -> MemoryTransport {
        MemoryTransport {
            peer: Arc::new(PeerState::new(room, replica, queue_capacity)),
            relay: self.clone(),
            presence_timeout: TransportConfig::default().presence_timeout,
            shutdown: watch::channel(false).0,
            started: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConnector for MemoryRelay {
    fn create(
        &self,
        endpoint: &str,
        room: &RoomId,
        replica: Arc<Replica>,
        config: &TransportConfig,
    ) -> CollabResult<Arc<dyn Transport>> {
        log::debug!("In-process relay ignores endpoint {endpoint}");
        Ok(Arc::new(
            self.transport(room.as_str(), replica, config.offline_queue_capacity)
                .with_presence_timeout(config.presence_timeout),
        ))
    }
}

/// Transport whose link is a [`MemoryRelay`] room.
pub struct MemoryTransport {
    peer: Arc<PeerState>,
    relay: MemoryRelay,
    presence_timeout: Duration,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl MemoryTransport {
    /// Drop remote participants silent for `timeout`.
    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    pub fn queued_updates(&self) -> usize {
        self.peer.queued_updates()
    }
}

async fn run_link(
    peer: Arc<PeerState>,
    relay: MemoryRelay,
    room: Arc<RelayRoom>,
    presence_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut inbound = room.sender.subscribe();

    let (tx, mut outbound) = mpsc::unbounded_channel();
    peer.attach(tx);

    let sweep_every = (presence_timeout / 2).max(Duration::from_millis(1));
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);

    loop {
        tokio::select! {
            biased;
            Some(msg) = outbound.recv() => room.route(msg, &peer),
            received = inbound.recv() => match received {
                Ok(msg) => {
                    if msg.connection_id != peer.connection_id() {
                        peer.handle((*msg).clone());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("[{}] Peer {} lagged, {n} frames dropped", room.name, peer.connection_id());
                    room.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = sweep.tick() => {
                peer.expire_presence(presence_timeout);
            }
            _ = shutdown.changed() => {
                // Deliver the goodbye queued by destroy.
                while let Ok(msg) = outbound.try_recv() {
                    room.route(msg, &peer);
                }
                break;
            }
        }
    }

    relay.leave(&room.name, peer.connection_id());
    peer.detach();
}

impl Transport for MemoryTransport {
    fn room(&self) -> &str {
        self.peer.room()
    }

    fn connection_id(&self) -> ConnectionId {
        self.peer.connection_id()
    }

    fn connect(&self) -> CollabResult<()> {
        if self.peer.is_destroyed() {
            return Err(CollabError::TransportDestroyed);
        }
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| CollabError::NoRuntime(e.to_string()))?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.peer.set_status(ConnectionStatus::Connecting);
        let room = self.relay.join(self.peer.room(), self.peer.connection_id());
        runtime.spawn(run_link(
            self.peer.clone(),
            self.relay.clone(),
            room,
            self.presence_timeout,
            self.shutdown.subscribe(),
        ));
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.peer.status()
    }

    fn is_synced(&self) -> bool {
        self.peer.is_synced()
    }

    fn on(&self, kind: EventKind, listener: TransportListener) -> ListenerId {
        self.peer.on(kind, listener)
    }

    fn off(&self, id: ListenerId) -> CollabResult<()> {
        self.peer.off(id)
    }

    fn set_local_presence(&self, state: Option<PresenceState>) {
        self.peer.set_local_presence(state)
    }

    fn presence_states(&self) -> std::collections::BTreeMap<ConnectionId, PresenceState> {
        self.peer.presence_states()
    }

    fn send_update(&self, update: &[u8]) -> CollabResult<()> {
        self.peer.send_update(update)
    }

    fn destroy(&self) -> CollabResult<()> {
        if self.peer.destroy() {
            self.shutdown.send_replace(true);
        }
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.peer.is_destroyed()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        let _ = Transport::destroy(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{ParticipantId, ParticipantPresence};
    use serde_json::json;

    fn named(id: &str) -> PresenceState {
        PresenceState::with_participant(ParticipantPresence {
            id: Some(ParticipantId::Text(id.into())),
            ..Default::default()
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_newcomer_receives_seeded_content() {
        let relay = MemoryRelay::new();
        relay
            .seed("document-1", &Document::new(vec![json!({"type": "heading"}), json!({"type": "paragraph"})]))
            .unwrap();

        let replica = Arc::new(Replica::new());
        let transport = relay.transport("document-1", replica.clone(), 16);
        transport.connect().unwrap();
        settle().await;

        assert!(transport.is_synced());
        assert_eq!(transport.status(), ConnectionStatus::Connected);
        assert_eq!(replica.block_count().unwrap(), 2);
        assert_eq!(relay.peer_count("document-1"), 1);
    }

    #[tokio::test]
    async fn test_updates_fan_out_between_peers() {
        let relay = MemoryRelay::new();
        let (ra, rb) = (Arc::new(Replica::new()), Arc::new(Replica::new()));
        let a = relay.transport("r", ra.clone(), 16);
        let b = relay.transport("r", rb.clone(), 16);
        a.connect().unwrap();
        b.connect().unwrap();
        settle().await;

        let update = ra.push_block(&json!({"type": "table"})).unwrap();
        a.send_update(&update).unwrap();
        settle().await;

        assert_eq!(rb.block_count().unwrap(), 1);
        assert_eq!(relay.room_document("r").unwrap().block_count(), 1);
        assert_eq!(relay.stats("r").unwrap().updates_applied, 1);
    }

    #[tokio::test]
    async fn test_presence_is_exchanged_and_removed() {
        let relay = MemoryRelay::new();
        let a = relay.transport("r", Arc::new(Replica::new()), 16);
        a.set_local_presence(Some(named("ada")));
        a.connect().unwrap();
        settle().await;

        let b = relay.transport("r", Arc::new(Replica::new()), 16);
        b.set_local_presence(Some(named("grace")));
        b.connect().unwrap();
        settle().await;

        assert_eq!(a.presence_states().len(), 2);
        assert_eq!(b.presence_states().len(), 2);

        b.destroy().unwrap();
        settle().await;
        assert_eq!(a.presence_states().len(), 1);
        assert_eq!(relay.peer_count("r"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_peer_presence_expires() {
        let relay = MemoryRelay::new();
        let a = relay.transport("r", Arc::new(Replica::new()), 16);
        a.set_local_presence(Some(named("ada")));
        a.connect().unwrap();
        settle().await;

        // A peer that announces itself and then disappears without a goodbye.
        relay
            .room("r")
            .fan_out(SyncMessage::presence(4242, "r", &named("ghost")).unwrap());
        settle().await;
        assert!(a.presence_states().contains_key(&4242));

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(
            a.presence_states().keys().copied().collect::<Vec<_>>(),
            vec![a.connection_id()]
        );
    }

    #[tokio::test]
    async fn test_room_is_dropped_when_last_peer_leaves_empty() {
        let relay = MemoryRelay::new();
        let a = relay.transport("scratch", Arc::new(Replica::new()), 16);
        a.connect().unwrap();
        settle().await;
        assert_eq!(relay.room_count(), 1);

        a.destroy().unwrap();
        settle().await;
        assert_eq!(relay.room_count(), 0);
        assert_eq!(relay.peer_count("scratch"), 0);

        // Content keeps a room alive.
        relay.seed("kept", &Document::new(vec![json!({"type": "paragraph"})])).unwrap();
        let b = relay.transport("kept", Arc::new(Replica::new()), 16);
        b.connect().unwrap();
        settle().await;
        b.destroy().unwrap();
        settle().await;
        assert_eq!(relay.room_count(), 1);
        assert_eq!(relay.room_document("kept").unwrap().block_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_after_destroy_fails() {
        let relay = MemoryRelay::new();
        let t = relay.transport("r", Arc::new(Replica::new()), 16);
        t.destroy().unwrap();
        t.destroy().unwrap();
        assert_eq!(t.connect(), Err(CollabError::TransportDestroyed));
    }

    #[test]
    fn test_connect_needs_runtime() {
        let relay = MemoryRelay::new();
        let t = relay.transport("r", Arc::new(Replica::new()), 16);
        assert!(matches!(t.connect(), Err(CollabError::NoRuntime(_))));
    }
}
