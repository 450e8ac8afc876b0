//! Client side of the sync protocol, independent of the link.
//!
//! A link (websocket, in-process relay) calls [`PeerState::attach`] once
//! frames can flow, feeds every inbound frame to [`PeerState::handle`], and
//! calls [`PeerState::detach`] when the link drops. The handshake, replica
//! integration and presence bookkeeping all live here.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;

use super::queue::OfflineQueue;
use super::{ConnectionStatus, EventKind, TransportEvent, TransportListener};
use crate::error::{CollabError, CollabResult};
use crate::listeners::{ListenerId, ListenerSet};
use crate::lock;
use crate::presence::{PresenceChange, PresenceState};
use crate::protocol::{new_connection_id, ConnectionId, MessageType, SyncMessage};
use crate::replica::Replica;

/// Outbound half of a live link.
pub type Outbox = UnboundedSender<SyncMessage>;

/// A remote participant's last announcement.
struct RemotePresence {
    state: PresenceState,
    last_seen: Instant,
}

pub struct PeerState {
    room: String,
    connection_id: ConnectionId,
    replica: Arc<Replica>,
    status: Mutex<ConnectionStatus>,
    synced: AtomicBool,
    destroyed: AtomicBool,
    clock: AtomicU64,
    listeners: ListenerSet<TransportEvent>,
    local_presence: Mutex<Option<PresenceState>>,
    remote_presence: Mutex<BTreeMap<ConnectionId, RemotePresence>>,
    queue: Mutex<OfflineQueue>,
    outbox: Mutex<Option<Outbox>>,
}

impl PeerState {
    pub fn new(room: &str, replica: Arc<Replica>, queue_capacity: usize) -> Self {
        Self {
            room: room.to_string(),
            connection_id: new_connection_id(),
            replica,
            status: Mutex::new(ConnectionStatus::Disconnected),
            synced: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            clock: AtomicU64::new(0),
            listeners: ListenerSet::new(),
            local_presence: Mutex::new(None),
            remote_presence: Mutex::new(BTreeMap::new()),
            queue: Mutex::new(OfflineQueue::new(queue_capacity)),
            outbox: Mutex::new(None),
        }
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    // ─── Link lifecycle ─────────────────────────────────────────────

    pub fn status(&self) -> ConnectionStatus {
        *lock(&self.status)
    }

    /// Record a status change; listeners hear about actual changes only.
    pub fn set_status(&self, status: ConnectionStatus) {
        let changed = {
            let mut current = lock(&self.status);
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            log::debug!("[{}] {} -> {:?}", self.room, self.connection_id, status);
            self.listeners.emit(&TransportEvent::Status(status));
        }
    }

    /// The link is up: run the handshake and report `Connected`.
    ///
    /// Handshake: our state vector, a presence query, our own presence,
    /// then every update queued while offline.
    pub fn attach(&self, outbox: Outbox) {
        if self.is_destroyed() {
            return;
        }
        *lock(&self.outbox) = Some(outbox);

        match self.replica.state_vector() {
            Ok(sv) => {
                self.send(SyncMessage::sync_step1(self.connection_id, &self.room, sv));
            }
            Err(e) => log::warn!("[{}] Cannot start sync: {e}", self.room),
        }
        self.send(SyncMessage::presence_query(self.connection_id, &self.room));
        self.announce();

        let queued = lock(&self.queue).drain();
        if !queued.is_empty() {
            log::info!("[{}] Replaying {} queued updates", self.room, queued.len());
        }
        for (clock, payload) in queued {
            self.send(SyncMessage::update(self.connection_id, &self.room, clock, payload));
        }

        self.set_status(ConnectionStatus::Connected);
    }

    /// The link dropped: forget remote presence and sync status.
    pub fn detach(&self) {
        *lock(&self.outbox) = None;

        if self.synced.swap(false, Ordering::SeqCst) {
            self.listeners.emit(&TransportEvent::Synced(false));
        }

        let gone: Vec<ConnectionId> = {
            let mut remote = lock(&self.remote_presence);
            let gone = remote.keys().copied().collect();
            remote.clear();
            gone
        };
        if !gone.is_empty() {
            self.listeners
                .emit(&TransportEvent::PresenceChanged(PresenceChange::remove(gone)));
        }

        self.set_status(ConnectionStatus::Disconnected);
    }

    // ─── Inbound ────────────────────────────────────────────────────

    /// Process one inbound frame. Frames carrying our own connection id
    /// are ignored.
    pub fn handle(&self, msg: SyncMessage) {
        if msg.connection_id == self.connection_id || self.is_destroyed() {
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => match self.replica.encode_diff(&msg.payload) {
                Ok(diff) => {
                    self.send(SyncMessage::sync_step2(self.connection_id, &self.room, diff));
                }
                Err(e) => log::debug!("[{}] Bad state vector: {e}", self.room),
            },
            MessageType::SyncStep2 => {
                if let Err(e) = self.replica.apply_remote_update(&msg.payload) {
                    log::warn!("[{}] Rejected sync diff: {e}", self.room);
                    return;
                }
                if !self.synced.swap(true, Ordering::SeqCst) {
                    log::info!("[{}] Replica synced", self.room);
                    self.listeners.emit(&TransportEvent::Synced(true));
                }
            }
            MessageType::Update => {
                if let Err(e) = self.replica.apply_remote_update(&msg.payload) {
                    log::warn!("[{}] Rejected update from {}: {e}", self.room, msg.connection_id);
                }
            }
            MessageType::Presence => match msg.presence_state() {
                Ok(state) => {
                    let previous = lock(&self.remote_presence).insert(
                        msg.connection_id,
                        RemotePresence {
                            state: state.clone(),
                            last_seen: Instant::now(),
                        },
                    );
                    let first_seen = previous.is_none();
                    // Renewals keep the entry alive but are not a change.
                    if previous.map(|p| p.state) != Some(state.clone()) {
                        self.listeners.emit(&TransportEvent::PresenceChanged(
                            PresenceChange::upsert(msg.connection_id, state),
                        ));
                    }
                    // Newcomers learn about us without waiting for a renewal.
                    if first_seen {
                        self.announce();
                    }
                }
                Err(e) => log::debug!("[{}] Bad presence from {}: {e}", self.room, msg.connection_id),
            },
            MessageType::PresenceQuery => self.announce(),
            MessageType::PresenceRemoved => {
                let removed = lock(&self.remote_presence).remove(&msg.connection_id).is_some();
                if removed {
                    self.listeners.emit(&TransportEvent::PresenceChanged(
                        PresenceChange::remove(vec![msg.connection_id]),
                    ));
                }
            }
            MessageType::Ping => {
                self.send(SyncMessage::pong(self.connection_id, &self.room));
            }
            MessageType::Pong => {}
        }
    }

    // ─── Outbound ───────────────────────────────────────────────────

    fn try_send(&self, msg: SyncMessage) -> Result<(), SyncMessage> {
        match lock(&self.outbox).as_ref() {
            Some(tx) => tx.send(msg).map_err(|e| e.0),
            None => Err(msg),
        }
    }

    fn send(&self, msg: SyncMessage) -> bool {
        self.try_send(msg).is_ok()
    }

    /// Send our presence to the room, if we have any and are linked.
    fn announce(&self) {
        let Some(state) = lock(&self.local_presence).clone() else {
            return;
        };
        match SyncMessage::presence(self.connection_id, &self.room, &state) {
            Ok(msg) => {
                self.send(msg);
            }
            Err(e) => log::warn!("[{}] Cannot encode presence: {e}", self.room),
        }
    }

    pub fn set_local_presence(&self, state: Option<PresenceState>) {
        if self.is_destroyed() {
            return;
        }
        let previous = std::mem::replace(&mut *lock(&self.local_presence), state.clone());
        match state {
            Some(state) => {
                if previous.as_ref() != Some(&state) {
                    self.listeners.emit(&TransportEvent::PresenceChanged(
                        PresenceChange::upsert(self.connection_id, state),
                    ));
                }
                self.announce();
            }
            None => {
                if previous.is_some() {
                    self.listeners.emit(&TransportEvent::PresenceChanged(
                        PresenceChange::remove(vec![self.connection_id]),
                    ));
                }
                self.send(SyncMessage::presence_removed(self.connection_id, &self.room));
            }
        }
    }

    /// Forget remote participants not heard from within `timeout`.
    /// Returns the connections dropped.
    pub fn expire_presence(&self, timeout: Duration) -> Vec<ConnectionId> {
        let now = Instant::now();
        let expired: Vec<ConnectionId> = {
            let mut remote = lock(&self.remote_presence);
            let expired: Vec<ConnectionId> = remote
                .iter()
                .filter(|(_, p)| now.duration_since(p.last_seen) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            for id in &expired {
                remote.remove(id);
            }
            expired
        };
        if !expired.is_empty() {
            log::debug!("[{}] Presence expired for {:?}", self.room, expired);
            self.listeners
                .emit(&TransportEvent::PresenceChanged(PresenceChange::remove(expired.clone())));
        }
        expired
    }

    pub fn presence_states(&self) -> BTreeMap<ConnectionId, PresenceState> {
        let mut states: BTreeMap<ConnectionId, PresenceState> = lock(&self.remote_presence)
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect();
        if let Some(local) = lock(&self.local_presence).clone() {
            states.insert(self.connection_id, local);
        }
        states
    }

    /// Send a local update, or queue it while the link is down.
    pub fn send_update(&self, update: &[u8]) -> CollabResult<()> {
        if self.is_destroyed() {
            return Err(CollabError::TransportDestroyed);
        }
        let clock = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        let msg = SyncMessage::update(self.connection_id, &self.room, clock, update.to_vec());
        match self.try_send(msg) {
            Ok(()) => Ok(()),
            Err(msg) => {
                let mut queue = lock(&self.queue);
                if queue.enqueue(msg.clock, msg.payload) {
                    Ok(())
                } else {
                    Err(CollabError::QueueFull(queue.capacity()))
                }
            }
        }
    }

    pub fn queued_updates(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    // ─── Listeners & teardown ───────────────────────────────────────

    pub fn on(&self, kind: EventKind, listener: TransportListener) -> ListenerId {
        self.listeners.add(move |event: &TransportEvent| {
            if event.kind() == kind {
                listener(event);
            }
        })
    }

    pub fn off(&self, id: ListenerId) -> CollabResult<()> {
        if self.listeners.remove(id) {
            Ok(())
        } else {
            Err(CollabError::UnknownListener(id))
        }
    }

    /// Say goodbye to the room and go quiet. Returns `false` if already
    /// destroyed.
    pub fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.send(SyncMessage::presence_removed(self.connection_id, &self.room));
        self.listeners.clear();
        *lock(&self.local_presence) = None;
        lock(&self.queue).clear();
        true
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::Document;
    use crate::presence::{ParticipantId, ParticipantPresence};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn peer() -> PeerState {
        PeerState::new("document-1", Arc::new(Replica::new()), 16)
    }

    fn recorder(peer: &PeerState, kind: EventKind) -> Arc<Mutex<Vec<TransportEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        peer.on(kind, Box::new(move |ev| e.lock().unwrap().push(ev.clone())));
        events
    }

    fn ada() -> PresenceState {
        PresenceState::with_participant(ParticipantPresence {
            id: Some(ParticipantId::Text("ada".into())),
            display_name: Some("Ada".into()),
            color: Some("#3b82f6".into()),
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> Vec<SyncMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_handshake_order() {
        let peer = peer();
        let statuses = recorder(&peer, EventKind::Status);
        peer.set_local_presence(Some(ada()));
        peer.send_update(&[1, 2, 3]).unwrap();
        assert_eq!(peer.queued_updates(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.attach(tx);

        let types: Vec<MessageType> = drain(&mut rx).iter().map(|m| m.msg_type).collect();
        assert_eq!(
            types,
            vec![
                MessageType::SyncStep1,
                MessageType::PresenceQuery,
                MessageType::Presence,
                MessageType::Update
            ]
        );
        assert_eq!(peer.queued_updates(), 0);
        assert_eq!(
            *statuses.lock().unwrap(),
            vec![TransportEvent::Status(ConnectionStatus::Connected)]
        );
    }

    #[test]
    fn test_sync_step2_marks_synced_once() {
        let peer = peer();
        let synced = recorder(&peer, EventKind::Synced);

        let remote = Replica::new();
        let diff = remote
            .replace_document(&Document::new(vec![json!({"type": "heading"})]))
            .unwrap();

        peer.handle(SyncMessage::sync_step2(0, "document-1", diff.clone()));
        peer.handle(SyncMessage::sync_step2(0, "document-1", diff));

        assert!(peer.is_synced());
        assert_eq!(*synced.lock().unwrap(), vec![TransportEvent::Synced(true)]);
        assert_eq!(peer.replica().block_count().unwrap(), 1);

        peer.detach();
        assert!(!peer.is_synced());
        assert_eq!(synced.lock().unwrap().last(), Some(&TransportEvent::Synced(false)));
    }

    #[test]
    fn test_first_seen_presence_is_answered() {
        let peer = peer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.set_local_presence(Some(ada()));
        peer.attach(tx);
        drain(&mut rx);

        let other = SyncMessage::presence(77, "document-1", &PresenceState::default()).unwrap();
        peer.handle(other.clone());
        let replies = drain(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].msg_type, MessageType::Presence);

        // Known connection: no reply.
        peer.handle(other);
        assert!(drain(&mut rx).is_empty());

        assert_eq!(peer.presence_states().len(), 2);
        peer.handle(SyncMessage::presence_removed(77, "document-1"));
        assert_eq!(peer.presence_states().len(), 1);
    }

    #[test]
    fn test_unchanged_presence_renewal_is_silent() {
        let peer = peer();
        let events = recorder(&peer, EventKind::Presence);
        let renewal = SyncMessage::presence(9, "document-1", &ada()).unwrap();
        peer.handle(renewal.clone());
        peer.handle(renewal);
        assert_eq!(events.lock().unwrap().len(), 1);

        let mut renamed = ada();
        if let Some(user) = renamed.participant.as_mut() {
            user.display_name = Some("Ada L.".into());
        }
        peer.handle(SyncMessage::presence(9, "document-1", &renamed).unwrap());
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_participants_expire() {
        let peer = peer();
        peer.handle(SyncMessage::presence(4242, "document-1", &ada()).unwrap());
        tokio::time::advance(Duration::from_secs(20)).await;
        peer.handle(SyncMessage::presence(7, "document-1", &PresenceState::default()).unwrap());

        let events = recorder(&peer, EventKind::Presence);
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(peer.expire_presence(Duration::from_secs(30)), vec![4242]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![TransportEvent::PresenceChanged(PresenceChange::remove(vec![4242]))]
        );
        assert_eq!(peer.presence_states().keys().copied().collect::<Vec<_>>(), vec![7]);

        // Nothing left to expire yet.
        assert!(peer.expire_presence(Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn test_own_frames_are_ignored() {
        let peer = peer();
        let events = recorder(&peer, EventKind::Presence);
        let own = SyncMessage::presence(peer.connection_id(), "document-1", &ada()).unwrap();
        peer.handle(own);
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_disconnect_forgets_remote_presence() {
        let peer = peer();
        let (tx, _rx) = mpsc::unbounded_channel();
        peer.attach(tx);
        peer.handle(SyncMessage::presence(5, "document-1", &ada()).unwrap());

        let events = recorder(&peer, EventKind::Presence);
        peer.detach();
        assert_eq!(
            *events.lock().unwrap(),
            vec![TransportEvent::PresenceChanged(PresenceChange::remove(vec![5]))]
        );
        assert_eq!(peer.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_destroy_is_final() {
        let peer = peer();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.attach(tx);
        drain(&mut rx);

        assert!(peer.destroy());
        assert!(!peer.destroy());
        let sent = drain(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type, MessageType::PresenceRemoved);
        assert_eq!(peer.send_update(&[1]), Err(CollabError::TransportDestroyed));
    }

    #[test]
    fn test_queue_full_is_reported() {
        let peer = PeerState::new("r", Arc::new(Replica::new()), 1);
        peer.send_update(&[1]).unwrap();
        assert_eq!(peer.send_update(&[2]), Err(CollabError::QueueFull(1)));
    }
}
