use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

use super::driver::SessionCommand;
use super::{SessionShared, SessionState};
use crate::error::CollabResult;
use crate::listeners::ListenerId;
use crate::presence::PresenceState;
use crate::protocol::ConnectionId;
use crate::replica::Replica;
use crate::room::RoomId;
use crate::surface::EditorSurface;
use crate::transport::{ConnectionStatus, EventKind, Transport, TransportListener};

/// What the host holds for an open session. Dropping it destroys the
/// session.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    transport: Arc<dyn Transport>,
}

impl SessionHandle {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(GuardedTransport {
            inner: shared.transport.clone(),
            session: Arc::downgrade(&shared),
        });
        Self { shared, transport }
    }

    pub fn room(&self) -> &RoomId {
        &self.shared.room
    }

    /// The replica the host binds its surface to.
    pub fn replica(&self) -> Arc<Replica> {
        self.shared.replica.clone()
    }

    /// The transport, for cursor/awareness features. Destroying it
    /// through this handle tears the session down first.
    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.watch_state();
        // The watch guard borrows `rx` and must be dropped first.
        let state = match rx.wait_for(predicate).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// The surface is ready; reconciliation may proceed.
    pub fn attach_editor(&self, surface: Arc<dyn EditorSurface>) {
        self.surface_hook().ready(surface);
    }

    pub fn detach_editor(&self) {
        self.surface_hook().detach();
    }

    /// Something the surface's own creation callback can hold on to.
    pub fn surface_hook(&self) -> SurfaceHook {
        SurfaceHook {
            mailbox: self.shared.mailbox.clone(),
        }
    }

    /// Tear everything down. Idempotent.
    pub fn destroy(&self) {
        self.shared.destroy();
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_destroyed()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.destroy();
    }
}

/// Reports surface readiness to a session.
#[derive(Clone)]
pub struct SurfaceHook {
    mailbox: mpsc::UnboundedSender<SessionCommand>,
}

impl SurfaceHook {
    pub fn ready(&self, surface: Arc<dyn EditorSurface>) {
        if self.mailbox.send(SessionCommand::AttachSurface(surface)).is_err() {
            log::debug!("Surface ready after session shutdown");
        }
    }

    pub fn detach(&self) {
        let _ = self.mailbox.send(SessionCommand::DetachSurface);
    }
}

/// The session's transport as handed to the host. `destroy` cleans up the
/// session's timers and listeners before the transport goes away.
pub struct GuardedTransport {
    inner: Arc<dyn Transport>,
    session: Weak<SessionShared>,
}

impl Transport for GuardedTransport {
    fn room(&self) -> &str {
        self.inner.room()
    }

    fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id()
    }

    fn connect(&self) -> CollabResult<()> {
        self.inner.connect()
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    fn is_synced(&self) -> bool {
        self.inner.is_synced()
    }

    fn on(&self, kind: EventKind, listener: TransportListener) -> ListenerId {
        self.inner.on(kind, listener)
    }

    fn off(&self, id: ListenerId) -> CollabResult<()> {
        self.inner.off(id)
    }

    fn set_local_presence(&self, state: Option<PresenceState>) {
        self.inner.set_local_presence(state)
    }

    fn presence_states(&self) -> BTreeMap<ConnectionId, PresenceState> {
        self.inner.presence_states()
    }

    fn send_update(&self, update: &[u8]) -> CollabResult<()> {
        self.inner.send_update(update)
    }

    fn destroy(&self) -> CollabResult<()> {
        if let Some(session) = self.session.upgrade() {
            session.cleanup();
        }
        self.inner.destroy()
    }

    fn is_destroyed(&self) -> bool {
        self.inner.is_destroyed()
    }
}
