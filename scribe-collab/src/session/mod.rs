//! Sync sessions: one per open document.
//!
//! ```text
//!  transport events ─┐
//!  timer expiries  ──┼──► mailbox ──► SessionDriver (single writer)
//!  surface attach  ──┘                   │
//!                                        ├─► ContentReconciler (once)
//!                                        ├─► PresenceRegistry ─► debounced callbacks
//!                                        └─► SessionState (watch channel)
//! ```
//!
//! Every asynchronous input becomes a [`driver::SessionCommand`], so the
//! session's mutable state is touched by the driver task only. Everything
//! the session subscribes to or schedules is tracked in a
//! [`ListenerRegistry`] or [`TimerRegistry`] and released by teardown.

mod controller;
mod driver;
mod handle;
mod state;

pub use controller::Collaboration;
pub use handle::{GuardedTransport, SessionHandle, SurfaceHook};
pub use state::{SessionEvent, SessionState};

use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};

use crate::config::CollabConfig;
use crate::debounce::Debouncer;
use crate::error::{CollabError, CollabResult};
use crate::listeners::ListenerRegistry;
use crate::presence::{
    Participant, ParticipantPresence, PresenceRegistry, PresenceState, UserIdentity,
};
use crate::reconcile::ContentReconciler;
use crate::replica::Replica;
use crate::retry::BoundedRetry;
use crate::room::{normalize_ws_url, BaseUrlResolver, EndpointResolver, RoomId};
use crate::timers::TimerRegistry;
use crate::transport::{EventKind, Transport, TransportConnector, WebSocketConnector};
use driver::{SessionCommand, SessionDriver};

pub type IdentityProvider = Box<dyn Fn() -> UserIdentity + Send + Sync>;
pub type PresenceCountCallback = Box<dyn Fn(usize) + Send + Sync>;
pub type PresenceListCallback = Box<dyn Fn(&[Participant]) + Send + Sync>;

/// Per-document inputs to [`SyncSession::open`].
#[derive(Default)]
pub struct SessionOptions {
    pub readonly: bool,
    pub initial_content: Option<Value>,
    pub identity: Option<IdentityProvider>,
    pub on_presence_count: Option<PresenceCountCallback>,
    pub on_presence_list: Option<PresenceListCallback>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn initial_content(mut self, content: Value) -> Self {
        self.initial_content = Some(content);
        self
    }

    pub fn identity(self, identity: UserIdentity) -> Self {
        self.identity_provider(move || identity.clone())
    }

    pub fn identity_provider(mut self, provider: impl Fn() -> UserIdentity + Send + Sync + 'static) -> Self {
        self.identity = Some(Box::new(provider));
        self
    }

    pub fn on_presence_count(mut self, callback: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_presence_count = Some(Box::new(callback));
        self
    }

    pub fn on_presence_list(
        mut self,
        callback: impl Fn(&[Participant]) + Send + Sync + 'static,
    ) -> Self {
        self.on_presence_list = Some(Box::new(callback));
        self
    }
}

/// Opens sessions. Holds the configuration and the two collaborators
/// that decide where (resolver) and how (connector) to connect.
pub struct SyncSession {
    config: CollabConfig,
    resolver: Arc<dyn EndpointResolver>,
    connector: Arc<dyn TransportConnector>,
}

impl SyncSession {
    /// Websocket sessions against `config.endpoint`.
    pub fn new(config: CollabConfig) -> Self {
        let resolver = Arc::new(BaseUrlResolver::new(config.endpoint.clone()));
        Self {
            config,
            resolver,
            connector: Arc::new(WebSocketConnector),
        }
    }

    pub fn with_resolver(mut self, resolver: impl EndpointResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_connector(mut self, connector: impl TransportConnector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    /// Open a session for `document_id`.
    ///
    /// Returns `None` when collaboration does not apply (no document,
    /// read-only, no endpoint) or could not be started; the host then
    /// keeps editing locally. Never panics.
    pub fn open(&self, document_id: Option<&str>, options: SessionOptions) -> Option<SessionHandle> {
        let document_id = document_id.map(str::trim).filter(|id| !id.is_empty());
        let Some(document_id) = document_id.filter(|_| !options.readonly) else {
            log::info!(
                "Collaboration not enabled (readonly: {}, document id: {})",
                options.readonly,
                document_id.is_some()
            );
            return None;
        };

        let Some(raw) = self.resolver.resolve(document_id) else {
            log::info!("No collaboration endpoint for document {document_id}");
            return None;
        };
        let Some(endpoint) = normalize_ws_url(&raw, self.config.origin.as_deref()) else {
            log::info!("Collaboration endpoint {raw:?} is unusable for document {document_id}");
            return None;
        };

        match self.start(document_id, &endpoint, options) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!("Failed to start collaboration for document {document_id}: {e}");
                None
            }
        }
    }

    fn start(
        &self,
        document_id: &str,
        endpoint: &str,
        options: SessionOptions,
    ) -> CollabResult<SessionHandle> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|e| CollabError::NoRuntime(e.to_string()))?;
        let timing = self.config.timing.clone();

        let room = RoomId::for_document(&self.config.room_prefix, document_id);
        let replica = Arc::new(Replica::new());
        let transport = self
            .connector
            .create(endpoint, &room, replica.clone(), &self.config.transport)?;

        let (mailbox, inbox) = mpsc::unbounded_channel();
        let debouncer = {
            let tx = mailbox.clone();
            Debouncer::new(timing.presence_debounce, move || {
                let _ = tx.send(SessionCommand::FlushPresence);
            })
        };
        let shared = Arc::new(SessionShared {
            room: room.clone(),
            replica: replica.clone(),
            transport: transport.clone(),
            timers: TimerRegistry::new(),
            listeners: ListenerRegistry::new(),
            debouncer,
            state: watch::channel(SessionState::Disconnected).0,
            mailbox: mailbox.clone(),
            cleaned: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });

        // Every listener is in place before the transport starts.
        for kind in [EventKind::Status, EventKind::Synced, EventKind::Presence] {
            let tx = mailbox.clone();
            let id = transport.on(
                kind,
                Box::new(move |event| {
                    let _ = tx.send(SessionCommand::Transport(event.clone()));
                }),
            );
            let t = transport.clone();
            shared.listeners.track(kind_label(kind), move || t.off(id));
        }
        {
            let weak: Weak<dyn Transport> = Arc::downgrade(&transport);
            let id = replica.on_update(move |update| {
                if let Some(transport) = weak.upgrade() {
                    if let Err(e) = transport.send_update(update) {
                        log::debug!("Local update not forwarded: {e}");
                    }
                }
            });
            let r = replica.clone();
            shared.listeners.track("replica update", move || r.off_update(id));
        }

        let palette = self.config.color_palette();
        let identity = options.identity.as_ref().map(|f| f()).unwrap_or_default();
        let local_presence = PresenceState::with_participant(ParticipantPresence {
            id: Some(identity.id),
            display_name: Some(identity.name),
            color: Some(palette.pick().to_string()),
        });

        let driver = SessionDriver {
            shared: shared.clone(),
            reconciler: ContentReconciler::new(options.initial_content, self.config.staleness),
            registry: PresenceRegistry::new(palette),
            surface: None,
            surface_wait: BoundedRetry::new(timing.surface_wait_attempts, timing.surface_wait_interval),
            retry_timer: None,
            settle_timer: None,
            local_presence,
            timing: timing.clone(),
            on_presence_count: options.on_presence_count,
            on_presence_list: options.on_presence_list,
        };
        runtime.spawn(driver.run(inbox));

        // Local presence is published by the driver once connected.
        shared.transition(SessionEvent::Connect);
        if let Err(e) = transport.connect() {
            shared.destroy();
            return Err(e);
        }

        shared.schedule(timing.initial_presence_delay, SessionCommand::FlushPresence);
        shared.schedule_repeating(timing.presence_renew_interval, SessionCommand::RenewPresence);

        log::info!("Collaboration session started for room {room}");
        Ok(SessionHandle::new(shared))
    }
}

fn kind_label(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Status => "status",
        EventKind::Synced => "sync",
        EventKind::Presence => "presence",
    }
}

/// State shared by the handle, the driver and the guarded transport.
pub(crate) struct SessionShared {
    room: RoomId,
    replica: Arc<Replica>,
    transport: Arc<dyn Transport>,
    timers: TimerRegistry,
    listeners: ListenerRegistry,
    debouncer: Debouncer,
    state: watch::Sender<SessionState>,
    mailbox: mpsc::UnboundedSender<SessionCommand>,
    cleaned: AtomicBool,
    destroyed: AtomicBool,
}

impl SessionShared {
    /// Apply a state-machine event. Returns whether the state changed.
    pub(crate) fn transition(&self, event: SessionEvent) -> bool {
        let mut moved = None;
        self.state.send_if_modified(|state| match state.on(event) {
            Some(next) if next != *state => {
                moved = Some((*state, next));
                *state = next;
                true
            }
            _ => false,
        });
        if let Some((from, to)) = moved {
            log::debug!("[{}] {from} -> {to} ({event:?})", self.room);
        }
        moved.is_some()
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn schedule(&self, delay: std::time::Duration, command: SessionCommand) -> crate::timers::TimerId {
        let tx = self.mailbox.clone();
        self.timers.schedule(delay, move || {
            let _ = tx.send(command);
        })
    }

    fn schedule_repeating(
        &self,
        period: std::time::Duration,
        command: SessionCommand,
    ) -> crate::timers::TimerId {
        let tx = self.mailbox.clone();
        self.timers.schedule_repeating(period, move || {
            let _ = tx.send(command.clone());
        })
    }

    pub(crate) fn is_cleaned(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst)
    }

    /// Stop every timer, listener and pending notification, and stop the
    /// driver. Runs once.
    pub(crate) fn cleanup(&self) {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return;
        }
        self.debouncer.cancel();
        let timers = self.timers.clear_all();
        let listeners = self.listeners.remove_all();
        let _ = self.mailbox.send(SessionCommand::Shutdown);
        log::debug!(
            "[{}] Cleaned up {} timeouts, {} intervals, {} listeners",
            self.room,
            timers.timeouts,
            timers.intervals,
            listeners
        );
    }

    /// Full teardown. Idempotent; safe after the transport was destroyed
    /// on its own.
    pub(crate) fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cleanup();
        self.transition(SessionEvent::Destroy);
        if let Err(e) = self.transport.destroy() {
            log::debug!("[{}] Ignoring transport teardown failure: {e}", self.room);
        }
        self.replica.release();
        log::info!("Collaboration session for room {} destroyed", self.room);
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}
