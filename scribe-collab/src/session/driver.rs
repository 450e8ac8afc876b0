//! The session's single-writer event loop.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use super::{PresenceCountCallback, PresenceListCallback, SessionEvent, SessionShared};
use crate::config::SessionTiming;
use crate::content::{self, Snapshot};
use crate::presence::{PresenceRegistry, PresenceState};
use crate::reconcile::{ContentReconciler, Decision, Latch};
use crate::retry::{BoundedRetry, RetryStep};
use crate::surface::EditorSurface;
use crate::timers::TimerId;
use crate::transport::{ConnectionStatus, TransportEvent};

/// Everything that can happen to a session.
#[derive(Clone)]
pub(crate) enum SessionCommand {
    Transport(TransportEvent),
    AttachSurface(Arc<dyn EditorSurface>),
    DetachSurface,
    /// Surface wait interval elapsed.
    SurfaceRetry,
    /// Settle delay after seeing the surface elapsed.
    Settled,
    /// Report presence to the host.
    FlushPresence,
    RenewPresence,
    Shutdown,
}

pub(super) struct SessionDriver {
    pub(super) shared: Arc<SessionShared>,
    pub(super) reconciler: ContentReconciler,
    pub(super) registry: PresenceRegistry,
    pub(super) surface: Option<Arc<dyn EditorSurface>>,
    pub(super) surface_wait: BoundedRetry,
    pub(super) retry_timer: Option<TimerId>,
    pub(super) settle_timer: Option<TimerId>,
    pub(super) local_presence: PresenceState,
    pub(super) timing: SessionTiming,
    pub(super) on_presence_count: Option<PresenceCountCallback>,
    pub(super) on_presence_list: Option<PresenceListCallback>,
}

impl SessionDriver {
    pub(super) async fn run(mut self, mut inbox: UnboundedReceiver<SessionCommand>) {
        while let Some(command) = inbox.recv().await {
            if self.shared.is_cleaned() {
                break;
            }
            match command {
                SessionCommand::Transport(event) => self.on_transport(event),
                SessionCommand::AttachSurface(surface) => self.on_attach(surface),
                SessionCommand::DetachSurface => {
                    log::debug!("[{}] Surface detached", self.shared.room);
                    self.surface = None;
                }
                SessionCommand::SurfaceRetry => {
                    self.retry_timer = None;
                    if self.reconciler.latch() == Latch::Started {
                        self.await_surface();
                    }
                }
                SessionCommand::Settled => self.on_settled(),
                SessionCommand::FlushPresence => self.flush_presence(),
                SessionCommand::RenewPresence => {
                    if self.shared.transport.status() == ConnectionStatus::Connected {
                        self.publish_presence();
                    }
                }
                SessionCommand::Shutdown => break,
            }
        }
        log::debug!("[{}] Session driver stopped", self.shared.room);
    }

    // ─── Transport ──────────────────────────────────────────────────

    fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Status(ConnectionStatus::Connecting) => {
                self.shared.transition(SessionEvent::Connect);
            }
            TransportEvent::Status(ConnectionStatus::Connected) => {
                log::info!("[{}] Connected", self.shared.room);
                self.shared.transition(SessionEvent::Connected);
                self.publish_presence();
            }
            TransportEvent::Status(ConnectionStatus::Disconnected) => {
                log::info!("[{}] Disconnected", self.shared.room);
                self.shared.transition(SessionEvent::Disconnected);
            }
            TransportEvent::Synced(true) => self.on_synced(),
            TransportEvent::Synced(false) => {}
            TransportEvent::PresenceChanged(change) => {
                self.registry.apply(&change);
                self.shared.debouncer.run();
            }
        }
    }

    fn on_synced(&mut self) {
        match self.reconciler.latch() {
            Latch::Idle => {
                self.shared.transition(SessionEvent::FirstSync);
                if self.reconciler.begin() {
                    self.await_surface();
                } else {
                    log::debug!("[{}] No initial content, keeping replica", self.shared.room);
                    self.shared.transition(SessionEvent::Reconciled);
                }
            }
            // Reconnected while a decision is still pending; its timers
            // carry on.
            Latch::Started => {
                self.shared.transition(SessionEvent::FirstSync);
            }
            Latch::Done => {
                self.shared.transition(SessionEvent::Resync);
            }
        }
    }

    fn publish_presence(&self) {
        self.shared
            .transport
            .set_local_presence(Some(self.local_presence.clone()));
    }

    fn flush_presence(&self) {
        let summary = self.registry.summary();
        log::debug!("[{}] {} participant(s) present", self.shared.room, summary.count);
        if let Some(callback) = &self.on_presence_count {
            callback(summary.count);
        }
        if let Some(callback) = &self.on_presence_list {
            callback(&summary.participants);
        }
    }

    // ─── Surface & reconciliation ───────────────────────────────────

    fn on_attach(&mut self, surface: Arc<dyn EditorSurface>) {
        log::debug!("[{}] Surface attached", self.shared.room);
        self.surface = Some(surface);
        if self.reconciler.latch() != Latch::Started {
            return;
        }
        if let Some(id) = self.retry_timer.take() {
            self.shared.timers.cancel(id);
        }
        self.await_surface();
    }

    /// Wait for a surface: settle if one is attached, otherwise spend one
    /// retry, otherwise give up.
    fn await_surface(&mut self) {
        if self.retry_timer.is_some() || self.settle_timer.is_some() {
            return;
        }
        if self.surface.is_some() {
            self.settle_timer = Some(
                self.shared
                    .schedule(self.timing.settle_delay, SessionCommand::Settled),
            );
            return;
        }
        match self.surface_wait.next_step() {
            RetryStep::Wait(delay) => {
                self.retry_timer = Some(self.shared.schedule(delay, SessionCommand::SurfaceRetry));
            }
            RetryStep::Exhausted => {
                log::warn!(
                    "[{}] No editing surface after {} attempts, keeping replicated content",
                    self.shared.room,
                    self.surface_wait.attempts()
                );
                self.reconciler.abandon();
                self.shared.transition(SessionEvent::Reconciled);
            }
        }
    }

    fn on_settled(&mut self) {
        self.settle_timer = None;
        if self.reconciler.latch() != Latch::Started {
            return;
        }
        // Detached during the settle delay: back to waiting.
        let Some(surface) = self.surface.clone() else {
            self.await_surface();
            return;
        };
        self.reconcile(surface.as_ref());
    }

    fn reconcile(&mut self, surface: &dyn EditorSurface) {
        let room = &self.shared.room;
        let replica_doc = match self.shared.replica.document() {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("[{room}] Cannot read replica for reconciliation: {e}");
                self.reconciler.abandon();
                self.shared.transition(SessionEvent::Reconciled);
                return;
            }
        };
        let participants = self.registry.summary().count;

        match self.reconciler.run(&replica_doc, participants) {
            Some(Decision::ImposeInitial(reason)) => {
                log::info!("[{room}] Using initial content ({reason:?})");
                self.impose(surface);
            }
            Some(Decision::KeepReplica) => {
                log::info!(
                    "[{room}] Keeping replicated content ({} blocks, {participants} participants)",
                    replica_doc.block_count()
                );
            }
            None => return,
        }
        self.shared.transition(SessionEvent::Reconciled);
    }

    fn impose(&self, surface: &dyn EditorSurface) {
        let room = &self.shared.room;
        let Some(initial) = self.reconciler.initial_snapshot() else {
            return;
        };

        let document = match initial {
            Snapshot::Document(doc) => {
                surface.set_content(Snapshot::Document(doc.clone()));
                doc
            }
            Snapshot::Markup(markup) => {
                surface.set_content(Snapshot::Markup(markup));
                match surface.get_content() {
                    Snapshot::Document(parsed) => match content::normalize(&parsed.to_value()) {
                        Snapshot::Document(doc) => doc,
                        Snapshot::Markup(_) => return,
                    },
                    Snapshot::Markup(_) => {
                        log::warn!("[{room}] Surface kept markup unparsed, replica left as is");
                        return;
                    }
                }
            }
        };

        if let Err(e) = self.shared.replica.replace_document(&document) {
            log::warn!("[{room}] Could not write initial content to replica: {e}");
        }
    }
}
