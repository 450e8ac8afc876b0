//! # scribe-collab: Collaborative editing sync core for Scribe
//!
//! Joins a document's shared room, keeps a CRDT replica in sync with the
//! other participants, tracks who is present, and decides once per session
//! whether the host's locally loaded content or the room's content wins.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  open()   ┌───────────────┐  mailbox  ┌───────────────┐
//! │ SyncSession  │ ────────► │ SessionHandle │ ────────► │ SessionDriver │
//! │ (config)     │           │ (host side)   │           │ (one task)    │
//! └──────────────┘           └───────┬───────┘           └───────┬───────┘
//!                                    │                           │
//!                                    ▼                           ▼
//!                            ┌───────────────┐   updates ┌───────────────┐
//!                            │ Replica (yrs) │ ◄───────► │ Transport     │
//!                            └───────────────┘           │ (ws / memory) │
//!                                                        └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Session lifecycle, state machine and teardown
//! - [`reconcile`]: One-shot initial-content decision
//! - [`presence`]: Participant list with per-user dedup
//! - [`transport`]: Room connections (websocket client, in-process relay)
//! - [`protocol`]: Binary wire frames (bincode-encoded SyncMessage)
//! - [`replica`]: The replicated document

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod content;
pub mod debounce;
pub mod error;
pub mod listeners;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod replica;
pub mod retry;
pub mod room;
pub mod session;
pub mod surface;
pub mod timers;
pub mod transport;

// Re-exports for convenience
pub use config::{CollabConfig, SessionTiming, TransportConfig};
pub use content::{Document, Snapshot};
pub use error::{CollabError, CollabResult};
pub use listeners::{ListenerId, ListenerRegistry, ListenerSet};
pub use presence::{
    ColorPalette, Participant, ParticipantId, ParticipantPresence, PresenceChange,
    PresenceRegistry, PresenceState, PresenceSummary, UserIdentity,
};
pub use protocol::{ConnectionId, MessageType, SyncMessage};
pub use reconcile::{ContentReconciler, Decision, ImposeReason, StalenessRule};
pub use replica::Replica;
pub use retry::{poll_until, BoundedRetry, RetryOutcome};
pub use room::{BaseUrlResolver, EndpointResolver, RoomId};
pub use session::{
    Collaboration, GuardedTransport, SessionHandle, SessionOptions, SessionState, SurfaceHook,
    SyncSession,
};
pub use surface::{BufferSurface, EditorSurface};
pub use timers::TimerRegistry;
pub use transport::{
    ConnectionStatus, EventKind, MemoryRelay, Transport, TransportConnector, TransportEvent,
    WebSocketConnector,
};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
