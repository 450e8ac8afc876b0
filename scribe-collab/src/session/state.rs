//! Session lifecycle state machine.
//!
//! ```text
//!                Connect            Connected              FirstSync
//! Disconnected ──────────► Connecting ──────► AwaitingFirstSync ──────► Reconciling
//!      ▲                       │                │        │ Resync            │
//!      │      Disconnected     │                │        ▼                   │ Reconciled
//!      └───────────────────────┴────────────────┴───── Steady ◄──────────────┘
//!
//!                  (any state) ── Destroy ──► Destroyed
//! ```

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingFirstSync,
    Reconciling,
    Steady,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    Connect,
    Connected,
    /// Synced, and reconciliation has not finished yet.
    FirstSync,
    /// Synced again after reconciliation already finished.
    Resync,
    Reconciled,
    Disconnected,
    Destroy,
}

impl SessionState {
    /// Next state, or `None` when `event` does not apply in this state.
    pub fn on(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Destroyed, _) => None,
            (_, E::Destroy) => Some(S::Destroyed),
            (S::Disconnected, E::Connect) => Some(S::Connecting),
            (S::Disconnected | S::Connecting, E::Connected) => Some(S::AwaitingFirstSync),
            (S::AwaitingFirstSync, E::FirstSync) => Some(S::Reconciling),
            (S::AwaitingFirstSync, E::Resync) => Some(S::Steady),
            (S::Reconciling, E::Reconciled) => Some(S::Steady),
            (S::Connecting | S::AwaitingFirstSync | S::Reconciling | S::Steady, E::Disconnected) => {
                Some(S::Disconnected)
            }
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Destroyed
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingFirstSync => "awaiting-first-sync",
            SessionState::Reconciling => "reconciling",
            SessionState::Steady => "steady",
            SessionState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}
