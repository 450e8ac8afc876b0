//! Host-side owner of at most one session.
//!
//! Toggling collaboration on and off from a UI goes through
//! [`Collaboration`]: enabling twice returns the running session, enabling
//! while a start is in progress is refused, and disabling destroys the
//! session and clears the cached participants.

use std::sync::{Arc, Mutex};

use super::{SessionHandle, SessionOptions, SyncSession};
use crate::lock;
use crate::presence::Participant;
use crate::surface::EditorSurface;

enum Slot {
    Idle,
    Starting,
    Active(Arc<SessionHandle>),
}

/// Latest presence report. `generation` changes on every disable, so
/// reports from a torn-down session are dropped.
#[derive(Default)]
struct Roster {
    generation: u64,
    count: usize,
    participants: Vec<Participant>,
}

pub struct Collaboration {
    sessions: SyncSession,
    slot: Mutex<Slot>,
    roster: Arc<Mutex<Roster>>,
}

impl Collaboration {
    pub fn new(sessions: SyncSession) -> Self {
        Self {
            sessions,
            slot: Mutex::new(Slot::Idle),
            roster: Arc::new(Mutex::new(Roster::default())),
        }
    }

    /// Start collaborating on `document_id`.
    ///
    /// Returns the running session if there already is one, and `None`
    /// while another start is in progress or when the session could not be
    /// opened. The presence callbacks in `options` still fire; the
    /// controller keeps its own copy of the latest report.
    pub fn enable(
        &self,
        document_id: Option<&str>,
        mut options: SessionOptions,
    ) -> Option<Arc<SessionHandle>> {
        {
            let mut slot = lock(&self.slot);
            match &*slot {
                Slot::Active(handle) => {
                    log::info!("Collaboration already enabled for room {}", handle.room());
                    return Some(handle.clone());
                }
                Slot::Starting => {
                    log::info!("Collaboration is still starting");
                    return None;
                }
                Slot::Idle => *slot = Slot::Starting,
            }
        }

        let generation = lock(&self.roster).generation;
        let host_count = options.on_presence_count.take();
        let roster = self.roster.clone();
        options = options.on_presence_count(move |count| {
            {
                let mut roster = lock(&roster);
                if roster.generation == generation {
                    roster.count = count;
                }
            }
            if let Some(callback) = &host_count {
                callback(count);
            }
        });
        let host_list = options.on_presence_list.take();
        let roster = self.roster.clone();
        options = options.on_presence_list(move |participants| {
            {
                let mut roster = lock(&roster);
                if roster.generation == generation {
                    roster.participants = participants.to_vec();
                }
            }
            if let Some(callback) = &host_list {
                callback(participants);
            }
        });

        let opened = self.sessions.open(document_id, options).map(Arc::new);

        let mut slot = lock(&self.slot);
        let still_starting = matches!(*slot, Slot::Starting);
        match opened {
            Some(handle) if still_starting => {
                log::info!("Collaboration enabled for room {}", handle.room());
                *slot = Slot::Active(handle.clone());
                Some(handle)
            }
            None if still_starting => {
                log::warn!("Collaboration could not be enabled");
                *slot = Slot::Idle;
                None
            }
            // Disabled while starting.
            Some(handle) => {
                handle.destroy();
                None
            }
            None => None,
        }
    }

    /// Destroy the session, if any, and forget every participant.
    pub fn disable(&self) {
        let previous = std::mem::replace(&mut *lock(&self.slot), Slot::Idle);
        if let Slot::Active(handle) = previous {
            handle.destroy();
            log::info!("Collaboration disabled for room {}", handle.room());
        }
        let mut roster = lock(&self.roster);
        roster.generation += 1;
        roster.count = 0;
        roster.participants.clear();
    }

    /// Hand the editing surface to the running session.
    pub fn set_editor(&self, surface: Arc<dyn EditorSurface>) {
        match &*lock(&self.slot) {
            Slot::Active(handle) => handle.attach_editor(surface),
            _ => log::debug!("No running session for the editor"),
        }
    }

    pub fn session(&self) -> Option<Arc<SessionHandle>> {
        match &*lock(&self.slot) {
            Slot::Active(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*lock(&self.slot), Slot::Active(_))
    }

    pub fn is_starting(&self) -> bool {
        matches!(*lock(&self.slot), Slot::Starting)
    }

    pub fn participant_count(&self) -> usize {
        lock(&self.roster).count
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.roster).participants.clone()
    }
}

impl Drop for Collaboration {
    fn drop(&mut self) {
        self.disable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollabConfig;
    use crate::presence::{ParticipantId, UserIdentity};
    use crate::session::SessionState;
    use crate::surface::BufferSurface;
    use crate::transport::MemoryRelay;
    use std::time::Duration;

    fn controller(relay: &MemoryRelay) -> Collaboration {
        Collaboration::new(
            SyncSession::new(CollabConfig::default().with_endpoint("ws://relay.test"))
                .with_connector(relay.clone()),
        )
    }

    fn ada() -> UserIdentity {
        UserIdentity::new(ParticipantId::Text("ada".into()), "Ada")
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_twice_returns_the_same_session() {
        let relay = MemoryRelay::new();
        let collab = controller(&relay);
        let first = collab.enable(Some("1"), SessionOptions::new()).unwrap();
        let second = collab.enable(Some("2"), SessionOptions::new()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.room().as_str(), "document-1");
        assert!(collab.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_while_starting_is_refused() {
        let relay = MemoryRelay::new();
        let collab = Arc::new(controller(&relay));
        let nested = Arc::new(Mutex::new(None));

        // The identity provider runs inside `open`, while the first enable
        // is still in progress.
        let (c, n) = (Arc::downgrade(&collab), nested.clone());
        let options = SessionOptions::new().identity_provider(move || {
            if let Some(collab) = c.upgrade() {
                let refused = collab.enable(Some("1"), SessionOptions::new()).is_none();
                *n.lock().unwrap() = Some(collab.is_starting() && refused);
            }
            ada()
        });

        assert!(collab.enable(Some("1"), options).is_some());
        assert_eq!(*nested.lock().unwrap(), Some(true));
        assert!(!collab.is_starting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_enable_can_be_retried() {
        let relay = MemoryRelay::new();
        let collab = controller(&relay);
        assert!(collab.enable(None, SessionOptions::new()).is_none());
        assert!(!collab.is_enabled());
        assert!(!collab.is_starting());
        assert!(collab.enable(Some("1"), SessionOptions::new()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_destroys_and_clears_participants() {
        let relay = MemoryRelay::new();
        let collab = controller(&relay);
        let reported = Arc::new(Mutex::new(Vec::new()));
        let r = reported.clone();

        let handle = collab
            .enable(
                Some("1"),
                SessionOptions::new()
                    .identity(ada())
                    .on_presence_count(move |count| r.lock().unwrap().push(count)),
            )
            .unwrap();
        collab.set_editor(Arc::new(BufferSurface::new()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(collab.participant_count(), 1);
        assert_eq!(collab.participants()[0].display_name, "Ada");
        assert_eq!(reported.lock().unwrap().last(), Some(&1));
        assert_eq!(handle.state(), SessionState::Steady);

        collab.disable();
        assert!(handle.is_destroyed());
        assert!(!collab.is_enabled());
        assert!(collab.session().is_none());
        assert_eq!(collab.participant_count(), 0);
        assert!(collab.participants().is_empty());

        // Disabling again is harmless; enabling starts a fresh session.
        collab.disable();
        let fresh = collab.enable(Some("1"), SessionOptions::new()).unwrap();
        assert!(!Arc::ptr_eq(&handle, &fresh));
    }
}
