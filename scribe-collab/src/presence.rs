//! Participant presence ("who else is in this document").
//!
//! Every live connection publishes one [`PresenceState`]. The same person
//! with two tabs open therefore shows up under two connection ids; the
//! [`PresenceRegistry`] folds those back into one [`Participant`] each.
//!
//! ```text
//! Transport PresenceChange ──► PresenceRegistry::apply()
//!                                     │
//!                          (debounced by the session)
//!                                     ▼
//!                         PresenceRegistry::summary()
//!                                     │
//!                     ┌───────────────┴───────────────┐
//!                     ▼                               ▼
//!             on_presence_count(n)         on_presence_list(&[..])
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

use crate::protocol::ConnectionId;

// ───────────────────────────────────────────────────────────────────
// Wire shapes
// ───────────────────────────────────────────────────────────────────

/// Participant ids come from the host application and may be numeric or
/// textual.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParticipantId {
    Number(i64),
    Text(String),
}

impl ParticipantId {
    /// Empty strings and zero are treated as "no id".
    pub fn is_meaningful(&self) -> bool {
        match self {
            ParticipantId::Number(n) => *n != 0,
            ParticipantId::Text(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantId::Number(n) => write!(f, "{n}"),
            ParticipantId::Text(s) => f.write_str(s),
        }
    }
}

/// The participant block of a presence state. Every field is optional on
/// input; peers running older builds may omit any of them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantPresence {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// Presence published by one connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantPresence>,
}

impl PresenceState {
    pub fn with_participant(participant: ParticipantPresence) -> Self {
        Self {
            participant: Some(participant),
        }
    }
}

/// One deduplicated entry of the presence list handed to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub color: String,
}

/// A batch of per-connection presence mutations, as delivered by a
/// transport.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceChange {
    pub upserted: Vec<(ConnectionId, PresenceState)>,
    pub removed: Vec<ConnectionId>,
}

impl PresenceChange {
    pub fn upsert(connection: ConnectionId, state: PresenceState) -> Self {
        Self {
            upserted: vec![(connection, state)],
            removed: Vec::new(),
        }
    }

    pub fn remove(connections: Vec<ConnectionId>) -> Self {
        Self {
            upserted: Vec::new(),
            removed: connections,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Identity & colors
// ───────────────────────────────────────────────────────────────────

/// Who the local participant is, as reported by the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub id: ParticipantId,
    pub name: String,
}

impl UserIdentity {
    pub fn new(id: ParticipantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// Fallback when the host has no signed-in user.
    pub fn anonymous() -> Self {
        Self::new(ParticipantId::Text("anonymous".into()), "Anonymous")
    }
}

impl Default for UserIdentity {
    fn default() -> Self {
        Self::anonymous()
    }
}

pub const DEFAULT_PALETTE: [&str; 8] = [
    "#3b82f6", "#ef4444", "#10b981", "#f59e0b", "#8b5cf6", "#ec4899", "#06b6d4", "#f97316",
];

/// Cursor/avatar colors. Owned per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorPalette {
    colors: Vec<String>,
}

impl ColorPalette {
    /// An empty list falls back to the default palette.
    pub fn new(colors: Vec<String>) -> Self {
        if colors.is_empty() {
            return Self::default();
        }
        Self { colors }
    }

    /// Color for a connection that did not announce one. Distinct
    /// connections get distinguishable colors; not stable across
    /// reconnects since connection ids are not.
    pub fn for_connection(&self, connection: ConnectionId) -> &str {
        &self.colors[(connection % self.colors.len() as u64) as usize]
    }

    /// Random pick for the local participant.
    pub fn pick(&self) -> &str {
        let entropy = Uuid::new_v4().as_u128();
        &self.colors[(entropy % self.colors.len() as u128) as usize]
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }
}

impl Default for ColorPalette {
    fn default() -> Self {
        Self {
            colors: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// What the host is told after each debounced burst.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceSummary {
    pub count: usize,
    pub participants: Vec<Participant>,
}

#[derive(Debug, PartialEq, Eq, Hash)]
enum DedupKey {
    Participant(ParticipantId),
    Connection(ConnectionId),
}

/// Mirror of the transport's per-connection presence map.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    states: BTreeMap<ConnectionId, PresenceState>,
    palette: ColorPalette,
}

impl PresenceRegistry {
    pub fn new(palette: ColorPalette) -> Self {
        Self {
            states: BTreeMap::new(),
            palette,
        }
    }

    /// Apply one transport change. Removals are applied after upserts.
    pub fn apply(&mut self, change: &PresenceChange) {
        for (connection, state) in &change.upserted {
            self.states.insert(*connection, state.clone());
        }
        for connection in &change.removed {
            self.states.remove(connection);
        }
    }

    /// Raw number of connections, including ones without a participant.
    pub fn connection_count(&self) -> usize {
        self.states.len()
    }

    /// One entry per distinct participant, in connection-id order.
    ///
    /// The first connection seen for a participant wins; there is no
    /// priority among duplicate connections of the same participant.
    pub fn participants(&self) -> Vec<Participant> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for (&connection, state) in &self.states {
            let Some(presence) = &state.participant else {
                continue;
            };

            let id = match &presence.id {
                Some(id) if id.is_meaningful() => id.clone(),
                _ => ParticipantId::Number(connection as i64),
            };
            let key = match &presence.id {
                Some(id) if id.is_meaningful() => DedupKey::Participant(id.clone()),
                _ => DedupKey::Connection(connection),
            };
            if !seen.insert(key) {
                continue;
            }

            out.push(Participant {
                id,
                display_name: presence
                    .display_name
                    .clone()
                    .unwrap_or_else(|| format!("User{connection}")),
                color: presence
                    .color
                    .clone()
                    .unwrap_or_else(|| self.palette.for_connection(connection).to_string()),
            });
        }

        out
    }

    pub fn summary(&self) -> PresenceSummary {
        let participants = self.participants();
        PresenceSummary {
            count: participants.len(),
            participants,
        }
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }
}
