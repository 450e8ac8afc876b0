//! First-contact reconciliation between the host's initial content and the
//! replicated document.
//!
//! The host usually loads the document from its own storage before the
//! room has answered. Once the replica is synced we must pick one of the
//! two, exactly once:
//!
//! | # | Condition                                   | Outcome        |
//! |---|---------------------------------------------|----------------|
//! | 1 | replica structurally empty                  | impose initial |
//! | 2 | at most one participant present             | impose initial |
//! | 3 | initial non-empty and replica stale         | impose initial |
//! | 4 | otherwise                                   | keep replica   |

use serde_json::Value;

use crate::content::{self, Document, Snapshot};

/// When rule 3 considers the replica out of date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalenessRule {
    /// The initial content has more blocks than the replica.
    #[default]
    ReplicaTruncated,
    /// Block counts differ in either direction.
    CountMismatch,
}

impl StalenessRule {
    pub fn is_stale(self, initial_blocks: usize, replica_blocks: usize) -> bool {
        match self {
            StalenessRule::ReplicaTruncated => initial_blocks > replica_blocks,
            StalenessRule::CountMismatch => initial_blocks != replica_blocks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImposeReason {
    EmptyReplica,
    SoloParticipant,
    ReplicaStale { initial: usize, replica: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    ImposeInitial(ImposeReason),
    KeepReplica,
}

/// Apply the decision table. First matching row wins.
pub fn decide(
    replica: &Document,
    participants: usize,
    initial: &Value,
    rule: StalenessRule,
) -> Decision {
    if replica.is_structurally_empty() {
        return Decision::ImposeInitial(ImposeReason::EmptyReplica);
    }
    if participants <= 1 {
        return Decision::ImposeInitial(ImposeReason::SoloParticipant);
    }
    let initial_blocks = content::block_count(initial);
    let replica_blocks = replica.block_count();
    if initial_blocks > 0 && rule.is_stale(initial_blocks, replica_blocks) {
        return Decision::ImposeInitial(ImposeReason::ReplicaStale {
            initial: initial_blocks,
            replica: replica_blocks,
        });
    }
    Decision::KeepReplica
}

/// Progress of the one-shot reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Latch {
    /// Waiting for the first sync.
    Idle,
    /// Synced; waiting for the surface to settle.
    Started,
    /// Decided, skipped or abandoned. Never leaves this state.
    Done,
}

/// Holds the initial content and guarantees the decision runs at most once.
#[derive(Debug, Clone)]
pub struct ContentReconciler {
    initial: Option<Value>,
    rule: StalenessRule,
    latch: Latch,
}

impl ContentReconciler {
    /// Absent initial content (`null`, `""`, ...) is the same as none.
    pub fn new(initial: Option<Value>, rule: StalenessRule) -> Self {
        Self {
            initial: initial.filter(content::is_present),
            rule,
            latch: Latch::Idle,
        }
    }

    pub fn latch(&self) -> Latch {
        self.latch
    }

    pub fn has_initial(&self) -> bool {
        self.initial.is_some()
    }

    /// First sync seen. Returns `true` if a decision is now pending;
    /// without initial content the latch goes straight to `Done`.
    pub fn begin(&mut self) -> bool {
        if self.latch != Latch::Idle {
            return false;
        }
        if self.initial.is_none() {
            self.latch = Latch::Done;
            return false;
        }
        self.latch = Latch::Started;
        true
    }

    /// Give up without deciding (e.g. the surface never showed up).
    pub fn abandon(&mut self) {
        self.latch = Latch::Done;
    }

    /// Decide, if a decision is pending. `None` once done.
    pub fn run(&mut self, replica: &Document, participants: usize) -> Option<Decision> {
        if self.latch != Latch::Started {
            return None;
        }
        self.latch = Latch::Done;
        let initial = self.initial.as_ref()?;
        Some(decide(replica, participants, initial, self.rule))
    }

    /// The initial content, normalized.
    pub fn initial_snapshot(&self) -> Option<Snapshot> {
        self.initial.as_ref().map(content::normalize)
    }
}
