//! The per-transaction commit entity.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

// ============================================================================
// CommitState
// ============================================================================

/// Phase of a commit's state machine.
///
/// Both the transient and the persistent state use this set;
/// `GenerateCommitTimestamp` and `Finish` occur only transiently (they are
/// never journaled).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitState {
    Start,
    Prepare,
    GenerateCommitTimestamp,
    Commit,
    Abort,
    Finish,
}

impl CommitState {
    /// Rank used to enforce forward-only persistent transitions.
    fn rank(self) -> u8 {
        match self {
            CommitState::Start => 0,
            CommitState::Prepare => 1,
            CommitState::GenerateCommitTimestamp => 2,
            CommitState::Commit | CommitState::Abort => 3,
            CommitState::Finish => 4,
        }
    }
}

// ============================================================================
// Commit
// ============================================================================

/// An in-flight commit tracked by the coordinator.
///
/// Created either when the commit RPC lands on a leader (simple) or when the
/// start mutation applies (distributed). Mutated only on the serialized
/// automaton; destroyed at Finish or after Abort.
#[derive(Debug, Clone)]
pub struct Commit {
    transaction_id: TransactionId,
    mutation_id: Option<MutationId>,
    participant_cell_ids: BTreeSet<CellId>,
    commit_timestamp: Timestamp,
    transient_state: CommitState,
    persistent_state: CommitState,
    responded_cell_ids: BTreeSet<CellId>,
    persistent: bool,
}

impl Commit {
    pub fn new(
        persistent: bool,
        transaction_id: TransactionId,
        mutation_id: Option<MutationId>,
        participant_cell_ids: BTreeSet<CellId>,
    ) -> Self {
        Self {
            transaction_id,
            mutation_id,
            participant_cell_ids,
            commit_timestamp: Timestamp::NULL,
            transient_state: CommitState::Start,
            persistent_state: CommitState::Start,
            responded_cell_ids: BTreeSet::new(),
            persistent,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn mutation_id(&self) -> Option<MutationId> {
        self.mutation_id
    }

    pub fn participant_cell_ids(&self) -> &BTreeSet<CellId> {
        &self.participant_cell_ids
    }

    pub fn commit_timestamp(&self) -> Timestamp {
        self.commit_timestamp
    }

    pub fn set_commit_timestamp(&mut self, timestamp: Timestamp) {
        self.commit_timestamp = timestamp;
    }

    pub fn transient_state(&self) -> CommitState {
        self.transient_state
    }

    pub fn set_transient_state(&mut self, state: CommitState) {
        self.transient_state = state;
    }

    pub fn persistent_state(&self) -> CommitState {
        self.persistent_state
    }

    /// Advances the persistent state.
    ///
    /// Persistent state only moves forward: Start → Prepare → Commit →
    /// Finish on success, or Start → … → Abort → Finish on failure. The
    /// transient state follows along.
    pub fn advance_persistent_state(&mut self, state: CommitState) {
        debug_assert!(
            state.rank() >= self.persistent_state.rank(),
            "persistent commit state must not regress: {:?} -> {:?}",
            self.persistent_state,
            state
        );
        self.persistent_state = state;
        self.transient_state = state;
    }

    pub fn responded_cell_ids(&self) -> &BTreeSet<CellId> {
        &self.responded_cell_ids
    }

    /// Records a participant's prepare acknowledgment. Returns false for a
    /// duplicate or a cell that is not a participant.
    pub fn record_responded(&mut self, cell_id: CellId) -> bool {
        if !self.participant_cell_ids.contains(&cell_id) {
            return false;
        }
        self.responded_cell_ids.insert(cell_id)
    }

    /// True once every participant has acknowledged its prepare.
    pub fn all_participants_responded(&self) -> bool {
        self.responded_cell_ids.len() == self.participant_cell_ids.len()
    }

    /// A commit with participants is distributed; an empty participant set
    /// means a simple single-cell commit.
    pub fn is_distributed(&self) -> bool {
        !self.participant_cell_ids.is_empty()
    }

    /// True once the commit has been journaled on the coordinator.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn to_persisted(&self) -> PersistedCommit {
        debug_assert!(self.persistent, "only persistent commits are journaled");
        PersistedCommit {
            transaction_id: self.transaction_id,
            mutation_id: self.mutation_id,
            participant_cell_ids: self.participant_cell_ids.clone(),
            commit_timestamp: self.commit_timestamp,
            persistent_state: self.persistent_state,
        }
    }

    pub fn from_persisted(record: PersistedCommit) -> Self {
        Self {
            transaction_id: record.transaction_id,
            mutation_id: record.mutation_id,
            participant_cell_ids: record.participant_cell_ids,
            commit_timestamp: record.commit_timestamp,
            transient_state: record.persistent_state,
            persistent_state: record.persistent_state,
            responded_cell_ids: BTreeSet::new(),
            persistent: true,
        }
    }
}

// ============================================================================
// PersistedCommit
// ============================================================================

/// The journaled projection of a distributed commit.
///
/// Simple commits are never persisted. Responded cells are deliberately
/// absent: every prepare acknowledgment arrives as a logged mailbox
/// mutation, so replay rebuilds the set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedCommit {
    pub transaction_id: TransactionId,
    pub mutation_id: Option<MutationId>,
    pub participant_cell_ids: BTreeSet<CellId>,
    pub commit_timestamp: Timestamp,
    pub persistent_state: CommitState,
}
