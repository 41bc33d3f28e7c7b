//! In-flight commit registries.

use std::collections::BTreeMap;

use tessera_types::TransactionId;

use crate::commit::{Commit, PersistedCommit};

/// The two per-cell commit maps.
///
/// `simple` holds transient single-cell commits: it lives only on the
/// leader and is discarded on step-down. `distributed` is part of the
/// cell's replicated state and is journaled into snapshots. The maps are
/// disjoint by construction; [`CommitRegistry::find`] scans both.
#[derive(Debug, Clone, Default)]
pub struct CommitRegistry {
    simple: BTreeMap<TransactionId, Commit>,
    distributed: BTreeMap<TransactionId, Commit>,
}

impl CommitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, transaction_id: TransactionId) -> Option<&Commit> {
        self.distributed
            .get(&transaction_id)
            .or_else(|| self.simple.get(&transaction_id))
    }

    pub fn find_mut(&mut self, transaction_id: TransactionId) -> Option<&mut Commit> {
        if let Some(commit) = self.distributed.get_mut(&transaction_id) {
            return Some(commit);
        }
        self.simple.get_mut(&transaction_id)
    }

    pub fn find_simple(&self, transaction_id: TransactionId) -> Option<&Commit> {
        self.simple.get(&transaction_id)
    }

    pub fn find_distributed(&self, transaction_id: TransactionId) -> Option<&Commit> {
        self.distributed.get(&transaction_id)
    }

    /// Inserts a transient simple commit.
    pub fn insert_simple(&mut self, commit: Commit) -> &mut Commit {
        let transaction_id = commit.transaction_id();
        debug_assert!(!commit.is_persistent());
        debug_assert!(!self.distributed.contains_key(&transaction_id));
        self.simple.entry(transaction_id).or_insert(commit)
    }

    /// Inserts a persistent distributed commit.
    pub fn insert_distributed(&mut self, commit: Commit) -> &mut Commit {
        let transaction_id = commit.transaction_id();
        debug_assert!(commit.is_persistent());
        debug_assert!(!self.simple.contains_key(&transaction_id));
        self.distributed.entry(transaction_id).or_insert(commit)
    }

    /// Removes a finished or aborted commit from whichever map holds it.
    pub fn remove(&mut self, transaction_id: TransactionId) -> Option<Commit> {
        self.distributed
            .remove(&transaction_id)
            .or_else(|| self.simple.remove(&transaction_id))
    }

    /// Discards all simple commits (leader step-down).
    pub fn clear_simple(&mut self) {
        self.simple.clear();
    }

    /// Discards everything (full automaton reset before snapshot load).
    pub fn clear(&mut self) {
        self.simple.clear();
        self.distributed.clear();
    }

    pub fn distributed_commits(&self) -> impl Iterator<Item = &Commit> {
        self.distributed.values()
    }

    /// Transaction ids of distributed commits, in key order.
    pub fn save_keys(&self) -> Vec<TransactionId> {
        self.distributed.keys().copied().collect()
    }

    /// Persisted records of distributed commits, in the same key order.
    pub fn save_values(&self) -> Vec<PersistedCommit> {
        self.distributed.values().map(Commit::to_persisted).collect()
    }

    /// Rebuilds the distributed map from journaled keys and values.
    pub fn load(&mut self, keys: Vec<TransactionId>, values: Vec<PersistedCommit>) {
        debug_assert_eq!(keys.len(), values.len());
        self.clear();
        for (key, value) in keys.into_iter().zip(values) {
            debug_assert_eq!(key, value.transaction_id);
            self.distributed.insert(key, Commit::from_persisted(value));
        }
    }
}
