//! Interfaces the coordinator consumes from its collaborators.

use tessera_types::{Timestamp, TransactionId};

use crate::error::Result;

/// Per-cell transaction-manager hook (MVCC, row locks, and friends live
/// behind it; they are not the coordinator's concern).
///
/// Calls run inside mutation handlers on the serialized automaton and must
/// be deterministic across peers.
pub trait TransactionManager {
    /// Prepares the local effects of a transaction for commit.
    ///
    /// `persistent` distinguishes the distributed case (the prepare itself
    /// is journaled). An error is a prepare failure: the coordinator aborts
    /// the commit and surfaces the error to the client.
    fn prepare_commit(
        &mut self,
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> Result<()>;

    /// Validates that an abort may proceed (transient, leader only).
    fn prepare_abort(&mut self, transaction_id: TransactionId, force: bool) -> Result<()>;

    /// Commits the local effects at `commit_timestamp`.
    ///
    /// Once `prepare_commit` has succeeded this must not fail; the engine
    /// treats an error here as a fatal contract violation and panics.
    fn commit_transaction(
        &mut self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<()>;

    /// Aborts the local effects. Idempotent; with `force` it may fail only
    /// with `TransactionUnknown`.
    fn abort_transaction(&mut self, transaction_id: TransactionId, force: bool) -> Result<()>;

    /// Renews the transaction's lease.
    fn ping_transaction(&mut self, transaction_id: TransactionId, ping_ancestors: bool)
        -> Result<()>;
}

/// The global timestamp oracle.
///
/// Issued values are strictly monotone across the deployment. Generation
/// may fail; the engine recovers by aborting the commit.
pub trait TimestampProvider {
    /// The latest timestamp issued so far, without advancing the oracle.
    fn latest_timestamp(&self) -> Timestamp;

    /// Generates a fresh timestamp strictly above every previous one.
    fn generate_timestamp(&mut self) -> Result<Timestamp>;
}
