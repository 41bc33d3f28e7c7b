//! Two-phase transaction commit for Tessera cells.
//!
//! This crate hosts the coordinator's side of the story: the per-transaction
//! [`Commit`] entity, the in-flight [`CommitRegistry`], and the
//! [`TransactionSupervisor`] state machine that drives Start → Prepare →
//! GenerateTimestamp → Commit → Finish for simple (single-cell) and
//! distributed (multi-cell) commits.
//!
//! # Architecture
//!
//! The supervisor is a deterministic state machine in the FCIS mold:
//! mutation application takes a [`SupervisorMutation`] and produces a
//! [`SupervisorOutput`] of mailbox messages, client replies, and timestamp
//! requests. It performs no I/O of its own; the hosting cell owns the
//! replicated log, the mailbox manager, and the kept-response table, and
//! routes outputs accordingly.
//!
//! Collaborators are consumed through two narrow traits:
//!
//! - [`TransactionManager`]: prepare / commit / abort / ping of the local
//!   transaction effects. Commit must not fail after a successful prepare;
//!   the engine enforces this fatally.
//! - [`TimestampProvider`]: the monotone timestamp oracle. Failures abort
//!   the affected commit.
//!
//! # Protocol overview
//!
//! ```text
//! Client ──CommitTransaction──► Coordinator
//!                                  │ StartDistributedCommit (logged)
//!                                  ├──PrepareTransactionCommit──► P₁…Pₙ
//!                                  │◄──OnTransactionCommitPrepared──┤
//!                                  │ (all prepared, leader only)
//!                                  │ FinalizeDistributedCommit (logged)
//!                                  ├──CommitPreparedTransaction──► P₁…Pₙ
//! Client ◄──{commit_timestamp}────┘
//! ```

mod commit;
mod engine;
mod error;
mod manager;
mod mutation;
mod registry;
pub mod rpc;

pub use commit::{Commit, CommitState, PersistedCommit};
pub use engine::{
    ApplyContext, ClientReply, PostedMessage, StartCommitOutcome, SupervisorOutput,
    TimestampOutcome, TransactionSupervisor,
};
pub use error::{Result, TxnError};
pub use manager::{TimestampProvider, TransactionManager};
pub use mutation::SupervisorMutation;
pub use registry::CommitRegistry;

#[cfg(test)]
mod tests;
