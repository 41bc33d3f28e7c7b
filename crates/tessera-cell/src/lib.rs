//! Composite cell automaton for Tessera.
//!
//! A cell is a replicated state-machine group; this crate binds the mailbox
//! layer (`tessera-hive`) and the commit engine (`tessera-supervisor`) to a
//! replicated mutation log with a kept-response table, and implements the
//! leadership and recovery rules of the coordinator:
//!
//! - simple commits live only on the leader and die with it;
//! - distributed commits are rebuilt from the log, and a fresh leader
//!   re-enters the generate-timestamp step for every commit that had
//!   already collected all prepare acknowledgments;
//! - snapshots carry a single version integer and are rejected when
//!   unknown.
//!
//! The [`harness`] module provides the deterministic multi-cell cluster
//! used by the integration tests: seeded transport faults, a recording
//! transaction manager, and a shared monotone timestamp oracle.

mod cell;
mod error;
mod mutation;

pub mod harness;

pub use cell::{Cell, CellConfig, ParticipantTransactions, RequestHandle, SNAPSHOT_VERSION};
pub use error::{Error, Result};
pub use mutation::CellMutation;
