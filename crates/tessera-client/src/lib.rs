//! Client-side transaction facade for Tessera.
//!
//! A [`TransactionClient`] starts, attaches, and tracks client
//! transactions. Each [`Transaction`] carries the participant set, issues
//! the commit RPC to a deterministically chosen coordinator, fans aborts
//! and pings out to every participant, and raises an aborted signal when
//! the transaction dies anywhere.
//!
//! All cell communication goes through the [`CellDirectory`] trait; wire a
//! real RPC stack behind it in production, or the in-memory cluster from
//! `tessera-cell::harness` in tests.

mod client;
mod config;
mod directory;
mod error;
mod transaction;

pub use client::{AttachOptions, TransactionClient};
pub use config::ClientConfig;
pub use directory::{CellDirectory, CreateTransactionRequest};
pub use error::{ConfigError, ConfigResult};
pub use transaction::{StartOptions, Transaction, TransactionKind, TransactionState};
