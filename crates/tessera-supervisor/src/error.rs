//! Transaction error taxonomy.
//!
//! These kinds travel over the wire (a participant reports its prepare
//! failure back to the coordinator inside a mailbox message) and into kept
//! responses, so the type is serializable and carries owned strings rather
//! than error sources.

use serde::{Deserialize, Serialize};
use tessera_types::TransactionId;
use thiserror::Error;

/// Errors produced and propagated by the transaction machinery.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnError {
    /// The transaction manager refused to prepare; the commit is aborted and
    /// the refusal is surfaced as the commit RPC error.
    #[error("prepare rejected: {0}")]
    PrepareRejected(String),

    /// The timestamp provider failed; recovered exactly like a prepare
    /// rejection.
    #[error("commit timestamp unavailable: {0}")]
    TimestampUnavailable(String),

    /// RPC or transport failure between client and cell. Retries are the
    /// client's responsibility; a mutation id makes them safe.
    #[error("transport error: {0}")]
    Transport(String),

    /// The RPC reached a follower; the client must redirect to the leader.
    #[error("cell {0} is not the leader")]
    NotLeader(tessera_types::CellId),

    /// The transaction is unknown at this cell (expired or already
    /// finished).
    #[error("transaction {0} is unknown")]
    TransactionUnknown(TransactionId),

    /// The operation is not valid in the transaction's current state.
    #[error("invalid transaction operation: {0}")]
    InvalidOperation(String),
}

impl TxnError {
    /// True for the `TransactionUnknown` class: the transaction is already
    /// gone, which abort paths treat as "done".
    pub fn is_transaction_unknown(&self) -> bool {
        matches!(self, TxnError::TransactionUnknown(_))
    }
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TxnError>;
