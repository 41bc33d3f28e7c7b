//! Client-facing RPC surface of the transaction coordinator.
//!
//! Requests and replies are plain serde structs; replies are encoded with
//! `postcard` into opaque [`Bytes`] at Finish time so that kept-response
//! replay is byte-for-byte identical to the original.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

use crate::error::TxnError;

// ============================================================================
// Requests
// ============================================================================

/// `CommitTransaction`: commit at this coordinator, with the given other
/// participants (empty means a simple single-cell commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitTransactionRequest {
    pub transaction_id: TransactionId,
    pub participant_cell_ids: Vec<CellId>,
    pub mutation_id: Option<MutationId>,
}

/// `AbortTransaction`: abort at this cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortTransactionRequest {
    pub transaction_id: TransactionId,
    pub force: bool,
    pub mutation_id: Option<MutationId>,
}

/// `PingTransaction`: renew the lease at this cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingTransactionRequest {
    pub transaction_id: TransactionId,
    pub ping_ancestors: bool,
}

/// `StartTransaction`: register the transaction at a tablet participant
/// before it may hold any of the transaction's effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTransactionRequest {
    pub transaction_id: TransactionId,
    pub start_timestamp: Timestamp,
    pub timeout_ms: Option<u64>,
}

// ============================================================================
// Replies
// ============================================================================

/// Successful `CommitTransaction` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReply {
    pub commit_timestamp: Timestamp,
}

/// Successful `AbortTransaction` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AbortReply {}

// ============================================================================
// Response encoding
// ============================================================================

fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(
        postcard::to_allocvec(value)
            .expect("response serialization should never fail (all fields are serializable)"),
    )
}

fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T, TxnError> {
    postcard::from_bytes(bytes)
        .map_err(|e| TxnError::Transport(format!("malformed response payload: {e}")))
}

/// Encodes a commit outcome into its canonical reply bytes.
pub fn encode_commit_response(result: &Result<CommitReply, TxnError>) -> Bytes {
    encode(result)
}

/// Decodes commit reply bytes back into the outcome.
pub fn decode_commit_response(bytes: &Bytes) -> Result<CommitReply, TxnError> {
    decode::<Result<CommitReply, TxnError>>(bytes)?
}

/// Encodes an abort outcome into its canonical reply bytes.
pub fn encode_abort_response(result: &Result<AbortReply, TxnError>) -> Bytes {
    encode(result)
}

/// Decodes abort reply bytes back into the outcome.
pub fn decode_abort_response(bytes: &Bytes) -> Result<AbortReply, TxnError> {
    decode::<Result<AbortReply, TxnError>>(bytes)?
}
