//! Supervisor mutations.
//!
//! Every state change of the commit machinery is one of these variants,
//! applied deterministically on all peers of a cell. The first three are
//! coordinator-local (proposed by the leader's RPC handlers and timestamp
//! continuations); the rest travel between cells as mailbox payloads.

use std::collections::BTreeSet;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

use crate::error::TxnError;

/// A logged mutation of the transaction supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorMutation {
    // === Coordinator-local (never sent over the wire) ===
    /// First phase of a distributed commit: create the persistent commit,
    /// prepare locally, fan out prepare requests.
    StartDistributedCommit {
        transaction_id: TransactionId,
        mutation_id: Option<MutationId>,
        participant_cell_ids: BTreeSet<CellId>,
        prepare_timestamp: Timestamp,
    },

    /// Second phase of a distributed commit: commit locally at the chosen
    /// timestamp and fan out commit requests.
    FinalizeDistributedCommit {
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    },

    /// Client-requested abort, validated transiently beforehand.
    AbortTransaction {
        transaction_id: TransactionId,
        mutation_id: Option<MutationId>,
        force: bool,
    },

    // === Inter-cell (mailbox payloads) ===
    /// Coordinator → participant: prepare this transaction.
    PrepareTransactionCommit {
        transaction_id: TransactionId,
        prepare_timestamp: Timestamp,
        coordinator_cell_id: CellId,
    },

    /// Participant → coordinator: prepare outcome.
    OnTransactionCommitPrepared {
        transaction_id: TransactionId,
        participant_cell_id: CellId,
        error: Option<TxnError>,
    },

    /// Coordinator → participant: commit the prepared transaction. Also
    /// proposed coordinator-locally with `is_distributed = false` to finish
    /// a simple commit.
    CommitPreparedTransaction {
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
        is_distributed: bool,
    },

    /// Coordinator → participant (and coordinator-local): the commit failed
    /// before the second phase; abort everywhere.
    AbortFailedTransaction { transaction_id: TransactionId },
}

impl SupervisorMutation {
    /// The transaction this mutation concerns.
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            SupervisorMutation::StartDistributedCommit { transaction_id, .. }
            | SupervisorMutation::FinalizeDistributedCommit { transaction_id, .. }
            | SupervisorMutation::AbortTransaction { transaction_id, .. }
            | SupervisorMutation::PrepareTransactionCommit { transaction_id, .. }
            | SupervisorMutation::OnTransactionCommitPrepared { transaction_id, .. }
            | SupervisorMutation::CommitPreparedTransaction { transaction_id, .. }
            | SupervisorMutation::AbortFailedTransaction { transaction_id } => *transaction_id,
        }
    }

    /// Encodes an inter-cell mutation into a mailbox payload.
    pub fn encode_payload(&self) -> Bytes {
        Bytes::from(
            postcard::to_allocvec(self)
                .expect("mutation serialization should never fail (all fields are serializable)"),
        )
    }

    /// Decodes a mailbox payload back into the mutation it carries.
    pub fn decode_payload(payload: &Bytes) -> Result<Self, TxnError> {
        postcard::from_bytes(payload)
            .map_err(|e| TxnError::Transport(format!("malformed mailbox payload: {e}")))
    }
}
