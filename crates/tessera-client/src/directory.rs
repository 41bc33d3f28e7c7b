//! The client's view of the deployment.

use std::future::Future;

use tessera_supervisor::rpc::{
    AbortReply, AbortTransactionRequest, CommitReply, CommitTransactionRequest,
    PingTransactionRequest, StartTransactionRequest,
};
use tessera_supervisor::TxnError;
use tessera_types::{CellId, Timestamp, TransactionId};

/// A request to create a master transaction object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTransactionRequest {
    pub parent_id: Option<TransactionId>,
    pub timeout_ms: Option<u64>,
}

/// Resolves cells to their leaders and carries the client RPC surface.
///
/// Implementations route each call to the current leader of the target
/// cell; redirection on [`TxnError::NotLeader`] is their concern, not the
/// transaction facade's.
pub trait CellDirectory: Send + Sync + 'static {
    /// Obtains a fresh start timestamp from the deployment's oracle.
    fn generate_start_timestamp(
        &self,
    ) -> impl Future<Output = Result<Timestamp, TxnError>> + Send;

    /// Creates a master transaction object on the master cell.
    fn create_transaction(
        &self,
        cell_id: CellId,
        request: CreateTransactionRequest,
    ) -> impl Future<Output = Result<TransactionId, TxnError>> + Send;

    /// Registers a transaction at a tablet participant.
    fn start_transaction(
        &self,
        cell_id: CellId,
        request: StartTransactionRequest,
    ) -> impl Future<Output = Result<(), TxnError>> + Send;

    /// Issues `CommitTransaction` at the chosen coordinator.
    fn commit_transaction(
        &self,
        cell_id: CellId,
        request: CommitTransactionRequest,
    ) -> impl Future<Output = Result<CommitReply, TxnError>> + Send;

    /// Issues `AbortTransaction` at one participant.
    fn abort_transaction(
        &self,
        cell_id: CellId,
        request: AbortTransactionRequest,
    ) -> impl Future<Output = Result<AbortReply, TxnError>> + Send;

    /// Issues `PingTransaction` at one participant.
    fn ping_transaction(
        &self,
        cell_id: CellId,
        request: PingTransactionRequest,
    ) -> impl Future<Output = Result<(), TxnError>> + Send;
}
