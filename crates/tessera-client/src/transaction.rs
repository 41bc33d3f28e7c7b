//! The client-side transaction object.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;

use tessera_supervisor::rpc::{
    AbortTransactionRequest, CommitReply, CommitTransactionRequest, PingTransactionRequest,
    StartTransactionRequest,
};
use tessera_supervisor::TxnError;
use tessera_types::{CellId, CellKind, MutationId, Timestamp, TransactionId};

use crate::config::ClientConfig;
use crate::directory::CellDirectory;

// ============================================================================
// Kinds, states, options
// ============================================================================

/// The flavor of a client transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// Created as an object on the master cell by RPC.
    Master,
    /// Synthesized locally; lives only at tablet participants.
    Tablet,
}

/// Lifecycle of a client transaction. Transitions are linear except that
/// Active → Aborted may happen at any moment asynchronously (lease expiry
/// noticed by a ping, abort by another client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Initializing,
    Active,
    Aborted,
    Committing,
    Committed,
    Detached,
}

/// Options for starting a transaction.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub kind: TransactionKind,
    /// Send a best-effort abort when the handle is dropped while active.
    pub auto_abort: bool,
    /// Renew leases periodically. Mandatory for tablet transactions.
    pub ping: bool,
    /// Also renew ancestor leases. Forbidden for tablet transactions.
    pub ping_ancestors: bool,
    /// Parent transaction (master only).
    pub parent_id: Option<TransactionId>,
    /// Lease timeout requested from participants.
    pub timeout_ms: Option<u64>,
}

impl StartOptions {
    pub fn master() -> Self {
        Self {
            kind: TransactionKind::Master,
            auto_abort: true,
            ping: true,
            ping_ancestors: false,
            parent_id: None,
            timeout_ms: None,
        }
    }

    pub fn tablet() -> Self {
        Self {
            kind: TransactionKind::Tablet,
            auto_abort: true,
            ping: true,
            ping_ancestors: false,
            parent_id: None,
            timeout_ms: None,
        }
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Inner {
    pub(crate) kind: TransactionKind,
    pub(crate) state: TransactionState,
    pub(crate) id: TransactionId,
    pub(crate) start_timestamp: Timestamp,
    pub(crate) participants: BTreeSet<CellId>,
    pub(crate) auto_abort: bool,
    pub(crate) ping_ancestors: bool,
    pub(crate) timeout_ms: Option<u64>,
    pub(crate) error: Option<TxnError>,
}

pub(crate) struct Shared {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) aborted: watch::Sender<bool>,
}

impl Shared {
    /// Marks the transaction aborted and fires the aborted signal once.
    pub(crate) fn set_aborted(&self, error: TxnError) {
        {
            let mut inner = self.inner.lock().expect("transaction lock");
            if inner.state == TransactionState::Aborted {
                return;
            }
            inner.state = TransactionState::Aborted;
            inner.error = Some(error);
        }
        self.aborted.send_replace(true);
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// A transaction held by a client.
///
/// Cheap accessors are synchronous; everything that talks to cells is
/// `async`. The handle is not clonable: dropping it while active with
/// `auto_abort` set sends a best-effort abort.
pub struct Transaction<D: CellDirectory> {
    pub(crate) shared: Arc<Shared>,
    pub(crate) directory: Arc<D>,
    pub(crate) master_cell_id: CellId,
}

impl<D: CellDirectory> std::fmt::Debug for Transaction<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.state())
            .field("master_cell_id", &self.master_cell_id)
            .finish()
    }
}

impl<D: CellDirectory> Transaction<D> {
    pub fn id(&self) -> TransactionId {
        self.shared.inner.lock().expect("transaction lock").id
    }

    pub fn kind(&self) -> TransactionKind {
        self.shared.inner.lock().expect("transaction lock").kind
    }

    pub fn start_timestamp(&self) -> Timestamp {
        self.shared
            .inner
            .lock()
            .expect("transaction lock")
            .start_timestamp
    }

    pub fn state(&self) -> TransactionState {
        self.shared.inner.lock().expect("transaction lock").state
    }

    pub fn participants(&self) -> BTreeSet<CellId> {
        self.shared
            .inner
            .lock()
            .expect("transaction lock")
            .participants
            .clone()
    }

    /// A receiver that flips to `true` when the transaction aborts.
    pub fn subscribe_aborted(&self) -> watch::Receiver<bool> {
        self.shared.aborted.subscribe()
    }

    /// Marks `cell_id` as a participant, registering the transaction there
    /// first. Idempotent. A registration failure aborts the transaction
    /// locally.
    pub async fn add_tablet_participant(&self, cell_id: CellId) -> Result<(), TxnError> {
        if cell_id.kind() != CellKind::Tablet {
            return Err(TxnError::InvalidOperation(format!(
                "cell {cell_id} is not a tablet cell"
            )));
        }

        let (id, start_timestamp, timeout_ms) = {
            let inner = self.shared.inner.lock().expect("transaction lock");
            if inner.state != TransactionState::Active {
                return Err(TxnError::InvalidOperation(
                    "transaction is not active".into(),
                ));
            }
            if let Some(error) = &inner.error {
                return Err(error.clone());
            }
            if inner.participants.contains(&cell_id) {
                return Ok(());
            }
            (inner.id, inner.start_timestamp, inner.timeout_ms)
        };

        tracing::debug!(tx = %id, cell = %cell_id, "adding tablet participant");
        let result = self
            .directory
            .start_transaction(
                cell_id,
                StartTransactionRequest {
                    transaction_id: id,
                    start_timestamp,
                    timeout_ms,
                },
            )
            .await;

        match result {
            Ok(()) => {
                let mut inner = self.shared.inner.lock().expect("transaction lock");
                if inner.state == TransactionState::Active {
                    inner.participants.insert(cell_id);
                }
                tracing::debug!(tx = %id, cell = %cell_id, "tablet participant added");
                Ok(())
            }
            Err(error) => {
                tracing::debug!(tx = %id, cell = %cell_id, %error, "error adding tablet participant");
                self.shared.set_aborted(TxnError::InvalidOperation(format!(
                    "error adding participant {cell_id} to transaction {id}: {error}"
                )));
                Err(error)
            }
        }
    }

    /// Commits the transaction.
    ///
    /// The coordinator is the master cell for master transactions and the
    /// lowest participant cell id for tablet transactions, so repeated
    /// commits of the same participant set always pick the same
    /// coordinator.
    pub async fn commit(&self, mutation_id: Option<MutationId>) -> Result<CommitReply, TxnError> {
        let (id, kind, participants) = {
            let mut inner = self.shared.inner.lock().expect("transaction lock");
            if let Some(error) = &inner.error {
                return Err(error.clone());
            }
            match inner.state {
                TransactionState::Committing => {
                    return Err(TxnError::InvalidOperation(
                        "transaction is already being committed".into(),
                    ));
                }
                TransactionState::Committed => {
                    return Err(TxnError::InvalidOperation(
                        "transaction is already committed".into(),
                    ));
                }
                TransactionState::Aborted => {
                    return Err(TxnError::InvalidOperation(
                        "transaction is already aborted".into(),
                    ));
                }
                TransactionState::Active => inner.state = TransactionState::Committing,
                TransactionState::Initializing | TransactionState::Detached => {
                    return Err(TxnError::InvalidOperation(
                        "transaction cannot be committed in its current state".into(),
                    ));
                }
            }
            (inner.id, inner.kind, inner.participants.clone())
        };

        if participants.is_empty() {
            let mut inner = self.shared.inner.lock().expect("transaction lock");
            if inner.state != TransactionState::Committing {
                return Err(inner.error.clone().unwrap_or_else(|| {
                    TxnError::InvalidOperation("transaction is no longer committing".into())
                }));
            }
            inner.state = TransactionState::Committed;
            tracing::info!(tx = %id, "trivial transaction committed");
            return Ok(CommitReply {
                commit_timestamp: Timestamp::NULL,
            });
        }

        let coordinator = match kind {
            TransactionKind::Master => self.master_cell_id,
            TransactionKind::Tablet => *participants
                .first()
                .expect("participant set is non-empty"),
        };
        let other_participants: Vec<CellId> = participants
            .iter()
            .copied()
            .filter(|&cell| cell != coordinator)
            .collect();

        tracing::info!(tx = %id, %coordinator, "committing transaction");
        let result = self
            .directory
            .commit_transaction(
                coordinator,
                CommitTransactionRequest {
                    transaction_id: id,
                    participant_cell_ids: other_participants,
                    mutation_id,
                },
            )
            .await;

        match result {
            Ok(reply) => {
                let mut inner = self.shared.inner.lock().expect("transaction lock");
                if inner.state != TransactionState::Committing {
                    return Err(inner.error.clone().unwrap_or_else(|| {
                        TxnError::InvalidOperation("transaction is no longer committing".into())
                    }));
                }
                inner.state = TransactionState::Committed;
                tracing::info!(tx = %id, commit_ts = %reply.commit_timestamp, "transaction committed");
                Ok(reply)
            }
            Err(error) => {
                tracing::warn!(tx = %id, %coordinator, %error, "error committing transaction");
                self.shared.set_aborted(error.clone());
                Err(error)
            }
        }
    }

    /// Aborts the transaction at every participant in parallel.
    ///
    /// Cells that no longer know the transaction are fine; any other error
    /// fails the call. The aborted signal fires regardless of per-cell
    /// outcomes once the fan-out succeeds.
    pub async fn abort(&self, mutation_id: Option<MutationId>) -> Result<(), TxnError> {
        let (id, participants) = {
            let inner = self.shared.inner.lock().expect("transaction lock");
            (inner.id, inner.participants.clone())
        };
        send_abort_fanout(&self.directory, id, participants, mutation_id).await?;
        self.shared.set_aborted(TxnError::InvalidOperation(
            "transaction aborted by user request".into(),
        ));
        Ok(())
    }

    /// Pings every participant in parallel.
    ///
    /// A participant reporting the transaction unknown means it is dead
    /// elsewhere: the transaction aborts locally and the error surfaces.
    /// Other per-cell errors are soft; they are logged and retried on the
    /// next scheduled round.
    pub async fn ping(&self) -> Result<(), TxnError> {
        ping_round(&self.shared, &self.directory, self.master_cell_id).await
    }

    /// Stops tracking the transaction without aborting it. Pings stop;
    /// the server eventually expires the lease.
    pub fn detach(&self) -> Result<(), TxnError> {
        let mut inner = self.shared.inner.lock().expect("transaction lock");
        match inner.state {
            TransactionState::Committed => Err(TxnError::InvalidOperation(
                "transaction is already committed".into(),
            )),
            TransactionState::Aborted => Err(TxnError::InvalidOperation(
                "transaction is already aborted".into(),
            )),
            TransactionState::Detached => Ok(()),
            TransactionState::Active => {
                inner.state = TransactionState::Detached;
                tracing::info!(tx = %inner.id, "transaction detached");
                Ok(())
            }
            TransactionState::Initializing | TransactionState::Committing => Err(
                TxnError::InvalidOperation("transaction cannot be detached right now".into()),
            ),
        }
    }
}

impl<D: CellDirectory> Drop for Transaction<D> {
    fn drop(&mut self) {
        let (auto_abort, state, id, participants) = {
            let inner = self.shared.inner.lock().expect("transaction lock");
            (
                inner.auto_abort,
                inner.state,
                inner.id,
                inner.participants.clone(),
            )
        };
        if !auto_abort || state != TransactionState::Active {
            return;
        }

        // Best-effort: only possible when a runtime is still around.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            tracing::debug!(tx = %id, "auto-aborting dropped transaction");
            let directory = Arc::clone(&self.directory);
            handle.spawn(async move {
                let _ = send_abort_fanout(&directory, id, participants, None).await;
            });
        }
    }
}

// ============================================================================
// Fan-out helpers
// ============================================================================

pub(crate) async fn send_abort_fanout<D: CellDirectory>(
    directory: &Arc<D>,
    id: TransactionId,
    participants: BTreeSet<CellId>,
    mutation_id: Option<MutationId>,
) -> Result<(), TxnError> {
    let mut rpcs = JoinSet::new();
    for cell_id in participants {
        let directory = Arc::clone(directory);
        rpcs.spawn(async move {
            let result = directory
                .abort_transaction(
                    cell_id,
                    AbortTransactionRequest {
                        transaction_id: id,
                        force: false,
                        mutation_id,
                    },
                )
                .await;
            (cell_id, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = rpcs.join_next().await {
        let (cell_id, result) = joined.expect("abort task panicked");
        match result {
            Ok(_) => {
                tracing::debug!(tx = %id, cell = %cell_id, "transaction aborted");
            }
            Err(TxnError::TransactionUnknown(_)) => {
                tracing::debug!(tx = %id, cell = %cell_id, "transaction already gone, ignored");
            }
            Err(error) => {
                tracing::warn!(tx = %id, cell = %cell_id, %error, "error aborting transaction");
                first_error.get_or_insert(error);
            }
        }
    }

    match first_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

pub(crate) async fn ping_round<D: CellDirectory>(
    shared: &Arc<Shared>,
    directory: &Arc<D>,
    master_cell_id: CellId,
) -> Result<(), TxnError> {
    let (id, participants, ping_ancestors) = {
        let inner = shared.inner.lock().expect("transaction lock");
        (
            inner.id,
            inner.participants.clone(),
            inner.ping_ancestors,
        )
    };

    let mut rpcs = JoinSet::new();
    for cell_id in participants {
        let directory = Arc::clone(directory);
        rpcs.spawn(async move {
            let result = directory
                .ping_transaction(
                    cell_id,
                    PingTransactionRequest {
                        transaction_id: id,
                        // Ancestors only exist on the master cell.
                        ping_ancestors: ping_ancestors && cell_id == master_cell_id,
                    },
                )
                .await;
            (cell_id, result)
        });
    }

    let mut hard_error = None;
    while let Some(joined) = rpcs.join_next().await {
        let (cell_id, result) = joined.expect("ping task panicked");
        match result {
            Ok(()) => {
                tracing::debug!(tx = %id, cell = %cell_id, "transaction pinged");
            }
            Err(error @ TxnError::TransactionUnknown(_)) => {
                tracing::warn!(tx = %id, cell = %cell_id, "transaction has expired or was aborted");
                hard_error.get_or_insert(error);
            }
            Err(error) => {
                // Soft: retried on the next scheduled round.
                tracing::warn!(tx = %id, cell = %cell_id, %error, "error pinging transaction");
            }
        }
    }

    if let Some(error) = hard_error {
        shared.set_aborted(error.clone());
        return Err(error);
    }
    Ok(())
}

/// Runs ping rounds on the configured period until the transaction dies or
/// its handle is dropped.
pub(crate) fn spawn_ping_loop<D: CellDirectory>(
    shared: Weak<Shared>,
    directory: Arc<D>,
    config: ClientConfig,
    master_cell_id: CellId,
) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_millis(config.ping_period_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let state = shared.inner.lock().expect("transaction lock").state;
            match state {
                TransactionState::Active | TransactionState::Committing => {
                    if ping_round(&shared, &directory, master_cell_id).await.is_err() {
                        return;
                    }
                }
                TransactionState::Initializing => {}
                _ => return,
            }
        }
    });
}
