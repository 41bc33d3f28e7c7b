//! Deterministic multi-cell harness.
//!
//! Production deployments wire [`Cell`] to a real transport, transaction
//! manager, and timestamp service. For tests and simulation this module
//! provides the in-memory stand-ins: a recording transaction manager, a
//! shared monotone oracle, and a [`Cluster`] that shuttles mailbox batches
//! between cells with seeded drop/duplicate faults.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tessera_supervisor::rpc::{
    decode_abort_response, decode_commit_response, AbortReply, AbortTransactionRequest,
    CommitReply, CommitTransactionRequest, PingTransactionRequest, StartTransactionRequest,
};
use tessera_supervisor::{TimestampProvider, TransactionManager, TxnError};
use tessera_types::{CellId, Timestamp, TransactionId};

use crate::cell::{Cell, CellConfig, ParticipantTransactions, RequestHandle};

// ============================================================================
// RecordingManager
// ============================================================================

/// What happened to a transaction at one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnPhase {
    Started,
    Prepared,
    Committed(Timestamp),
    Aborted,
}

/// One call into the manager, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCall {
    Prepare {
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    },
    Commit {
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    },
    Abort {
        transaction_id: TransactionId,
        force: bool,
    },
    Ping {
        transaction_id: TransactionId,
    },
}

#[derive(Debug, Default)]
struct ManagerInner {
    calls: Vec<ManagerCall>,
    phases: BTreeMap<TransactionId, TxnPhase>,
    prepare_failures: BTreeMap<TransactionId, TxnError>,
}

/// A transaction manager that records every call and enforces the contract
/// the coordinator relies on: commit only after prepare, forced aborts fail
/// only with `TransactionUnknown`, pings of gone transactions report them
/// gone.
///
/// Cloning shares the underlying state, so tests keep a handle for
/// inspection and fault scripting after moving a clone into a cell.
#[derive(Debug, Clone, Default)]
pub struct RecordingManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl RecordingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the next prepare of `transaction_id` to fail.
    pub fn fail_prepare(&self, transaction_id: TransactionId, error: TxnError) {
        self.inner
            .lock()
            .expect("manager lock")
            .prepare_failures
            .insert(transaction_id, error);
    }

    /// Locally aborts the transaction, as a lease expiry would.
    pub fn expire(&self, transaction_id: TransactionId) {
        self.inner
            .lock()
            .expect("manager lock")
            .phases
            .insert(transaction_id, TxnPhase::Aborted);
    }

    /// Drops every trace of the transaction, as lease cleanup eventually
    /// does; later calls report it unknown.
    pub fn forget(&self, transaction_id: TransactionId) {
        self.inner
            .lock()
            .expect("manager lock")
            .phases
            .remove(&transaction_id);
    }

    pub fn phase(&self, transaction_id: TransactionId) -> Option<TxnPhase> {
        self.inner
            .lock()
            .expect("manager lock")
            .phases
            .get(&transaction_id)
            .copied()
    }

    pub fn calls(&self) -> Vec<ManagerCall> {
        self.inner.lock().expect("manager lock").calls.clone()
    }

    /// Calls concerning one transaction, in arrival order.
    pub fn calls_for(&self, transaction_id: TransactionId) -> Vec<ManagerCall> {
        self.calls()
            .into_iter()
            .filter(|call| match call {
                ManagerCall::Prepare { transaction_id: t, .. }
                | ManagerCall::Commit { transaction_id: t, .. }
                | ManagerCall::Abort { transaction_id: t, .. }
                | ManagerCall::Ping { transaction_id: t } => *t == transaction_id,
            })
            .collect()
    }
}

impl TransactionManager for RecordingManager {
    fn prepare_commit(
        &mut self,
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("manager lock");
        if let Some(error) = inner.prepare_failures.remove(&transaction_id) {
            return Err(error);
        }
        if inner.phases.get(&transaction_id) == Some(&TxnPhase::Aborted) {
            return Err(TxnError::TransactionUnknown(transaction_id));
        }
        inner.calls.push(ManagerCall::Prepare {
            transaction_id,
            persistent,
            prepare_timestamp,
        });
        inner.phases.insert(transaction_id, TxnPhase::Prepared);
        Ok(())
    }

    fn prepare_abort(&mut self, transaction_id: TransactionId, force: bool) -> Result<(), TxnError> {
        let inner = self.inner.lock().expect("manager lock");
        match inner.phases.get(&transaction_id) {
            Some(TxnPhase::Committed(_)) if !force => Err(TxnError::InvalidOperation(format!(
                "transaction {transaction_id} is already committed"
            ))),
            _ => Ok(()),
        }
    }

    fn commit_transaction(
        &mut self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("manager lock");
        match inner.phases.get(&transaction_id) {
            Some(TxnPhase::Prepared) => {
                inner.calls.push(ManagerCall::Commit {
                    transaction_id,
                    commit_timestamp,
                });
                inner
                    .phases
                    .insert(transaction_id, TxnPhase::Committed(commit_timestamp));
                Ok(())
            }
            // Re-application during replay is idempotent.
            Some(TxnPhase::Committed(ts)) if *ts == commit_timestamp => Ok(()),
            other => Err(TxnError::InvalidOperation(format!(
                "commit of transaction {transaction_id} in phase {other:?}"
            ))),
        }
    }

    fn abort_transaction(&mut self, transaction_id: TransactionId, force: bool) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("manager lock");
        match inner.phases.get(&transaction_id) {
            None => Err(TxnError::TransactionUnknown(transaction_id)),
            Some(TxnPhase::Committed(_)) => Err(TxnError::InvalidOperation(format!(
                "transaction {transaction_id} is already committed"
            ))),
            _ => {
                inner.calls.push(ManagerCall::Abort {
                    transaction_id,
                    force,
                });
                inner.phases.insert(transaction_id, TxnPhase::Aborted);
                Ok(())
            }
        }
    }

    fn ping_transaction(
        &mut self,
        transaction_id: TransactionId,
        _ping_ancestors: bool,
    ) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("manager lock");
        match inner.phases.get(&transaction_id) {
            None | Some(TxnPhase::Aborted) => Err(TxnError::TransactionUnknown(transaction_id)),
            _ => {
                inner.calls.push(ManagerCall::Ping { transaction_id });
                Ok(())
            }
        }
    }
}

impl ParticipantTransactions for RecordingManager {
    fn start_transaction(
        &mut self,
        transaction_id: TransactionId,
        _start_timestamp: Timestamp,
        _timeout_ms: Option<u64>,
    ) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("manager lock");
        match inner.phases.get(&transaction_id) {
            Some(TxnPhase::Aborted) => Err(TxnError::TransactionUnknown(transaction_id)),
            Some(_) => Ok(()),
            None => {
                inner.phases.insert(transaction_id, TxnPhase::Started);
                Ok(())
            }
        }
    }
}

// ============================================================================
// SharedTimestampOracle
// ============================================================================

#[derive(Debug, Default)]
struct OracleInner {
    last: u64,
    fail_next: u32,
}

/// A shared monotone timestamp oracle. Clones share the counter, giving
/// every cell in a cluster the same global time source.
#[derive(Debug, Clone, Default)]
pub struct SharedTimestampOracle {
    inner: Arc<Mutex<OracleInner>>,
}

impl SharedTimestampOracle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves the oracle forward so the next generated value exceeds `to`.
    pub fn advance_to(&self, to: u64) {
        let mut inner = self.inner.lock().expect("oracle lock");
        inner.last = inner.last.max(to);
    }

    /// Scripts the next `count` generations to fail.
    pub fn fail_next_generations(&self, count: u32) {
        self.inner.lock().expect("oracle lock").fail_next = count;
    }
}

impl TimestampProvider for SharedTimestampOracle {
    fn latest_timestamp(&self) -> Timestamp {
        Timestamp::new(self.inner.lock().expect("oracle lock").last)
    }

    fn generate_timestamp(&mut self) -> Result<Timestamp, TxnError> {
        let mut inner = self.inner.lock().expect("oracle lock");
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(TxnError::TimestampUnavailable("oracle unavailable".into()));
        }
        inner.last += 1;
        Ok(Timestamp::new(inner.last))
    }
}

// ============================================================================
// Cluster
// ============================================================================

/// Transport fault knobs, applied per message with the cluster's seeded
/// generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    pub drop_probability: f64,
    pub duplicate_probability: f64,
}

/// A set of cells joined by an in-memory transport.
///
/// All scheduling is deterministic for a given seed: the same sequence of
/// operations yields the same interleavings, faults included.
pub struct Cluster {
    cells: BTreeMap<CellId, Cell<RecordingManager, SharedTimestampOracle>>,
    managers: BTreeMap<CellId, RecordingManager>,
    oracle: SharedTimestampOracle,
    rng: SmallRng,
    faults: FaultPlan,
}

impl Cluster {
    /// A fault-free cluster over the given cells.
    pub fn new(seed: u64, cell_ids: &[CellId]) -> Self {
        Self::with_faults(seed, cell_ids, FaultPlan::default())
    }

    /// A cluster whose transport drops and duplicates per `faults`.
    pub fn with_faults(seed: u64, cell_ids: &[CellId], faults: FaultPlan) -> Self {
        let oracle = SharedTimestampOracle::new();
        let mut cells = BTreeMap::new();
        let mut managers = BTreeMap::new();
        for &id in cell_ids {
            let manager = RecordingManager::new();
            managers.insert(id, manager.clone());
            cells.insert(
                id,
                Cell::new(id, CellConfig::testing(), manager, oracle.clone()),
            );
        }
        Self {
            cells,
            managers,
            oracle,
            rng: SmallRng::seed_from_u64(seed),
            faults,
        }
    }

    pub fn oracle(&self) -> SharedTimestampOracle {
        self.oracle.clone()
    }

    /// The inspection handle of a cell's transaction manager.
    pub fn manager(&self, cell_id: CellId) -> RecordingManager {
        self.managers[&cell_id].clone()
    }

    pub fn cell(&self, cell_id: CellId) -> &Cell<RecordingManager, SharedTimestampOracle> {
        &self.cells[&cell_id]
    }

    pub fn cell_mut(
        &mut self,
        cell_id: CellId,
    ) -> &mut Cell<RecordingManager, SharedTimestampOracle> {
        self.cells.get_mut(&cell_id).expect("unknown cell")
    }

    /// Crashes a cell's leader and brings a recovered peer up in its place.
    pub fn crash_and_recover(&mut self, cell_id: CellId) {
        let fresh = RecordingManager::new();
        self.managers.insert(cell_id, fresh.clone());
        self.cell_mut(cell_id).crash_and_recover(fresh);
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    /// Runs one round: timestamp continuations, then one mailbox flush per
    /// cell with transport faults applied. Returns whether any work
    /// happened.
    pub fn step(&mut self) -> bool {
        let mut progressed = false;
        let ids: Vec<CellId> = self.cells.keys().copied().collect();

        for &id in &ids {
            let cell = self.cells.get_mut(&id).expect("unknown cell");
            if cell.has_pending_timestamp_requests() {
                cell.dispatch_timestamp_requests();
                progressed = true;
            }
        }

        for &sender in &ids {
            let batches = self.cells.get_mut(&sender).expect("unknown cell").poll_outbound();
            for batch in batches {
                progressed = true;
                let mut lossy = false;
                let mut wire = Vec::new();
                for message in batch.messages {
                    if self.rng.gen_bool(self.faults.drop_probability) {
                        lossy = true;
                        continue;
                    }
                    if self.rng.gen_bool(self.faults.duplicate_probability) {
                        wire.push(message.clone());
                    }
                    wire.push(message);
                }

                let ack = if wire.is_empty() {
                    None
                } else {
                    let target = self.cells.get_mut(&batch.to).expect("unknown cell");
                    target.handle_receive_messages(sender, wire).ok()
                };

                let origin = self.cells.get_mut(&sender).expect("unknown cell");
                if let Some(next_expected) = ack {
                    origin.handle_acknowledgment(batch.to, next_expected);
                }
                origin.on_delivery_result(batch.to, !lossy && ack.is_some());
            }
        }

        for &id in &ids {
            self.cells.get_mut(&id).expect("unknown cell").advance_tick();
        }

        progressed
    }

    /// Steps until the cluster stops making progress (with enough patience
    /// for mailbox backoff to expire), bounded by `max_rounds`.
    pub fn run_until_quiet(&mut self, max_rounds: usize) {
        let mut quiet = 0;
        for _ in 0..max_rounds {
            if self.step() {
                quiet = 0;
            } else {
                quiet += 1;
                if quiet > 16 {
                    return;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Synchronous RPC helpers
    // ------------------------------------------------------------------

    /// Issues `CommitTransaction` at `coordinator` and pumps the cluster
    /// until the response resolves.
    pub fn commit_transaction(
        &mut self,
        coordinator: CellId,
        request: &CommitTransactionRequest,
    ) -> Result<CommitReply, TxnError> {
        let handle = self.cell_mut(coordinator).handle_commit_transaction(request)?;
        let bytes = self.await_response(coordinator, handle)?;
        decode_commit_response(&bytes)
    }

    /// Issues `AbortTransaction` at `cell_id` and pumps until resolved.
    pub fn abort_transaction(
        &mut self,
        cell_id: CellId,
        request: &AbortTransactionRequest,
    ) -> Result<AbortReply, TxnError> {
        let handle = self.cell_mut(cell_id).handle_abort_transaction(request)?;
        let bytes = self.await_response(cell_id, handle)?;
        decode_abort_response(&bytes)
    }

    /// Issues `PingTransaction` at `cell_id`.
    pub fn ping_transaction(
        &mut self,
        cell_id: CellId,
        request: &PingTransactionRequest,
    ) -> Result<(), TxnError> {
        self.cell_mut(cell_id).handle_ping_transaction(request)
    }

    /// Issues `StartTransaction` at `cell_id` (participant registration).
    pub fn start_transaction(
        &mut self,
        cell_id: CellId,
        request: &StartTransactionRequest,
    ) -> Result<(), TxnError> {
        self.cell_mut(cell_id).handle_start_transaction(request)
    }

    fn await_response(
        &mut self,
        cell_id: CellId,
        handle: RequestHandle,
    ) -> Result<Bytes, TxnError> {
        for _ in 0..10_000 {
            if let Some(bytes) = self.cell_mut(cell_id).take_response(handle) {
                return Ok(bytes);
            }
            self.step();
        }
        Err(TxnError::Transport("response did not resolve".into()))
    }
}
