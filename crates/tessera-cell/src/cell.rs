//! The composite cell automaton.
//!
//! A [`Cell`] binds the mailbox manager and the transaction supervisor to a
//! replicated mutation log and a kept-response table. Everything the
//! protocol does is one of:
//!
//! - a **transient RPC handler** (leader only) that validates, consults the
//!   kept-response table, and proposes a mutation;
//! - a **mutation application**, deterministic and identical on every peer;
//! - a **continuation** (timestamp generation, outbound mailbox flush) that
//!   re-enters the automaton by proposing a further mutation.
//!
//! The log model is deliberately simple: proposing appends the entry and
//! applies it immediately, which models a successful consensus round.
//! Recovery replays the log (or a snapshot plus the remaining suffix) into
//! fresh state, which is exactly what a follower taking over has done.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessera_hive::{HiveConfig, HiveState, OutboundBatch, SequenceNumber, SequencedMessage};
use tessera_supervisor::rpc::{
    encode_abort_response, encode_commit_response, AbortTransactionRequest,
    CommitTransactionRequest, PingTransactionRequest, StartTransactionRequest,
};
use tessera_supervisor::{
    PersistedCommit, StartCommitOutcome, SupervisorMutation, SupervisorOutput, TimestampOutcome,
    TimestampProvider, TransactionManager, TransactionSupervisor, TxnError,
};
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

use crate::error::{Error, Result};
use crate::mutation::CellMutation;

/// Current snapshot layout version; loaders reject anything else.
pub const SNAPSHOT_VERSION: u32 = 1;

// ============================================================================
// Configuration
// ============================================================================

/// Static configuration of a cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellConfig {
    pub hive: HiveConfig,
}

impl CellConfig {
    /// Configuration for testing (tight mailbox retry schedule).
    pub fn testing() -> Self {
        Self {
            hive: HiveConfig::testing(),
        }
    }
}

// ============================================================================
// Participant registration
// ============================================================================

/// Tablet-node surface for registering a transaction at a participant before
/// the coordinator may involve it. This sits outside the coordinator's
/// transaction-manager hook: it belongs to the cell hosting the data.
pub trait ParticipantTransactions {
    fn start_transaction(
        &mut self,
        transaction_id: TransactionId,
        start_timestamp: Timestamp,
        timeout_ms: Option<u64>,
    ) -> std::result::Result<(), TxnError>;
}

// ============================================================================
// Cell
// ============================================================================

/// Identifies an in-flight client RPC on a cell; redeemed against
/// [`Cell::take_response`] once the commit machinery resolves it.
pub type RequestHandle = u64;

#[derive(Serialize, Deserialize)]
struct SnapshotEnvelope {
    version: u32,
    applied: u64,
    hive: HiveState,
    commit_keys: Vec<TransactionId>,
    commit_values: Vec<PersistedCommit>,
    kept_responses: Vec<(MutationId, Bytes)>,
}

/// One replicated cell: mailboxes, commit engine, log, kept responses.
pub struct Cell<M, P> {
    id: CellId,
    config: CellConfig,

    // Replicated state.
    log: Vec<CellMutation>,
    applied: u64,
    hive: HiveState,
    supervisor: TransactionSupervisor,
    kept_responses: BTreeMap<MutationId, Bytes>,

    // Collaborators.
    manager: M,
    provider: P,

    // Transient leader-side state.
    is_leader: bool,
    tick: u64,
    next_handle: RequestHandle,
    commit_waiters: BTreeMap<TransactionId, Vec<RequestHandle>>,
    abort_waiters: BTreeMap<TransactionId, Vec<RequestHandle>>,
    finished: BTreeMap<RequestHandle, Bytes>,
    pending_timestamp_requests: VecDeque<TransactionId>,
}

impl<M, P> Cell<M, P>
where
    M: TransactionManager,
    P: TimestampProvider,
{
    /// Creates a fresh cell, initially leading.
    pub fn new(id: CellId, config: CellConfig, manager: M, provider: P) -> Self {
        Self {
            id,
            config,
            log: Vec::new(),
            applied: 0,
            hive: HiveState::new(id),
            supervisor: TransactionSupervisor::new(),
            kept_responses: BTreeMap::new(),
            manager,
            provider,
            is_leader: true,
            tick: 0,
            next_handle: 1,
            commit_waiters: BTreeMap::new(),
            abort_waiters: BTreeMap::new(),
            finished: BTreeMap::new(),
            pending_timestamp_requests: VecDeque::new(),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn supervisor(&self) -> &TransactionSupervisor {
        &self.supervisor
    }

    pub fn hive(&self) -> &HiveState {
        &self.hive
    }

    pub fn manager(&self) -> &M {
        &self.manager
    }

    pub fn log_len(&self) -> usize {
        self.log.len()
    }

    // ------------------------------------------------------------------
    // Client RPC surface (leader only)
    // ------------------------------------------------------------------

    /// `CommitTransaction`: returns a handle resolved once the commit
    /// finishes or fails.
    pub fn handle_commit_transaction(
        &mut self,
        request: &CommitTransactionRequest,
    ) -> std::result::Result<RequestHandle, TxnError> {
        self.ensure_leader()?;
        let transaction_id = request.transaction_id;
        let handle = self.allocate_handle();

        // Retries with the same mutation id replay the original response
        // byte-for-byte, for simple and distributed commits alike.
        if let Some(mutation_id) = request.mutation_id {
            if let Some(response) = self.kept_responses.get(&mutation_id) {
                tracing::debug!(tx = %transaction_id, "replying with kept response");
                self.finished.insert(handle, response.clone());
                return Ok(handle);
            }
        }

        let prepare_timestamp = self.provider.latest_timestamp();
        let outcome = self.supervisor.start_commit(
            &mut tessera_supervisor::ApplyContext {
                self_cell_id: self.id,
                is_leader: self.is_leader,
                manager: &mut self.manager,
            },
            request,
            prepare_timestamp,
        );

        match outcome {
            StartCommitOutcome::AttachToExisting => {
                self.commit_waiters
                    .entry(transaction_id)
                    .or_default()
                    .push(handle);
            }
            StartCommitOutcome::SimpleStarted => {
                self.commit_waiters
                    .entry(transaction_id)
                    .or_default()
                    .push(handle);
                self.pending_timestamp_requests.push_back(transaction_id);
            }
            StartCommitOutcome::SimpleFailed { response, mutation } => {
                self.finished.insert(handle, response);
                self.propose(CellMutation::Supervisor(mutation));
            }
            StartCommitOutcome::ProposeStart(mutation) => {
                self.commit_waiters
                    .entry(transaction_id)
                    .or_default()
                    .push(handle);
                self.propose(CellMutation::Supervisor(mutation));
            }
        }

        Ok(handle)
    }

    /// `AbortTransaction`: validates the abort transiently, then proposes
    /// it. Validation errors surface synchronously.
    pub fn handle_abort_transaction(
        &mut self,
        request: &AbortTransactionRequest,
    ) -> std::result::Result<RequestHandle, TxnError> {
        self.ensure_leader()?;
        let handle = self.allocate_handle();

        if let Some(mutation_id) = request.mutation_id {
            if let Some(response) = self.kept_responses.get(&mutation_id) {
                self.finished.insert(handle, response.clone());
                return Ok(handle);
            }
        }

        let mutation = self.supervisor.abort_transaction(
            &mut tessera_supervisor::ApplyContext {
                self_cell_id: self.id,
                is_leader: self.is_leader,
                manager: &mut self.manager,
            },
            request.transaction_id,
            request.force,
            request.mutation_id,
        )?;

        self.abort_waiters
            .entry(request.transaction_id)
            .or_default()
            .push(handle);
        self.propose(CellMutation::Supervisor(mutation));
        Ok(handle)
    }

    /// `PingTransaction`: forwarded to the transaction manager outside the
    /// automaton; errors surface verbatim.
    pub fn handle_ping_transaction(
        &mut self,
        request: &PingTransactionRequest,
    ) -> std::result::Result<(), TxnError> {
        self.ensure_leader()?;
        self.supervisor.ping_transaction(
            &mut tessera_supervisor::ApplyContext {
                self_cell_id: self.id,
                is_leader: self.is_leader,
                manager: &mut self.manager,
            },
            request.transaction_id,
            request.ping_ancestors,
        )
    }

    /// Redeems a finished RPC handle.
    pub fn take_response(&mut self, handle: RequestHandle) -> Option<Bytes> {
        self.finished.remove(&handle)
    }

    // ------------------------------------------------------------------
    // Inter-cell RPC surface
    // ------------------------------------------------------------------

    /// `ReceiveMessages` from a peer cell's leader. Returns this cell's
    /// advanced expectation, which the sender applies as an acknowledgment.
    pub fn handle_receive_messages(
        &mut self,
        sender: CellId,
        messages: Vec<SequencedMessage>,
    ) -> std::result::Result<SequenceNumber, TxnError> {
        self.ensure_leader()?;
        self.propose(CellMutation::HiveReceive { sender, messages });
        Ok(self
            .hive
            .mailbox(sender)
            .map(tessera_hive::Mailbox::next_expected_incoming)
            .unwrap_or(SequenceNumber::ZERO))
    }

    /// Applies a durable acknowledgment from a peer.
    pub fn handle_acknowledgment(&mut self, peer: CellId, next_expected: SequenceNumber) {
        if !self.is_leader {
            return;
        }
        self.propose(CellMutation::HiveAcknowledge {
            peer,
            next_expected,
        });
    }

    // ------------------------------------------------------------------
    // Continuations
    // ------------------------------------------------------------------

    /// Fulfills queued commit-timestamp requests against the provider and
    /// proposes the resulting mutations.
    pub fn dispatch_timestamp_requests(&mut self) {
        while let Some(transaction_id) = self.pending_timestamp_requests.pop_front() {
            let generated = self.provider.generate_timestamp();
            let outcome = self.supervisor.on_commit_timestamp_generated(
                &mut tessera_supervisor::ApplyContext {
                    self_cell_id: self.id,
                    is_leader: self.is_leader,
                    manager: &mut self.manager,
                },
                transaction_id,
                generated,
            );
            match outcome {
                TimestampOutcome::Ignored => {}
                TimestampOutcome::Propose(mutation) => {
                    self.propose(CellMutation::Supervisor(mutation));
                }
                TimestampOutcome::Failed { response, mutation } => {
                    self.resolve_waiters(transaction_id, false, &response);
                    self.propose(CellMutation::Supervisor(mutation));
                }
            }
        }
    }

    /// True while a commit-timestamp request is parked on the automaton.
    pub fn has_pending_timestamp_requests(&self) -> bool {
        !self.pending_timestamp_requests.is_empty()
    }

    /// Collects mailbox batches due for (re)transmission this tick.
    pub fn poll_outbound(&mut self) -> Vec<OutboundBatch> {
        if !self.is_leader {
            return Vec::new();
        }
        let tick = self.tick;
        self.hive.poll_outbound(tick)
    }

    /// Records the transport outcome of an outbound batch.
    pub fn on_delivery_result(&mut self, peer: CellId, ok: bool) {
        let tick = self.tick;
        let config = self.config.hive;
        self.hive.on_delivery_result(peer, tick, ok, &config);
    }

    /// Advances the cell's coarse retry clock.
    pub fn advance_tick(&mut self) {
        self.tick += 1;
    }

    // ------------------------------------------------------------------
    // Leadership and recovery
    // ------------------------------------------------------------------

    /// Steps down: simple commits and response promises are lost; waiting
    /// clients observe a transport failure and must retry with the same
    /// mutation id.
    pub fn step_down(&mut self) {
        if !self.is_leader {
            return;
        }
        tracing::info!(cell = %self.id, "stepping down");
        self.is_leader = false;
        self.supervisor.on_stop_leading();
        self.hive.reset_transient();
        self.pending_timestamp_requests.clear();
        self.fail_all_waiters();
    }

    /// Becomes the active leader: re-enters the generate-timestamp step for
    /// every recovered commit that is ready, and rearms the mailbox resend
    /// window.
    pub fn become_leader(&mut self) {
        if self.is_leader {
            return;
        }
        tracing::info!(cell = %self.id, "becoming leader");
        self.is_leader = true;
        self.hive.reset_transient();
        let output = self.supervisor.on_leader_active();
        self.route_output(output, false, true);
    }

    /// Simulates a leader crash followed by a peer taking over: all
    /// transient state dies, replicated state is rebuilt by replaying the
    /// log into a fresh automaton, and the new peer assumes leadership.
    ///
    /// `fresh_manager` stands in for the peer's own transaction-manager
    /// state, which is replicated by the same log.
    pub fn crash_and_recover(&mut self, fresh_manager: M) {
        tracing::info!(cell = %self.id, entries = self.log.len(), "crash; recovering from log");
        self.step_down();

        self.hive = HiveState::new(self.id);
        self.supervisor = TransactionSupervisor::new();
        self.kept_responses.clear();
        self.manager = fresh_manager;
        self.applied = 0;

        let entries: Vec<CellMutation> = self.log.clone();
        for entry in &entries {
            self.apply_entry(entry, false);
        }
        self.applied = entries.len() as u64;

        self.become_leader();
    }

    /// Serializes the cell's replicated state.
    ///
    /// Layout: a version integer, then the supervisor's keys, then its
    /// values, then the mailbox and kept-response tables.
    pub fn snapshot(&self) -> Result<Bytes> {
        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            applied: self.applied,
            hive: self.hive.clone(),
            commit_keys: self.supervisor.registry().save_keys(),
            commit_values: self.supervisor.registry().save_values(),
            kept_responses: self
                .kept_responses
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        };
        postcard::to_allocvec(&envelope)
            .map(Bytes::from)
            .map_err(|e| Error::SnapshotSerialization(e.to_string()))
    }

    /// Restores replicated state from a snapshot, replays the remaining log
    /// suffix, and assumes leadership.
    pub fn recover_from_snapshot(&mut self, snapshot: &Bytes, fresh_manager: M) -> Result<()> {
        let envelope: SnapshotEnvelope = postcard::from_bytes(snapshot)
            .map_err(|e| Error::CorruptSnapshot(e.to_string()))?;
        if envelope.version != SNAPSHOT_VERSION {
            return Err(Error::UnsupportedSnapshotVersion(
                envelope.version,
                SNAPSHOT_VERSION,
            ));
        }

        self.step_down();
        self.hive = envelope.hive;
        self.hive.reset_transient();
        self.supervisor = TransactionSupervisor::new();
        self.supervisor
            .registry_mut()
            .load(envelope.commit_keys, envelope.commit_values);
        self.kept_responses = envelope.kept_responses.into_iter().collect();
        self.manager = fresh_manager;

        let suffix: Vec<CellMutation> = self
            .log
            .iter()
            .skip(envelope.applied as usize)
            .cloned()
            .collect();
        for entry in &suffix {
            self.apply_entry(entry, false);
        }
        self.applied = self.log.len() as u64;

        self.become_leader();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Log machinery
    // ------------------------------------------------------------------

    /// Appends a mutation to the log and applies it (a successful consensus
    /// round).
    fn propose(&mut self, mutation: CellMutation) {
        debug_assert!(self.is_leader, "only the leader proposes mutations");
        self.log.push(mutation.clone());
        self.apply_entry(&mutation, true);
        self.applied = self.log.len() as u64;
    }

    /// Applies one log entry. `live` distinguishes leader-side application
    /// from recovery replay: replay never resolves client promises nor
    /// requests timestamps.
    fn apply_entry(&mut self, mutation: &CellMutation, live: bool) {
        match mutation {
            CellMutation::Supervisor(supervisor_mutation) => {
                let is_abort_reply =
                    matches!(supervisor_mutation, SupervisorMutation::AbortTransaction { .. });
                let output = self.supervisor.apply(
                    &mut tessera_supervisor::ApplyContext {
                        self_cell_id: self.id,
                        is_leader: live && self.is_leader,
                        manager: &mut self.manager,
                    },
                    supervisor_mutation,
                );
                self.route_output(output, is_abort_reply, live);
            }
            CellMutation::HiveReceive { sender, messages } => {
                let outcome = self.hive.apply_receive(*sender, messages.clone());
                for payload in outcome.delivered {
                    match SupervisorMutation::decode_payload(&payload) {
                        Ok(remote) => {
                            let output = self.supervisor.apply(
                                &mut tessera_supervisor::ApplyContext {
                                    self_cell_id: self.id,
                                    is_leader: live && self.is_leader,
                                    manager: &mut self.manager,
                                },
                                &remote,
                            );
                            self.route_output(output, false, live);
                        }
                        Err(error) => {
                            tracing::error!(peer = %sender, %error, "undecodable mailbox payload, skipping");
                        }
                    }
                }
            }
            CellMutation::HiveAcknowledge {
                peer,
                next_expected,
            } => {
                self.hive.apply_acknowledge(*peer, *next_expected);
            }
        }
    }

    /// Routes a supervisor output: posts messages, registers kept
    /// responses, resolves waiters, queues timestamp requests.
    fn route_output(&mut self, output: SupervisorOutput, is_abort_reply: bool, live: bool) {
        for message in output.messages {
            self.hive
                .post_message(message.to, message.mutation.encode_payload());
        }
        for reply in output.replies {
            if let Some(mutation_id) = reply.keep_as {
                self.kept_responses.insert(mutation_id, reply.response.clone());
            }
            if live {
                self.resolve_waiters(reply.transaction_id, is_abort_reply, &reply.response);
            }
        }
        if live && self.is_leader {
            self.pending_timestamp_requests
                .extend(output.timestamp_requests);
        }
    }

    fn resolve_waiters(
        &mut self,
        transaction_id: TransactionId,
        is_abort_reply: bool,
        response: &Bytes,
    ) {
        let waiters = if is_abort_reply {
            self.abort_waiters.remove(&transaction_id)
        } else {
            self.commit_waiters.remove(&transaction_id)
        };
        for handle in waiters.unwrap_or_default() {
            self.finished.insert(handle, response.clone());
        }
    }

    /// Resolves every outstanding waiter with a transport error; this is
    /// what clients of a dying leader observe.
    fn fail_all_waiters(&mut self) {
        let commit_response = encode_commit_response(&Err(TxnError::Transport(
            "cell leader changed".into(),
        )));
        let abort_response = encode_abort_response(&Err(TxnError::Transport(
            "cell leader changed".into(),
        )));
        for (_, handles) in std::mem::take(&mut self.commit_waiters) {
            for handle in handles {
                self.finished.insert(handle, commit_response.clone());
            }
        }
        for (_, handles) in std::mem::take(&mut self.abort_waiters) {
            for handle in handles {
                self.finished.insert(handle, abort_response.clone());
            }
        }
    }

    fn allocate_handle(&mut self) -> RequestHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn ensure_leader(&self) -> std::result::Result<(), TxnError> {
        if self.is_leader {
            Ok(())
        } else {
            Err(TxnError::NotLeader(self.id))
        }
    }
}

impl<M, P> Cell<M, P>
where
    M: TransactionManager + ParticipantTransactions,
    P: TimestampProvider,
{
    /// `StartTransaction`: registers the transaction at this (tablet)
    /// participant ahead of any of its effects.
    pub fn handle_start_transaction(
        &mut self,
        request: &StartTransactionRequest,
    ) -> std::result::Result<(), TxnError> {
        self.ensure_leader()?;
        self.manager.start_transaction(
            request.transaction_id,
            request.start_timestamp,
            request.timeout_ms,
        )
    }
}
