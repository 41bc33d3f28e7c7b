//! The two-phase commit engine.
//!
//! One [`TransactionSupervisor`] runs per cell, driven from two sides:
//!
//! - **RPC handlers** ([`TransactionSupervisor::start_commit`],
//!   [`abort_transaction`](TransactionSupervisor::abort_transaction),
//!   [`ping_transaction`](TransactionSupervisor::ping_transaction)) run
//!   transiently on the leader and decide which mutation, if any, to
//!   propose.
//! - **Mutation application** ([`TransactionSupervisor::apply`]) runs
//!   deterministically on every peer and performs the actual state
//!   transitions, calling into the [`TransactionManager`] and emitting
//!   mailbox messages and client replies through [`SupervisorOutput`].
//!
//! Long-running work (commit-timestamp generation) leaves the automaton as
//! a [`SupervisorOutput::timestamp_requests`] entry and re-enters through
//! [`TransactionSupervisor::on_commit_timestamp_generated`], which looks the
//! commit up again by id: the commit may have been aborted or removed by an
//! intervening mutation.

use bytes::Bytes;
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

use crate::commit::{Commit, CommitState};
use crate::error::TxnError;
use crate::manager::TransactionManager;
use crate::mutation::SupervisorMutation;
use crate::registry::CommitRegistry;
use crate::rpc::{
    encode_abort_response, encode_commit_response, AbortReply, CommitReply,
    CommitTransactionRequest,
};

// ============================================================================
// Context and output
// ============================================================================

/// Per-call environment handed to the engine by the hosting cell.
pub struct ApplyContext<'a> {
    /// This cell's identity (the coordinator id inside fan-out messages).
    pub self_cell_id: CellId,

    /// Whether this peer currently leads the cell. Only the leader evaluates
    /// second-phase readiness and emits timestamp requests.
    pub is_leader: bool,

    /// The local transaction manager (C3).
    pub manager: &'a mut dyn TransactionManager,
}

/// A mailbox message produced by a handler, posted atomically with the
/// enclosing mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedMessage {
    pub to: CellId,
    pub mutation: SupervisorMutation,
}

/// A resolved client response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReply {
    pub transaction_id: TransactionId,
    /// When set, the hosting cell registers the response with the log's
    /// kept-response table for idempotent replay.
    pub keep_as: Option<MutationId>,
    pub response: Bytes,
}

/// Everything a handler asks the hosting cell to do.
#[derive(Debug, Default)]
pub struct SupervisorOutput {
    /// Messages to post through the mailbox layer.
    pub messages: Vec<PostedMessage>,

    /// Client replies to resolve.
    pub replies: Vec<ClientReply>,

    /// Transactions whose commit timestamp the leader must now obtain from
    /// the provider.
    pub timestamp_requests: Vec<TransactionId>,
}

impl SupervisorOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.replies.is_empty() && self.timestamp_requests.is_empty()
    }
}

// ============================================================================
// Transient outcomes
// ============================================================================

/// Result of the `CommitTransaction` RPC handler.
#[derive(Debug)]
pub enum StartCommitOutcome {
    /// A commit for this transaction is already in flight; attach the
    /// caller to its response.
    AttachToExisting,

    /// A simple commit was created and prepared; generate a commit
    /// timestamp and re-enter through `on_commit_timestamp_generated`.
    SimpleStarted,

    /// A simple commit failed to prepare: resolve the caller with
    /// `response` and propose `mutation` to abort everywhere.
    SimpleFailed {
        response: Bytes,
        mutation: SupervisorMutation,
    },

    /// A distributed commit: propose `mutation` and attach the caller.
    ProposeStart(SupervisorMutation),
}

/// Result of delivering a generated commit timestamp back to the engine.
#[derive(Debug)]
pub enum TimestampOutcome {
    /// The commit vanished meanwhile (aborted or finished); nothing to do.
    Ignored,

    /// Propose this mutation to move the commit forward.
    Propose(SupervisorMutation),

    /// Generation failed: resolve waiters with `response` and propose
    /// `mutation` to abort everywhere.
    Failed {
        response: Bytes,
        mutation: SupervisorMutation,
    },
}

// ============================================================================
// TransactionSupervisor
// ============================================================================

/// The per-cell commit coordinator.
#[derive(Debug, Default)]
pub struct TransactionSupervisor {
    registry: CommitRegistry,
}

impl TransactionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &CommitRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CommitRegistry {
        &mut self.registry
    }

    // ------------------------------------------------------------------
    // RPC handlers (leader, transient)
    // ------------------------------------------------------------------

    /// Handles a `CommitTransaction` RPC.
    ///
    /// The kept-response check for `request.mutation_id` happens in the
    /// hosting cell before this is called; here an existing in-flight
    /// commit wins over everything else.
    pub fn start_commit(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        request: &CommitTransactionRequest,
        prepare_timestamp: Timestamp,
    ) -> StartCommitOutcome {
        let transaction_id = request.transaction_id;

        if self.registry.find(transaction_id).is_some() {
            tracing::debug!(tx = %transaction_id, "commit already in flight, attaching caller");
            return StartCommitOutcome::AttachToExisting;
        }

        if request.participant_cell_ids.is_empty() {
            self.start_simple_commit(ctx, request, prepare_timestamp)
        } else {
            tracing::debug!(
                tx = %transaction_id,
                participants = request.participant_cell_ids.len(),
                "proposing distributed commit start"
            );
            StartCommitOutcome::ProposeStart(SupervisorMutation::StartDistributedCommit {
                transaction_id,
                mutation_id: request.mutation_id,
                participant_cell_ids: request.participant_cell_ids.iter().copied().collect(),
                prepare_timestamp,
            })
        }
    }

    fn start_simple_commit(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        request: &CommitTransactionRequest,
        prepare_timestamp: Timestamp,
    ) -> StartCommitOutcome {
        let transaction_id = request.transaction_id;

        let commit = Commit::new(false, transaction_id, request.mutation_id, Default::default());
        let commit = self.registry.insert_simple(commit);
        commit.advance_persistent_state(CommitState::Prepare);

        // Any prepare failure is replied to the client.
        if let Err(error) =
            ctx.manager
                .prepare_commit(transaction_id, false, prepare_timestamp)
        {
            tracing::debug!(tx = %transaction_id, %error, "simple commit failed to prepare");
            commit.set_transient_state(CommitState::Abort);
            return StartCommitOutcome::SimpleFailed {
                response: encode_commit_response(&Err(error)),
                mutation: SupervisorMutation::AbortFailedTransaction { transaction_id },
            };
        }

        tracing::debug!(
            tx = %transaction_id,
            prepare_ts = %prepare_timestamp,
            "simple commit prepared"
        );
        commit.set_transient_state(CommitState::GenerateCommitTimestamp);
        StartCommitOutcome::SimpleStarted
    }

    /// Handles an `AbortTransaction` RPC: validates the abort transiently,
    /// then hands back the mutation to propose.
    pub fn abort_transaction(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        force: bool,
        mutation_id: Option<MutationId>,
    ) -> Result<SupervisorMutation, TxnError> {
        ctx.manager.prepare_abort(transaction_id, force)?;
        Ok(SupervisorMutation::AbortTransaction {
            transaction_id,
            mutation_id,
            force,
        })
    }

    /// Handles a `PingTransaction` RPC. Errors surface to the caller
    /// verbatim; `TransactionUnknown` tells the client to abort locally.
    pub fn ping_transaction(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        ping_ancestors: bool,
    ) -> Result<(), TxnError> {
        ctx.manager.ping_transaction(transaction_id, ping_ancestors)
    }

    /// Re-entry point for a generated commit timestamp.
    pub fn on_commit_timestamp_generated(
        &mut self,
        _ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        timestamp: Result<Timestamp, TxnError>,
    ) -> TimestampOutcome {
        let Some(commit) = self.registry.find_mut(transaction_id) else {
            tracing::debug!(
                tx = %transaction_id,
                "commit timestamp generated for an invalid or expired transaction, ignoring"
            );
            return TimestampOutcome::Ignored;
        };

        let timestamp = match timestamp {
            Ok(timestamp) => timestamp,
            Err(cause) => {
                let error = match cause {
                    e @ TxnError::TimestampUnavailable(_) => e,
                    other => TxnError::TimestampUnavailable(other.to_string()),
                };
                tracing::warn!(tx = %transaction_id, %error, "failed to generate commit timestamp");
                commit.set_transient_state(CommitState::Abort);
                return TimestampOutcome::Failed {
                    response: encode_commit_response(&Err(error)),
                    mutation: SupervisorMutation::AbortFailedTransaction { transaction_id },
                };
            }
        };

        if commit.is_distributed() {
            TimestampOutcome::Propose(SupervisorMutation::FinalizeDistributedCommit {
                transaction_id,
                commit_timestamp: timestamp,
            })
        } else {
            TimestampOutcome::Propose(SupervisorMutation::CommitPreparedTransaction {
                transaction_id,
                commit_timestamp: timestamp,
                is_distributed: false,
            })
        }
    }

    // ------------------------------------------------------------------
    // Mutation application (all peers, deterministic)
    // ------------------------------------------------------------------

    /// Applies one supervisor mutation.
    pub fn apply(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        mutation: &SupervisorMutation,
    ) -> SupervisorOutput {
        match mutation {
            SupervisorMutation::StartDistributedCommit {
                transaction_id,
                mutation_id,
                participant_cell_ids,
                prepare_timestamp,
            } => self.apply_start_distributed_commit(
                ctx,
                *transaction_id,
                *mutation_id,
                participant_cell_ids,
                *prepare_timestamp,
            ),
            SupervisorMutation::FinalizeDistributedCommit {
                transaction_id,
                commit_timestamp,
            } => self.apply_finalize_distributed_commit(ctx, *transaction_id, *commit_timestamp),
            SupervisorMutation::AbortTransaction {
                transaction_id,
                mutation_id,
                force,
            } => self.apply_abort_transaction(ctx, *transaction_id, *mutation_id, *force),
            SupervisorMutation::PrepareTransactionCommit {
                transaction_id,
                prepare_timestamp,
                coordinator_cell_id,
            } => self.apply_prepare_transaction_commit(
                ctx,
                *transaction_id,
                *prepare_timestamp,
                *coordinator_cell_id,
            ),
            SupervisorMutation::OnTransactionCommitPrepared {
                transaction_id,
                participant_cell_id,
                error,
            } => self.apply_on_transaction_commit_prepared(
                ctx,
                *transaction_id,
                *participant_cell_id,
                error.clone(),
            ),
            SupervisorMutation::CommitPreparedTransaction {
                transaction_id,
                commit_timestamp,
                is_distributed,
            } => self.apply_commit_prepared_transaction(
                ctx,
                *transaction_id,
                *commit_timestamp,
                *is_distributed,
            ),
            SupervisorMutation::AbortFailedTransaction { transaction_id } => {
                self.apply_abort_failed_transaction(ctx, *transaction_id)
            }
        }
    }

    fn apply_start_distributed_commit(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        mutation_id: Option<MutationId>,
        participant_cell_ids: &std::collections::BTreeSet<CellId>,
        prepare_timestamp: Timestamp,
    ) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();

        debug_assert!(
            self.registry.find_simple(transaction_id).is_none(),
            "transaction {transaction_id} already has a simple commit"
        );
        if self.registry.find_distributed(transaction_id).is_some() {
            // Duplicate proposal; the caller is attached to the existing
            // commit's response by the hosting cell.
            return output;
        }

        let commit = Commit::new(
            true,
            transaction_id,
            mutation_id,
            participant_cell_ids.clone(),
        );
        let commit = self.registry.insert_distributed(commit);
        commit.advance_persistent_state(CommitState::Prepare);

        tracing::debug!(
            tx = %transaction_id,
            coordinator = %ctx.self_cell_id,
            participants = participant_cell_ids.len(),
            prepare_ts = %prepare_timestamp,
            "distributed commit first phase started"
        );

        // Prepare at the coordinator.
        if let Err(error) = ctx
            .manager
            .prepare_commit(transaction_id, true, prepare_timestamp)
        {
            tracing::debug!(tx = %transaction_id, %error, "coordinator failed to prepare");
            self.set_commit_failed(ctx, transaction_id, error, &mut output);
            return output;
        }

        // Prepare at the participants.
        let coordinator_cell_id = ctx.self_cell_id;
        let commit = self
            .registry
            .find_distributed(transaction_id)
            .expect("commit was just inserted");
        for &cell_id in commit.participant_cell_ids() {
            output.messages.push(PostedMessage {
                to: cell_id,
                mutation: SupervisorMutation::PrepareTransactionCommit {
                    transaction_id,
                    prepare_timestamp,
                    coordinator_cell_id,
                },
            });
        }

        output
    }

    fn apply_prepare_transaction_commit(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        prepare_timestamp: Timestamp,
        coordinator_cell_id: CellId,
    ) -> SupervisorOutput {
        // Participants keep no commit object; they only prepare and report.
        let error = match ctx
            .manager
            .prepare_commit(transaction_id, true, prepare_timestamp)
        {
            Ok(()) => {
                tracing::debug!(
                    tx = %transaction_id,
                    coordinator = %coordinator_cell_id,
                    prepare_ts = %prepare_timestamp,
                    "participant prepared distributed commit"
                );
                None
            }
            Err(error) => {
                tracing::debug!(
                    tx = %transaction_id,
                    coordinator = %coordinator_cell_id,
                    %error,
                    "participant failed to prepare distributed commit"
                );
                Some(error)
            }
        };

        SupervisorOutput {
            messages: vec![PostedMessage {
                to: coordinator_cell_id,
                mutation: SupervisorMutation::OnTransactionCommitPrepared {
                    transaction_id,
                    participant_cell_id: ctx.self_cell_id,
                    error,
                },
            }],
            ..Default::default()
        }
    }

    fn apply_on_transaction_commit_prepared(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        participant_cell_id: CellId,
        error: Option<TxnError>,
    ) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();

        let Some(commit) = self.registry.find_distributed(transaction_id) else {
            tracing::debug!(
                tx = %transaction_id,
                participant = %participant_cell_id,
                "prepare acknowledgment for an invalid or expired transaction, ignoring"
            );
            return output;
        };
        debug_assert!(commit.is_distributed());

        if let Some(error) = error {
            tracing::debug!(
                tx = %transaction_id,
                participant = %participant_cell_id,
                %error,
                "participant has failed to prepare"
            );
            self.set_commit_failed(ctx, transaction_id, error, &mut output);
            return output;
        }

        tracing::debug!(
            tx = %transaction_id,
            participant = %participant_cell_id,
            "participant has prepared"
        );

        let commit = self
            .registry
            .find_mut(transaction_id)
            .expect("commit was just found");
        if !commit.record_responded(participant_cell_id) {
            tracing::warn!(
                tx = %transaction_id,
                participant = %participant_cell_id,
                "unexpected prepare acknowledgment, ignoring"
            );
            return output;
        }

        if ctx.is_leader {
            self.check_second_phase_start(transaction_id, &mut output);
        }

        output
    }

    fn apply_finalize_distributed_commit(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();

        let Some(commit) = self.registry.find_mut(transaction_id) else {
            tracing::error!(
                tx = %transaction_id,
                "requested to finalize an invalid or expired transaction, ignoring"
            );
            return output;
        };
        debug_assert!(commit.is_distributed());

        commit.set_commit_timestamp(commit_timestamp);
        commit.advance_persistent_state(CommitState::Commit);

        // Commit at the coordinator. Must not fail after a successful
        // prepare; an error here is a transaction-manager contract
        // violation.
        Self::do_commit_prepared(ctx, transaction_id, commit_timestamp);

        // Commit at the participants.
        let commit = self
            .registry
            .find_mut(transaction_id)
            .expect("commit was just found");
        for &cell_id in commit.participant_cell_ids() {
            output.messages.push(PostedMessage {
                to: cell_id,
                mutation: SupervisorMutation::CommitPreparedTransaction {
                    transaction_id,
                    commit_timestamp,
                    is_distributed: true,
                },
            });
        }

        self.set_commit_completed(transaction_id, commit_timestamp, &mut output);
        output
    }

    fn apply_commit_prepared_transaction(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
        is_distributed: bool,
    ) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();

        Self::do_commit_prepared(ctx, transaction_id, commit_timestamp);

        if !is_distributed {
            // Simple commit: the coordinator resolves the caller now. The
            // commit object may be missing, e.g. on followers.
            if let Some(commit) = self.registry.find_mut(transaction_id) {
                commit.set_commit_timestamp(commit_timestamp);
                commit.advance_persistent_state(CommitState::Commit);
                self.set_commit_completed(transaction_id, commit_timestamp, &mut output);
            }
        }

        output
    }

    fn apply_abort_transaction(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        mutation_id: Option<MutationId>,
        force: bool,
    ) -> SupervisorOutput {
        Self::do_abort(ctx, transaction_id, force);
        tracing::debug!(tx = %transaction_id, force, "transaction aborted");

        SupervisorOutput {
            replies: vec![ClientReply {
                transaction_id,
                keep_as: mutation_id,
                response: encode_abort_response(&Ok(AbortReply::default())),
            }],
            ..Default::default()
        }
    }

    fn apply_abort_failed_transaction(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
    ) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();

        Self::do_abort(ctx, transaction_id, true);

        // On the coordinator the commit object is still registered; abort
        // fans out to its participants and the commit is dropped. On
        // participants there is nothing else to do.
        if let Some(commit) = self.registry.find_mut(transaction_id) {
            commit.advance_persistent_state(CommitState::Abort);
            let participants: Vec<CellId> = commit.participant_cell_ids().iter().copied().collect();
            for cell_id in participants {
                output.messages.push(PostedMessage {
                    to: cell_id,
                    mutation: SupervisorMutation::AbortFailedTransaction { transaction_id },
                });
            }
            self.registry.remove(transaction_id);
            tracing::debug!(tx = %transaction_id, "failed commit aborted and removed");
        }

        output
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Called when this peer becomes the active leader.
    ///
    /// Every recovered distributed commit that had already collected all
    /// prepare acknowledgments re-enters the generate-timestamp step; for
    /// commits in other states the mailbox layer re-posts whatever is still
    /// pending on its own.
    pub fn on_leader_active(&mut self) -> SupervisorOutput {
        let mut output = SupervisorOutput::default();
        let ready: Vec<TransactionId> = self
            .registry
            .distributed_commits()
            .filter(|c| c.persistent_state() == CommitState::Prepare)
            .filter(|c| c.all_participants_responded())
            .map(Commit::transaction_id)
            .collect();
        for transaction_id in ready {
            self.check_second_phase_start(transaction_id, &mut output);
        }
        output
    }

    /// Called when this peer stops leading: transient commits are lost.
    pub fn on_stop_leading(&mut self) {
        self.registry.clear_simple();
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Starts the second phase once every participant has prepared.
    fn check_second_phase_start(
        &mut self,
        transaction_id: TransactionId,
        output: &mut SupervisorOutput,
    ) {
        let Some(commit) = self.registry.find_mut(transaction_id) else {
            return;
        };
        if !commit.is_distributed() || !commit.all_participants_responded() {
            return;
        }

        tracing::debug!(tx = %transaction_id, "distributed commit second phase started");
        commit.set_transient_state(CommitState::GenerateCommitTimestamp);
        output.timestamp_requests.push(transaction_id);
    }

    /// Commit must not fail after a successful prepare.
    fn do_commit_prepared(
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) {
        if let Err(error) = ctx.manager.commit_transaction(transaction_id, commit_timestamp) {
            tracing::error!(tx = %transaction_id, %error, "error committing prepared transaction");
            panic!("transaction manager failed to commit prepared transaction {transaction_id}: {error}");
        }
        tracing::debug!(
            tx = %transaction_id,
            commit_ts = %commit_timestamp,
            "transaction committed"
        );
    }

    /// Force-abort that swallows only the `TransactionUnknown` class; any
    /// other error breaks the manager's force-abort contract and is
    /// surfaced in the log.
    fn do_abort(ctx: &mut ApplyContext<'_>, transaction_id: TransactionId, force: bool) {
        match ctx.manager.abort_transaction(transaction_id, force) {
            Ok(()) => {}
            Err(error) if error.is_transaction_unknown() => {
                tracing::debug!(tx = %transaction_id, "transaction already gone, abort is a no-op");
            }
            Err(error) => {
                tracing::warn!(tx = %transaction_id, %error, "transaction manager refused a forced abort");
            }
        }
    }

    /// Fails a commit from inside a mutation: aborts locally, fans the
    /// abort out to participants, resolves the caller with the error, and
    /// drops the commit.
    fn set_commit_failed(
        &mut self,
        ctx: &mut ApplyContext<'_>,
        transaction_id: TransactionId,
        error: TxnError,
        output: &mut SupervisorOutput,
    ) {
        let Some(commit) = self.registry.find_mut(transaction_id) else {
            return;
        };
        commit.advance_persistent_state(CommitState::Abort);
        let mutation_id = commit.mutation_id();
        let participants: Vec<CellId> = commit.participant_cell_ids().iter().copied().collect();

        Self::do_abort(ctx, transaction_id, true);

        for cell_id in participants {
            output.messages.push(PostedMessage {
                to: cell_id,
                mutation: SupervisorMutation::AbortFailedTransaction { transaction_id },
            });
        }

        output.replies.push(ClientReply {
            transaction_id,
            keep_as: mutation_id,
            response: encode_commit_response(&Err(error)),
        });

        self.registry.remove(transaction_id);
    }

    /// Finishes a commit: resolves the caller with the commit timestamp and
    /// drops the commit.
    fn set_commit_completed(
        &mut self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
        output: &mut SupervisorOutput,
    ) {
        let Some(commit) = self.registry.find_mut(transaction_id) else {
            return;
        };
        tracing::debug!(
            tx = %transaction_id,
            commit_ts = %commit_timestamp,
            distributed = commit.is_distributed(),
            "transaction commit completed"
        );
        commit.advance_persistent_state(CommitState::Finish);
        let mutation_id = commit.mutation_id();

        output.replies.push(ClientReply {
            transaction_id,
            keep_as: mutation_id,
            response: encode_commit_response(&Ok(CommitReply { commit_timestamp })),
        });

        self.registry.remove(transaction_id);
    }
}
