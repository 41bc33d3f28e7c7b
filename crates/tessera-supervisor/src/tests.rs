//! Integration tests for tessera-supervisor.
//!
//! These drive the engine directly with a scriptable transaction manager;
//! full multi-cell flows live in tessera-cell's tests.

use std::collections::BTreeSet;

use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

use crate::rpc::{decode_commit_response, CommitTransactionRequest};
use crate::{
    ApplyContext, CommitState, PersistedCommit, StartCommitOutcome, SupervisorMutation,
    TimestampOutcome, TransactionManager, TransactionSupervisor, TxnError,
};

// ============================================================================
// Scriptable transaction manager
// ============================================================================

#[derive(Default)]
struct MockManager {
    prepared: Vec<(TransactionId, bool, Timestamp)>,
    committed: Vec<(TransactionId, Timestamp)>,
    aborted: Vec<(TransactionId, bool)>,
    fail_prepare: Option<TxnError>,
    fail_commit: bool,
    abort_reports_unknown: bool,
}

impl TransactionManager for MockManager {
    fn prepare_commit(
        &mut self,
        transaction_id: TransactionId,
        persistent: bool,
        prepare_timestamp: Timestamp,
    ) -> Result<(), TxnError> {
        if let Some(error) = self.fail_prepare.clone() {
            return Err(error);
        }
        self.prepared.push((transaction_id, persistent, prepare_timestamp));
        Ok(())
    }

    fn prepare_abort(&mut self, _transaction_id: TransactionId, _force: bool) -> Result<(), TxnError> {
        Ok(())
    }

    fn commit_transaction(
        &mut self,
        transaction_id: TransactionId,
        commit_timestamp: Timestamp,
    ) -> Result<(), TxnError> {
        if self.fail_commit {
            return Err(TxnError::InvalidOperation("not prepared".into()));
        }
        self.committed.push((transaction_id, commit_timestamp));
        Ok(())
    }

    fn abort_transaction(&mut self, transaction_id: TransactionId, force: bool) -> Result<(), TxnError> {
        if self.abort_reports_unknown {
            return Err(TxnError::TransactionUnknown(transaction_id));
        }
        self.aborted.push((transaction_id, force));
        Ok(())
    }

    fn ping_transaction(
        &mut self,
        _transaction_id: TransactionId,
        _ping_ancestors: bool,
    ) -> Result<(), TxnError> {
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn tx(n: u64) -> TransactionId {
    TransactionId::from_raw(u128::from(n))
}

fn coordinator() -> CellId {
    CellId::tablet(0)
}

fn participant(n: u128) -> CellId {
    CellId::tablet(n)
}

fn commit_request(n: u64, participants: &[CellId]) -> CommitTransactionRequest {
    CommitTransactionRequest {
        transaction_id: tx(n),
        participant_cell_ids: participants.to_vec(),
        mutation_id: Some(MutationId::new(u128::from(n) << 32)),
    }
}

fn ctx<'a>(manager: &'a mut MockManager, is_leader: bool) -> ApplyContext<'a> {
    ApplyContext {
        self_cell_id: coordinator(),
        is_leader,
        manager,
    }
}

// ============================================================================
// Simple commits
// ============================================================================

#[test]
fn simple_commit_runs_to_finish() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();

    let request = commit_request(1, &[]);
    let outcome = supervisor.start_commit(&mut ctx(&mut manager, true), &request, Timestamp::new(90));
    assert!(matches!(outcome, StartCommitOutcome::SimpleStarted));
    assert_eq!(manager.prepared, vec![(tx(1), false, Timestamp::new(90))]);
    assert!(supervisor.registry().find(tx(1)).is_some());

    // The provider answers; the engine proposes the finishing mutation.
    let outcome = supervisor.on_commit_timestamp_generated(
        &mut ctx(&mut manager, true),
        tx(1),
        Ok(Timestamp::new(100)),
    );
    let TimestampOutcome::Propose(mutation) = outcome else {
        panic!("expected a proposal");
    };
    assert_eq!(
        mutation,
        SupervisorMutation::CommitPreparedTransaction {
            transaction_id: tx(1),
            commit_timestamp: Timestamp::new(100),
            is_distributed: false,
        }
    );

    let output = supervisor.apply(&mut ctx(&mut manager, true), &mutation);
    assert_eq!(manager.committed, vec![(tx(1), Timestamp::new(100))]);
    assert!(output.messages.is_empty());
    assert_eq!(output.replies.len(), 1);
    let reply = &output.replies[0];
    assert_eq!(reply.keep_as, request.mutation_id);
    let decoded = decode_commit_response(&reply.response).unwrap();
    assert_eq!(decoded.commit_timestamp, Timestamp::new(100));

    // Destroyed at Finish.
    assert!(supervisor.registry().find(tx(1)).is_none());
}

#[test]
fn simple_commit_prepare_failure_replies_with_error() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager {
        fail_prepare: Some(TxnError::PrepareRejected("row lock conflict".into())),
        ..Default::default()
    };

    let request = commit_request(2, &[]);
    let outcome = supervisor.start_commit(&mut ctx(&mut manager, true), &request, Timestamp::new(90));
    let StartCommitOutcome::SimpleFailed { response, mutation } = outcome else {
        panic!("expected a prepare failure");
    };
    assert_eq!(
        decode_commit_response(&response).unwrap_err(),
        TxnError::PrepareRejected("row lock conflict".into())
    );
    assert_eq!(
        mutation,
        SupervisorMutation::AbortFailedTransaction { transaction_id: tx(2) }
    );

    // Applying the abort mutation drops the commit.
    manager.fail_prepare = None;
    supervisor.apply(&mut ctx(&mut manager, true), &mutation);
    assert!(supervisor.registry().find(tx(2)).is_none());
    assert_eq!(manager.aborted, vec![(tx(2), true)]);
    assert!(manager.committed.is_empty());
}

#[test]
fn second_commit_rpc_attaches_to_in_flight_commit() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();

    let request = commit_request(3, &[]);
    supervisor.start_commit(&mut ctx(&mut manager, true), &request, Timestamp::new(90));
    let outcome = supervisor.start_commit(&mut ctx(&mut manager, true), &request, Timestamp::new(91));
    assert!(matches!(outcome, StartCommitOutcome::AttachToExisting));
    // Only the first call prepared.
    assert_eq!(manager.prepared.len(), 1);
}

// ============================================================================
// Distributed commits — coordinator path
// ============================================================================

fn start_distributed(
    supervisor: &mut TransactionSupervisor,
    manager: &mut MockManager,
    n: u64,
    participants: &[CellId],
) -> SupervisorMutation {
    let request = commit_request(n, participants);
    let outcome =
        supervisor.start_commit(&mut ctx(manager, true), &request, Timestamp::new(200));
    let StartCommitOutcome::ProposeStart(mutation) = outcome else {
        panic!("expected a distributed start proposal");
    };
    mutation
}

#[test]
fn distributed_start_prepares_locally_and_fans_out() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();
    let participants = [participant(1), participant(2), participant(3)];

    let start = start_distributed(&mut supervisor, &mut manager, 4, &participants);
    let output = supervisor.apply(&mut ctx(&mut manager, true), &start);

    assert_eq!(manager.prepared, vec![(tx(4), true, Timestamp::new(200))]);
    assert_eq!(output.messages.len(), 3);
    for (message, cell) in output.messages.iter().zip(participants) {
        assert_eq!(message.to, cell);
        assert_eq!(
            message.mutation,
            SupervisorMutation::PrepareTransactionCommit {
                transaction_id: tx(4),
                prepare_timestamp: Timestamp::new(200),
                coordinator_cell_id: coordinator(),
            }
        );
    }

    let commit = supervisor.registry().find_distributed(tx(4)).unwrap();
    assert!(commit.is_persistent());
    assert_eq!(commit.persistent_state(), CommitState::Prepare);
}

#[test]
fn second_phase_starts_only_on_leader_after_all_acks() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();
    let participants = [participant(1), participant(2)];

    let start = start_distributed(&mut supervisor, &mut manager, 5, &participants);
    supervisor.apply(&mut ctx(&mut manager, true), &start);

    let ack = |cell| SupervisorMutation::OnTransactionCommitPrepared {
        transaction_id: tx(5),
        participant_cell_id: cell,
        error: None,
    };

    // First ack: not all participants responded yet.
    let output = supervisor.apply(&mut ctx(&mut manager, true), &ack(participant(1)));
    assert!(output.timestamp_requests.is_empty());

    // Second ack on a follower: recorded, but no second phase there.
    let output = supervisor.apply(&mut ctx(&mut manager, false), &ack(participant(2)));
    assert!(output.timestamp_requests.is_empty());
    assert!(supervisor
        .registry()
        .find_distributed(tx(5))
        .unwrap()
        .all_participants_responded());

    // A recovered leader picks the ready commit back up.
    let output = supervisor.on_leader_active();
    assert_eq!(output.timestamp_requests, vec![tx(5)]);
}

#[test]
fn finalize_commits_everywhere_and_replies() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();
    let participants = [participant(1), participant(2)];

    let start = start_distributed(&mut supervisor, &mut manager, 6, &participants);
    supervisor.apply(&mut ctx(&mut manager, true), &start);
    for cell in participants {
        supervisor.apply(
            &mut ctx(&mut manager, true),
            &SupervisorMutation::OnTransactionCommitPrepared {
                transaction_id: tx(6),
                participant_cell_id: cell,
                error: None,
            },
        );
    }

    let outcome = supervisor.on_commit_timestamp_generated(
        &mut ctx(&mut manager, true),
        tx(6),
        Ok(Timestamp::new(250)),
    );
    let TimestampOutcome::Propose(finalize) = outcome else {
        panic!("expected a finalize proposal");
    };

    let output = supervisor.apply(&mut ctx(&mut manager, true), &finalize);
    assert_eq!(manager.committed, vec![(tx(6), Timestamp::new(250))]);
    assert_eq!(output.messages.len(), 2);
    for message in &output.messages {
        assert_eq!(
            message.mutation,
            SupervisorMutation::CommitPreparedTransaction {
                transaction_id: tx(6),
                commit_timestamp: Timestamp::new(250),
                is_distributed: true,
            }
        );
    }
    assert_eq!(output.replies.len(), 1);
    assert_eq!(
        decode_commit_response(&output.replies[0].response)
            .unwrap()
            .commit_timestamp,
        Timestamp::new(250)
    );
    assert!(supervisor.registry().find(tx(6)).is_none());
}

#[test]
fn participant_prepare_error_aborts_the_commit() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();
    let participants = [participant(1), participant(2), participant(3)];

    let start = start_distributed(&mut supervisor, &mut manager, 7, &participants);
    supervisor.apply(&mut ctx(&mut manager, true), &start);

    let output = supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::OnTransactionCommitPrepared {
            transaction_id: tx(7),
            participant_cell_id: participant(2),
            error: Some(TxnError::PrepareRejected("lease expired".into())),
        },
    );

    // Abort fans out to every participant, including the one that failed.
    assert_eq!(output.messages.len(), 3);
    for message in &output.messages {
        assert_eq!(
            message.mutation,
            SupervisorMutation::AbortFailedTransaction { transaction_id: tx(7) }
        );
    }
    assert_eq!(output.replies.len(), 1);
    assert_eq!(
        decode_commit_response(&output.replies[0].response).unwrap_err(),
        TxnError::PrepareRejected("lease expired".into())
    );
    assert!(supervisor.registry().find(tx(7)).is_none());
    assert!(manager.committed.is_empty());
    assert_eq!(manager.aborted, vec![(tx(7), true)]);
}

#[test]
fn timestamp_failure_aborts_the_commit() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();
    let participants = [participant(1)];

    let start = start_distributed(&mut supervisor, &mut manager, 8, &participants);
    supervisor.apply(&mut ctx(&mut manager, true), &start);
    supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::OnTransactionCommitPrepared {
            transaction_id: tx(8),
            participant_cell_id: participant(1),
            error: None,
        },
    );

    let outcome = supervisor.on_commit_timestamp_generated(
        &mut ctx(&mut manager, true),
        tx(8),
        Err(TxnError::Transport("oracle unreachable".into())),
    );
    let TimestampOutcome::Failed { response, mutation } = outcome else {
        panic!("expected a timestamp failure");
    };
    assert!(matches!(
        decode_commit_response(&response).unwrap_err(),
        TxnError::TimestampUnavailable(_)
    ));

    let output = supervisor.apply(&mut ctx(&mut manager, true), &mutation);
    assert_eq!(output.messages.len(), 1, "abort fans out to the participant");
    assert!(supervisor.registry().find(tx(8)).is_none());
}

// ============================================================================
// Participant path
// ============================================================================

#[test]
fn participant_prepares_and_reports_back() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();

    let output = supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::PrepareTransactionCommit {
            transaction_id: tx(9),
            prepare_timestamp: Timestamp::new(200),
            coordinator_cell_id: participant(9),
        },
    );

    assert_eq!(manager.prepared, vec![(tx(9), true, Timestamp::new(200))]);
    // No commit object is kept on the participant side.
    assert!(supervisor.registry().find(tx(9)).is_none());
    assert_eq!(output.messages.len(), 1);
    assert_eq!(output.messages[0].to, participant(9));
    assert_eq!(
        output.messages[0].mutation,
        SupervisorMutation::OnTransactionCommitPrepared {
            transaction_id: tx(9),
            participant_cell_id: coordinator(),
            error: None,
        }
    );
}

#[test]
fn participant_reports_prepare_failure() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager {
        fail_prepare: Some(TxnError::PrepareRejected("conflict".into())),
        ..Default::default()
    };

    let output = supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::PrepareTransactionCommit {
            transaction_id: tx(10),
            prepare_timestamp: Timestamp::new(200),
            coordinator_cell_id: participant(9),
        },
    );

    let SupervisorMutation::OnTransactionCommitPrepared { error, .. } = &output.messages[0].mutation
    else {
        panic!("expected a prepare acknowledgment");
    };
    assert_eq!(error, &Some(TxnError::PrepareRejected("conflict".into())));
}

#[test]
fn participant_abort_swallows_unknown_transaction() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager {
        abort_reports_unknown: true,
        ..Default::default()
    };

    // Idempotently ignored; no panic, no message.
    let output = supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::AbortFailedTransaction { transaction_id: tx(11) },
    );
    assert!(output.is_empty());
}

#[test]
#[should_panic(expected = "failed to commit prepared transaction")]
fn post_prepare_commit_failure_is_fatal() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager {
        fail_commit: true,
        ..Default::default()
    };

    supervisor.apply(
        &mut ctx(&mut manager, true),
        &SupervisorMutation::CommitPreparedTransaction {
            transaction_id: tx(12),
            commit_timestamp: Timestamp::new(300),
            is_distributed: true,
        },
    );
}

// ============================================================================
// Persistence
// ============================================================================

#[test]
fn snapshot_round_trips_distributed_commits_only() {
    let mut supervisor = TransactionSupervisor::new();
    let mut manager = MockManager::default();

    // One simple, one distributed.
    let simple = commit_request(13, &[]);
    supervisor.start_commit(&mut ctx(&mut manager, true), &simple, Timestamp::new(90));
    let start = start_distributed(&mut supervisor, &mut manager, 14, &[participant(1)]);
    supervisor.apply(&mut ctx(&mut manager, true), &start);

    let keys = supervisor.registry().save_keys();
    let values = supervisor.registry().save_values();
    assert_eq!(keys, vec![tx(14)], "simple commits are never persisted");

    let mut restored = TransactionSupervisor::new();
    restored.registry_mut().load(keys, values.clone());
    let commit = restored.registry().find_distributed(tx(14)).unwrap();
    assert!(commit.is_persistent());
    assert_eq!(commit.persistent_state(), CommitState::Prepare);
    assert_eq!(
        commit.participant_cell_ids(),
        &BTreeSet::from([participant(1)])
    );
    // Responded cells are rebuilt from the log, not the snapshot.
    assert!(commit.responded_cell_ids().is_empty());

    // Serialized record carries exactly the journaled fields.
    let record: PersistedCommit = values[0].clone();
    let bytes = postcard::to_allocvec(&record).unwrap();
    let reparsed: PersistedCommit = postcard::from_bytes(&bytes).unwrap();
    assert_eq!(reparsed, record);
}

#[test]
fn mailbox_payload_round_trip() {
    let mutation = SupervisorMutation::PrepareTransactionCommit {
        transaction_id: tx(15),
        prepare_timestamp: Timestamp::new(42),
        coordinator_cell_id: coordinator(),
    };
    let payload = mutation.encode_payload();
    assert_eq!(SupervisorMutation::decode_payload(&payload).unwrap(), mutation);
}

proptest::proptest! {
    #[test]
    fn any_inter_cell_mutation_survives_the_wire(
        raw_tx in proptest::prelude::any::<u128>(),
        ts in proptest::prelude::any::<u64>(),
        cell in 0u128..(1 << 64),
        failed in proptest::prelude::any::<bool>(),
    ) {
        let acknowledgment = SupervisorMutation::OnTransactionCommitPrepared {
            transaction_id: TransactionId::from_raw(raw_tx),
            participant_cell_id: CellId::tablet(cell),
            error: failed.then(|| TxnError::PrepareRejected("conflict".into())),
        };
        let commit = SupervisorMutation::CommitPreparedTransaction {
            transaction_id: TransactionId::from_raw(raw_tx),
            commit_timestamp: Timestamp::new(ts),
            is_distributed: failed,
        };
        for mutation in [acknowledgment, commit] {
            let payload = mutation.encode_payload();
            proptest::prop_assert_eq!(SupervisorMutation::decode_payload(&payload).unwrap(), mutation);
        }
    }
}
