//! Client facade tests against the in-memory multi-cell cluster.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tessera_cell::harness::{Cluster, SharedTimestampOracle, TxnPhase};
use tessera_client::{
    CellDirectory, ClientConfig, CreateTransactionRequest, StartOptions, TransactionClient,
    TransactionKind, TransactionState,
};
use tessera_supervisor::rpc::{
    AbortReply, AbortTransactionRequest, CommitReply, CommitTransactionRequest,
    PingTransactionRequest, StartTransactionRequest,
};
use tessera_supervisor::{TimestampProvider, TxnError};
use tessera_types::{CellId, MutationId, Timestamp, TransactionId};

// ============================================================================
// Directory over the harness cluster
// ============================================================================

struct ClusterDirectory {
    cluster: Arc<Mutex<Cluster>>,
    oracle: SharedTimestampOracle,
    next_master_object: AtomicU64,
    commit_targets: Mutex<Vec<CellId>>,
}

impl ClusterDirectory {
    fn new(cluster: Arc<Mutex<Cluster>>) -> Self {
        let oracle = cluster.lock().expect("cluster lock").oracle();
        Self {
            cluster,
            oracle,
            next_master_object: AtomicU64::new(1),
            commit_targets: Mutex::new(Vec::new()),
        }
    }

    fn commit_targets(&self) -> Vec<CellId> {
        self.commit_targets.lock().expect("spy lock").clone()
    }
}

impl CellDirectory for ClusterDirectory {
    fn generate_start_timestamp(&self) -> impl Future<Output = Result<Timestamp, TxnError>> + Send {
        let mut oracle = self.oracle.clone();
        async move { oracle.generate_timestamp() }
    }

    fn create_transaction(
        &self,
        cell_id: CellId,
        request: CreateTransactionRequest,
    ) -> impl Future<Output = Result<TransactionId, TxnError>> + Send {
        let cluster = Arc::clone(&self.cluster);
        let object = self.next_master_object.fetch_add(1, Ordering::Relaxed);
        async move {
            let id = TransactionId::from_parts(
                tessera_types::CellKind::Master,
                Timestamp::new(object),
                object,
            );
            cluster.lock().expect("cluster lock").start_transaction(
                cell_id,
                &StartTransactionRequest {
                    transaction_id: id,
                    start_timestamp: Timestamp::NULL,
                    timeout_ms: request.timeout_ms,
                },
            )?;
            Ok(id)
        }
    }

    fn start_transaction(
        &self,
        cell_id: CellId,
        request: StartTransactionRequest,
    ) -> impl Future<Output = Result<(), TxnError>> + Send {
        let cluster = Arc::clone(&self.cluster);
        async move {
            cluster
                .lock()
                .expect("cluster lock")
                .start_transaction(cell_id, &request)
        }
    }

    fn commit_transaction(
        &self,
        cell_id: CellId,
        request: CommitTransactionRequest,
    ) -> impl Future<Output = Result<CommitReply, TxnError>> + Send {
        let cluster = Arc::clone(&self.cluster);
        self.commit_targets.lock().expect("spy lock").push(cell_id);
        async move {
            cluster
                .lock()
                .expect("cluster lock")
                .commit_transaction(cell_id, &request)
        }
    }

    fn abort_transaction(
        &self,
        cell_id: CellId,
        request: AbortTransactionRequest,
    ) -> impl Future<Output = Result<AbortReply, TxnError>> + Send {
        let cluster = Arc::clone(&self.cluster);
        async move {
            cluster
                .lock()
                .expect("cluster lock")
                .abort_transaction(cell_id, &request)
        }
    }

    fn ping_transaction(
        &self,
        cell_id: CellId,
        request: PingTransactionRequest,
    ) -> impl Future<Output = Result<(), TxnError>> + Send {
        let cluster = Arc::clone(&self.cluster);
        async move {
            cluster
                .lock()
                .expect("cluster lock")
                .ping_transaction(cell_id, &request)
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn master() -> CellId {
    CellId::master(1)
}

fn tablet(n: u128) -> CellId {
    CellId::tablet(n)
}

fn setup(
    cells: &[CellId],
) -> (
    Arc<Mutex<Cluster>>,
    Arc<ClusterDirectory>,
    TransactionClient<ClusterDirectory>,
) {
    let cluster = Arc::new(Mutex::new(Cluster::new(7, cells)));
    let directory = Arc::new(ClusterDirectory::new(Arc::clone(&cluster)));
    let client = TransactionClient::new(Arc::clone(&directory), master(), ClientConfig::testing());
    (cluster, directory, client)
}

// ============================================================================
// Commit flows
// ============================================================================

#[tokio::test]
async fn master_transaction_commits_across_tablets() {
    let cells = [master(), tablet(1), tablet(2)];
    let (cluster, directory, client) = setup(&cells);

    let txn = client.start(StartOptions::master()).await.unwrap();
    assert_eq!(txn.kind(), TransactionKind::Master);
    assert_eq!(txn.state(), TransactionState::Active);
    assert!(txn.start_timestamp().is_valid());

    txn.add_tablet_participant(tablet(1)).await.unwrap();
    txn.add_tablet_participant(tablet(2)).await.unwrap();
    // Idempotent.
    txn.add_tablet_participant(tablet(1)).await.unwrap();
    assert_eq!(txn.participants().len(), 3);

    let reply = txn.commit(Some(MutationId::new(0xC0FFEE))).await.unwrap();
    assert_eq!(txn.state(), TransactionState::Committed);

    // The master cell coordinated.
    assert_eq!(directory.commit_targets(), vec![master()]);

    let cluster = cluster.lock().expect("cluster lock");
    for cell in cells {
        assert_eq!(
            cluster.manager(cell).phase(txn.id()),
            Some(TxnPhase::Committed(reply.commit_timestamp)),
            "{cell} must commit at the common timestamp"
        );
    }
}

#[tokio::test]
async fn tablet_transaction_commits_via_lowest_participant() {
    let cells = [master(), tablet(3), tablet(5)];
    let (cluster, directory, client) = setup(&cells);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.add_tablet_participant(tablet(5)).await.unwrap();
    txn.add_tablet_participant(tablet(3)).await.unwrap();

    let reply = txn.commit(None).await.unwrap();

    // Deterministic coordinator: the lowest participant cell id.
    assert_eq!(directory.commit_targets(), vec![tablet(3)]);

    let cluster = cluster.lock().expect("cluster lock");
    for cell in [tablet(3), tablet(5)] {
        assert_eq!(
            cluster.manager(cell).phase(txn.id()),
            Some(TxnPhase::Committed(reply.commit_timestamp))
        );
    }
}

#[tokio::test]
async fn trivial_commit_needs_no_rpc() {
    let (_cluster, directory, client) = setup(&[master()]);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    let reply = txn.commit(None).await.unwrap();
    assert_eq!(reply.commit_timestamp, Timestamp::NULL);
    assert_eq!(txn.state(), TransactionState::Committed);
    assert!(directory.commit_targets().is_empty());
}

#[tokio::test]
async fn commit_failure_aborts_the_transaction() {
    let cells = [master(), tablet(1), tablet(2)];
    let (cluster, _directory, client) = setup(&cells);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.add_tablet_participant(tablet(1)).await.unwrap();
    txn.add_tablet_participant(tablet(2)).await.unwrap();

    cluster
        .lock()
        .expect("cluster lock")
        .manager(tablet(2))
        .fail_prepare(txn.id(), TxnError::PrepareRejected("conflict".into()));

    let error = txn.commit(None).await.unwrap_err();
    assert_eq!(error, TxnError::PrepareRejected("conflict".into()));
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(*txn.subscribe_aborted().borrow());
}

// ============================================================================
// Pings and aborts
// ============================================================================

#[tokio::test]
async fn ping_detects_remote_abort_and_commit_reports_it() {
    let cells = [master(), tablet(1), tablet(2)];
    let (cluster, _directory, client) = setup(&cells);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.add_tablet_participant(tablet(1)).await.unwrap();
    txn.add_tablet_participant(tablet(2)).await.unwrap();
    txn.ping().await.unwrap();

    // T1 aborts the transaction locally (lease expiry).
    cluster
        .lock()
        .expect("cluster lock")
        .manager(tablet(1))
        .expire(txn.id());

    let error = txn.ping().await.unwrap_err();
    assert_eq!(error, TxnError::TransactionUnknown(txn.id()));
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(*txn.subscribe_aborted().borrow());

    // A later commit surfaces the same death.
    let error = txn.commit(None).await.unwrap_err();
    assert_eq!(error, TxnError::TransactionUnknown(txn.id()));
}

#[tokio::test]
async fn abort_tolerates_cells_that_forgot_the_transaction() {
    let cells = [master(), tablet(1), tablet(2)];
    let (cluster, _directory, client) = setup(&cells);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.add_tablet_participant(tablet(1)).await.unwrap();
    txn.add_tablet_participant(tablet(2)).await.unwrap();

    // T1 has already cleaned the transaction up entirely.
    cluster
        .lock()
        .expect("cluster lock")
        .manager(tablet(1))
        .forget(txn.id());

    txn.abort(None).await.unwrap();
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(*txn.subscribe_aborted().borrow());
    assert_eq!(
        cluster
            .lock()
            .expect("cluster lock")
            .manager(tablet(2))
            .phase(txn.id()),
        Some(TxnPhase::Aborted)
    );
}

#[tokio::test(start_paused = true)]
async fn scheduled_pings_renew_leases_until_detach() {
    let (cluster, _directory, client) = setup(&[master()]);
    let manager = cluster.lock().expect("cluster lock").manager(master());

    let txn = client.start(StartOptions::master()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    let pings_before = manager
        .calls_for(txn.id())
        .iter()
        .filter(|c| matches!(c, tessera_cell::harness::ManagerCall::Ping { .. }))
        .count();
    assert!(pings_before > 0, "scheduled pings must have run");

    txn.detach().unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let pings_after = manager
        .calls_for(txn.id())
        .iter()
        .filter(|c| matches!(c, tessera_cell::harness::ManagerCall::Ping { .. }))
        .count();
    assert!(
        pings_after <= pings_before + 1,
        "detach must stop the ping schedule"
    );
}

#[tokio::test(start_paused = true)]
async fn dropping_an_auto_abort_transaction_aborts_it() {
    let (cluster, _directory, client) = setup(&[master()]);

    let txn = client.start(StartOptions::master()).await.unwrap();
    let id = txn.id();
    drop(txn);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        cluster
            .lock()
            .expect("cluster lock")
            .manager(master())
            .phase(id),
        Some(TxnPhase::Aborted)
    );
}

// ============================================================================
// Validation and lifecycle
// ============================================================================

#[tokio::test]
async fn tablet_start_options_are_validated() {
    let (_cluster, _directory, client) = setup(&[master()]);

    let mut no_ping = StartOptions::tablet();
    no_ping.ping = false;
    assert!(matches!(
        client.start(no_ping).await.unwrap_err(),
        TxnError::InvalidOperation(_)
    ));

    let mut ancestors = StartOptions::tablet();
    ancestors.ping_ancestors = true;
    assert!(matches!(
        client.start(ancestors).await.unwrap_err(),
        TxnError::InvalidOperation(_)
    ));

    let mut parented = StartOptions::tablet();
    parented.parent_id = Some(TransactionId::from_raw(1));
    assert!(matches!(
        client.start(parented).await.unwrap_err(),
        TxnError::InvalidOperation(_)
    ));
}

#[tokio::test]
async fn detach_is_idempotent_but_final_states_reject_it() {
    let (_cluster, _directory, client) = setup(&[master()]);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.detach().unwrap();
    txn.detach().unwrap();
    assert_eq!(txn.state(), TransactionState::Detached);

    let committed = client.start(StartOptions::tablet()).await.unwrap();
    committed.commit(None).await.unwrap();
    assert!(matches!(
        committed.detach().unwrap_err(),
        TxnError::InvalidOperation(_)
    ));
}

#[tokio::test]
async fn abort_all_kills_live_transactions() {
    let cells = [master(), tablet(1)];
    let (cluster, _directory, client) = setup(&cells);

    let txn = client.start(StartOptions::tablet()).await.unwrap();
    txn.add_tablet_participant(tablet(1)).await.unwrap();

    client.abort_all().await;
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert_eq!(
        cluster
            .lock()
            .expect("cluster lock")
            .manager(tablet(1))
            .phase(txn.id()),
        Some(TxnPhase::Aborted)
    );
}
