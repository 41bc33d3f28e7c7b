//! The client-side transaction factory.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

use tessera_supervisor::TxnError;
use tessera_types::{CellId, CellKind, TransactionId};

use crate::config::ClientConfig;
use crate::directory::{CellDirectory, CreateTransactionRequest};
use crate::transaction::{
    send_abort_fanout, spawn_ping_loop, Inner, Shared, StartOptions, Transaction, TransactionKind,
    TransactionState,
};

/// Options for attaching to an existing master transaction.
#[derive(Debug, Clone, Copy)]
pub struct AttachOptions {
    pub auto_abort: bool,
    pub ping: bool,
    pub ping_ancestors: bool,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            auto_abort: false,
            ping: true,
            ping_ancestors: false,
        }
    }
}

/// Creates and tracks client transactions, scheduling pings for the live
/// ones.
pub struct TransactionClient<D: CellDirectory> {
    directory: Arc<D>,
    config: ClientConfig,
    master_cell_id: CellId,
    tablet_counter: AtomicU64,
    alive: Mutex<Vec<Weak<Shared>>>,
}

impl<D: CellDirectory> TransactionClient<D> {
    pub fn new(directory: Arc<D>, master_cell_id: CellId, config: ClientConfig) -> Self {
        Self {
            directory,
            config,
            master_cell_id,
            tablet_counter: AtomicU64::new(0),
            alive: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Starts a new transaction.
    pub async fn start(&self, options: StartOptions) -> Result<Transaction<D>, TxnError> {
        Self::validate_start_options(&options)?;

        let start_timestamp = self.directory.generate_start_timestamp().await?;
        tracing::info!(start_ts = %start_timestamp, kind = ?options.kind, "starting transaction");

        let (id, participants) = match options.kind {
            TransactionKind::Master => {
                let id = self
                    .directory
                    .create_transaction(
                        self.master_cell_id,
                        CreateTransactionRequest {
                            parent_id: options.parent_id,
                            timeout_ms: options.timeout_ms.or(Some(self.config.default_timeout_ms)),
                        },
                    )
                    .await?;
                (id, BTreeSet::from([self.master_cell_id]))
            }
            TransactionKind::Tablet => {
                let counter = self.tablet_counter.fetch_add(1, Ordering::Relaxed);
                let id = TransactionId::from_parts(CellKind::Tablet, start_timestamp, counter);
                // Participants join the ping schedule as they are added.
                (id, BTreeSet::new())
            }
        };

        let transaction = self.install(
            id,
            options.kind,
            start_timestamp,
            participants,
            options.auto_abort,
            options.ping,
            options.ping_ancestors,
            options.timeout_ms.or(Some(self.config.default_timeout_ms)),
        );
        tracing::info!(
            tx = %id,
            start_ts = %start_timestamp,
            auto_abort = options.auto_abort,
            ping = options.ping,
            "transaction started"
        );
        Ok(transaction)
    }

    /// Attaches to an existing master transaction without any RPC.
    pub fn attach(&self, id: TransactionId, options: AttachOptions) -> Transaction<D> {
        let transaction = self.install(
            id,
            TransactionKind::Master,
            tessera_types::Timestamp::NULL,
            BTreeSet::from([self.master_cell_id]),
            options.auto_abort,
            options.ping,
            options.ping_ancestors,
            None,
        );
        tracing::info!(tx = %id, "master transaction attached");
        transaction
    }

    /// Aborts every live auto-abort transaction.
    pub async fn abort_all(&self) {
        let live: Vec<Arc<Shared>> = {
            let mut alive = self.alive.lock().expect("client lock");
            alive.retain(|weak| weak.strong_count() > 0);
            alive.iter().filter_map(Weak::upgrade).collect()
        };

        for shared in live {
            let (id, state, participants) = {
                let inner = shared.inner.lock().expect("transaction lock");
                (inner.id, inner.state, inner.participants.clone())
            };
            if state != TransactionState::Active {
                continue;
            }
            let _ = send_abort_fanout(&self.directory, id, participants, None).await;
            shared.set_aborted(TxnError::InvalidOperation(
                "transaction aborted by client shutdown".into(),
            ));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn install(
        &self,
        id: TransactionId,
        kind: TransactionKind,
        start_timestamp: tessera_types::Timestamp,
        participants: BTreeSet<CellId>,
        auto_abort: bool,
        ping: bool,
        ping_ancestors: bool,
        timeout_ms: Option<u64>,
    ) -> Transaction<D> {
        let (aborted, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                kind,
                state: TransactionState::Active,
                id,
                start_timestamp,
                participants,
                auto_abort,
                ping_ancestors,
                timeout_ms,
                error: None,
            }),
            aborted,
        });

        if auto_abort {
            self.alive
                .lock()
                .expect("client lock")
                .push(Arc::downgrade(&shared));
        }
        if ping {
            spawn_ping_loop(
                Arc::downgrade(&shared),
                Arc::clone(&self.directory),
                self.config,
                self.master_cell_id,
            );
        }

        Transaction {
            shared,
            directory: Arc::clone(&self.directory),
            master_cell_id: self.master_cell_id,
        }
    }

    fn validate_start_options(options: &StartOptions) -> Result<(), TxnError> {
        match options.kind {
            TransactionKind::Master => Ok(()),
            TransactionKind::Tablet => {
                if options.parent_id.is_some() {
                    return Err(TxnError::InvalidOperation(
                        "tablet transaction cannot have a parent".into(),
                    ));
                }
                if !options.ping {
                    return Err(TxnError::InvalidOperation(
                        "cannot switch off pings for a tablet transaction".into(),
                    ));
                }
                if options.ping_ancestors {
                    return Err(TxnError::InvalidOperation(
                        "cannot ping ancestors for a tablet transaction".into(),
                    ));
                }
                Ok(())
            }
        }
    }
}
