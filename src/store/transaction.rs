//! Transactions over one or more object stores.
//!
//! A [`Transaction`] is a cheap, cloneable handle on a worker thread that
//! holds an open SQLite transaction. Requests are awaited one at a time in
//! program order; the transaction's outcome is published once through a
//! `watch` channel so any number of callers can await [`Transaction::complete`].

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use super::engine::{Op, Reply};
use super::error::{StoreError, StoreResult};
use super::object_store::ObjectStore;
use super::schema::StoreMeta;
use super::worker::{self, Request, WorkerSpec};

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Lifecycle of a transaction.
#[derive(Debug, Clone)]
pub enum TxState {
    Active,
    /// `COMMIT` has been issued; abort is no longer possible.
    Committing,
    Committed,
    Aborted(StoreError),
}

impl TxState {
    fn is_settled(&self) -> bool {
        matches!(self, TxState::Committed | TxState::Aborted(_))
    }

    fn outcome(&self) -> StoreResult<()> {
        match self {
            TxState::Committed => Ok(()),
            TxState::Aborted(cause) => Err(cause.clone()),
            TxState::Active | TxState::Committing => Err(StoreError::TransactionClosed),
        }
    }
}

/// State shared between the handles and the worker thread.
pub(crate) struct TxShared {
    pub(crate) id: u64,
    state: watch::Sender<TxState>,
}

impl TxShared {
    pub(crate) fn is_active(&self) -> bool {
        matches!(*self.state.borrow(), TxState::Active)
    }

    /// Move from `Active` straight to a final state. Returns `false` if the
    /// transaction had already left the active state.
    pub(crate) fn settle(&self, outcome: StoreResult<()>) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(state, TxState::Active) {
                return false;
            }
            *state = match outcome {
                Ok(()) => TxState::Committed,
                Err(cause) => TxState::Aborted(cause),
            };
            true
        })
    }

    pub(crate) fn begin_commit(&self) -> bool {
        self.state.send_if_modified(|state| {
            if !matches!(state, TxState::Active) {
                return false;
            }
            *state = TxState::Committing;
            true
        })
    }

    pub(crate) fn finish_commit(&self, outcome: StoreResult<()>) {
        self.state.send_if_modified(|state| {
            if !matches!(state, TxState::Committing) {
                return false;
            }
            *state = match outcome {
                Ok(()) => TxState::Committed,
                Err(cause) => TxState::Aborted(cause),
            };
            true
        });
    }

    fn is_aborted(&self) -> bool {
        matches!(*self.state.borrow(), TxState::Aborted(_))
    }
}

struct TxInner {
    shared: Arc<TxShared>,
    requests: mpsc::UnboundedSender<Request>,
    mode: TxMode,
    scope: Vec<Arc<StoreMeta>>,
}

/// A handle on an open transaction.
///
/// Dropping every clone without committing rolls the transaction back.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxInner>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.shared.id)
            .field("mode", &self.inner.mode)
            .field("state", &*self.inner.shared.state.borrow())
            .finish()
    }
}

impl Transaction {
    /// Open a transaction on `path` covering `scope`.
    pub(crate) async fn begin(
        path: PathBuf,
        scope: Vec<Arc<StoreMeta>>,
        mode: TxMode,
        busy_timeout: Duration,
    ) -> StoreResult<Self> {
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TxState::Active);
        let shared = Arc::new(TxShared {
            id: NEXT_TX_ID.fetch_add(1, Ordering::Relaxed),
            state,
        });
        let (ready_tx, ready_rx) = oneshot::channel();
        worker::spawn(
            WorkerSpec {
                path,
                mode,
                busy_timeout,
            },
            Arc::clone(&shared),
            requests_rx,
            ready_tx,
        )?;
        ready_rx
            .await
            .map_err(|_| StoreError::Worker("worker exited before the transaction began".into()))??;

        debug!(tx = shared.id, ?mode, stores = scope.len(), "transaction opened");
        Ok(Self {
            inner: Arc::new(TxInner {
                shared,
                requests,
                mode,
                scope,
            }),
        })
    }

    pub fn mode(&self) -> TxMode {
        self.inner.mode
    }

    /// Names of the object stores this transaction may touch.
    pub fn scope(&self) -> Vec<&str> {
        self.inner.scope.iter().map(|m| m.name.as_str()).collect()
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> TxState {
        self.inner.shared.state.borrow().clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared.is_active()
    }

    /// Handle on an object store inside this transaction's scope.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownStore`] if `name` is not in scope, and
    /// [`StoreError::TransactionClosed`] once the transaction has settled.
    pub fn object_store(&self, name: &str) -> StoreResult<ObjectStore> {
        if !self.is_active() {
            return Err(StoreError::TransactionClosed);
        }
        let meta = self
            .inner
            .scope
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| StoreError::UnknownStore(name.to_owned()))?;
        Ok(ObjectStore::new(self.clone(), Arc::clone(meta)))
    }

    /// Send one request and await its reply.
    pub(crate) async fn request(&self, op: Op) -> StoreResult<Reply> {
        if !self.is_active() {
            return Err(StoreError::TransactionClosed);
        }
        if op.is_mutation() && self.inner.mode == TxMode::ReadOnly {
            return Err(StoreError::TransactionMode {
                operation: op.name(),
            });
        }
        let (respond_to, reply) = oneshot::channel();
        self.inner
            .requests
            .send(Request::Op { op, respond_to })
            .map_err(|_| StoreError::TransactionClosed)?;
        let reply = reply.await.map_err(|_| StoreError::TransactionClosed)??;
        // The request ran, but its effects were rolled back with the rest.
        if self.inner.shared.is_aborted() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(reply)
    }

    /// Commit and wait for the outcome.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionClosed`] if the transaction already settled,
    /// or the backend error that made `COMMIT` fail.
    pub async fn commit(&self) -> StoreResult<()> {
        if !self.is_active() {
            return Err(StoreError::TransactionClosed);
        }
        let (respond_to, reply) = oneshot::channel();
        self.inner
            .requests
            .send(Request::Commit { respond_to })
            .map_err(|_| StoreError::TransactionClosed)?;
        reply.await.map_err(|_| StoreError::TransactionClosed)?
    }

    /// Abort the transaction, discarding its changes.
    ///
    /// Has no effect once the transaction has committed or aborted.
    pub fn abort(&self) {
        self.abort_with(StoreError::Aborted);
    }

    /// Abort with a specific cause. Returns `false` if it was too late.
    pub(crate) fn abort_with(&self, cause: StoreError) -> bool {
        if !self.inner.shared.settle(Err(cause)) {
            return false;
        }
        debug!(tx = self.inner.shared.id, "abort requested");
        let _ = self.inner.requests.send(Request::Abort);
        true
    }

    /// Resolve once the transaction has committed (`Ok`) or aborted (`Err`
    /// carrying the cause).
    pub async fn complete(&self) -> StoreResult<()> {
        let mut state = self.inner.shared.state.subscribe();
        let settled = state
            .wait_for(TxState::is_settled)
            .await
            .map_err(|_| StoreError::Worker("transaction state dropped".into()))?;
        settled.outcome()
    }

    /// Like [`complete`](Self::complete), but aborts the transaction if it
    /// has not settled within `timeout`.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionTimeout`] when the deadline passes first.
    pub async fn complete_within(&self, timeout: Duration) -> StoreResult<()> {
        match tokio::time::timeout(timeout, self.complete()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                let cause = StoreError::TransactionTimeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                };
                if self.abort_with(cause.clone()) {
                    Err(cause)
                } else {
                    // Already committing; report how that ends.
                    self.complete().await
                }
            }
        }
    }
}
