//! Transaction worker threads.
//!
//! Each transaction owns one SQLite connection on a dedicated thread. The
//! async side sends [`Request`]s over an unbounded channel and awaits the
//! oneshot reply, so every store primitive becomes a single-resolution
//! future and requests within a transaction are executed strictly in order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::engine::{self, Op, Reply};
use super::error::{StoreError, StoreResult};
use super::transaction::{TxMode, TxShared};

/// A message for a transaction worker.
pub(crate) enum Request {
    Op {
        op: Op,
        respond_to: oneshot::Sender<StoreResult<Reply>>,
    },
    Commit {
        respond_to: oneshot::Sender<StoreResult<()>>,
    },
    Abort,
}

/// What a worker needs to open its transaction.
pub(crate) struct WorkerSpec {
    pub path: PathBuf,
    pub mode: TxMode,
    pub busy_timeout: Duration,
}

/// Start a worker thread. `ready` resolves once `BEGIN` has succeeded.
pub(crate) fn spawn(
    spec: WorkerSpec,
    shared: Arc<TxShared>,
    requests: mpsc::UnboundedReceiver<Request>,
    ready: oneshot::Sender<StoreResult<()>>,
) -> StoreResult<()> {
    std::thread::Builder::new()
        .name(format!("duewatch-tx-{}", shared.id))
        .spawn(move || run(spec, shared, requests, ready))
        .map(|_| ())
        .map_err(|e| StoreError::Worker(format!("cannot spawn transaction thread: {e}")))
}

pub(crate) fn open_connection(path: &std::path::Path, busy_timeout: Duration) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    Ok(conn)
}

fn begin(spec: &WorkerSpec) -> StoreResult<Connection> {
    let conn = open_connection(&spec.path, spec.busy_timeout)?;
    let sql = match spec.mode {
        TxMode::ReadOnly => "BEGIN DEFERRED",
        // Take the write lock up front so overlapping writers queue on
        // SQLite's busy handler instead of failing mid-transaction.
        TxMode::ReadWrite => "BEGIN IMMEDIATE",
    };
    conn.execute_batch(sql)?;
    Ok(conn)
}

fn rollback(conn: &Connection, id: u64) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        // Nothing to undo when SQLite already rolled back on its own.
        debug!(tx = id, "rollback: {e}");
    }
}

fn run(
    spec: WorkerSpec,
    shared: Arc<TxShared>,
    mut requests: mpsc::UnboundedReceiver<Request>,
    ready: oneshot::Sender<StoreResult<()>>,
) {
    let conn = match begin(&spec) {
        Ok(conn) => {
            let _ = ready.send(Ok(()));
            conn
        }
        Err(e) => {
            shared.settle(Err(e.clone()));
            let _ = ready.send(Err(e));
            return;
        }
    };
    debug!(tx = shared.id, mode = ?spec.mode, "transaction started");

    while let Some(request) = requests.blocking_recv() {
        match request {
            Request::Op { op, respond_to } => {
                if !shared.is_active() {
                    rollback(&conn, shared.id);
                    let _ = respond_to.send(Err(StoreError::TransactionClosed));
                    return;
                }
                let name = op.name();
                let result = engine::execute(&conn, op);
                match &result {
                    Err(e) if e.aborts_transaction() => {
                        warn!(tx = shared.id, op = name, "request failed, aborting: {e}");
                        rollback(&conn, shared.id);
                        shared.settle(Err(e.clone()));
                        let _ = respond_to.send(result);
                        return;
                    }
                    _ => {
                        let _ = respond_to.send(result);
                    }
                }
            }
            Request::Commit { respond_to } => {
                if !shared.begin_commit() {
                    rollback(&conn, shared.id);
                    let _ = respond_to.send(Err(StoreError::TransactionClosed));
                    return;
                }
                let result = conn.execute_batch("COMMIT").map_err(StoreError::from);
                if result.is_err() {
                    rollback(&conn, shared.id);
                }
                shared.finish_commit(result.clone());
                debug!(tx = shared.id, ok = result.is_ok(), "transaction committed");
                let _ = respond_to.send(result);
                return;
            }
            Request::Abort => {
                rollback(&conn, shared.id);
                debug!(tx = shared.id, "transaction aborted");
                return;
            }
        }
    }

    // Every handle was dropped without committing.
    rollback(&conn, shared.id);
    shared.settle(Err(StoreError::TransactionClosed));
    debug!(tx = shared.id, "transaction dropped without commit, rolled back");
}
