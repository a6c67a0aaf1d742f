//! Scans for tasks whose deadline has passed.

use tracing::debug;

use super::{DEADLINE_INDEX, TASKS_STORE, Task};
use crate::error::Result;
use crate::store::{Cursor, Database, Direction, KeyRange, ObjectStore, Transaction, TxMode};

/// Finds elapsed, unnotified tasks.
#[derive(Debug, Clone)]
pub struct DeadlineScanner {
    db: Database,
}

impl DeadlineScanner {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Start a scan of tasks due at or before `now_ms`.
    ///
    /// The scan holds a read-write transaction so the tasks it yields can be
    /// marked notified atomically; overlapping scans run one after another.
    pub async fn scan_elapsed(&self, now_ms: i64) -> Result<Scan> {
        let tx = self.db.transaction(&[TASKS_STORE], TxMode::ReadWrite).await?;
        let store = tx.object_store(TASKS_STORE)?;
        let cursor = store
            .index(DEADLINE_INDEX)?
            .open_cursor(KeyRange::upper_bound(now_ms, false), Direction::Next)?;
        debug!(now_ms, "deadline scan started");
        Ok(Scan {
            tx,
            store,
            cursor,
            now_ms,
        })
    }
}

/// An in-progress scan: a cursor over elapsed tasks plus the transaction
/// that will record their alerts.
#[derive(Debug)]
pub struct Scan {
    tx: Transaction,
    store: ObjectStore,
    cursor: Cursor,
    now_ms: i64,
}

impl Scan {
    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Next elapsed task that has not been notified, in deadline order.
    pub async fn next_task(&mut self) -> Result<Option<Task>> {
        while let Some(entry) = self.cursor.next_entry().await? {
            let task: Task = entry.decode()?;
            if task.is_due(self.now_ms) {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    /// Drain the remaining tasks.
    pub async fn collect(&mut self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        while let Some(task) = self.next_task().await? {
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Record that `task`'s alert was delivered.
    pub async fn mark_notified(&self, task: &Task) -> Result<Task> {
        let notified = Task {
            notified: true,
            ..task.clone()
        };
        self.store.put(&notified).await?;
        Ok(notified)
    }

    /// Commit everything marked during the scan.
    pub async fn finish(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Discard everything marked during the scan.
    pub fn abort(self) {
        self.tx.abort();
    }
}
