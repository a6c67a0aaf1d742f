//! CRUD operations on tasks.
//!
//! Every operation opens its own transaction on the `tasks` store alone,
//! read-only where it only reads. Updates are read-modify-write inside one
//! read-write transaction, so a stored `notified = true` is always carried
//! forward.

use chrono::{Local, TimeZone};
use serde::Serialize;
use tracing::{debug, info};

use super::{NOTIFIED_INDEX, NewTask, TASKS_STORE, Task};
use crate::error::{Result, TrackerError};
use crate::store::{Database, KeyRange, ObjectStore, StoreError, Transaction, TxMode};

/// A task as first written, before the store assigns its id.
#[derive(Serialize)]
struct Draft<'a> {
    title: &'a str,
    deadline: i64,
    notified: bool,
    completed: bool,
    day: u32,
    month: u32,
    year: i32,
    hours: u32,
    minutes: u32,
}

/// Typed access to the `tasks` store.
#[derive(Debug, Clone)]
pub struct TaskRepository {
    db: Database,
}

impl TaskRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn begin(&self, mode: TxMode) -> Result<(Transaction, ObjectStore)> {
        let tx = self.db.transaction(&[TASKS_STORE], mode).await?;
        let store = tx.object_store(TASKS_STORE)?;
        Ok((tx, store))
    }

    /// Store a new task due at its local-time deadline.
    ///
    /// # Errors
    ///
    /// [`TrackerError::InvalidInput`] if the title is blank or the date and
    /// time do not name a local instant.
    pub async fn create(&self, task: NewTask) -> Result<Task> {
        self.create_in(task, &Local).await
    }

    /// Like [`create`](Self::create), with the deadline computed in `tz`.
    pub async fn create_in<Tz: TimeZone>(&self, task: NewTask, tz: &Tz) -> Result<Task> {
        let deadline = task.deadline_in(tz)?;
        let (tx, store) = self.begin(TxMode::ReadWrite).await?;
        let key = store
            .add(&Draft {
                title: &task.title,
                deadline,
                notified: false,
                completed: false,
                day: task.day,
                month: task.month,
                year: task.year,
                hours: task.hours,
                minutes: task.minutes,
            })
            .await?;
        tx.commit().await?;

        let id = key
            .as_int()
            .ok_or_else(|| StoreError::Data(format!("generated task key {key} is not an integer")))?;
        info!(task_id = id, deadline, "task created");
        Ok(Task {
            id,
            title: task.title,
            deadline,
            notified: false,
            completed: false,
            day: task.day,
            month: task.month,
            year: task.year,
            hours: task.hours,
            minutes: task.minutes,
        })
    }

    /// # Errors
    ///
    /// [`TrackerError::NotFound`] if no task has this id.
    pub async fn get(&self, id: i64) -> Result<Task> {
        let (tx, store) = self.begin(TxMode::ReadOnly).await?;
        let task = store.get::<Task>(id).await?;
        tx.commit().await?;
        task.ok_or(TrackerError::NotFound { id })
    }

    /// Every task, ordered by id.
    pub async fn list_all(&self) -> Result<Vec<Task>> {
        let (tx, store) = self.begin(TxMode::ReadOnly).await?;
        let tasks = store.get_all::<Task>(KeyRange::all(), None).await?;
        tx.commit().await?;
        Ok(tasks)
    }

    /// Number of tasks whose alert has not gone out yet.
    pub async fn count_unnotified(&self) -> Result<u64> {
        let (tx, store) = self.begin(TxMode::ReadOnly).await?;
        let count = store
            .index(NOTIFIED_INDEX)?
            .count(KeyRange::only(false))
            .await?;
        tx.commit().await?;
        Ok(count)
    }

    async fn update(&self, id: i64, change: impl FnOnce(&mut Task)) -> Result<Task> {
        let (tx, store) = self.begin(TxMode::ReadWrite).await?;
        let Some(mut task) = store.get::<Task>(id).await? else {
            tx.abort();
            return Err(TrackerError::NotFound { id });
        };
        change(&mut task);
        store.put(&task).await?;
        tx.commit().await?;
        Ok(task)
    }

    /// Flip `completed`.
    ///
    /// # Errors
    ///
    /// [`TrackerError::NotFound`] if no task has this id; nothing is written.
    pub async fn toggle_completed(&self, id: i64) -> Result<Task> {
        let task = self.update(id, |t| t.completed = !t.completed).await?;
        debug!(task_id = id, completed = task.completed, "task toggled");
        Ok(task)
    }

    /// Set `completed` to `completed`.
    pub async fn set_completed(&self, id: i64, completed: bool) -> Result<Task> {
        let task = self.update(id, |t| t.completed = completed).await?;
        debug!(task_id = id, completed, "task completion set");
        Ok(task)
    }

    /// Remove a task. Removing a missing task succeeds.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let (tx, store) = self.begin(TxMode::ReadWrite).await?;
        store.delete(id).await?;
        tx.commit().await?;
        info!(task_id = id, "task deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::store::{StoreFactory, StoreOptions};
    use crate::tasks::open_task_store;
    use chrono::Utc;

    async fn repo(dir: &tempfile::TempDir) -> TaskRepository {
        let factory = StoreFactory::new(dir.path(), StoreOptions::default());
        TaskRepository::new(open_task_store(&factory, "duewatch").await.unwrap())
    }

    fn new_task(title: &str, day: u32) -> NewTask {
        NewTask {
            title: title.into(),
            day,
            month: 6,
            year: 2025,
            hours: 12,
            minutes: 0,
        }
    }

    #[tokio::test]
    async fn create_assigns_ids_and_initial_flags() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        let a = repo.create_in(new_task("a", 1), &Utc).await.unwrap();
        let b = repo.create_in(new_task("b", 2), &Utc).await.unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert!(!a.notified && !a.completed);
        assert_eq!(repo.get(2).await.unwrap(), b);
        assert_eq!(repo.list_all().await.unwrap(), vec![a, b]);
        assert_eq!(repo.count_unnotified().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn toggle_flips_completed_and_keeps_notified() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        let task = repo.create_in(new_task("a", 1), &Utc).await.unwrap();

        // Simulate a delivered alert.
        let tx = repo.db.transaction(&[TASKS_STORE], TxMode::ReadWrite).await.unwrap();
        let store = tx.object_store(TASKS_STORE).unwrap();
        store
            .put(&Task {
                notified: true,
                ..task.clone()
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let toggled = repo.toggle_completed(task.id).await.unwrap();
        assert!(toggled.completed);
        assert!(toggled.notified);
        let again = repo.toggle_completed(task.id).await.unwrap();
        assert!(!again.completed);
        assert!(repo.get(task.id).await.unwrap().notified);
    }

    #[tokio::test]
    async fn missing_tasks_report_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        assert!(matches!(
            repo.toggle_completed(42).await,
            Err(TrackerError::NotFound { id: 42 })
        ));
        assert!(matches!(repo.get(42).await, Err(TrackerError::NotFound { id: 42 })));
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        let task = repo.create_in(new_task("a", 1), &Utc).await.unwrap();
        repo.delete(task.id).await.unwrap();
        repo.delete(task.id).await.unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let repo = repo(&dir).await;
        assert!(matches!(
            repo.create_in(new_task("", 1), &Utc).await,
            Err(TrackerError::InvalidInput(_))
        ));
        assert!(matches!(
            repo.create_in(new_task("a", 31), &Utc).await,
            Err(TrackerError::InvalidInput(_))
        ));
        assert!(repo.list_all().await.unwrap().is_empty());
    }
}
