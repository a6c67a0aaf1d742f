#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use duewatch::alert::{Alert, AlertError, AlertSink};
use duewatch::store::{Database, StoreFactory, StoreOptions};
use duewatch::tasks::open_task_store;
use duewatch::{
    DeadlineScanner, Dispatcher, NewTask, Permission, PermissionGate, Task, TaskRepository,
    TrackerError, Trigger, Watcher,
};

/// Records every delivered alert, optionally failing for one task.
#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<i64>>,
    fail_for: Mutex<Option<i64>>,
    delay: Duration,
}

impl RecordingSink {
    fn delivered(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().clone()
    }

    fn fail_for(&self, id: Option<i64>) {
        *self.fail_for.lock().unwrap() = id;
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if *self.fail_for.lock().unwrap() == Some(alert.task_id) {
            return Err(AlertError::Delivery("display unavailable".into()));
        }
        self.delivered.lock().unwrap().push(alert.task_id);
        Ok(())
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    db: Database,
    repo: TaskRepository,
}

async fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let factory = StoreFactory::new(dir.path(), StoreOptions::default());
    let db = open_task_store(&factory, "duewatch").await.unwrap();
    Fixture {
        repo: TaskRepository::new(db.clone()),
        db,
        _dir: dir,
    }
}

fn due(title: &str, hours: u32, minutes: u32) -> NewTask {
    NewTask {
        title: title.into(),
        day: 15,
        month: 6,
        year: 2030,
        hours,
        minutes,
    }
}

async fn create(repo: &TaskRepository, task: NewTask) -> Task {
    repo.create_in(task, &Utc).await.unwrap()
}

#[tokio::test]
async fn elapsed_task_is_alerted_and_marked() {
    let f = fixture().await;
    let task = create(&f.repo, due("file report", 9, 0)).await;
    let now = task.deadline + 1000;

    let mut scan = DeadlineScanner::new(f.db.clone()).scan_elapsed(now).await.unwrap();
    let found = scan.collect().await.unwrap();
    assert_eq!(found.iter().map(|t| t.id).collect::<Vec<_>>(), vec![task.id]);
    scan.abort();

    let sink = Arc::new(RecordingSink::default());
    let dispatcher = Dispatcher::new(sink.clone());
    let scan = DeadlineScanner::new(f.db.clone()).scan_elapsed(now).await.unwrap();
    let report = dispatcher.dispatch(scan).await.unwrap();

    assert_eq!((report.scanned, report.alerted, report.failed), (1, 1, 0));
    assert_eq!(sink.delivered(), vec![task.id]);
    assert!(f.repo.get(task.id).await.unwrap().notified);
    assert_eq!(f.repo.count_unnotified().await.unwrap(), 0);
}

#[tokio::test]
async fn scan_yields_tasks_in_deadline_order() {
    let f = fixture().await;
    let later = create(&f.repo, due("later", 9, 1)).await;
    let earlier = create(&f.repo, due("earlier", 9, 0)).await;
    let future = create(&f.repo, due("future", 10, 0)).await;
    let now = later.deadline + 1000;

    let mut scan = DeadlineScanner::new(f.db.clone()).scan_elapsed(now).await.unwrap();
    let ids: Vec<i64> = scan.collect().await.unwrap().iter().map(|t| t.id).collect();
    scan.finish().await.unwrap();
    assert_eq!(ids, vec![earlier.id, later.id]);
    assert!(!ids.contains(&future.id));
}

#[tokio::test]
async fn deadline_equal_to_now_is_elapsed() {
    let f = fixture().await;
    let task = create(&f.repo, due("exact", 9, 0)).await;

    let scanner = DeadlineScanner::new(f.db.clone());
    let mut early = scanner.scan_elapsed(task.deadline - 1).await.unwrap();
    assert!(early.next_task().await.unwrap().is_none());
    early.finish().await.unwrap();

    let mut exact = scanner.scan_elapsed(task.deadline).await.unwrap();
    assert_eq!(exact.next_task().await.unwrap().map(|t| t.id), Some(task.id));
    exact.finish().await.unwrap();
}

#[tokio::test]
async fn toggling_a_missing_task_writes_nothing() {
    let f = fixture().await;
    let task = create(&f.repo, due("only", 9, 0)).await;

    assert!(matches!(
        f.repo.toggle_completed(task.id + 100).await,
        Err(TrackerError::NotFound { id }) if id == task.id + 100
    ));
    let all = f.repo.list_all().await.unwrap();
    assert_eq!(all, vec![task]);
}

#[tokio::test]
async fn overlapping_checks_alert_once() {
    let f = fixture().await;
    let task = create(&f.repo, due("shared", 9, 0)).await;
    let now = task.deadline + 1000;

    let sink = Arc::new(RecordingSink {
        delay: Duration::from_millis(50),
        ..RecordingSink::default()
    });
    let watcher = Watcher::new(f.db.clone(), Dispatcher::new(sink.clone()));

    let first = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.check_deadlines(Trigger::Poll, now).await })
    };
    let second = {
        let watcher = watcher.clone();
        tokio::spawn(async move { watcher.check_deadlines(Trigger::Background, now).await })
    };
    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_eq!(a.alerted + b.alerted, 1);
    assert_eq!(sink.delivered(), vec![task.id]);
    assert!(f.repo.get(task.id).await.unwrap().notified);
}

#[tokio::test]
async fn repeated_checks_do_not_realert() {
    let f = fixture().await;
    let task = create(&f.repo, due("once", 9, 0)).await;
    let sink = Arc::new(RecordingSink::default());
    let watcher = Watcher::new(f.db.clone(), Dispatcher::new(sink.clone()));

    for offset in [1_000, 60_000, 3_600_000] {
        watcher
            .check_deadlines(Trigger::Poll, task.deadline + offset)
            .await
            .unwrap();
    }
    assert_eq!(sink.delivered(), vec![task.id]);
}

#[tokio::test]
async fn failed_alert_is_retried_by_the_next_check() {
    let f = fixture().await;
    let flaky = create(&f.repo, due("flaky", 9, 0)).await;
    let fine = create(&f.repo, due("fine", 9, 1)).await;
    let now = fine.deadline + 1000;

    let sink = Arc::new(RecordingSink::default());
    sink.fail_for(Some(flaky.id));
    let watcher = Watcher::new(f.db.clone(), Dispatcher::new(sink.clone()));

    let report = watcher.check_deadlines(Trigger::Poll, now).await.unwrap();
    assert_eq!((report.scanned, report.alerted, report.failed), (2, 1, 1));
    assert!(!f.repo.get(flaky.id).await.unwrap().notified);
    assert!(f.repo.get(fine.id).await.unwrap().notified);

    sink.fail_for(None);
    let report = watcher.check_deadlines(Trigger::Retry, now).await.unwrap();
    assert_eq!((report.scanned, report.alerted), (1, 1));
    assert_eq!(sink.delivered(), vec![fine.id, flaky.id]);
}

#[tokio::test]
async fn denied_permission_leaves_tasks_pending() {
    let f = fixture().await;
    let task = create(&f.repo, due("muted", 9, 0)).await;
    let gate = Arc::new(PermissionGate::new(RecordingSink::default(), Permission::Undecided));
    let watcher = Watcher::new(f.db.clone(), Dispatcher::new(gate.clone()));

    let report = watcher
        .check_deadlines(Trigger::Poll, task.deadline + 1000)
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(f.repo.count_unnotified().await.unwrap(), 1);

    gate.set_permission(Permission::Granted);
    let report = watcher
        .check_deadlines(Trigger::Poll, task.deadline + 1000)
        .await
        .unwrap();
    assert_eq!(report.alerted, 1);
    assert_eq!(f.repo.count_unnotified().await.unwrap(), 0);
}

#[tokio::test]
async fn completion_changes_never_clear_notified() {
    let f = fixture().await;
    let task = create(&f.repo, due("sticky", 9, 0)).await;
    let watcher = Watcher::new(
        f.db.clone(),
        Dispatcher::new(Arc::new(RecordingSink::default())),
    );
    watcher
        .check_deadlines(Trigger::Poll, task.deadline + 1000)
        .await
        .unwrap();

    let toggled = f.repo.toggle_completed(task.id).await.unwrap();
    assert!(toggled.completed && toggled.notified);
    let toggled = f.repo.toggle_completed(task.id).await.unwrap();
    assert!(!toggled.completed && toggled.notified);

    let stored = f.repo.get(task.id).await.unwrap();
    assert!(stored.notified);
    assert_eq!(stored.deadline, task.deadline);
}

#[tokio::test]
async fn deleted_tasks_are_not_alerted() {
    let f = fixture().await;
    let task = create(&f.repo, due("gone", 9, 0)).await;
    f.repo.delete(task.id).await.unwrap();

    let sink = Arc::new(RecordingSink::default());
    let watcher = Watcher::new(f.db.clone(), Dispatcher::new(sink.clone()));
    let report = watcher
        .check_deadlines(Trigger::Poll, task.deadline + 1000)
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);
    assert!(sink.delivered().is_empty());
    assert!(matches!(
        f.repo.get(task.id).await,
        Err(TrackerError::NotFound { .. })
    ));
}
