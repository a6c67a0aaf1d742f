//! Deadline watcher.
//!
//! Runs the scan-and-dispatch pipeline from three triggers: a foreground
//! poll, a background check with one delayed retry after a failure, and
//! explicit [`WatcherMessage`]s. Triggers may overlap freely; read-write
//! transactions are serialized by the store, so a task is alerted once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{Result, TrackerError};
use crate::store::{Database, StoreError, Transaction};
use crate::tasks::{DeadlineScanner, Task, TaskRepository};

/// Current time in epoch milliseconds.
pub fn now_epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// What started a deadline check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Foreground timer.
    Poll,
    /// Background schedule.
    Background,
    /// Delayed retry of a failed background check.
    Retry,
    /// Explicit [`WatcherMessage::CheckDeadlines`].
    Message,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Trigger::Poll => "poll",
            Trigger::Background => "background",
            Trigger::Retry => "retry",
            Trigger::Message => "message",
        })
    }
}

/// Requests sent to a running watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherMessage {
    /// Check deadlines now.
    CheckDeadlines,
    /// Mark a task completed (the alert's "complete" action).
    CompleteTask { id: i64 },
}

/// Parses `check` and `complete <id>`, the text form used on the command
/// line.
impl FromStr for WatcherMessage {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let message = match (words.next(), words.next()) {
            (Some("check"), None) => WatcherMessage::CheckDeadlines,
            (Some("complete"), Some(id)) => WatcherMessage::CompleteTask {
                id: id
                    .parse()
                    .map_err(|_| TrackerError::InvalidInput(format!("bad task id `{id}`")))?,
            },
            _ => {
                return Err(TrackerError::InvalidInput(format!(
                    "unknown message `{}`",
                    s.trim()
                )));
            }
        };
        if words.next().is_some() {
            return Err(TrackerError::InvalidInput(format!(
                "unexpected text after message `{}`",
                s.trim()
            )));
        }
        Ok(message)
    }
}

/// Owns the triggers and runs deadline checks.
#[derive(Debug, Clone)]
pub struct Watcher {
    repo: TaskRepository,
    scanner: DeadlineScanner,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    background_interval: Duration,
    retry_delay: Duration,
    transaction_timeout: Duration,
}

impl Watcher {
    pub fn new(db: Database, dispatcher: Dispatcher) -> Self {
        let defaults = WatcherConfig::default();
        Self {
            repo: TaskRepository::new(db.clone()),
            scanner: DeadlineScanner::new(db),
            dispatcher,
            poll_interval: Duration::from_secs(defaults.poll_interval_secs),
            background_interval: Duration::from_secs(defaults.background_interval_secs),
            retry_delay: Duration::from_secs(defaults.retry_delay_secs),
            transaction_timeout: Duration::from_secs(30),
        }
    }

    /// Apply intervals from configuration.
    pub fn with_config(self, config: &WatcherConfig) -> Self {
        self.with_intervals(
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_secs(config.background_interval_secs),
            Duration::from_secs(config.retry_delay_secs),
        )
    }

    /// Set the poll and background intervals and the retry delay.
    pub fn with_intervals(mut self, poll: Duration, background: Duration, retry_delay: Duration) -> Self {
        self.poll_interval = poll.max(Duration::from_millis(1));
        self.background_interval = background.max(Duration::from_millis(1));
        self.retry_delay = retry_delay;
        self
    }

    /// Bound how long one check may hold its transaction.
    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &TaskRepository {
        &self.repo
    }

    /// Scan for tasks due at `now_ms` and alert them.
    ///
    /// Safe to call at any time, including while another check is running.
    ///
    /// # Errors
    ///
    /// Store errors, or [`StoreError::TransactionTimeout`] if the check held
    /// its transaction longer than the configured timeout and was aborted,
    /// in which case nothing from the check is committed. A check whose
    /// commit had already started when the timeout fired reports the commit
    /// outcome instead.
    pub async fn check_deadlines(&self, trigger: Trigger, now_ms: i64) -> Result<DispatchReport> {
        debug!(%trigger, now_ms, "checking deadlines");
        let scan = self.scanner.scan_elapsed(now_ms).await?;
        let tx = scan.transaction().clone();
        let dispatch = self.dispatcher.dispatch(scan);
        tokio::pin!(dispatch);
        match tokio::time::timeout(self.transaction_timeout, &mut dispatch).await {
            Ok(outcome) => outcome,
            Err(_) => self.settle_timed_out(trigger, &tx, dispatch).await,
        }
    }

    /// Abort a check that overran its timeout, unless its commit is already
    /// under way; then `pending` finishes and its outcome is returned.
    async fn settle_timed_out<F>(
        &self,
        trigger: Trigger,
        tx: &Transaction,
        pending: Pin<&mut F>,
    ) -> Result<DispatchReport>
    where
        F: Future<Output = Result<DispatchReport>>,
    {
        let cause = StoreError::TransactionTimeout {
            timeout_ms: millis(self.transaction_timeout),
        };
        if tx.abort_with(cause.clone()) {
            warn!(%trigger, "deadline check timed out");
            return Err(cause.into());
        }
        debug!(%trigger, "deadline check overran during commit");
        pending.await
    }

    /// Mark a task completed.
    pub async fn complete_task(&self, id: i64) -> Result<Task> {
        self.repo.set_completed(id, true).await
    }

    /// Handle one message.
    pub async fn handle_message(&self, message: WatcherMessage) -> Result<()> {
        match message {
            WatcherMessage::CheckDeadlines => {
                self.check_deadlines(Trigger::Message, now_epoch_millis())
                    .await
                    .map(|_| ())
            }
            WatcherMessage::CompleteTask { id } => {
                self.complete_task(id).await?;
                info!(task_id = id, "task completed from alert");
                Ok(())
            }
        }
    }

    async fn run_check(&self, trigger: Trigger) -> Result<DispatchReport> {
        let outcome = self.check_deadlines(trigger, now_epoch_millis()).await;
        if let Err(e) = &outcome {
            error!(%trigger, "deadline check failed: {e}");
        }
        outcome
    }

    /// Background check; a failure schedules one delayed retry, whose
    /// handle is returned.
    async fn background_check(&self, cancel: &CancellationToken) -> Option<JoinHandle<()>> {
        match self.run_check(Trigger::Background).await {
            Ok(_) => None,
            Err(_) => Some(self.schedule_retry(cancel)),
        }
    }

    fn schedule_retry(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let watcher = self.clone();
        let cancel = cancel.clone();
        let delay = self.retry_delay;
        info!(delay_ms = millis(delay), "retrying background check");
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    // One retry only; a second failure waits for the next tick.
                    let _ = watcher.run_check(Trigger::Retry).await;
                }
            }
        })
    }

    /// Start the watcher loop on the runtime.
    pub fn spawn(
        self,
        messages: mpsc::Receiver<WatcherMessage>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(messages, cancel))
    }

    /// Run the triggers until `cancel` fires.
    pub async fn run(self, mut messages: mpsc::Receiver<WatcherMessage>, cancel: CancellationToken) {
        info!(
            poll_ms = millis(self.poll_interval),
            background_ms = millis(self.background_interval),
            "deadline watcher started"
        );
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut background = tokio::time::interval_at(
            tokio::time::Instant::now() + self.background_interval,
            self.background_interval,
        );
        background.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut messages_open = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    let _ = self.run_check(Trigger::Poll).await;
                }
                _ = background.tick() => {
                    // The retry runs detached.
                    let _ = self.background_check(&cancel).await;
                }
                message = messages.recv(), if messages_open => match message {
                    Some(message) => {
                        if let Err(e) = self.handle_message(message.clone()).await {
                            match e {
                                TrackerError::NotFound { id } => {
                                    warn!(task_id = id, "message for unknown task");
                                }
                                other => error!(?message, "message failed: {other}"),
                            }
                        }
                    }
                    None => {
                        debug!("message channel closed");
                        messages_open = false;
                    }
                },
            }
        }
        info!("deadline watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::alert::ChannelAlertSink;
    use crate::store::{StoreFactory, StoreOptions};
    use crate::tasks::{NewTask, open_task_store};
    use std::sync::Arc;

    async fn setup(dir: &tempfile::TempDir) -> (Watcher, mpsc::Receiver<crate::alert::Alert>) {
        let factory = StoreFactory::new(dir.path(), StoreOptions::default());
        let db = open_task_store(&factory, "duewatch").await.unwrap();
        let (sink, alerts) = ChannelAlertSink::new(16);
        (Watcher::new(db, Dispatcher::new(Arc::new(sink))), alerts)
    }

    fn past_task(title: &str) -> NewTask {
        NewTask {
            title: title.into(),
            day: 1,
            month: 1,
            year: 2020,
            hours: 12,
            minutes: 0,
        }
    }

    #[test]
    fn triggers_display_lowercase() {
        assert_eq!(Trigger::Background.to_string(), "background");
        assert_eq!(Trigger::Message.to_string(), "message");
    }

    #[tokio::test]
    async fn check_deadlines_alerts_past_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut alerts) = setup(&dir).await;
        let task = watcher.repository().create(past_task("old")).await.unwrap();

        let report = watcher
            .check_deadlines(Trigger::Poll, now_epoch_millis())
            .await
            .unwrap();
        assert_eq!(report.alerted, 1);
        assert_eq!(alerts.recv().await.unwrap().task_id, task.id);
    }

    #[tokio::test]
    async fn complete_message_marks_task_done() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _alerts) = setup(&dir).await;
        let task = watcher.repository().create(past_task("old")).await.unwrap();

        watcher
            .handle_message(WatcherMessage::CompleteTask { id: task.id })
            .await
            .unwrap();
        assert!(watcher.repository().get(task.id).await.unwrap().completed);
        assert!(matches!(
            watcher
                .handle_message(WatcherMessage::CompleteTask { id: 999 })
                .await,
            Err(TrackerError::NotFound { id: 999 })
        ));
    }

    #[tokio::test]
    async fn loop_answers_messages_and_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, mut alerts) = setup(&dir).await;
        let task = watcher.repository().create(past_task("old")).await.unwrap();
        let watcher = watcher.with_intervals(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = watcher.spawn(rx, cancel.clone());
        tx.send(WatcherMessage::CheckDeadlines).await.unwrap();

        // The first poll tick fires immediately, so exactly one alert
        // arrives whichever trigger wins.
        let alert = tokio::time::timeout(Duration::from_secs(5), alerts.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(alert.task_id, task.id);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn text_messages_reach_a_running_watcher() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _alerts) = setup(&dir).await;
        let task = watcher.repository().create(past_task("done")).await.unwrap();
        let repo = watcher.repository().clone();
        let watcher = watcher.with_intervals(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = watcher.spawn(rx, cancel.clone());
        let complete = format!("complete {}", task.id);
        for line in ["complete 999", complete.as_str()] {
            tx.send(line.parse().unwrap()).await.unwrap();
        }
        // Closing the channel leaves the timers running.
        drop(tx);

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if repo.get(task.id).await.unwrap().completed {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(completed.is_ok());
        assert!(!handle.is_finished());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    /// Sleeps in `emit` for the first `slow_calls` attempts.
    #[derive(Default)]
    struct SlowSink {
        delay: Duration,
        slow_calls: usize,
        attempts: std::sync::atomic::AtomicUsize,
        delivered: std::sync::Mutex<Vec<i64>>,
    }

    impl SlowSink {
        fn attempts(&self) -> usize {
            self.attempts.load(std::sync::atomic::Ordering::SeqCst)
        }

        fn delivered(&self) -> Vec<i64> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl crate::alert::AlertSink for SlowSink {
        async fn emit(
            &self,
            alert: &crate::alert::Alert,
        ) -> std::result::Result<(), crate::alert::AlertError> {
            let n = self
                .attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if n < self.slow_calls {
                tokio::time::sleep(self.delay).await;
            }
            self.delivered.lock().unwrap().push(alert.task_id);
            Ok(())
        }
    }

    async fn slow_setup(dir: &tempfile::TempDir, sink: Arc<SlowSink>) -> Watcher {
        let factory = StoreFactory::new(dir.path(), StoreOptions::default());
        let db = open_task_store(&factory, "duewatch").await.unwrap();
        Watcher::new(db, Dispatcher::new(sink))
            .with_intervals(
                Duration::from_secs(3600),
                Duration::from_secs(3600),
                Duration::from_millis(50),
            )
            .with_transaction_timeout(Duration::from_millis(100))
    }

    #[test]
    fn messages_parse_from_text() {
        assert_eq!(
            "check".parse::<WatcherMessage>().unwrap(),
            WatcherMessage::CheckDeadlines
        );
        assert_eq!(
            "  complete 42 ".parse::<WatcherMessage>().unwrap(),
            WatcherMessage::CompleteTask { id: 42 }
        );
        for bad in ["", "complete", "complete x", "check now", "snooze 1"] {
            assert!(matches!(
                bad.parse::<WatcherMessage>(),
                Err(TrackerError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn overlong_check_is_aborted_and_releases_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            slow_calls: usize::MAX,
            ..SlowSink::default()
        });
        let watcher = slow_setup(&dir, Arc::clone(&sink)).await;
        let task = watcher.repository().create(past_task("slow")).await.unwrap();

        let err = watcher
            .check_deadlines(Trigger::Poll, now_epoch_millis())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Store(StoreError::TransactionTimeout { timeout_ms: 100 })
        ));
        assert!(sink.delivered().is_empty());

        // The aborted scan kept nothing and no longer holds the write lock.
        let stored = tokio::time::timeout(
            Duration::from_secs(2),
            watcher.repository().set_completed(task.id, true),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(!stored.notified);
        assert_eq!(watcher.repository().count_unnotified().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn overrun_after_commit_started_reports_the_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (watcher, _alerts) = setup(&dir).await;
        let scan = watcher.scanner.scan_elapsed(now_epoch_millis()).await.unwrap();
        let tx = scan.transaction().clone();
        scan.finish().await.unwrap();

        let report = DispatchReport {
            scanned: 1,
            alerted: 1,
            failed: 0,
        };
        let pending = std::pin::pin!(async move { Ok::<_, TrackerError>(report) });
        let outcome = watcher
            .settle_timed_out(Trigger::Background, &tx, pending)
            .await
            .unwrap();
        assert_eq!(outcome, report);
        assert!(matches!(tx.state(), crate::store::TxState::Committed));
    }

    #[tokio::test]
    async fn failed_background_check_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            slow_calls: 1,
            ..SlowSink::default()
        });
        let watcher = slow_setup(&dir, Arc::clone(&sink)).await;
        let task = watcher.repository().create(past_task("flaky")).await.unwrap();

        let cancel = CancellationToken::new();
        let retry = watcher.background_check(&cancel).await.unwrap();
        assert_eq!(sink.attempts(), 1);
        retry.await.unwrap();

        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.delivered(), vec![task.id]);
        assert!(watcher.repository().get(task.id).await.unwrap().notified);
    }

    #[tokio::test]
    async fn failed_retry_is_not_retried_again() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            slow_calls: usize::MAX,
            ..SlowSink::default()
        });
        let watcher = slow_setup(&dir, Arc::clone(&sink)).await;
        watcher.repository().create(past_task("stuck")).await.unwrap();

        let cancel = CancellationToken::new();
        let retry = watcher.background_check(&cancel).await.unwrap();
        retry.await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(sink.attempts(), 2);
        assert_eq!(watcher.repository().count_unnotified().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn successful_background_check_schedules_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink::default());
        let watcher = slow_setup(&dir, Arc::clone(&sink)).await;
        watcher.repository().create(past_task("quick")).await.unwrap();

        let cancel = CancellationToken::new();
        assert!(watcher.background_check(&cancel).await.is_none());
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test]
    async fn cancelled_retry_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(SlowSink {
            delay: Duration::from_millis(500),
            slow_calls: 1,
            ..SlowSink::default()
        });
        let watcher = slow_setup(&dir, Arc::clone(&sink)).await.with_intervals(
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );
        watcher.repository().create(past_task("cancelled")).await.unwrap();

        let cancel = CancellationToken::new();
        let retry = watcher.background_check(&cancel).await.unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), retry)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(sink.attempts(), 1);
        assert_eq!(watcher.repository().count_unnotified().await.unwrap(), 1);
    }
}
