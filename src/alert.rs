//! User-facing deadline alerts.
//!
//! The dispatcher hands each [`Alert`] to an [`AlertSink`]. Sinks decide how
//! the alert reaches the user; [`PermissionGate`] refuses delivery until the
//! user has granted notification permission.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::tasks::Task;

/// Default alert title.
pub const ALERT_TITLE: &str = "Task Deadline Reached!";

/// Actions offered with an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    /// Mark the task completed.
    Complete,
    /// Show the task list.
    Open,
}

/// One deadline alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub task_id: i64,
    pub title: String,
    pub body: String,
    pub actions: Vec<AlertAction>,
}

impl Alert {
    pub fn for_task(task: &Task, title: &str) -> Self {
        Self {
            task_id: task.id,
            title: title.to_owned(),
            body: format!("{} is due now", task.title),
            actions: vec![AlertAction::Complete, AlertAction::Open],
        }
    }
}

/// Why an alert was not delivered.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AlertError {
    #[error("notification permission not granted")]
    PermissionDenied,

    #[error("alert delivery failed: {0}")]
    Delivery(String),
}

/// Delivers alerts to the user.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Called at most once per task per scan.
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError>;
}

/// Writes alerts to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        info!(task_id = alert.task_id, title = %alert.title, "{}", alert.body);
        Ok(())
    }
}

/// Forwards alerts to a channel for a front end to present.
#[derive(Debug, Clone)]
pub struct ChannelAlertSink {
    tx: mpsc::Sender<Alert>,
}

impl ChannelAlertSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Alert>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        self.tx
            .send(alert.clone())
            .await
            .map_err(|_| AlertError::Delivery("alert receiver dropped".into()))
    }
}

/// Notification permission as reported by the platform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    #[default]
    Granted,
    Denied,
    /// Not asked yet; treated as denied.
    #[serde(rename = "default")]
    Undecided,
}

/// Fails fast with [`AlertError::PermissionDenied`] unless permission is
/// granted.
#[derive(Debug)]
pub struct PermissionGate<S> {
    inner: S,
    permission: RwLock<Permission>,
}

impl<S: AlertSink> PermissionGate<S> {
    pub fn new(inner: S, permission: Permission) -> Self {
        Self {
            inner,
            permission: RwLock::new(permission),
        }
    }

    pub fn permission(&self) -> Permission {
        *self.permission.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the outcome of a permission request.
    pub fn set_permission(&self, permission: Permission) {
        *self.permission.write().unwrap_or_else(PoisonError::into_inner) = permission;
    }
}

#[async_trait]
impl<S: AlertSink> AlertSink for PermissionGate<S> {
    async fn emit(&self, alert: &Alert) -> Result<(), AlertError> {
        if self.permission() != Permission::Granted {
            return Err(AlertError::PermissionDenied);
        }
        self.inner.emit(alert).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn task() -> Task {
        Task {
            id: 7,
            title: "Pay rent".into(),
            deadline: 0,
            notified: false,
            completed: false,
            day: 1,
            month: 1,
            year: 2025,
            hours: 0,
            minutes: 0,
        }
    }

    #[test]
    fn alert_text_names_the_task() {
        let alert = Alert::for_task(&task(), ALERT_TITLE);
        assert_eq!(alert.title, "Task Deadline Reached!");
        assert_eq!(alert.body, "Pay rent is due now");
        assert_eq!(alert.actions, vec![AlertAction::Complete, AlertAction::Open]);
    }

    #[tokio::test]
    async fn channel_sink_forwards_alerts() {
        let (sink, mut rx) = ChannelAlertSink::new(4);
        let alert = Alert::for_task(&task(), ALERT_TITLE);
        sink.emit(&alert).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), alert);

        drop(rx);
        assert!(matches!(
            sink.emit(&alert).await,
            Err(AlertError::Delivery(_))
        ));
    }

    #[tokio::test]
    async fn gate_blocks_until_granted() {
        let (sink, mut rx) = ChannelAlertSink::new(4);
        let gate = PermissionGate::new(sink, Permission::Undecided);
        let alert = Alert::for_task(&task(), ALERT_TITLE);

        assert_eq!(gate.emit(&alert).await, Err(AlertError::PermissionDenied));
        assert!(rx.try_recv().is_err());

        gate.set_permission(Permission::Granted);
        gate.emit(&alert).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().task_id, 7);
    }

    #[test]
    fn permission_uses_platform_names() {
        let parsed: Permission = serde_json::from_str("\"default\"").unwrap();
        assert_eq!(parsed, Permission::Undecided);
        assert_eq!(serde_json::to_string(&Permission::Denied).unwrap(), "\"denied\"");
    }
}
