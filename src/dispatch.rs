//! Turns elapsed tasks into alerts.
//!
//! For each task a scan yields, the dispatcher emits one alert and then marks
//! the task notified in the scan's transaction. A task whose alert fails stays
//! unnotified and is offered again by the next scan.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::alert::{ALERT_TITLE, Alert, AlertSink};
use crate::error::{Result, TrackerError};
use crate::tasks::Scan;

/// Outcome of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Elapsed, unnotified tasks the scan produced.
    pub scanned: usize,
    /// Tasks alerted and marked notified.
    pub alerted: usize,
    /// Tasks whose alert could not be delivered.
    pub failed: usize,
}

/// Emits alerts for the tasks of a [`Scan`].
#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn AlertSink>,
    title: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("title", &self.title)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self {
            sink,
            title: ALERT_TITLE.to_owned(),
        }
    }

    /// Override the alert title.
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    /// Alert every task in `scan`, then commit.
    ///
    /// # Errors
    ///
    /// Store errors abort the scan's transaction, so no task from this pass
    /// is marked notified. Alerts already emitted in the pass will be emitted
    /// again by the next scan.
    pub async fn dispatch(&self, mut scan: Scan) -> Result<DispatchReport> {
        match self.alert_all(&mut scan).await {
            Ok(report) => {
                scan.finish().await?;
                if report.scanned > 0 {
                    info!(
                        scanned = report.scanned,
                        alerted = report.alerted,
                        failed = report.failed,
                        "deadline alerts dispatched"
                    );
                }
                Ok(report)
            }
            Err(e) => {
                warn!("dispatch aborted: {e}");
                scan.abort();
                Err(e)
            }
        }
    }

    async fn alert_all(&self, scan: &mut Scan) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        while let Some(task) = scan.next_task().await? {
            report.scanned += 1;
            let alert = Alert::for_task(&task, &self.title);
            match self.sink.emit(&alert).await {
                Ok(()) => {
                    scan.mark_notified(&task).await?;
                    report.alerted += 1;
                    debug!(task_id = task.id, "task marked notified");
                }
                Err(source) => {
                    report.failed += 1;
                    let err = TrackerError::AlertDelivery {
                        id: task.id,
                        source,
                    };
                    warn!(task_id = task.id, "{err}");
                }
            }
        }
        Ok(report)
    }
}
