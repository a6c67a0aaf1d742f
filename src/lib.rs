//! duewatch: a local task tracker with one-time deadline alerts.
//!
//! Tasks live in an embedded document store (JSON records in SQLite) and are
//! watched for elapsed deadlines:
//! Watcher trigger → DeadlineScanner → Dispatcher → AlertSink
//!
//! # Architecture
//!
//! - **Store**: async transactions, indexes, cursors and versioned migrations
//!   over SQLite (`store`)
//! - **Tasks**: typed repository and deadline scans over the `tasks` store
//!   (`tasks`)
//! - **Dispatch**: one alert per elapsed task, then `notified = true` in the
//!   same transaction (`dispatch`, `alert`)
//! - **Watcher**: foreground poll, background check with retry, and messages
//!   (`watcher`)

pub mod alert;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod paths;
pub mod store;
pub mod tasks;
pub mod watcher;

pub use alert::{
    Alert, AlertError, AlertSink, ChannelAlertSink, Permission, PermissionGate, TracingAlertSink,
};
pub use config::TrackerConfig;
pub use dispatch::{DispatchReport, Dispatcher};
pub use error::{Result, TrackerError};
pub use tasks::{DeadlineScanner, NewTask, Scan, Task, TaskRepository};
pub use watcher::{Trigger, Watcher, WatcherMessage};
