//! Tasks with deadlines, and their persisted schema.
//!
//! Sub-modules:
//! - `repository`: CRUD over the `tasks` object store.
//! - `scanner`: index range scans for tasks whose deadline has passed.

pub mod repository;
pub mod scanner;

pub use repository::TaskRepository;
pub use scanner::{DeadlineScanner, Scan};

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};
use crate::store::{
    Database, IndexParams, Migrations, ObjectStoreParams, StoreFactory, StoreResult,
};

/// Default name of the store file.
pub const DEFAULT_STORE_NAME: &str = "duewatch";
/// Object store holding every task.
pub const TASKS_STORE: &str = "tasks";
/// Index over `deadline` (epoch milliseconds).
pub const DEADLINE_INDEX: &str = "deadline";
/// Index over `notified` (0/1).
pub const NOTIFIED_INDEX: &str = "notified";
/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    /// Due time in epoch milliseconds, fixed at creation.
    pub deadline: i64,
    /// Set once the deadline alert has been delivered. Never cleared.
    #[serde(default)]
    pub notified: bool,
    #[serde(default)]
    pub completed: bool,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub hours: u32,
    pub minutes: u32,
}

impl Task {
    /// Returns `true` if the deadline has passed and no alert went out yet.
    pub fn is_due(&self, now_ms: i64) -> bool {
        !self.notified && self.deadline <= now_ms
    }
}

/// User input for a new task. The deadline is computed from these fields in
/// local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub day: u32,
    pub month: u32,
    pub year: i32,
    pub hours: u32,
    pub minutes: u32,
}

impl NewTask {
    /// A task due at `at`, local time.
    pub fn at(title: impl Into<String>, at: NaiveDateTime) -> Self {
        use chrono::{Datelike, Timelike};
        Self {
            title: title.into(),
            day: at.day(),
            month: at.month(),
            year: at.year(),
            hours: at.hour(),
            minutes: at.minute(),
        }
    }

    fn local_datetime(&self) -> Result<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(self.year, self.month, self.day).ok_or_else(|| {
            TrackerError::InvalidInput(format!(
                "{:04}-{:02}-{:02} is not a calendar date",
                self.year, self.month, self.day
            ))
        })?;
        let time = NaiveTime::from_hms_opt(self.hours, self.minutes, 0).ok_or_else(|| {
            TrackerError::InvalidInput(format!(
                "{:02}:{:02} is not a time of day",
                self.hours, self.minutes
            ))
        })?;
        Ok(date.and_time(time))
    }

    /// Deadline in epoch milliseconds, interpreting the fields in `tz`.
    ///
    /// Times repeated by a DST change resolve to the earlier instant.
    ///
    /// # Errors
    ///
    /// [`TrackerError::InvalidInput`] for an empty title, out-of-range
    /// fields, or a time skipped by a DST change.
    pub fn deadline_in<Tz: TimeZone>(&self, tz: &Tz) -> Result<i64> {
        if self.title.trim().is_empty() {
            return Err(TrackerError::InvalidInput("title must not be empty".into()));
        }
        let local = self.local_datetime()?;
        let instant = tz.from_local_datetime(&local).earliest().ok_or_else(|| {
            TrackerError::InvalidInput(format!("{local} does not exist in the local time zone"))
        })?;
        Ok(instant.timestamp_millis())
    }

    /// Deadline in the system's local time zone.
    pub fn deadline(&self) -> Result<i64> {
        self.deadline_in(&Local)
    }
}

/// Schema steps for the task store.
pub fn task_migrations() -> Migrations {
    Migrations::new().step(0, 1, |up| {
        if up.contains_object_store(TASKS_STORE)? {
            return Ok(());
        }
        let tasks = up.create_object_store(TASKS_STORE, ObjectStoreParams::auto_increment("id"))?;
        tasks.create_index(DEADLINE_INDEX, "deadline", IndexParams::default())?;
        tasks.create_index(NOTIFIED_INDEX, "notified", IndexParams::default())?;
        Ok(())
    })
}

/// Open the task store at the current schema version.
///
/// The handle closes itself when another caller needs to upgrade or delete
/// the store.
pub async fn open_task_store(factory: &StoreFactory, name: &str) -> StoreResult<Database> {
    let db = factory.open(name, SCHEMA_VERSION, task_migrations()).await?;
    db.close_on_version_change();
    Ok(db)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use chrono::{FixedOffset, Utc};

    fn new_task(day: u32, month: u32, hours: u32, minutes: u32) -> NewTask {
        NewTask {
            title: "Pay rent".into(),
            day,
            month,
            year: 2025,
            hours,
            minutes,
        }
    }

    #[test]
    fn deadline_is_epoch_millis_in_the_given_zone() {
        let task = new_task(1, 1, 0, 0);
        assert_eq!(task.deadline_in(&Utc).unwrap(), 1_735_689_600_000);

        let plus_two = FixedOffset::east_opt(2 * 3600).unwrap();
        assert_eq!(
            task.deadline_in(&plus_two).unwrap(),
            1_735_689_600_000 - 2 * 3_600_000
        );
    }

    #[test]
    fn out_of_range_fields_are_rejected() {
        for task in [new_task(31, 2, 9, 0), new_task(1, 13, 9, 0), new_task(1, 1, 24, 0), new_task(1, 1, 9, 60)] {
            assert!(matches!(
                task.deadline_in(&Utc),
                Err(TrackerError::InvalidInput(_))
            ));
        }
    }

    #[test]
    fn blank_titles_are_rejected() {
        let mut task = new_task(1, 1, 9, 0);
        task.title = "   ".into();
        assert!(matches!(
            task.deadline_in(&Utc),
            Err(TrackerError::InvalidInput(_))
        ));
    }

    #[test]
    fn at_copies_the_components() {
        let at = NaiveDate::from_ymd_opt(2026, 3, 9)
            .unwrap()
            .and_hms_opt(17, 45, 0)
            .unwrap();
        let task = NewTask::at("Dentist", at);
        assert_eq!((task.day, task.month, task.year), (9, 3, 2026));
        assert_eq!((task.hours, task.minutes), (17, 45));
    }

    #[test]
    fn due_means_elapsed_and_unnotified() {
        let mut task = Task {
            id: 1,
            title: "x".into(),
            deadline: 100,
            notified: false,
            completed: false,
            day: 1,
            month: 1,
            year: 2025,
            hours: 0,
            minutes: 0,
        };
        assert!(task.is_due(100));
        assert!(!task.is_due(99));
        task.notified = true;
        assert!(!task.is_due(1000));
    }
}
