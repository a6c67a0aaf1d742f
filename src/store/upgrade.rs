//! Versioned schema migrations.
//!
//! An upgrade from `old` to `new` runs every registered step whose range
//! `from -> to` lies inside `old -> new`, in ascending order, inside one
//! exclusive SQLite transaction together with the version bump. If a step
//! fails nothing is kept: the catalog, the records and the version all roll
//! back.

use std::fmt;
use std::sync::Arc;

use rusqlite::{Connection, ErrorCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::engine::{self, Op, Reply, Source};
use super::error::{OpenFailure, StoreError, StoreResult};
use super::key::{Key, KeyRange};
use super::object_store::decode;
use super::schema::{self, IndexMeta, IndexParams, ObjectStoreParams, StoreMeta};

type StepFn = dyn Fn(&Upgrade<'_>) -> StoreResult<()> + Send + Sync;

/// One migration step.
#[derive(Clone)]
pub struct MigrationStep {
    pub from: u32,
    pub to: u32,
    handler: Arc<StepFn>,
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .finish_non_exhaustive()
    }
}

/// The ordered set of migration steps for a store.
#[derive(Debug, Clone, Default)]
pub struct Migrations {
    steps: Vec<MigrationStep>,
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step that upgrades `from` to `to`.
    #[must_use]
    pub fn step<F>(mut self, from: u32, to: u32, handler: F) -> Self
    where
        F: Fn(&Upgrade<'_>) -> StoreResult<()> + Send + Sync + 'static,
    {
        self.steps.push(MigrationStep {
            from,
            to,
            handler: Arc::new(handler),
        });
        self
    }

    /// Steps that belong to an upgrade from `old` to `new`, in run order.
    pub fn applicable(&self, old: u32, new: u32) -> Vec<&MigrationStep> {
        let mut steps: Vec<&MigrationStep> = self
            .steps
            .iter()
            .filter(|s| s.from < s.to && old <= s.from && s.to <= new)
            .collect();
        steps.sort_by_key(|s| (s.from, s.to));
        steps
    }

    /// Highest version any step reaches.
    pub fn latest(&self) -> u32 {
        self.steps.iter().map(|s| s.to).max().unwrap_or(0)
    }
}

/// Schema and data access while an upgrade is running.
pub struct Upgrade<'c> {
    conn: &'c Connection,
    name: &'c str,
    old_version: u32,
    new_version: u32,
}

impl<'c> Upgrade<'c> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn object_store_names(&self) -> StoreResult<Vec<String>> {
        Ok(schema::load_catalog(self.conn)?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    pub fn contains_object_store(&self, name: &str) -> StoreResult<bool> {
        Ok(self.object_store_names()?.iter().any(|n| n == name))
    }

    /// Create an object store.
    ///
    /// # Errors
    ///
    /// [`StoreError::Constraint`] if it already exists.
    pub fn create_object_store(
        &self,
        name: &str,
        params: ObjectStoreParams,
    ) -> StoreResult<UpgradeStore<'c>> {
        schema::insert_store(self.conn, name, &params)?;
        debug!(store = name, "created object store");
        Ok(UpgradeStore {
            conn: self.conn,
            name: name.to_owned(),
        })
    }

    pub fn delete_object_store(&self, name: &str) -> StoreResult<()> {
        schema::remove_store(self.conn, name)?;
        debug!(store = name, "deleted object store");
        Ok(())
    }

    /// An existing object store.
    pub fn object_store(&self, name: &str) -> StoreResult<UpgradeStore<'c>> {
        schema::load_store(self.conn, name)?;
        Ok(UpgradeStore {
            conn: self.conn,
            name: name.to_owned(),
        })
    }
}

/// An object store being reshaped by a migration.
pub struct UpgradeStore<'c> {
    conn: &'c Connection,
    name: String,
}

impl UpgradeStore<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn meta(&self) -> StoreResult<StoreMeta> {
        schema::load_store(self.conn, &self.name)
    }

    /// Create an index and fill it from the records already stored.
    pub fn create_index(&self, name: &str, key_path: &str, params: IndexParams) -> StoreResult<()> {
        schema::insert_index(self.conn, &self.name, name, key_path, params)?;
        engine::populate_index(
            self.conn,
            &self.name,
            &IndexMeta {
                name: name.to_owned(),
                key_path: key_path.to_owned(),
                unique: params.unique,
            },
        )?;
        debug!(store = %self.name, index = name, "created index");
        Ok(())
    }

    pub fn delete_index(&self, name: &str) -> StoreResult<()> {
        schema::remove_index(self.conn, &self.name, name)
    }

    pub fn index_names(&self) -> StoreResult<Vec<String>> {
        Ok(self.meta()?.indexes.into_iter().map(|i| i.name).collect())
    }

    pub fn add<T: Serialize>(&self, value: &T) -> StoreResult<Key> {
        engine::write_record(self.conn, &self.meta()?, serde_json::to_value(value)?, None, false)
    }

    pub fn put<T: Serialize>(&self, value: &T) -> StoreResult<Key> {
        engine::write_record(self.conn, &self.meta()?, serde_json::to_value(value)?, None, true)
    }

    pub fn get<T: DeserializeOwned>(&self, query: impl Into<KeyRange>) -> StoreResult<Option<T>> {
        let op = Op::Get {
            store: self.name.clone(),
            source: Source::Store,
            range: query.into(),
        };
        match engine::execute(self.conn, op)? {
            Reply::Value(value) => value.map(decode).transpose(),
            _ => Ok(None),
        }
    }

    /// Every record, in key order.
    pub fn get_all<T: DeserializeOwned>(&self) -> StoreResult<Vec<T>> {
        let op = Op::GetAll {
            store: self.name.clone(),
            source: Source::Store,
            range: KeyRange::all(),
            limit: None,
        };
        match engine::execute(self.conn, op)? {
            Reply::Values(values) => values.into_iter().map(decode).collect(),
            _ => Ok(Vec::new()),
        }
    }

    pub fn count(&self) -> StoreResult<u64> {
        let op = Op::Count {
            store: self.name.clone(),
            source: Source::Store,
            range: KeyRange::all(),
        };
        match engine::execute(self.conn, op)? {
            Reply::Count(n) => Ok(n),
            _ => Ok(0),
        }
    }

    pub fn delete(&self, query: impl Into<KeyRange>) -> StoreResult<()> {
        engine::delete_range(self.conn, &self.name, &query.into()).map(|_| ())
    }

    pub fn clear(&self) -> StoreResult<()> {
        engine::clear(self.conn, &self.name)
    }
}

fn begin_exclusive(conn: &Connection, name: &str, new: u32) -> StoreResult<()> {
    match conn.execute_batch("BEGIN EXCLUSIVE") {
        Ok(()) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            Err(StoreError::Open {
                name: name.to_owned(),
                reason: OpenFailure::Blocked {
                    requested: new,
                    open_handles: 0,
                },
            })
        }
        Err(e) => Err(e.into()),
    }
}

fn rollback(conn: &Connection, name: &str) {
    if let Err(e) = conn.execute_batch("ROLLBACK") {
        debug!(store = name, "rollback after upgrade: {e}");
    }
}

/// Run the upgrade to `new` on `conn`. `seen` is the version read before the
/// lock was taken.
///
/// The version is read again under the exclusive lock, since another opener
/// may have upgraded in between. Steps run from that fresh version; if it
/// already reached `new` nothing runs, and if it passed `new` the open fails
/// with [`OpenFailure::VersionTooLow`].
pub(crate) fn run(
    conn: &Connection,
    name: &str,
    seen: u32,
    new: u32,
    migrations: &Migrations,
) -> StoreResult<()> {
    begin_exclusive(conn, name, new)?;
    let old = match schema::read_version(conn) {
        Ok(version) => version,
        Err(e) => {
            rollback(conn, name);
            return Err(e.into());
        }
    };
    if old > new {
        rollback(conn, name);
        return Err(StoreError::Open {
            name: name.to_owned(),
            reason: OpenFailure::VersionTooLow {
                requested: new,
                existing: old,
            },
        });
    }
    if old == new {
        rollback(conn, name);
        debug!(store = name, version = new, "already upgraded by another opener");
        return Ok(());
    }
    if old != seen {
        debug!(store = name, seen, current = old, "store version moved before upgrade lock");
    }
    info!(store = name, from = old, to = new, "upgrading store");

    let upgrade = Upgrade {
        conn,
        name,
        old_version: old,
        new_version: new,
    };
    let result = schema::apply_schema(conn)
        .map_err(StoreError::from)
        .and_then(|()| {
            for step in migrations.applicable(old, new) {
                debug!(store = name, from = step.from, to = step.to, "running migration step");
                (step.handler)(&upgrade).map_err(|e| StoreError::Migration {
                    name: name.to_owned(),
                    from: step.from,
                    to: step.to,
                    reason: e.to_string(),
                })?;
            }
            schema::write_version(conn, new)?;
            Ok(())
        })
        .and_then(|()| Ok(conn.execute_batch("COMMIT")?));

    match result {
        Ok(()) => {
            info!(store = name, version = new, "upgrade complete");
            Ok(())
        }
        Err(e) => {
            warn!(store = name, from = old, to = new, "upgrade rolled back: {e}");
            rollback(conn, name);
            Err(match e {
                StoreError::Migration { .. } => e,
                other => StoreError::Migration {
                    name: name.to_owned(),
                    from: old,
                    to: new,
                    reason: other.to_string(),
                },
            })
        }
    }
}
