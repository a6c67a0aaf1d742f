//! SQLite DDL and catalog access for the document store.
//!
//! Every object store shares two backing tables: `_records` holds the JSON
//! documents and `_index_entries` holds one row per (index, key, record).
//! The catalog tables describe which object stores and indexes exist. The
//! store version lives in SQLite's `user_version` header field so that it
//! changes atomically with the upgrade transaction.

use rusqlite::{Connection, OptionalExtension, params};

use super::error::{StoreError, StoreResult};

/// Catalog and record tables. Idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _object_stores (
    name           TEXT PRIMARY KEY,
    key_path       TEXT,               -- NULL for out-of-line keys
    auto_increment INTEGER NOT NULL,
    next_key       INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS _indexes (
    store     TEXT NOT NULL,
    name      TEXT NOT NULL,
    key_path  TEXT NOT NULL,
    is_unique INTEGER NOT NULL,
    PRIMARY KEY (store, name)
);

-- Key columns are untyped so integer and text keys keep their storage class.
CREATE TABLE IF NOT EXISTS _records (
    store TEXT NOT NULL,
    key   NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (store, key)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS _index_entries (
    store       TEXT NOT NULL,
    idx         TEXT NOT NULL,
    key         NOT NULL,
    primary_key NOT NULL,
    PRIMARY KEY (store, idx, key, primary_key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_index_entries_record
    ON _index_entries(store, primary_key);
"#;

/// Options for a new object store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStoreParams {
    /// Dotted path of the in-line primary key; `None` for out-of-line keys.
    pub key_path: Option<String>,
    /// Whether missing integer keys are generated by the store.
    pub auto_increment: bool,
}

impl ObjectStoreParams {
    /// In-line key at `key_path`, generated when absent.
    pub fn auto_increment(key_path: impl Into<String>) -> Self {
        Self {
            key_path: Some(key_path.into()),
            auto_increment: true,
        }
    }
}

/// Options for a new index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexParams {
    pub unique: bool,
}

/// Catalog entry for an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    pub name: String,
    pub key_path: String,
    pub unique: bool,
}

/// Catalog entry for an object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMeta {
    pub name: String,
    pub key_path: Option<String>,
    pub auto_increment: bool,
    pub indexes: Vec<IndexMeta>,
}

impl StoreMeta {
    pub fn index(&self, name: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

/// Apply the catalog schema. Safe to call on every upgrade.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)
}

/// Read the stored version (0 for a fresh file).
pub(crate) fn read_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

pub(crate) fn write_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    // PRAGMA arguments cannot be bound parameters.
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
}

/// Load the whole catalog. Returns an empty list before the first upgrade.
pub(crate) fn load_catalog(conn: &Connection) -> StoreResult<Vec<StoreMeta>> {
    let has_catalog: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = '_object_stores')",
        [],
        |row| row.get(0),
    )?;
    if !has_catalog {
        return Ok(Vec::new());
    }

    let mut stmt = conn
        .prepare("SELECT name, key_path, auto_increment FROM _object_stores ORDER BY name")?;
    let rows = stmt.query_map([], |row| {
        Ok(StoreMeta {
            name: row.get(0)?,
            key_path: row.get(1)?,
            auto_increment: row.get(2)?,
            indexes: Vec::new(),
        })
    })?;
    let mut stores = Vec::new();
    for store in rows {
        let mut store = store?;
        store.indexes = load_indexes(conn, &store.name)?;
        stores.push(store);
    }
    Ok(stores)
}

fn load_indexes(conn: &Connection, store: &str) -> StoreResult<Vec<IndexMeta>> {
    let mut stmt = conn.prepare(
        "SELECT name, key_path, is_unique FROM _indexes WHERE store = ?1 ORDER BY name",
    )?;
    let rows = stmt.query_map(params![store], |row| {
        Ok(IndexMeta {
            name: row.get(0)?,
            key_path: row.get(1)?,
            unique: row.get(2)?,
        })
    })?;
    let mut indexes = Vec::new();
    for index in rows {
        indexes.push(index?);
    }
    Ok(indexes)
}

/// Load one object store's catalog entry.
pub(crate) fn load_store(conn: &Connection, name: &str) -> StoreResult<StoreMeta> {
    let store = conn
        .query_row(
            "SELECT name, key_path, auto_increment FROM _object_stores WHERE name = ?1",
            params![name],
            |row| {
                Ok(StoreMeta {
                    name: row.get(0)?,
                    key_path: row.get(1)?,
                    auto_increment: row.get(2)?,
                    indexes: Vec::new(),
                })
            },
        )
        .optional()?;
    let mut store = store.ok_or_else(|| StoreError::UnknownStore(name.to_owned()))?;
    store.indexes = load_indexes(conn, name)?;
    Ok(store)
}

pub(crate) fn insert_store(
    conn: &Connection,
    name: &str,
    opts: &ObjectStoreParams,
) -> StoreResult<()> {
    if opts.auto_increment && opts.key_path.as_deref() == Some("") {
        return Err(StoreError::Data(
            "auto-increment stores need a non-empty key path".to_owned(),
        ));
    }
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO _object_stores (name, key_path, auto_increment) VALUES (?1, ?2, ?3)",
        params![name, opts.key_path, opts.auto_increment],
    )?;
    if inserted == 0 {
        return Err(StoreError::Constraint(format!(
            "object store `{name}` already exists"
        )));
    }
    Ok(())
}

pub(crate) fn remove_store(conn: &Connection, name: &str) -> StoreResult<()> {
    let removed = conn.execute("DELETE FROM _object_stores WHERE name = ?1", params![name])?;
    if removed == 0 {
        return Err(StoreError::UnknownStore(name.to_owned()));
    }
    conn.execute("DELETE FROM _indexes WHERE store = ?1", params![name])?;
    conn.execute("DELETE FROM _index_entries WHERE store = ?1", params![name])?;
    conn.execute("DELETE FROM _records WHERE store = ?1", params![name])?;
    Ok(())
}

pub(crate) fn insert_index(
    conn: &Connection,
    store: &str,
    name: &str,
    key_path: &str,
    opts: IndexParams,
) -> StoreResult<()> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO _indexes (store, name, key_path, is_unique) VALUES (?1, ?2, ?3, ?4)",
        params![store, name, key_path, opts.unique],
    )?;
    if inserted == 0 {
        return Err(StoreError::Constraint(format!(
            "index `{name}` already exists on `{store}`"
        )));
    }
    Ok(())
}

pub(crate) fn remove_index(conn: &Connection, store: &str, name: &str) -> StoreResult<()> {
    let removed = conn.execute(
        "DELETE FROM _indexes WHERE store = ?1 AND name = ?2",
        params![store, name],
    )?;
    if removed == 0 {
        return Err(StoreError::UnknownIndex {
            store: store.to_owned(),
            index: name.to_owned(),
        });
    }
    conn.execute(
        "DELETE FROM _index_entries WHERE store = ?1 AND idx = ?2",
        params![store, name],
    )?;
    Ok(())
}

/// Next generated key for an auto-increment store.
pub(crate) fn next_key(conn: &Connection, store: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT next_key FROM _object_stores WHERE name = ?1",
        params![store],
        |row| row.get(0),
    )?)
}

/// Raise the key generator so it never hands out `used` or anything below it.
pub(crate) fn bump_next_key(conn: &Connection, store: &str, used: i64) -> StoreResult<()> {
    conn.execute(
        "UPDATE _object_stores SET next_key = MAX(next_key, ?2 + 1) WHERE name = ?1",
        params![store, used],
    )?;
    Ok(())
}
