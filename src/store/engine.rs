//! Synchronous document operations on a single SQLite connection.
//!
//! Everything here runs on a transaction worker thread (or inside the upgrade
//! transaction) with a transaction already open on `conn`. Index entries are
//! maintained explicitly so range scans over an index are ordinary ordered
//! queries on `_index_entries`.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use serde_json::Value;

use super::error::{StoreError, StoreResult};
use super::key::{Key, KeyRange, extract_key, inject_key};
use super::schema::{self, IndexMeta, StoreMeta};

/// What a read walks: the records themselves or one of their indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Source {
    Store,
    Index(String),
}

/// Iteration order of a cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    #[default]
    Next,
    /// Descending key order.
    Prev,
}

/// One row produced by a cursor step.
#[derive(Debug, Clone)]
pub(crate) struct CursorRow {
    pub key: Key,
    pub primary_key: Key,
    pub value: Option<Value>,
}

/// A single store request.
#[derive(Debug)]
pub(crate) enum Op {
    Add {
        store: String,
        value: Value,
        key: Option<Key>,
    },
    Put {
        store: String,
        value: Value,
        key: Option<Key>,
    },
    Delete {
        store: String,
        range: KeyRange,
    },
    Clear {
        store: String,
    },
    Get {
        store: String,
        source: Source,
        range: KeyRange,
    },
    GetKey {
        store: String,
        source: Source,
        range: KeyRange,
    },
    GetAll {
        store: String,
        source: Source,
        range: KeyRange,
        limit: Option<u32>,
    },
    GetAllKeys {
        store: String,
        source: Source,
        range: KeyRange,
        limit: Option<u32>,
    },
    Count {
        store: String,
        source: Source,
        range: KeyRange,
    },
    CursorStep {
        store: String,
        source: Source,
        range: KeyRange,
        direction: Direction,
        after: Option<(Key, Key)>,
        skip: u32,
        with_values: bool,
    },
}

impl Op {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Add { .. } => "add",
            Op::Put { .. } => "put",
            Op::Delete { .. } => "delete",
            Op::Clear { .. } => "clear",
            Op::Get { .. } => "get",
            Op::GetKey { .. } => "get_key",
            Op::GetAll { .. } => "get_all",
            Op::GetAllKeys { .. } => "get_all_keys",
            Op::Count { .. } => "count",
            Op::CursorStep { .. } => "cursor_step",
        }
    }

    pub(crate) fn is_mutation(&self) -> bool {
        matches!(
            self,
            Op::Add { .. } | Op::Put { .. } | Op::Delete { .. } | Op::Clear { .. }
        )
    }
}

/// Result of a store request.
#[derive(Debug)]
pub(crate) enum Reply {
    Key(Key),
    MaybeKey(Option<Key>),
    Value(Option<Value>),
    Values(Vec<Value>),
    Keys(Vec<Key>),
    Count(u64),
    Row(Option<CursorRow>),
    Done,
}

/// Execute one request.
pub(crate) fn execute(conn: &Connection, op: Op) -> StoreResult<Reply> {
    match op {
        Op::Add { store, value, key } => {
            let meta = schema::load_store(conn, &store)?;
            write_record(conn, &meta, value, key, false).map(Reply::Key)
        }
        Op::Put { store, value, key } => {
            let meta = schema::load_store(conn, &store)?;
            write_record(conn, &meta, value, key, true).map(Reply::Key)
        }
        Op::Delete { store, range } => {
            schema::load_store(conn, &store)?;
            delete_range(conn, &store, &range).map(|_| Reply::Done)
        }
        Op::Clear { store } => {
            schema::load_store(conn, &store)?;
            clear(conn, &store).map(|_| Reply::Done)
        }
        Op::Get {
            store,
            source,
            range,
        } => {
            let rows = select(conn, &Query::new(&store, &source, &range).limit(1), true)?;
            Ok(Reply::Value(rows.into_iter().next().and_then(|r| r.value)))
        }
        Op::GetKey {
            store,
            source,
            range,
        } => {
            let rows = select(conn, &Query::new(&store, &source, &range).limit(1), false)?;
            Ok(Reply::MaybeKey(rows.into_iter().next().map(|r| r.primary_key)))
        }
        Op::GetAll {
            store,
            source,
            range,
            limit,
        } => {
            let mut query = Query::new(&store, &source, &range);
            query.limit = limit;
            let rows = select(conn, &query, true)?;
            Ok(Reply::Values(
                rows.into_iter().filter_map(|r| r.value).collect(),
            ))
        }
        Op::GetAllKeys {
            store,
            source,
            range,
            limit,
        } => {
            let mut query = Query::new(&store, &source, &range);
            query.limit = limit;
            let rows = select(conn, &query, false)?;
            Ok(Reply::Keys(rows.into_iter().map(|r| r.primary_key).collect()))
        }
        Op::Count {
            store,
            source,
            range,
        } => count(conn, &Query::new(&store, &source, &range)).map(Reply::Count),
        Op::CursorStep {
            store,
            source,
            range,
            direction,
            after,
            skip,
            with_values,
        } => {
            let query = Query {
                direction,
                after: after.as_ref(),
                offset: skip,
                ..Query::new(&store, &source, &range).limit(1)
            };
            let rows = select(conn, &query, with_values)?;
            Ok(Reply::Row(rows.into_iter().next()))
        }
    }
}

/// Insert or replace one record, maintaining its index entries.
pub(crate) fn write_record(
    conn: &Connection,
    meta: &StoreMeta,
    mut value: Value,
    explicit_key: Option<Key>,
    overwrite: bool,
) -> StoreResult<Key> {
    let key = match (&meta.key_path, explicit_key) {
        (Some(path), Some(_)) => {
            return Err(StoreError::Data(format!(
                "`{}` uses in-line keys at `{path}`; an explicit key is not allowed",
                meta.name
            )));
        }
        (Some(path), None) => match extract_key(&value, path) {
            Some(key) => key,
            None if meta.auto_increment => {
                let key = Key::Int(schema::next_key(conn, &meta.name)?);
                inject_key(&mut value, path, &key)?;
                key
            }
            None => {
                return Err(StoreError::Data(format!(
                    "record for `{}` has no valid key at `{path}`",
                    meta.name
                )));
            }
        },
        (None, Some(key)) => key,
        (None, None) if meta.auto_increment => Key::Int(schema::next_key(conn, &meta.name)?),
        (None, None) => {
            return Err(StoreError::Data(format!(
                "`{}` uses out-of-line keys; a key is required",
                meta.name
            )));
        }
    };

    if meta.auto_increment {
        if let Key::Int(used) = key {
            schema::bump_next_key(conn, &meta.name, used)?;
        }
    }

    let exists = record_exists(conn, &meta.name, &key)?;
    if exists && !overwrite {
        return Err(StoreError::Constraint(format!(
            "key {key} already exists in `{}`",
            meta.name
        )));
    }

    let entries: Vec<(&IndexMeta, Key)> = meta
        .indexes
        .iter()
        .filter_map(|index| extract_key(&value, &index.key_path).map(|k| (index, k)))
        .collect();
    for (index, index_key) in entries.iter().filter(|(index, _)| index.unique) {
        ensure_unique(conn, &meta.name, index, index_key, &key)?;
    }

    if exists {
        conn.execute(
            "DELETE FROM _index_entries WHERE store = ?1 AND primary_key = ?2",
            params![meta.name, key],
        )?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO _records (store, key, value) VALUES (?1, ?2, ?3)",
        params![meta.name, key, serde_json::to_string(&value)?],
    )?;
    for (index, index_key) in &entries {
        conn.execute(
            "INSERT OR IGNORE INTO _index_entries (store, idx, key, primary_key) VALUES (?1, ?2, ?3, ?4)",
            params![meta.name, index.name, index_key, key],
        )?;
    }
    Ok(key)
}

fn record_exists(conn: &Connection, store: &str, key: &Key) -> StoreResult<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM _records WHERE store = ?1 AND key = ?2",
            params![store, key],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn ensure_unique(
    conn: &Connection,
    store: &str,
    index: &IndexMeta,
    index_key: &Key,
    primary_key: &Key,
) -> StoreResult<()> {
    let clash = conn
        .query_row(
            "SELECT primary_key FROM _index_entries \
             WHERE store = ?1 AND idx = ?2 AND key = ?3 AND primary_key != ?4 LIMIT 1",
            params![store, index.name, index_key, primary_key],
            |row| row.get::<_, Key>(0),
        )
        .optional()?;
    match clash {
        Some(other) => Err(StoreError::Constraint(format!(
            "unique index `{}` already maps {index_key} to record {other}",
            index.name
        ))),
        None => Ok(()),
    }
}

/// Build entries for a freshly created index from the existing records.
pub(crate) fn populate_index(conn: &Connection, store: &str, index: &IndexMeta) -> StoreResult<()> {
    let range = KeyRange::all();
    let rows = select(conn, &Query::new(store, &Source::Store, &range), true)?;
    for row in rows {
        let Some(value) = row.value else { continue };
        let Some(index_key) = extract_key(&value, &index.key_path) else {
            continue;
        };
        if index.unique {
            ensure_unique(conn, store, index, &index_key, &row.primary_key)?;
        }
        conn.execute(
            "INSERT OR IGNORE INTO _index_entries (store, idx, key, primary_key) VALUES (?1, ?2, ?3, ?4)",
            params![store, index.name, index_key, row.primary_key],
        )?;
    }
    Ok(())
}

pub(crate) fn delete_range(conn: &Connection, store: &str, range: &KeyRange) -> StoreResult<usize> {
    let mut clauses = vec!["store = ?".to_owned()];
    let mut values = vec![SqlValue::Text(store.to_owned())];
    range.push_sql("key", &mut clauses, &mut values);
    let filter = clauses.join(" AND ");

    let mut entry_values = vec![SqlValue::Text(store.to_owned())];
    entry_values.extend(values.iter().cloned());
    conn.execute(
        &format!(
            "DELETE FROM _index_entries WHERE store = ? AND primary_key IN \
             (SELECT key FROM _records WHERE {filter})"
        ),
        params_from_iter(entry_values.iter()),
    )?;
    Ok(conn.execute(
        &format!("DELETE FROM _records WHERE {filter}"),
        params_from_iter(values.iter()),
    )?)
}

pub(crate) fn clear(conn: &Connection, store: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM _index_entries WHERE store = ?1", params![store])?;
    conn.execute("DELETE FROM _records WHERE store = ?1", params![store])?;
    Ok(())
}

/// A read over a store or index.
pub(crate) struct Query<'a> {
    store: &'a str,
    source: &'a Source,
    range: &'a KeyRange,
    direction: Direction,
    after: Option<&'a (Key, Key)>,
    limit: Option<u32>,
    offset: u32,
}

impl<'a> Query<'a> {
    pub(crate) fn new(store: &'a str, source: &'a Source, range: &'a KeyRange) -> Self {
        Self {
            store,
            source,
            range,
            direction: Direction::Next,
            after: None,
            limit: None,
            offset: 0,
        }
    }

    fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// `FROM ... WHERE ...` plus its parameters, and the key/primary-key columns.
    fn parts(&self) -> (String, Vec<SqlValue>, &'static str, &'static str) {
        let mut values = vec![SqlValue::Text(self.store.to_owned())];
        let (from, mut clauses, key_col, pk_col) = match self.source {
            Source::Store => (
                "_records r",
                vec!["r.store = ?".to_owned()],
                "r.key",
                "r.key",
            ),
            Source::Index(name) => {
                values.push(SqlValue::Text(name.clone()));
                (
                    "_index_entries e JOIN _records r ON r.store = e.store AND r.key = e.primary_key",
                    vec!["e.store = ?".to_owned(), "e.idx = ?".to_owned()],
                    "e.key",
                    "e.primary_key",
                )
            }
        };
        self.range.push_sql(key_col, &mut clauses, &mut values);

        if let Some((key, primary_key)) = self.after {
            let cmp = match self.direction {
                Direction::Next => ">",
                Direction::Prev => "<",
            };
            match self.source {
                Source::Store => {
                    clauses.push(format!("{key_col} {cmp} ?"));
                    values.push(key.to_sql_value());
                }
                Source::Index(_) => {
                    clauses.push(format!(
                        "({key_col} {cmp} ? OR ({key_col} = ? AND {pk_col} {cmp} ?))"
                    ));
                    values.push(key.to_sql_value());
                    values.push(key.to_sql_value());
                    values.push(primary_key.to_sql_value());
                }
            }
        }

        (
            format!("FROM {from} WHERE {}", clauses.join(" AND ")),
            values,
            key_col,
            pk_col,
        )
    }
}

fn select(conn: &Connection, query: &Query<'_>, with_values: bool) -> StoreResult<Vec<CursorRow>> {
    let (body, values, key_col, pk_col) = query.parts();
    let dir = match query.direction {
        Direction::Next => "ASC",
        Direction::Prev => "DESC",
    };
    let order = match query.source {
        Source::Store => format!("{key_col} {dir}"),
        Source::Index(_) => format!("{key_col} {dir}, {pk_col} {dir}"),
    };
    let value_col = if with_values { "r.value" } else { "NULL" };
    let mut sql = format!("SELECT {key_col}, {pk_col}, {value_col} {body} ORDER BY {order}");
    match (query.limit, query.offset) {
        (Some(limit), offset) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (None, 0) => {}
        (None, offset) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
        Ok((
            row.get::<_, Key>(0)?,
            row.get::<_, Key>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (key, primary_key, raw) = row?;
        let value = raw.map(|text| serde_json::from_str(&text)).transpose()?;
        out.push(CursorRow {
            key,
            primary_key,
            value,
        });
    }
    Ok(out)
}

fn count(conn: &Connection, query: &Query<'_>) -> StoreResult<u64> {
    let (body, values, _, _) = query.parts();
    let n: i64 = conn.query_row(
        &format!("SELECT COUNT(*) {body}"),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;
    Ok(u64::try_from(n).unwrap_or(0))
}
