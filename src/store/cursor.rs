//! Cursors over object stores and indexes.
//!
//! A cursor remembers the last `(key, primary_key)` it produced and asks the
//! worker for the next row past that position, so records deleted or
//! modified behind it do not disturb iteration. Cursors only move forward in
//! their direction and cannot be restarted.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::engine::{Direction, Op, Reply, Source};
use super::error::{StoreError, StoreResult};
use super::key::{Key, KeyRange, extract_key};
use super::object_store::{ObjectStore, decode};

/// The row a cursor is positioned on.
#[derive(Debug, Clone)]
pub struct CursorEntry {
    /// The index key for index cursors, the primary key otherwise.
    pub key: Key,
    pub primary_key: Key,
    /// `None` for key-only cursors.
    pub value: Option<Value>,
}

impl CursorEntry {
    /// Deserialize the record.
    ///
    /// # Errors
    ///
    /// [`StoreError::Data`] for key-only cursors or a record of another shape.
    pub fn decode<T: DeserializeOwned>(&self) -> StoreResult<T> {
        match &self.value {
            Some(value) => decode(value.clone()),
            None => Err(StoreError::Data("key cursor entries carry no record".into())),
        }
    }
}

/// A cursor inside a transaction.
#[derive(Debug)]
pub struct Cursor {
    store: ObjectStore,
    source: Source,
    range: KeyRange,
    direction: Direction,
    with_values: bool,
    position: Option<(Key, Key)>,
    exhausted: bool,
}

impl Cursor {
    pub(crate) fn new(
        store: ObjectStore,
        source: Source,
        range: KeyRange,
        direction: Direction,
        with_values: bool,
    ) -> Self {
        Self {
            store,
            source,
            range,
            direction,
            with_values,
            position: None,
            exhausted: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Key at the current position.
    pub fn key(&self) -> Option<&Key> {
        self.position.as_ref().map(|(key, _)| key)
    }

    /// Primary key at the current position.
    pub fn primary_key(&self) -> Option<&Key> {
        self.position.as_ref().map(|(_, pk)| pk)
    }

    /// Move to the next row. `None` once the range is exhausted.
    pub async fn next_entry(&mut self) -> StoreResult<Option<CursorEntry>> {
        self.step(0).await
    }

    /// Skip `count - 1` rows and return the one after them.
    ///
    /// # Errors
    ///
    /// [`StoreError::Data`] if `count` is zero.
    pub async fn advance(&mut self, count: u32) -> StoreResult<Option<CursorEntry>> {
        if count == 0 {
            return Err(StoreError::Data("cursor advance count must be positive".into()));
        }
        self.step(count - 1).await
    }

    async fn step(&mut self, skip: u32) -> StoreResult<Option<CursorEntry>> {
        if self.exhausted {
            return Ok(None);
        }
        let op = Op::CursorStep {
            store: self.store.name().to_owned(),
            source: self.source.clone(),
            range: self.range.clone(),
            direction: self.direction,
            after: self.position.clone(),
            skip,
            with_values: self.with_values,
        };
        let row = match self.store.transaction().request(op).await? {
            Reply::Row(row) => row,
            other => {
                return Err(StoreError::Worker(format!(
                    "unexpected reply to `cursor_step`: {other:?}"
                )));
            }
        };
        match row {
            Some(row) => {
                self.position = Some((row.key.clone(), row.primary_key.clone()));
                Ok(Some(CursorEntry {
                    key: row.key,
                    primary_key: row.primary_key,
                    value: row.value,
                }))
            }
            None => {
                self.exhausted = true;
                self.position = None;
                Ok(None)
            }
        }
    }

    fn current_primary_key(&self) -> StoreResult<Key> {
        self.primary_key()
            .cloned()
            .ok_or_else(|| StoreError::Data("cursor is not positioned on a record".into()))
    }

    /// Replace the record under the cursor.
    ///
    /// # Errors
    ///
    /// [`StoreError::Data`] for key-only cursors, when the cursor is not on a
    /// record, or when an in-line key in `value` differs from the current one.
    pub async fn update<T: Serialize>(&self, value: &T) -> StoreResult<Key> {
        if !self.with_values {
            return Err(StoreError::Data("key cursors cannot update records".into()));
        }
        let primary_key = self.current_primary_key()?;
        match self.store.key_path() {
            Some(path) => {
                let json = serde_json::to_value(value)?;
                if extract_key(&json, path).as_ref() != Some(&primary_key) {
                    return Err(StoreError::Data(format!(
                        "updated record must keep key {primary_key} at `{path}`"
                    )));
                }
                self.store.put(&json).await
            }
            None => self.store.put_with_key(value, primary_key).await,
        }
    }

    /// Delete the record under the cursor.
    pub async fn delete(&self) -> StoreResult<()> {
        if !self.with_values {
            return Err(StoreError::Data("key cursors cannot delete records".into()));
        }
        let primary_key = self.current_primary_key()?;
        self.store.delete(KeyRange::only(primary_key)).await
    }

    /// Feed up to `limit` further rows to `f`, stopping early at the end of
    /// the range. Returns how many rows were processed.
    pub async fn process_batch<F>(&mut self, limit: usize, mut f: F) -> StoreResult<usize>
    where
        F: FnMut(CursorEntry) -> StoreResult<()>,
    {
        let mut processed = 0;
        while processed < limit {
            let Some(entry) = self.next_entry().await? else {
                break;
            };
            f(entry)?;
            processed += 1;
        }
        Ok(processed)
    }
}
