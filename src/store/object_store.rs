//! Typed access to object stores and indexes inside a transaction.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::cursor::Cursor;
use super::engine::{Direction, Op, Reply, Source};
use super::error::{StoreError, StoreResult};
use super::key::{Key, KeyRange};
use super::schema::{IndexMeta, StoreMeta};
use super::transaction::{Transaction, TxMode};

/// An object store as seen through one transaction.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    tx: Transaction,
    meta: Arc<StoreMeta>,
}

fn unexpected(op: &str, reply: Reply) -> StoreError {
    StoreError::Worker(format!("unexpected reply to `{op}`: {reply:?}"))
}

pub(crate) fn decode<T: DeserializeOwned>(value: serde_json::Value) -> StoreResult<T> {
    Ok(serde_json::from_value(value)?)
}

impl ObjectStore {
    pub(crate) fn new(tx: Transaction, meta: Arc<StoreMeta>) -> Self {
        Self { tx, meta }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn key_path(&self) -> Option<&str> {
        self.meta.key_path.as_deref()
    }

    pub fn auto_increment(&self) -> bool {
        self.meta.auto_increment
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.meta.indexes.iter().map(|i| i.name.as_str()).collect()
    }

    pub fn transaction(&self) -> &Transaction {
        &self.tx
    }

    /// Handle on one of this store's indexes.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownIndex`] if the store has no index called `name`.
    pub fn index(&self, name: &str) -> StoreResult<Index> {
        let meta = self
            .meta
            .index(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownIndex {
                store: self.meta.name.clone(),
                index: name.to_owned(),
            })?;
        Ok(Index {
            store: self.clone(),
            meta,
        })
    }

    async fn write<T: Serialize>(
        &self,
        value: &T,
        key: Option<Key>,
        overwrite: bool,
    ) -> StoreResult<Key> {
        let value = serde_json::to_value(value)?;
        let store = self.meta.name.clone();
        let op = if overwrite {
            Op::Put { store, value, key }
        } else {
            Op::Add { store, value, key }
        };
        match self.tx.request(op).await? {
            Reply::Key(key) => Ok(key),
            other => Err(unexpected("write", other)),
        }
    }

    /// Insert a record; fails with [`StoreError::Constraint`] if its key exists.
    pub async fn add<T: Serialize>(&self, value: &T) -> StoreResult<Key> {
        self.write(value, None, false).await
    }

    /// Insert a record under an explicit out-of-line key.
    pub async fn add_with_key<T: Serialize>(&self, value: &T, key: impl Into<Key>) -> StoreResult<Key> {
        self.write(value, Some(key.into()), false).await
    }

    /// Insert or replace a record.
    pub async fn put<T: Serialize>(&self, value: &T) -> StoreResult<Key> {
        self.write(value, None, true).await
    }

    /// Insert or replace a record under an explicit out-of-line key.
    pub async fn put_with_key<T: Serialize>(&self, value: &T, key: impl Into<Key>) -> StoreResult<Key> {
        self.write(value, Some(key.into()), true).await
    }

    /// Delete every record whose primary key falls in `query`.
    pub async fn delete(&self, query: impl Into<KeyRange>) -> StoreResult<()> {
        let op = Op::Delete {
            store: self.meta.name.clone(),
            range: query.into(),
        };
        self.tx.request(op).await.map(|_| ())
    }

    pub async fn clear(&self) -> StoreResult<()> {
        let op = Op::Clear {
            store: self.meta.name.clone(),
        };
        self.tx.request(op).await.map(|_| ())
    }

    pub async fn get<T: DeserializeOwned>(&self, query: impl Into<KeyRange>) -> StoreResult<Option<T>> {
        get(&self.tx, &self.meta.name, Source::Store, query.into()).await
    }

    pub async fn get_key(&self, query: impl Into<KeyRange>) -> StoreResult<Option<Key>> {
        get_key(&self.tx, &self.meta.name, Source::Store, query.into()).await
    }

    /// Records in key order, at most `count` of them.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        query: impl Into<KeyRange>,
        count: Option<u32>,
    ) -> StoreResult<Vec<T>> {
        get_all(&self.tx, &self.meta.name, Source::Store, query.into(), count).await
    }

    pub async fn get_all_keys(
        &self,
        query: impl Into<KeyRange>,
        count: Option<u32>,
    ) -> StoreResult<Vec<Key>> {
        get_all_keys(&self.tx, &self.meta.name, Source::Store, query.into(), count).await
    }

    pub async fn count(&self, query: impl Into<KeyRange>) -> StoreResult<u64> {
        count(&self.tx, &self.meta.name, Source::Store, query.into()).await
    }

    /// Cursor over records in `query`, in `direction` order.
    pub fn open_cursor(&self, query: impl Into<KeyRange>, direction: Direction) -> StoreResult<Cursor> {
        self.cursor(Source::Store, query.into(), direction, true)
    }

    /// Cursor over primary keys only.
    pub fn open_key_cursor(&self, query: impl Into<KeyRange>, direction: Direction) -> StoreResult<Cursor> {
        self.cursor(Source::Store, query.into(), direction, false)
    }

    fn cursor(
        &self,
        source: Source,
        range: KeyRange,
        direction: Direction,
        with_values: bool,
    ) -> StoreResult<Cursor> {
        if !self.tx.is_active() {
            return Err(StoreError::TransactionClosed);
        }
        Ok(Cursor::new(self.clone(), source, range, direction, with_values))
    }

    /// Add every item in order.
    ///
    /// The first failure aborts the transaction, so none of the batch is
    /// committed.
    ///
    /// # Errors
    ///
    /// [`StoreError::TransactionMode`] on a read-only transaction, otherwise
    /// the first item's error.
    pub async fn bulk_add<T: Serialize>(&self, items: &[T]) -> StoreResult<Vec<Key>> {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            match self.add(item).await {
                Ok(key) => keys.push(key),
                Err(e) => return Err(self.bulk_failure("bulk_add", e)),
            }
        }
        Ok(keys)
    }

    /// Put every item in order. Fails like [`bulk_add`](Self::bulk_add).
    pub async fn bulk_put<T: Serialize>(&self, items: &[T]) -> StoreResult<Vec<Key>> {
        let mut keys = Vec::with_capacity(items.len());
        for item in items {
            match self.put(item).await {
                Ok(key) => keys.push(key),
                Err(e) => return Err(self.bulk_failure("bulk_put", e)),
            }
        }
        Ok(keys)
    }

    fn bulk_failure(&self, operation: &'static str, error: StoreError) -> StoreError {
        if self.tx.mode() == TxMode::ReadOnly {
            return StoreError::TransactionMode { operation };
        }
        self.tx.abort_with(error.clone());
        error
    }

    pub(crate) fn meta(&self) -> &StoreMeta {
        &self.meta
    }
}

/// An index as seen through one transaction.
#[derive(Debug, Clone)]
pub struct Index {
    store: ObjectStore,
    meta: IndexMeta,
}

impl Index {
    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn key_path(&self) -> &str {
        &self.meta.key_path
    }

    pub fn unique(&self) -> bool {
        self.meta.unique
    }

    pub fn object_store(&self) -> &ObjectStore {
        &self.store
    }

    fn source(&self) -> Source {
        Source::Index(self.meta.name.clone())
    }

    /// First record whose index key falls in `query`.
    pub async fn get<T: DeserializeOwned>(&self, query: impl Into<KeyRange>) -> StoreResult<Option<T>> {
        get(&self.store.tx, self.store.name(), self.source(), query.into()).await
    }

    /// Primary key of the first record whose index key falls in `query`.
    pub async fn get_key(&self, query: impl Into<KeyRange>) -> StoreResult<Option<Key>> {
        get_key(&self.store.tx, self.store.name(), self.source(), query.into()).await
    }

    pub async fn get_all<T: DeserializeOwned>(
        &self,
        query: impl Into<KeyRange>,
        count: Option<u32>,
    ) -> StoreResult<Vec<T>> {
        get_all(&self.store.tx, self.store.name(), self.source(), query.into(), count).await
    }

    /// Primary keys in index order.
    pub async fn get_all_keys(
        &self,
        query: impl Into<KeyRange>,
        count: Option<u32>,
    ) -> StoreResult<Vec<Key>> {
        get_all_keys(&self.store.tx, self.store.name(), self.source(), query.into(), count).await
    }

    pub async fn count(&self, query: impl Into<KeyRange>) -> StoreResult<u64> {
        count(&self.store.tx, self.store.name(), self.source(), query.into()).await
    }

    pub fn open_cursor(&self, query: impl Into<KeyRange>, direction: Direction) -> StoreResult<Cursor> {
        self.store.cursor(self.source(), query.into(), direction, true)
    }

    pub fn open_key_cursor(&self, query: impl Into<KeyRange>, direction: Direction) -> StoreResult<Cursor> {
        self.store.cursor(self.source(), query.into(), direction, false)
    }

    /// Look up each index key in turn, one result per key.
    pub async fn bulk_get<T: DeserializeOwned>(&self, keys: &[Key]) -> StoreResult<Vec<Option<T>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(KeyRange::only(key.clone())).await?);
        }
        Ok(out)
    }
}

async fn get<T: DeserializeOwned>(
    tx: &Transaction,
    store: &str,
    source: Source,
    range: KeyRange,
) -> StoreResult<Option<T>> {
    let op = Op::Get {
        store: store.to_owned(),
        source,
        range,
    };
    match tx.request(op).await? {
        Reply::Value(value) => value.map(decode).transpose(),
        other => Err(unexpected("get", other)),
    }
}

async fn get_key(
    tx: &Transaction,
    store: &str,
    source: Source,
    range: KeyRange,
) -> StoreResult<Option<Key>> {
    let op = Op::GetKey {
        store: store.to_owned(),
        source,
        range,
    };
    match tx.request(op).await? {
        Reply::MaybeKey(key) => Ok(key),
        other => Err(unexpected("get_key", other)),
    }
}

async fn get_all<T: DeserializeOwned>(
    tx: &Transaction,
    store: &str,
    source: Source,
    range: KeyRange,
    limit: Option<u32>,
) -> StoreResult<Vec<T>> {
    let op = Op::GetAll {
        store: store.to_owned(),
        source,
        range,
        limit,
    };
    match tx.request(op).await? {
        Reply::Values(values) => values.into_iter().map(decode).collect(),
        other => Err(unexpected("get_all", other)),
    }
}

async fn get_all_keys(
    tx: &Transaction,
    store: &str,
    source: Source,
    range: KeyRange,
    limit: Option<u32>,
) -> StoreResult<Vec<Key>> {
    let op = Op::GetAllKeys {
        store: store.to_owned(),
        source,
        range,
        limit,
    };
    match tx.request(op).await? {
        Reply::Keys(keys) => Ok(keys),
        other => Err(unexpected("get_all_keys", other)),
    }
}

async fn count(tx: &Transaction, store: &str, source: Source, range: KeyRange) -> StoreResult<u64> {
    let op = Op::Count {
        store: store.to_owned(),
        source,
        range,
    };
    match tx.request(op).await? {
        Reply::Count(n) => Ok(n),
        other => Err(unexpected("count", other)),
    }
}
