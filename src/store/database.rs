//! Opening, versioning and deleting named stores.
//!
//! A [`StoreFactory`] owns a directory of SQLite files, one per store name,
//! and tracks the live [`Database`] handles for each name. Upgrading or
//! deleting a store first asks the other handles to close (via
//! [`StoreEvent::VersionChange`]) and fails with
//! [`OpenFailure::Blocked`] if they are still open after the configured wait.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tracing::{debug, info, warn};

use super::error::{OpenFailure, StoreError, StoreResult};
use super::schema::{self, StoreMeta};
use super::transaction::{Transaction, TxMode};
use super::upgrade::{self, Migrations};
use super::worker::open_connection;

/// Timeouts used by the store layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    /// How long a transaction waits for SQLite's write lock.
    pub busy_timeout: Duration,
    /// How long an upgrade or delete waits for other handles to close.
    pub blocked_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            blocked_timeout: Duration::from_millis(1000),
        }
    }
}

/// Notifications delivered to open handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// Another caller wants to upgrade (`new: Some`) or delete (`new: None`)
    /// the store and is waiting for this handle to close.
    VersionChange { old: u32, new: Option<u32> },
    /// This handle was closed.
    Closed,
}

struct HandleEntry {
    id: u64,
    events: broadcast::Sender<StoreEvent>,
}

#[derive(Default)]
struct Registry {
    handles: Mutex<HashMap<String, Vec<HandleEntry>>>,
    changed: Notify,
}

impl Registry {
    fn with_handles<R>(&self, f: impl FnOnce(&mut HashMap<String, Vec<HandleEntry>>) -> R) -> R {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut handles)
    }

    fn register(&self, name: &str, id: u64, events: broadcast::Sender<StoreEvent>) {
        self.with_handles(|h| {
            h.entry(name.to_owned())
                .or_default()
                .push(HandleEntry { id, events });
        });
    }

    fn unregister(&self, name: &str, id: u64) {
        let removed = self.with_handles(|h| {
            let Some(list) = h.get_mut(name) else {
                return false;
            };
            let before = list.len();
            list.retain(|e| e.id != id);
            let removed = list.len() != before;
            if list.is_empty() {
                h.remove(name);
            }
            removed
        });
        if removed {
            self.changed.notify_waiters();
        }
    }

    fn open_count(&self, name: &str) -> usize {
        self.with_handles(|h| h.get(name).map_or(0, Vec::len))
    }

    fn broadcast(&self, name: &str, event: &StoreEvent) {
        self.with_handles(|h| {
            for entry in h.get(name).into_iter().flatten() {
                let _ = entry.events.send(event.clone());
            }
        });
    }

    /// Ask other handles on `name` to close and wait until they have.
    async fn wait_until_closed(
        &self,
        name: &str,
        old: u32,
        new: Option<u32>,
        timeout: Duration,
    ) -> StoreResult<()> {
        if self.open_count(name) == 0 {
            return Ok(());
        }
        self.broadcast(name, &StoreEvent::VersionChange { old, new });
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let open_handles = self.open_count(name);
            if open_handles == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(store = name, open_handles, "version change blocked by open handles");
                return Err(StoreError::Open {
                    name: name.to_owned(),
                    reason: OpenFailure::Blocked {
                        requested: new.unwrap_or(old),
                        open_handles,
                    },
                });
            }
        }
    }
}

/// Opens and manages named stores under one directory.
#[derive(Clone)]
pub struct StoreFactory {
    root: PathBuf,
    options: StoreOptions,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for StoreFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreFactory")
            .field("root", &self.root)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Worker(format!("blocking task failed: {e}")))?
}

fn access_error(name: &str, e: impl std::fmt::Display) -> StoreError {
    StoreError::Open {
        name: name.to_owned(),
        reason: OpenFailure::Access(e.to_string()),
    }
}

impl StoreFactory {
    pub fn new(root: impl Into<PathBuf>, options: StoreOptions) -> Self {
        Self {
            root: root.into(),
            options,
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn options(&self) -> StoreOptions {
        self.options
    }

    /// Backing file for `name`.
    ///
    /// # Errors
    ///
    /// [`OpenFailure::InvalidName`] unless `name` is a plain file name.
    pub fn path_for(&self, name: &str) -> StoreResult<PathBuf> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::Open {
                name: name.to_owned(),
                reason: OpenFailure::InvalidName,
            });
        }
        Ok(self.root.join(format!("{name}.db")))
    }

    /// Open `name` at `version`, creating or upgrading it as needed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Open`] for an invalid name or version, a downgrade, a
    ///   blocked upgrade, or an inaccessible file.
    /// - [`StoreError::Migration`] if a migration step fails; the store is
    ///   left at its previous version.
    pub async fn open(&self, name: &str, version: u32, migrations: Migrations) -> StoreResult<Database> {
        if version == 0 {
            return Err(StoreError::Open {
                name: name.to_owned(),
                reason: OpenFailure::InvalidVersion,
            });
        }
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.root).map_err(|e| access_error(name, e))?;

        let busy_timeout = self.options.busy_timeout;
        let (conn, existing) = {
            let path = path.clone();
            let label = name.to_owned();
            blocking(move || {
                let conn = open_connection(&path, busy_timeout).map_err(|e| access_error(&label, e))?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                let existing = schema::read_version(&conn)?;
                Ok((conn, existing))
            })
            .await?
        };

        if existing > version {
            return Err(StoreError::Open {
                name: name.to_owned(),
                reason: OpenFailure::VersionTooLow {
                    requested: version,
                    existing,
                },
            });
        }

        if existing < version {
            self.registry
                .wait_until_closed(name, existing, Some(version), self.options.blocked_timeout)
                .await?;
        }

        let label = name.to_owned();
        let catalog = blocking(move || {
            if existing < version {
                upgrade::run(&conn, &label, existing, version, &migrations)?;
            }
            schema::load_catalog(&conn)
        })
        .await?;

        let db = Database::register(
            name,
            path,
            version,
            catalog,
            self.options,
            Arc::clone(&self.registry),
        );
        info!(store = name, version, "store opened");
        Ok(db)
    }

    /// Returns `true` if a backing file for `name` exists.
    pub fn exists(&self, name: &str) -> StoreResult<bool> {
        Ok(self.path_for(name)?.exists())
    }

    /// Stored version of `name`, or `None` if it does not exist.
    pub async fn version(&self, name: &str) -> StoreResult<Option<u32>> {
        let path = self.path_for(name)?;
        if !path.exists() {
            return Ok(None);
        }
        let busy_timeout = self.options.busy_timeout;
        let version = blocking(move || {
            let conn = open_connection(&path, busy_timeout)?;
            Ok(schema::read_version(&conn)?)
        })
        .await?;
        Ok(Some(version).filter(|v| *v > 0))
    }

    /// Delete `name` and its files. Deleting a missing store succeeds.
    ///
    /// # Errors
    ///
    /// [`OpenFailure::Blocked`] if other handles stay open.
    pub async fn delete(&self, name: &str) -> StoreResult<()> {
        let path = self.path_for(name)?;
        let old = self.version(name).await?.unwrap_or(0);
        self.registry
            .wait_until_closed(name, old, None, self.options.blocked_timeout)
            .await?;

        let mut removed = false;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(access_error(name, e)),
            }
        }
        if removed {
            info!(store = name, "store deleted");
        }
        Ok(())
    }

    /// Remove every record from every object store of `name`, keeping the
    /// schema and version. A missing store is left alone.
    pub async fn clear_database(&self, name: &str) -> StoreResult<()> {
        let Some(version) = self.version(name).await? else {
            return Ok(());
        };
        let db = self.open(name, version, Migrations::new()).await?;
        let names = db.object_store_names();
        if !names.is_empty() {
            let scope: Vec<&str> = names.iter().map(String::as_str).collect();
            let tx = db.transaction(&scope, TxMode::ReadWrite).await?;
            for store in &scope {
                tx.object_store(store)?.clear().await?;
            }
            tx.commit().await?;
        }
        db.close();
        debug!(store = name, "store cleared");
        Ok(())
    }
}

struct DatabaseInner {
    id: u64,
    name: String,
    path: PathBuf,
    version: u32,
    catalog: Vec<Arc<StoreMeta>>,
    options: StoreOptions,
    registry: Arc<Registry>,
    events: broadcast::Sender<StoreEvent>,
    closed: AtomicBool,
}

impl DatabaseInner {
    fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.registry.unregister(&self.name, self.id);
        let _ = self.events.send(StoreEvent::Closed);
        true
    }
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        self.close();
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An open store at a fixed version.
///
/// Cloning shares the handle; it closes when [`close`](Self::close) is
/// called or the last clone is dropped.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Database {
    fn register(
        name: &str,
        path: PathBuf,
        version: u32,
        catalog: Vec<StoreMeta>,
        options: StoreOptions,
        registry: Arc<Registry>,
    ) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(8);
        registry.register(name, id, events.clone());
        Self {
            inner: Arc::new(DatabaseInner {
                id,
                name: name.to_owned(),
                path,
                version,
                catalog: catalog.into_iter().map(Arc::new).collect(),
                options,
                registry,
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn object_store_names(&self) -> Vec<String> {
        self.inner.catalog.iter().map(|m| m.name.clone()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Start a transaction over `scope`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::ConnectionClosed`] after [`close`](Self::close).
    /// - [`StoreError::UnknownStore`] if a name in `scope` does not exist.
    pub async fn transaction(&self, scope: &[&str], mode: TxMode) -> StoreResult<Transaction> {
        if self.is_closed() {
            return Err(StoreError::ConnectionClosed);
        }
        let mut stores = Vec::with_capacity(scope.len());
        for name in scope {
            let meta = self
                .inner
                .catalog
                .iter()
                .find(|m| m.name == *name)
                .ok_or_else(|| StoreError::UnknownStore((*name).to_owned()))?;
            stores.push(Arc::clone(meta));
        }
        Transaction::begin(
            self.inner.path.clone(),
            stores,
            mode,
            self.inner.options.busy_timeout,
        )
        .await
    }

    /// Close this handle. Transactions already started run to completion.
    pub fn close(&self) {
        if self.inner.close() {
            debug!(store = %self.inner.name, "handle closed");
        }
    }

    /// Subscribe to version-change and close notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Close this handle as soon as another caller asks to upgrade or
    /// delete the store.
    pub fn close_on_version_change(&self) {
        let mut events = self.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::VersionChange { old, new }) => {
                        if let Some(inner) = weak.upgrade() {
                            debug!(store = %inner.name, old, ?new, "closing for version change");
                            inner.close();
                        }
                        return;
                    }
                    Ok(StoreEvent::Closed) | Err(broadcast::error::RecvError::Closed) => return,
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::store::schema::ObjectStoreParams;

    fn factory(dir: &tempfile::TempDir) -> StoreFactory {
        StoreFactory::new(
            dir.path(),
            StoreOptions {
                busy_timeout: Duration::from_millis(500),
                blocked_timeout: Duration::from_millis(100),
            },
        )
    }

    fn notes_v1() -> Migrations {
        Migrations::new().step(0, 1, |up| {
            up.create_object_store("notes", ObjectStoreParams::auto_increment("id"))?;
            Ok(())
        })
    }

    #[test]
    fn names_must_be_plain_file_names() {
        let f = StoreFactory::new("/tmp/x", StoreOptions::default());
        for bad in ["", ".", "..", "a/b", "a\\b"] {
            assert!(matches!(
                f.path_for(bad),
                Err(StoreError::Open {
                    reason: OpenFailure::InvalidName,
                    ..
                })
            ));
        }
        assert!(f.path_for("duewatch").unwrap().ends_with("duewatch.db"));
    }

    #[tokio::test]
    async fn open_creates_then_reopens_without_migrating() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&dir);
        assert_eq!(f.version("notes").await.unwrap(), None);

        let db = f.open("notes", 1, notes_v1()).await.unwrap();
        assert_eq!(db.object_store_names(), vec!["notes".to_owned()]);
        db.close();

        // A second open at the same version must not re-run the step, which
        // would fail on the existing store.
        let again = f.open("notes", 1, notes_v1()).await.unwrap();
        assert_eq!(again.version(), 1);
        assert_eq!(f.version("notes").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn zero_and_lower_versions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&dir);
        assert!(matches!(
            f.open("notes", 0, Migrations::new()).await,
            Err(StoreError::Open {
                reason: OpenFailure::InvalidVersion,
                ..
            })
        ));

        f.open("notes", 2, notes_v1()).await.unwrap().close();
        assert!(matches!(
            f.open("notes", 1, notes_v1()).await,
            Err(StoreError::Open {
                reason: OpenFailure::VersionTooLow {
                    requested: 1,
                    existing: 2
                },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn closed_handles_refuse_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let db = factory(&dir).open("notes", 1, notes_v1()).await.unwrap();
        db.close();
        assert!(matches!(
            db.transaction(&["notes"], TxMode::ReadOnly).await,
            Err(StoreError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn upgrade_waits_for_cooperative_handles() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&dir);
        let old = f.open("notes", 1, notes_v1()).await.unwrap();
        old.close_on_version_change();

        let db = f.open("notes", 2, notes_v1()).await.unwrap();
        assert_eq!(db.version(), 2);
        assert!(old.is_closed());
    }

    #[tokio::test]
    async fn delete_removes_files_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let f = factory(&dir);
        f.open("notes", 1, notes_v1()).await.unwrap().close();
        assert!(f.exists("notes").unwrap());
        f.delete("notes").await.unwrap();
        assert!(!f.exists("notes").unwrap());
        f.delete("notes").await.unwrap();
    }
}
