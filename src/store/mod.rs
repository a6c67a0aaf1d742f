//! Async document store over SQLite.
//!
//! Records are JSON documents grouped into named object stores with optional
//! secondary indexes. All access goes through [`Transaction`]s whose requests
//! are awaited one at a time; schema changes happen only inside versioned
//! [`Migrations`] run by [`StoreFactory::open`].
//!
//! Sub-modules:
//! - `database`: `StoreFactory`, `Database` handles and version-change events.
//! - `upgrade`: migration steps and the upgrade context.
//! - `transaction` / `worker`: transaction handles and their worker threads.
//! - `object_store` / `cursor`: typed operations inside a transaction.
//! - `engine` / `schema`: the SQL underneath.

pub mod cursor;
pub mod database;
pub(crate) mod engine;
pub mod error;
pub mod key;
pub mod object_store;
pub(crate) mod schema;
pub mod transaction;
pub mod upgrade;
pub(crate) mod worker;

pub use cursor::{Cursor, CursorEntry};
pub use database::{Database, StoreEvent, StoreFactory, StoreOptions};
pub use engine::Direction;
pub use error::{OpenFailure, StoreError, StoreResult};
pub use key::{Key, KeyRange, extract_key};
pub use object_store::{Index, ObjectStore};
pub use schema::{IndexParams, ObjectStoreParams};
pub use transaction::{Transaction, TxMode, TxState};
pub use upgrade::{MigrationStep, Migrations, Upgrade, UpgradeStore};
