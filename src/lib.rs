//! Transactional path-keyed key/value storage.
//!
//! pathdb maps typed, path-shaped keys to structured values. Many read
//! transactions run concurrently while at most one write transaction is
//! active; every transaction sees a consistent snapshot of the store as of
//! the serial it was started at, independent of later commits. Commits
//! append one entry to a serial-numbered changelog, which doubles as the
//! point-in-time history of every key. Side files staged by a transaction
//! become visible atomically with its commit and are repaired from the
//! changelog after a crash. A background notification thread converts
//! committed changes into subscriber events at its own persistent cursor.
//!
//! # Examples
//!
//! ```no_run
//! use pathdb::{Database, Result, Value, ValueKind};
//! use tempfile::tempdir;
//!
//! # fn main() -> Result<()> {
//!     let dir = tempdir()?;
//!     let db = Database::open(dir.path())?;
//!     let user_info = db.add_key("user_info", "users/{name}/info", ValueKind::Mapping)?;
//!     let alice = user_info.resolve(&[("name", "alice")])?;
//!
//!     let mut tx = db.begin_transaction(true)?;
//!     tx.update(&alice, |value| {
//!         value
//!             .as_mapping_mut()
//!             .unwrap()
//!             .insert("email".to_string(), Value::Text("alice@example.com".to_string()));
//!     })?;
//!     let serial = tx.commit()?;
//!     assert_eq!(serial, 0);
//!
//!     let mut tx = db.begin_transaction(false)?;
//!     let value = tx.get(&alice)?;
//!     assert_eq!(
//!         value.as_mapping().unwrap()["email"],
//!         Value::Text("alice@example.com".to_string())
//!     );
//!     tx.commit()?;
//! #    Ok(())
//! # }
//! ```

mod codec;
mod database;
mod error;
mod key;
mod notify;
mod storage;
mod transaction;
mod value;
mod writer;

pub use database::{Database, DatabaseConfig, ImportSubscriber};
pub use error::{Error, Result};
pub use key::{Key, KeyRegistry, TypedKey};
pub use notify::{KeyChangeEvent, KeySubscriber, EVENT_SERIAL_FILE};
pub use storage::{Change, ChangelogEntry, Changes, Connection, Storage, CHANGELOG_FILE};
pub use transaction::Transaction;
pub use value::{Value, ValueKind};
pub use writer::CommitWriter;
