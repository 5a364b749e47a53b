//! Thread-bound transactions over the changelog store.
//!
//! A transaction pins its snapshot serial at begin time and observes a
//! stable view for its whole lifetime: committed changelog entries are
//! immutable, so reads at a fixed serial never see later commits. Writers
//! buffer their changes in a private cache and dirty-set until commit.
//! At most one transaction may be open per thread, and at most one write
//! transaction may be active process-wide.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;

use crate::database::Database;
use crate::error::{Error, Result};
use crate::key::TypedKey;
use crate::storage::Connection;
use crate::value::{Value, ValueKind};
use crate::writer::CommitWriter;

thread_local! {
    static TX_BOUND: Cell<bool> = Cell::new(false);
}

/// A read or write transaction, bound to the thread that began it.
pub struct Transaction<'a> {
    db: &'a Database,
    at_serial: i64,
    write: bool,
    cache: HashMap<TypedKey, Arc<Value>>,
    dirty: HashSet<TypedKey>,
    conn: Connection,
    closed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(
        db: &'a Database,
        write: bool,
        at_serial: Option<i64>,
    ) -> Result<Transaction<'a>> {
        if write {
            if db.is_readonly() {
                return Err(Error::ReadOnly);
            }
            assert!(
                at_serial.is_none(),
                "a write transaction cannot use at_serial"
            );
        }
        TX_BOUND.with(|bound| {
            assert!(!bound.get(), "thread already has an open transaction");
            bound.set(true);
        });
        if write {
            db.write_lock().acquire();
        }
        let at_serial = at_serial.unwrap_or_else(|| db.storage().current_serial());
        debug!(
            "starting {} transaction at serial {at_serial}",
            if write { "write" } else { "read" }
        );
        Ok(Transaction {
            db,
            at_serial,
            write,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            conn: db.storage().get_connection(),
            closed: false,
        })
    }

    /// The snapshot serial this transaction reads at.
    pub fn at_serial(&self) -> i64 {
        self.at_serial
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    /// Returns the frozen value of `key` as of this transaction's snapshot,
    /// including changes buffered by this transaction itself. A key that
    /// does not exist yields an empty value of its declared kind.
    pub fn get(&mut self, key: &TypedKey) -> Result<Arc<Value>> {
        if let Some(value) = self.cache.get(key) {
            return Ok(value.clone());
        }
        if self.dirty.contains(key) {
            // deleted within this transaction
            return Ok(Arc::new(key.kind().empty()));
        }
        match self.db.get_value_at_conn(key, self.at_serial, &self.conn) {
            Ok(value) => {
                let value = Arc::new(value);
                self.cache.insert(key.clone(), value.clone());
                Ok(value)
            }
            Err(Error::KeyAbsent(_)) => Ok(Arc::new(key.kind().empty())),
            Err(err) => Err(err),
        }
    }

    /// Returns a mutable deep copy of the value of `key`.
    pub fn get_mutable(&mut self, key: &TypedKey) -> Result<Value> {
        Ok((*self.get(key)?).clone())
    }

    pub fn exists(&mut self, key: &TypedKey) -> Result<bool> {
        if self.cache.contains_key(key) {
            return Ok(true);
        }
        if self.dirty.contains(key) {
            return Ok(false);
        }
        match self.db.get_value_at_conn(key, self.at_serial, &self.conn) {
            Ok(_) => Ok(true),
            Err(Error::KeyAbsent(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// True if this transaction has a pending set or delete for `key`.
    pub fn is_dirty(&self, key: &TypedKey) -> bool {
        self.dirty.contains(key)
    }

    /// Finds a key cached by this transaction through its relpath.
    pub fn key_in_transaction(&self, relpath: &str) -> Option<TypedKey> {
        self.cache
            .keys()
            .find(|key| key.relpath() == relpath)
            .cloned()
    }

    /// Buffers setting `key` to `value`. The value must match the key's
    /// declared kind, and mapping values may not hold byte strings.
    pub fn set(&mut self, key: &TypedKey, value: Value) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        if value.kind() != key.kind() {
            return Err(Error::TypeMismatch {
                relpath: key.relpath().to_string(),
                expected: key.kind(),
                found: value.kind(),
            });
        }
        if value.contains_byte_values() {
            return Err(Error::TypeMismatch {
                relpath: key.relpath().to_string(),
                expected: ValueKind::Text,
                found: ValueKind::Bytes,
            });
        }
        self.cache.insert(key.clone(), Arc::new(value));
        self.dirty.insert(key.clone());
        Ok(())
    }

    /// Buffers deletion of `key`.
    pub fn delete(&mut self, key: &TypedKey) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        self.cache.remove(key);
        self.dirty.insert(key.clone());
        Ok(())
    }

    /// Applies `f` to a mutable copy of the value and buffers the result.
    pub fn update<F: FnOnce(&mut Value)>(&mut self, key: &TypedKey, f: F) -> Result<()> {
        let mut value = self.get_mutable(key)?;
        f(&mut value);
        self.set(key, value)
    }

    /// Stages side-file content, written next to the commit of this
    /// transaction.
    pub fn file_set(&mut self, relpath: &str, content: &[u8]) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        self.conn.set_dirty_file(relpath, Some(content.to_vec()));
        Ok(())
    }

    /// Stages deletion of a side file at commit.
    pub fn file_delete(&mut self, relpath: &str) -> Result<()> {
        if !self.write {
            return Err(Error::ReadOnly);
        }
        self.conn.set_dirty_file(relpath, None);
        Ok(())
    }

    /// Reads a side file: content staged in this transaction first, the
    /// basedir otherwise. A staged deletion reads as absent.
    pub fn file_get(&self, relpath: &str) -> Option<Vec<u8>> {
        if let Some(staged) = self.conn.dirty_file(relpath) {
            return staged.clone();
        }
        std::fs::read(self.db.storage().basedir().join(relpath)).ok()
    }

    /// Commits buffered changes and closes the transaction. Returns the
    /// commit serial, or `at_serial` for a read or empty transaction.
    pub fn commit(mut self) -> Result<i64> {
        self.commit_in_place()
    }

    fn commit_in_place(&mut self) -> Result<i64> {
        if !self.write || (self.dirty.is_empty() && !self.conn.has_dirty_files()) {
            if self.write {
                debug!("nothing to commit, just closing transaction");
            }
            let at_serial = self.at_serial;
            self.close();
            return Ok(at_serial);
        }
        let mut writer = CommitWriter::new(self.db.storage().clone(), &mut self.conn);
        for key in &self.dirty {
            // a dirty key absent from the cache was deleted
            let value = self.cache.get(key).map(|value| (**value).clone());
            writer.record_set(key, value);
        }
        let outcome = writer.commit();
        self.close();
        outcome
    }

    /// Discards buffered changes and closes the transaction.
    pub fn rollback(mut self) {
        debug!("transaction rollback at serial {}", self.at_serial);
        self.close();
    }

    /// Commits, then begins again in place with the requested mode at the
    /// fresh current serial. Returns the serial the commit obtained.
    /// Restarting a write transaction as read is not supported.
    pub fn restart(&mut self, write: bool) -> Result<i64> {
        assert!(
            write || !self.write,
            "can only restart as read from a read transaction"
        );
        let db = self.db;
        let serial = self.commit_in_place()?;
        *self = Transaction::begin(db, write, None)?;
        Ok(serial)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cache.clear();
        self.dirty.clear();
        if self.write {
            self.db.write_lock().release();
        }
        TX_BOUND.with(|bound| bound.set(false));
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            debug!("open transaction dropped, rolling back at serial {}", self.at_serial);
            self.close();
        }
    }
}
