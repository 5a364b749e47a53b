//! Engine coordinator.
//!
//! A [`Database`] owns the changelog storage, the key registry, the global
//! write lock and the notification thread. It hands out thread-bound
//! transactions, performs crash recovery at open, and replays externally
//! produced change batches through the import pipeline.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::SystemTime;

use log::debug;

use crate::codec;
use crate::error::{Error, Result};
use crate::key::{Key, KeyRegistry, TypedKey};
use crate::notify::{KeySubscriber, NotifierState};
use crate::storage::{ChangelogEntry, Changes, Connection, Storage};
use crate::transaction::Transaction;
use crate::value::{Value, ValueKind};
use crate::writer::{check_pending_renames, CommitWriter};

/// Config options for the engine
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Whether write transactions are rejected (default: false)
    pub readonly: bool,
    /// Number of decoded changelog entries kept in memory (default: 10000)
    pub cache_size: usize,
    /// Whether to fsync the changelog on every commit (default: true)
    pub sync_on_commit: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            cache_size: 10_000,
            sync_on_commit: true,
        }
    }
}

/// Handler invoked while replaying imported changes, before their commit.
/// It may stage additional side files through the writer.
pub type ImportSubscriber =
    Box<dyn Fn(&mut CommitWriter, &TypedKey, Option<&Value>, i64) -> Result<()> + Send + Sync>;

/// Non-reentrant mutex serializing write transactions.
pub(crate) struct WriteLock {
    locked: Mutex<bool>,
    cond: Condvar,
}

impl WriteLock {
    fn new() -> Self {
        WriteLock {
            locked: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cond.wait(locked).unwrap();
        }
        *locked = true;
    }

    pub(crate) fn release(&self) {
        *self.locked.lock().unwrap() = false;
        self.cond.notify_one();
    }
}

struct WriteLockGuard<'a>(&'a WriteLock);

impl Drop for WriteLockGuard<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// The engine: one instance per basedir and process.
pub struct Database {
    storage: Arc<Storage>,
    registry: Arc<RwLock<KeyRegistry>>,
    write_lock: WriteLock,
    notifier: Arc<NotifierState>,
    notifier_thread: Mutex<Option<JoinHandle<()>>>,
    import_subscribers: Mutex<HashMap<String, ImportSubscriber>>,
    readonly: bool,
}

impl Database {
    /// Opens the store under `basedir` with default configuration.
    pub fn open(basedir: &Path) -> Result<Database> {
        Self::open_with_config(basedir, DatabaseConfig::default())
    }

    /// Opens the store under `basedir`. When the changelog already holds
    /// commits, the rename plan of the most recent entry is replayed so a
    /// crash between changelog write and side-file renames is repaired.
    pub fn open_with_config(basedir: &Path, config: DatabaseConfig) -> Result<Database> {
        let storage = Arc::new(Storage::open(
            basedir,
            config.cache_size,
            config.sync_on_commit,
        )?);
        if storage.next_serial() > 0 {
            let raw = storage.get_raw_changelog_entry(storage.current_serial())?;
            let entry: ChangelogEntry = codec::loads(&raw)?;
            check_pending_renames(storage.basedir(), &entry.rel_renames)?;
        }
        let registry = Arc::new(RwLock::new(KeyRegistry::new()));
        let notifier = Arc::new(NotifierState::new(storage.clone(), registry.clone()));
        debug!(
            "opened store at {} with current serial {}",
            basedir.display(),
            storage.current_serial()
        );
        Ok(Database {
            storage,
            registry,
            write_lock: WriteLock::new(),
            notifier,
            notifier_thread: Mutex::new(None),
            import_subscribers: Mutex::new(HashMap::new()),
            readonly: config.readonly,
        })
    }

    pub fn basedir(&self) -> &Path {
        self.storage.basedir()
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn write_lock(&self) -> &WriteLock {
        &self.write_lock
    }

    /// Registers a key schema. Registration happens once, at init.
    pub fn add_key(&self, name: &str, pattern: &str, kind: ValueKind) -> Result<Arc<Key>> {
        self.registry.write().unwrap().add(name, pattern, kind)
    }

    pub fn get_key(&self, name: &str) -> Option<Arc<Key>> {
        self.registry.read().unwrap().get(name)
    }

    /// Returns the typed key for a relpath. Without `keyname` the cached
    /// keys of `tx` are consulted first, then the primary index, so keys
    /// staged by a still-open transaction resolve before they are
    /// committed.
    pub fn derive_key(
        &self,
        relpath: &str,
        keyname: Option<&str>,
        tx: Option<&Transaction>,
    ) -> Result<TypedKey> {
        let name = match keyname {
            Some(name) => name.to_string(),
            None => {
                if let Some(key) = tx.and_then(|tx| tx.key_in_transaction(relpath)) {
                    return Ok(key);
                }
                let conn = self.storage.get_connection();
                match conn.read_typedkey(relpath) {
                    Some((name, _serial)) => name,
                    None => return Err(Error::KeyAbsent(relpath.to_string())),
                }
            }
        };
        let key = self
            .get_key(&name)
            .ok_or_else(|| Error::Other(format!("no key registered under name {name}")))?;
        Ok(key.derive(relpath))
    }

    /// Begins a transaction bound to the current thread. A write
    /// transaction waits for the global write lock.
    pub fn begin_transaction(&self, write: bool) -> Result<Transaction<'_>> {
        Transaction::begin(self, write, None)
    }

    /// Begins a read transaction pinned at `at_serial`.
    pub fn begin_transaction_at(&self, at_serial: i64) -> Result<Transaction<'_>> {
        Transaction::begin(self, false, Some(at_serial))
    }

    /// Runs `f` in a transaction: committed when `f` returns `Ok`, rolled
    /// back when it returns `Err`.
    pub fn transaction<R, F>(&self, write: bool, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        let mut tx = self.begin_transaction(write)?;
        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Runs `f` in a read transaction pinned at `at_serial`.
    pub fn transaction_at<R, F>(&self, at_serial: i64, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction) -> Result<R>,
    {
        let mut tx = self.begin_transaction_at(at_serial)?;
        match f(&mut tx) {
            Ok(result) => {
                tx.commit()?;
                Ok(result)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }

    /// Returns the value `key` held immediately after `at_serial`, walking
    /// the changelog backwards through each change's `back_serial`.
    pub fn get_value_at(&self, key: &TypedKey, at_serial: i64) -> Result<Value> {
        let conn = self.storage.get_connection();
        self.get_value_at_conn(key, at_serial, &conn)
    }

    pub(crate) fn get_value_at_conn(
        &self,
        key: &TypedKey,
        at_serial: i64,
        conn: &Connection,
    ) -> Result<Value> {
        let relpath = key.relpath();
        let (_, mut last_serial) = conn
            .read_typedkey(relpath)
            .ok_or_else(|| Error::KeyAbsent(relpath.to_string()))?;
        while last_serial >= 0 {
            let changes = self.storage.get_changes(last_serial)?;
            let change = changes.get(relpath).ok_or_else(|| {
                Error::Corrupted(format!(
                    "no change recorded for {relpath} at serial {last_serial}"
                ))
            })?;
            if last_serial > at_serial {
                last_serial = change.back_serial;
                continue;
            }
            return match &change.value {
                Some(value) => Ok(value.clone()),
                // deleted at or before at_serial
                None => Err(Error::KeyAbsent(relpath.to_string())),
            };
        }
        Err(Error::KeyAbsent(relpath.to_string()))
    }

    /// Replays one externally produced change batch as a single commit.
    /// `serial` must equal the next serial; gaps and repeats are rejected.
    /// Registered import subscribers run per change before the commit and
    /// may stage additional side files; their failure aborts the import.
    pub fn import_changes(&self, serial: i64, changes: &Changes) -> Result<i64> {
        if self.readonly {
            return Err(Error::ReadOnly);
        }
        self.write_lock.acquire();
        let _guard = WriteLockGuard(&self.write_lock);
        let next_serial = self.storage.next_serial();
        if next_serial != serial {
            return Err(Error::Other(format!(
                "import serial {serial} does not match next serial {next_serial}"
            )));
        }
        let mut conn = self.storage.get_connection();
        let mut writer = CommitWriter::new(self.storage.clone(), &mut conn);
        let subscribers = self.import_subscribers.lock().unwrap();
        for (relpath, change) in changes {
            let key = self.derive_key(relpath, Some(change.keyname.as_str()), None)?;
            writer.record_set(&key, change.value.clone());
            if let Some(subscriber) = subscribers.get(key.name()) {
                debug!("calling import subscriber for key {}", key.name());
                subscriber(&mut writer, &key, change.value.as_ref(), change.back_serial)?;
            }
        }
        writer.commit()
    }

    /// Registers the import subscriber for a key schema. At most one per
    /// schema.
    pub fn subscribe_on_import(&self, key: &Key, subscriber: ImportSubscriber) {
        let mut subscribers = self.import_subscribers.lock().unwrap();
        assert!(
            !subscribers.contains_key(key.name()),
            "import subscriber already registered for key {}",
            key.name()
        );
        subscribers.insert(key.name().to_string(), subscriber);
    }

    /// Registers a key-change subscriber with the notifier. Must happen
    /// before [`Database::start_notifier`].
    pub fn on_key_change(&self, key: &Key, subscriber: KeySubscriber) {
        self.notifier.on_key_change(key.name(), subscriber);
    }

    /// Starts the notification thread. Subscriber registration is closed
    /// from here on. Starting twice is a no-op.
    pub fn start_notifier(&self) -> Result<()> {
        let mut handle = self.notifier_thread.lock().unwrap();
        if handle.is_some() {
            return Ok(());
        }
        let state = self.notifier.clone();
        state.mark_started();
        let thread = std::thread::Builder::new()
            .name("pathdb-notifier".to_string())
            .spawn(move || state.run())?;
        *handle = Some(thread);
        Ok(())
    }

    /// Blocks until the current serial reaches `serial`. Returns false when
    /// woken by shutdown instead.
    pub fn wait_tx_serial(&self, serial: i64) -> bool {
        self.storage
            .commit_signal()
            .wait_while(|| self.storage.current_serial() < serial && !self.notifier.is_shutdown());
        self.storage.current_serial() >= serial
    }

    /// Blocks until the persisted event cursor reaches `serial`. Returns
    /// false when woken by shutdown instead.
    pub fn wait_event_serial(&self, serial: i64) -> bool {
        self.notifier.wait_event_serial(serial)
    }

    /// The serial the next commit will obtain.
    pub fn get_next_serial(&self) -> i64 {
        self.storage.next_serial()
    }

    /// The latest committed serial, -1 when nothing was ever committed.
    pub fn get_current_serial(&self) -> i64 {
        self.storage.current_serial()
    }

    pub fn get_last_commit_timestamp(&self) -> Option<SystemTime> {
        self.storage.last_commit_timestamp()
    }

    /// The last event serial whose subscribers all ran, -1 initially.
    pub fn get_event_serial(&self) -> i64 {
        self.notifier.read_event_serial()
    }

    /// Modification time of the notifier cursor file, if it exists.
    pub fn get_event_serial_timestamp(&self) -> Option<SystemTime> {
        self.notifier.event_serial_timestamp()
    }

    /// The moment the notifier last caught up with the current serial.
    pub fn get_event_serial_in_sync_at(&self) -> Option<SystemTime> {
        self.notifier.in_sync_at()
    }

    /// Shuts down the notifier and closes the store.
    pub fn close(self) {}

    fn stop_notifier(&self) {
        self.notifier.request_shutdown();
        if let Some(handle) = self.notifier_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.stop_notifier();
    }
}
