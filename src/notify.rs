//! Post-commit notification pipeline.
//!
//! A single background thread tails committed serials and invokes the
//! subscribers registered for each changed key. The thread keeps its own
//! persistent cursor, so a restarted process resumes delivery exactly after
//! the last serial whose subscribers all ran.

use std::collections::HashMap;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use log::{debug, error, warn};

use crate::codec;
use crate::error::Result;
use crate::key::{KeyRegistry, TypedKey};
use crate::storage::Storage;
use crate::value::Value;

/// Name of the notifier cursor file inside the basedir. It stores the last
/// dispatched event serial plus one.
pub const EVENT_SERIAL_FILE: &str = ".event_serial";

/// A committed key change, delivered to subscribers in commit order.
#[derive(Clone)]
pub struct KeyChangeEvent {
    pub key: TypedKey,
    /// The frozen value the key changed to; `None` for a deletion.
    pub value: Option<Arc<Value>>,
    /// The serial of the commit carrying this change.
    pub at_serial: i64,
    /// The serial the key was previously written at, -1 if never.
    pub back_serial: i64,
}

/// Callback registered for changes of one key schema.
pub type KeySubscriber = Box<dyn Fn(&KeyChangeEvent) + Send + Sync>;

pub(crate) struct NotifierState {
    storage: Arc<Storage>,
    registry: Arc<RwLock<KeyRegistry>>,
    event_serial_path: PathBuf,
    subscribers: Mutex<HashMap<String, Vec<KeySubscriber>>>,
    started: AtomicBool,
    shutdown: AtomicBool,
    event_signal: crate::storage::Signal,
    in_sync_at: Mutex<Option<SystemTime>>,
}

impl NotifierState {
    pub(crate) fn new(storage: Arc<Storage>, registry: Arc<RwLock<KeyRegistry>>) -> Self {
        let event_serial_path = storage.basedir().join(EVENT_SERIAL_FILE);
        NotifierState {
            storage,
            registry,
            event_serial_path,
            subscribers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            event_signal: crate::storage::Signal::new(),
            in_sync_at: Mutex::new(None),
        }
    }

    /// Registers a subscriber for a key schema name. Registration is closed
    /// once the notifier thread has started.
    pub(crate) fn on_key_change(&self, keyname: &str, subscriber: KeySubscriber) {
        assert!(
            !self.started.load(Ordering::SeqCst),
            "cannot register subscribers after the notifier thread started"
        );
        self.subscribers
            .lock()
            .unwrap()
            .entry(keyname.to_string())
            .or_default()
            .push(subscriber);
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The last event serial whose subscribers all ran, -1 initially.
    pub(crate) fn read_event_serial(&self) -> i64 {
        codec::read_int_file(&self.event_serial_path, 0) - 1
    }

    fn write_event_serial(&self, event_serial: i64) -> Result<()> {
        codec::write_int_file(&self.event_serial_path, event_serial + 1)
    }

    /// Modification time of the cursor file, if it exists.
    pub(crate) fn event_serial_timestamp(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.event_serial_path)
            .ok()?
            .modified()
            .ok()
    }

    /// The moment the notifier last caught up with the current serial.
    pub(crate) fn in_sync_at(&self) -> Option<SystemTime> {
        *self.in_sync_at.lock().unwrap()
    }

    /// Blocks until the persisted event cursor reaches `serial`. Returns
    /// false when woken by shutdown instead.
    pub(crate) fn wait_event_serial(&self, serial: i64) -> bool {
        debug!("waiting for event serial {serial}");
        self.event_signal
            .wait_while(|| self.read_event_serial() < serial && !self.is_shutdown());
        self.read_event_serial() >= serial
    }

    /// Flags shutdown and wakes every blocked wait.
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.event_signal.notify_all();
        self.storage.commit_signal().notify_all();
    }

    /// Thread body: tail committed serials, dispatch subscribers, persist
    /// the cursor after every serial, then sleep until the next commit.
    pub(crate) fn run(&self) {
        let mut event_serial = self.read_event_serial();
        debug!("notifier starting at event serial {event_serial}");
        loop {
            while event_serial < self.storage.current_serial() {
                if self.is_shutdown() {
                    return;
                }
                event_serial += 1;
                if let Err(err) = self.dispatch_serial(event_serial, false) {
                    error!("notifier stopping, cannot load changes for serial {event_serial}: {err}");
                    return;
                }
                if let Err(err) = self.write_event_serial(event_serial) {
                    error!("notifier stopping, cannot persist event serial {event_serial}: {err}");
                    return;
                }
                self.event_signal.notify_all();
            }
            if event_serial == self.storage.current_serial() {
                *self.in_sync_at.lock().unwrap() = Some(SystemTime::now());
            }
            self.storage
                .commit_signal()
                .wait_while(|| event_serial >= self.storage.current_serial() && !self.is_shutdown());
            if self.is_shutdown() {
                return;
            }
        }
    }

    /// Dispatches all subscribers for one serial, in the insertion order of
    /// its change map. A panicking subscriber is logged and skipped unless
    /// `raising` is set.
    pub(crate) fn dispatch_serial(&self, serial: i64, raising: bool) -> Result<()> {
        debug!("dispatching key-change events for serial {serial}");
        let changes = self.storage.get_changes(serial)?;
        for (relpath, change) in changes.iter() {
            let key = match self.registry.read().unwrap().get(&change.keyname) {
                Some(key) => key.derive(relpath),
                None => {
                    warn!(
                        "no key registered under name {}, skipping event for {relpath}",
                        change.keyname
                    );
                    continue;
                }
            };
            let event = KeyChangeEvent {
                key,
                value: change.value.clone().map(Arc::new),
                at_serial: serial,
                back_serial: change.back_serial,
            };
            let subscribers = self.subscribers.lock().unwrap();
            if let Some(list) = subscribers.get(&change.keyname) {
                for subscriber in list {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| subscriber(&event))) {
                        if raising {
                            resume_unwind(payload);
                        }
                        error!(
                            "key-change subscriber for {} panicked at serial {serial}",
                            change.keyname
                        );
                    }
                }
            }
        }
        debug!("finished dispatching events for serial {serial}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Change, ChangelogEntry, Changes};
    use crate::value::ValueKind;

    fn state_with_one_commit() -> (tempfile::TempDir, Arc<NotifierState>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path(), 16, true).unwrap());
        let mut registry = KeyRegistry::new();
        registry
            .add("user_info", "users/{name}/info", ValueKind::Mapping)
            .unwrap();
        let mut changes = Changes::new();
        changes.insert(
            "users/alice/info".to_string(),
            Change {
                keyname: "user_info".to_string(),
                back_serial: -1,
                value: Some(Value::Int(1)),
            },
        );
        let mut conn = storage.get_connection();
        conn.write_changelog_entry(
            0,
            &ChangelogEntry {
                changes,
                rel_renames: Vec::new(),
            },
        )
        .unwrap();
        storage.bump_serial();
        let state = Arc::new(NotifierState::new(
            storage,
            Arc::new(RwLock::new(registry)),
        ));
        (dir, state)
    }

    #[test]
    fn dispatch_builds_events_with_extracted_params() {
        let (_dir, state) = state_with_one_commit();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let record = seen.clone();
        state.on_key_change(
            "user_info",
            Box::new(move |event| {
                record.lock().unwrap().push((
                    event.key.relpath().to_string(),
                    event.key.param("name").map(str::to_string),
                    event.at_serial,
                    event.back_serial,
                ));
            }),
        );
        state.dispatch_serial(0, true).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[(
                "users/alice/info".to_string(),
                Some("alice".to_string()),
                0,
                -1
            )]
        );
    }

    #[test]
    fn panicking_subscriber_is_swallowed_without_raising() {
        let (_dir, state) = state_with_one_commit();
        let seen = Arc::new(Mutex::new(0));
        state.on_key_change("user_info", Box::new(|_| panic!("boom")));
        let count = seen.clone();
        state.on_key_change(
            "user_info",
            Box::new(move |_| {
                *count.lock().unwrap() += 1;
            }),
        );
        state.dispatch_serial(0, false).unwrap();
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    #[should_panic]
    fn raising_mode_resumes_subscriber_panics() {
        let (_dir, state) = state_with_one_commit();
        state.on_key_change("user_info", Box::new(|_| panic!("boom")));
        let _ = state.dispatch_serial(0, true);
    }

    #[test]
    #[should_panic]
    fn registration_after_start_is_rejected() {
        let (_dir, state) = state_with_one_commit();
        state.mark_started();
        state.on_key_change("user_info", Box::new(|_| ()));
    }

    #[test]
    fn missing_cursor_file_reads_as_minus_one() {
        let (_dir, state) = state_with_one_commit();
        assert_eq!(state.read_event_serial(), -1);
        state.write_event_serial(0).unwrap();
        assert_eq!(state.read_event_serial(), 0);
    }
}
