//! File-backed changelog storage.
//!
//! A single append-only changelog file is the source of truth: one record
//! per commit serial, holding the serialized `(changes, rel_renames)` entry.
//! The primary index mapping each relpath to `(keyname, last_serial)` is
//! rebuilt from the changelog at open and kept in memory. Connections stage
//! index rows and dirty side files privately until their changelog entry is
//! written, so an abandoned writer never touches shared state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

use fs2::FileExt;
use indexmap::IndexMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::{Error, Result};
use crate::value::Value;

/// Changelog file magic header and format
pub const CHANGELOG_MAGIC: &[u8; 6] = b"PTHDB\0";
pub const CHANGELOG_FORMAT_VERSION: u16 = 1; // big-endian on disk
/// Header size in bytes: magic plus version
const HEADER_SIZE: u64 = 8;
/// Per-record header: serial (8 bytes BE) plus payload length (4 bytes BE)
const RECORD_HEADER_SIZE: u64 = 12;

/// Name of the changelog file inside the basedir
pub const CHANGELOG_FILE: &str = "changelog";

/// One recorded key change: the schema name, the serial this relpath was
/// previously written at (-1 if never) and the new value (`None` deletes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub keyname: String,
    pub back_serial: i64,
    pub value: Option<Value>,
}

/// The per-commit change map, preserving insertion order.
pub type Changes = IndexMap<String, Change>;

/// The durable unit of a commit: all key changes plus the side-file rename
/// plan. A rename entry ending in `-tmp` is renamed to its stripped form at
/// commit; any other entry is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub changes: Changes,
    pub rel_renames: Vec<String>,
}

/// Broadcast point for threads waiting on commit or event progress.
pub(crate) struct Signal {
    guard: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Signal {
            guard: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify_all(&self) {
        let _guard = self.guard.lock().unwrap();
        self.cond.notify_all();
    }

    /// Blocks while `condition` holds. The condition is evaluated under the
    /// signal lock, so a broadcast between evaluation and sleep cannot be
    /// missed.
    pub(crate) fn wait_while<F: FnMut() -> bool>(&self, mut condition: F) {
        let mut guard = self.guard.lock().unwrap();
        while condition() {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// Entry-bounded cache of decoded change maps, most recently used last.
struct ChangesCache {
    cap: usize,
    map: HashMap<i64, Arc<Changes>>,
    order: VecDeque<i64>,
}

impl ChangesCache {
    fn new(cap: usize) -> Self {
        ChangesCache {
            cap: cap.max(1),
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, serial: i64) -> Option<Arc<Changes>> {
        let changes = self.map.get(&serial).cloned()?;
        if let Some(at) = self.order.iter().position(|s| *s == serial) {
            self.order.remove(at);
            self.order.push_back(serial);
        }
        Some(changes)
    }

    fn insert(&mut self, serial: i64, changes: Arc<Changes>) {
        if self.map.insert(serial, changes).is_none() {
            self.order.push_back(serial);
        }
        while self.map.len() > self.cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

struct StorageInner {
    file: File,
    /// Byte offset of each record, indexed by serial.
    offsets: Vec<u64>,
    /// relpath -> (keyname, last_serial)
    index: HashMap<String, (String, i64)>,
}

impl Drop for StorageInner {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// The changelog store shared by all connections of one engine.
pub struct Storage {
    basedir: PathBuf,
    sync_on_commit: bool,
    next_serial: AtomicI64,
    last_commit_timestamp: Mutex<Option<SystemTime>>,
    inner: Mutex<StorageInner>,
    cache: Mutex<ChangesCache>,
    commit_signal: Arc<Signal>,
}

impl Storage {
    /// Opens the changelog under `basedir`, creating it when absent, and
    /// rebuilds the primary index by scanning all records. A torn record at
    /// the tail (crash during append) is truncated away: its commit never
    /// reached the durability point.
    pub fn open(basedir: &Path, cache_size: usize, sync_on_commit: bool) -> Result<Storage> {
        std::fs::create_dir_all(basedir)?;
        let path = basedir.join(CHANGELOG_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::FileLocked(e.to_string()))?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            let mut header = Vec::with_capacity(HEADER_SIZE as usize);
            header.extend_from_slice(CHANGELOG_MAGIC);
            header.extend_from_slice(&CHANGELOG_FORMAT_VERSION.to_be_bytes());
            file.write_all(&header)?;
            file.sync_all()?;
        } else {
            let mut header = [0u8; HEADER_SIZE as usize];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header).map_err(|_| {
                Error::Corrupted("changelog file too short for header".to_string())
            })?;
            if &header[..6] != CHANGELOG_MAGIC {
                return Err(Error::Corrupted("bad changelog magic".to_string()));
            }
            let version = u16::from_be_bytes([header[6], header[7]]);
            if version != CHANGELOG_FORMAT_VERSION {
                return Err(Error::Corrupted(format!(
                    "unsupported changelog format version {version}"
                )));
            }
        }

        let (offsets, index, valid_end) = Self::scan(&mut file, file_len.max(HEADER_SIZE))?;
        if valid_end < file_len {
            warn!(
                "truncating torn changelog record at offset {valid_end} (file length {file_len})"
            );
            file.set_len(valid_end)?;
            file.sync_all()?;
        }

        let next_serial = offsets.len() as i64;
        Ok(Storage {
            basedir: basedir.to_path_buf(),
            sync_on_commit,
            next_serial: AtomicI64::new(next_serial),
            last_commit_timestamp: Mutex::new(None),
            inner: Mutex::new(StorageInner {
                file,
                offsets,
                index,
            }),
            cache: Mutex::new(ChangesCache::new(cache_size)),
            commit_signal: Arc::new(Signal::new()),
        })
    }

    /// Reads all records, folding each change map into the primary index.
    /// Returns the offsets per serial and the end of the last whole record.
    #[allow(clippy::type_complexity)]
    fn scan(
        file: &mut File,
        file_len: u64,
    ) -> Result<(Vec<u64>, HashMap<String, (String, i64)>, u64)> {
        let mut offsets = Vec::new();
        let mut index = HashMap::new();
        let mut pos = HEADER_SIZE;
        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(pos))?;
        while pos < file_len {
            if pos + RECORD_HEADER_SIZE > file_len {
                break; // torn record header
            }
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            reader.read_exact(&mut header)?;
            let serial = u64::from_be_bytes(header[..8].try_into().unwrap());
            let payload_len = u32::from_be_bytes(header[8..].try_into().unwrap()) as u64;
            if serial != offsets.len() as u64 {
                return Err(Error::Corrupted(format!(
                    "changelog record at offset {pos} carries serial {serial}, expected {}",
                    offsets.len()
                )));
            }
            if pos + RECORD_HEADER_SIZE + payload_len > file_len {
                break; // torn payload
            }
            let mut payload = vec![0; payload_len as usize];
            reader.read_exact(&mut payload)?;
            let entry: ChangelogEntry = codec::loads(&payload)?;
            for (relpath, change) in entry.changes {
                index.insert(relpath, (change.keyname, serial as i64));
            }
            offsets.push(pos);
            pos += RECORD_HEADER_SIZE + payload_len;
        }
        Ok((offsets, index, pos))
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    /// The serial the next commit will obtain.
    pub fn next_serial(&self) -> i64 {
        self.next_serial.load(Ordering::SeqCst)
    }

    /// The latest committed serial, -1 when nothing was ever committed.
    pub fn current_serial(&self) -> i64 {
        self.next_serial() - 1
    }

    pub(crate) fn bump_serial(&self) {
        self.next_serial.fetch_add(1, Ordering::SeqCst);
        *self.last_commit_timestamp.lock().unwrap() = Some(SystemTime::now());
    }

    pub fn last_commit_timestamp(&self) -> Option<SystemTime> {
        *self.last_commit_timestamp.lock().unwrap()
    }

    pub fn get_connection(self: &Arc<Self>) -> Connection {
        Connection {
            storage: self.clone(),
            staged_index: HashMap::new(),
            dirty_files: BTreeMap::new(),
        }
    }

    /// Returns the decoded change map of `serial`, through the cache.
    pub fn get_changes(&self, serial: i64) -> Result<Arc<Changes>> {
        if let Some(hit) = self.cache.lock().unwrap().get(serial) {
            return Ok(hit);
        }
        let raw = self.get_raw_changelog_entry(serial)?;
        let entry: ChangelogEntry = codec::loads(&raw)?;
        let changes = Arc::new(entry.changes);
        self.cache.lock().unwrap().insert(serial, changes.clone());
        Ok(changes)
    }

    /// Returns the serialized payload of the record at `serial`.
    pub fn get_raw_changelog_entry(&self, serial: i64) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        let offset = match usize::try_from(serial)
            .ok()
            .and_then(|at| inner.offsets.get(at).copied())
        {
            Some(offset) => offset,
            None => return Err(Error::KeyAbsent(format!("changelog entry {serial}"))),
        };
        inner.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE as usize];
        inner.file.read_exact(&mut header)?;
        let payload_len = u32::from_be_bytes(header[8..].try_into().unwrap()) as usize;
        let mut payload = vec![0; payload_len];
        inner.file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Enters freshly committed changes into the cache in frozen form.
    pub fn cache_commit_changes(&self, serial: i64, changes: Arc<Changes>) {
        self.cache.lock().unwrap().insert(serial, changes);
    }

    /// Wakes everything blocked on commit progress.
    pub fn notify_on_commit(&self, serial: i64) {
        debug!("notifying waiters of commit at serial {serial}");
        self.commit_signal.notify_all();
    }

    pub(crate) fn commit_signal(&self) -> &Arc<Signal> {
        &self.commit_signal
    }
}

/// A handle for one transaction's storage work: index reads that see the
/// connection's own staged rows, plus the dirty side-file map drained at
/// commit.
pub struct Connection {
    storage: Arc<Storage>,
    staged_index: HashMap<String, (String, i64)>,
    dirty_files: BTreeMap<String, Option<Vec<u8>>>,
}

impl Connection {
    /// Looks up `(keyname, last_serial)` for a relpath, staged rows first.
    pub fn read_typedkey(&self, relpath: &str) -> Option<(String, i64)> {
        if let Some(row) = self.staged_index.get(relpath) {
            return Some(row.clone());
        }
        self.storage
            .inner
            .lock()
            .unwrap()
            .index
            .get(relpath)
            .cloned()
    }

    /// Stages a primary-index row, applied when the changelog entry is
    /// written.
    pub fn write_typedkey(&mut self, relpath: &str, keyname: &str, serial: i64) {
        self.staged_index
            .insert(relpath.to_string(), (keyname.to_string(), serial));
    }

    /// Appends the record for `serial` and makes it durable, then applies
    /// this connection's staged index rows. This is the commit's durability
    /// point: once it returns, crash recovery will complete the commit.
    pub fn write_changelog_entry(&mut self, serial: i64, entry: &ChangelogEntry) -> Result<()> {
        let payload = codec::dumps(entry)?;
        let mut inner = self.storage.inner.lock().unwrap();
        if serial != inner.offsets.len() as i64 {
            return Err(Error::Other(format!(
                "changelog entry {serial} out of order, expected {}",
                inner.offsets.len()
            )));
        }
        let offset = inner.file.seek(SeekFrom::End(0))?;
        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
        record.extend_from_slice(&(serial as u64).to_be_bytes());
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&payload);
        inner.file.write_all(&record)?;
        if self.storage.sync_on_commit {
            inner.file.sync_all()?;
        }
        inner.offsets.push(offset);
        for (relpath, row) in self.staged_index.drain() {
            inner.index.insert(relpath, row);
        }
        Ok(())
    }

    /// Stages side-file content to be materialized at commit; `None` stages
    /// a deletion.
    pub fn set_dirty_file(&mut self, relpath: &str, content: Option<Vec<u8>>) {
        self.dirty_files.insert(relpath.to_string(), content);
    }

    pub fn dirty_file(&self, relpath: &str) -> Option<&Option<Vec<u8>>> {
        self.dirty_files.get(relpath)
    }

    pub fn has_dirty_files(&self) -> bool {
        !self.dirty_files.is_empty()
    }

    pub(crate) fn take_dirty_files(&mut self) -> BTreeMap<String, Option<Vec<u8>>> {
        std::mem::take(&mut self.dirty_files)
    }
}
