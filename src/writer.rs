//! Scoped commit execution.
//!
//! A [`CommitWriter`] collects key changes and a side-file rename plan, then
//! commits them as one changelog entry. The entry is made durable before any
//! rename or delete touches the filesystem, so a crash in between is repaired
//! at the next open by replaying the plan. An uncommitted writer cleans up
//! its staged `-tmp` files when dropped, on every exit path.

use std::fs;
use std::io::{ErrorKind, Write};
use std::mem;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::key::TypedKey;
use crate::storage::{Change, ChangelogEntry, Changes, Connection, Storage};
use crate::value::Value;

/// Writer for one commit, scoped to a connection.
pub struct CommitWriter<'a> {
    storage: Arc<Storage>,
    conn: &'a mut Connection,
    changes: Changes,
    pending_renames: Vec<(Option<String>, String)>,
    committed: bool,
}

impl<'a> CommitWriter<'a> {
    pub(crate) fn new(storage: Arc<Storage>, conn: &'a mut Connection) -> Self {
        CommitWriter {
            storage,
            conn,
            changes: Changes::new(),
            pending_renames: Vec::new(),
            committed: false,
        }
    }

    /// The serial this commit will obtain.
    pub fn commit_serial(&self) -> i64 {
        self.storage.next_serial()
    }

    /// Records setting `key` to `value`; `None` records a deletion. The
    /// primary index row is staged at the commit serial.
    pub fn record_set(&mut self, key: &TypedKey, value: Option<Value>) {
        let back_serial = self
            .conn
            .read_typedkey(key.relpath())
            .map(|(_, serial)| serial)
            .unwrap_or(-1);
        self.conn
            .write_typedkey(key.relpath(), key.name(), self.storage.next_serial());
        self.changes.insert(
            key.relpath().to_string(),
            Change {
                keyname: key.name().to_string(),
                back_serial,
                value,
            },
        );
    }

    /// Appends a rename to the commit plan. `source = None` means "delete
    /// `dest` at commit"; otherwise `source` must be `dest` plus the `-tmp`
    /// suffix.
    pub fn record_rename_file(&mut self, source: Option<&str>, dest: &str) {
        if let Some(source) = source {
            debug_assert_eq!(source, format!("{dest}-tmp"));
        }
        self.pending_renames
            .push((source.map(str::to_string), dest.to_string()));
    }

    /// Writes `content` to the staged `-tmp` sibling of `relpath` and
    /// schedules the rename. Import subscribers use this to materialize
    /// additional side files together with the commit.
    pub fn stage_file(&mut self, relpath: &str, content: &[u8]) -> Result<()> {
        let staged_rel = format!("{relpath}-tmp");
        let mut file = codec::create_file_ensure_dir(&self.storage.basedir().join(&staged_rel))?;
        file.write_all(content)?;
        self.record_rename_file(Some(&staged_rel), relpath);
        Ok(())
    }

    pub(crate) fn commit(mut self) -> Result<i64> {
        for (relpath, content) in self.conn.take_dirty_files() {
            match content {
                Some(bytes) => self.stage_file(&relpath, &bytes)?,
                None => self.record_rename_file(None, &relpath),
            }
        }
        let rel_renames = make_rel_renames(&self.pending_renames);
        let commit_serial = self.storage.next_serial();
        let entry = ChangelogEntry {
            changes: mem::take(&mut self.changes),
            rel_renames,
        };
        self.conn.write_changelog_entry(commit_serial, &entry)?;
        // durable from here on; a crash below is repaired by replaying the
        // rename plan at the next open
        let (files_commit, files_del) = commit_renames(self.storage.basedir(), &entry.rel_renames)?;
        self.storage.bump_serial();

        let mut message = format!(
            "committed serial {commit_serial}: keys: {}",
            entry
                .changes
                .keys()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(",")
        );
        if !files_commit.is_empty() {
            message.push_str(&format!(", files_commit: {}", files_commit.join(",")));
        }
        if !files_del.is_empty() {
            message.push_str(&format!(", files_del: {}", files_del.join(",")));
        }
        info!("{message}");

        self.storage
            .cache_commit_changes(commit_serial, Arc::new(entry.changes));
        self.storage.notify_on_commit(commit_serial);
        self.committed = true;
        Ok(commit_serial)
    }
}

impl Drop for CommitWriter<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        while let Some((source, _dest)) = self.pending_renames.pop() {
            if let Some(staged_rel) = source {
                let _ = fs::remove_file(self.storage.basedir().join(staged_rel));
            }
        }
        debug!(
            "rolled back staged side files at serial {}",
            self.storage.next_serial()
        );
    }
}

/// Builds the basedir-relative rename plan: staged entries keep their `-tmp`
/// suffix, deletions are listed as the plain path.
fn make_rel_renames(pending: &[(Option<String>, String)]) -> Vec<String> {
    pending
        .iter()
        .map(|(source, dest)| source.clone().unwrap_or_else(|| dest.clone()))
        .collect()
}

/// Executes a rename plan after its changelog entry is durable. Returns the
/// committed and the deleted relpaths.
pub(crate) fn commit_renames(
    basedir: &Path,
    rel_renames: &[String],
) -> Result<(Vec<String>, Vec<String>)> {
    let mut files_commit = Vec::new();
    let mut files_del = Vec::new();
    for relpath in rel_renames {
        let path = basedir.join(relpath);
        match relpath.strip_suffix("-tmp") {
            Some(dest_rel) => {
                codec::rename_file(&path, &basedir.join(dest_rel))?;
                files_commit.push(dest_rel.to_string());
            }
            None => {
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                }
                files_del.push(relpath.clone());
            }
        }
    }
    Ok((files_commit, files_del))
}

/// Replays the rename plan of the most recent changelog entry at startup.
/// Work that already happened is detected and skipped, so replaying is
/// idempotent.
pub(crate) fn check_pending_renames(basedir: &Path, rel_renames: &[String]) -> Result<()> {
    for relpath in rel_renames {
        let path = basedir.join(relpath);
        match relpath.strip_suffix("-tmp") {
            Some(dest_rel) => {
                let dest = basedir.join(dest_rel);
                if path.exists() {
                    codec::rename_file(&path, &dest)?;
                    warn!("completed file-commit from crashed commit: {dest_rel}");
                } else if !dest.exists() {
                    return Err(Error::Corrupted(format!(
                        "side file {dest_rel} missing after crashed commit"
                    )));
                }
            }
            None => match fs::remove_file(&path) {
                Ok(()) => warn!("completed file-del from crashed commit: {relpath}"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;
    use crate::value::ValueKind;

    #[test]
    fn rename_plan_keeps_staged_suffix_and_plain_deletes() {
        let pending = vec![
            (Some("pkgs/a.tar-tmp".to_string()), "pkgs/a.tar".to_string()),
            (None, "pkgs/old.tar".to_string()),
        ];
        assert_eq!(
            make_rel_renames(&pending),
            vec!["pkgs/a.tar-tmp".to_string(), "pkgs/old.tar".to_string()]
        );
    }

    #[test]
    fn dropped_writer_removes_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path(), 16, true).unwrap());
        let mut conn = storage.get_connection();
        let mut writer = CommitWriter::new(storage.clone(), &mut conn);
        writer.stage_file("pkgs/a.tar", b"DATA").unwrap();
        let staged = dir.path().join("pkgs/a.tar-tmp");
        assert!(staged.exists());
        drop(writer);
        assert!(!staged.exists());
        assert_eq!(storage.next_serial(), 0);
    }

    #[test]
    fn committed_writer_materializes_files_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(Storage::open(dir.path(), 16, true).unwrap());
        let mut conn = storage.get_connection();
        let key = Key::new("counter", "counter", ValueKind::Int)
            .unwrap()
            .typed()
            .unwrap();
        let mut writer = CommitWriter::new(storage.clone(), &mut conn);
        writer.record_set(&key, Some(Value::Int(3)));
        writer.stage_file("pkgs/a.tar", b"DATA").unwrap();
        let serial = writer.commit().unwrap();
        assert_eq!(serial, 0);
        assert_eq!(storage.next_serial(), 1);
        assert!(storage.last_commit_timestamp().is_some());
        assert_eq!(fs::read(dir.path().join("pkgs/a.tar")).unwrap(), b"DATA");
        assert!(!dir.path().join("pkgs/a.tar-tmp").exists());
        let changes = storage.get_changes(0).unwrap();
        assert_eq!(changes.get("counter").unwrap().back_serial, -1);
        assert_eq!(changes.get("counter").unwrap().value, Some(Value::Int(3)));
    }
}
