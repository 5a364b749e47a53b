//! Byte codec for changelog payloads plus atomic file-write helpers.
//!
//! Every file the engine produces is written to a `-tmp` sibling first and
//! renamed into place, so a reader never observes a half-written file.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Serializes a value into the changelog payload format.
pub fn dumps<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Other(format!("failed to serialize: {e}")))
}

/// Deserializes a changelog payload.
pub fn loads<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data).map_err(|e| Error::Corrupted(format!("failed to deserialize: {e}")))
}

/// Returns the staging sibling of `path`: same location, `-tmp` suffix.
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str("-tmp");
    path.with_file_name(name)
}

/// Opens `path` for writing, creating parent directories on demand.
pub fn create_file_ensure_dir(path: &Path) -> io::Result<File> {
    match File::create(path) {
        Ok(file) => Ok(file),
        Err(err) => {
            let dir = match path.parent() {
                Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => dir,
                _ => return Err(err),
            };
            fs::create_dir_all(dir)?;
            File::create(path)
        }
    }
}

/// Renames `source` over `dest`, creating the destination directory on
/// demand. Windows refuses to rename over an existing file, so the
/// destination is unlinked first there.
pub fn rename_file(source: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            if let Some(dir) = dest.parent() {
                if !dir.as_os_str().is_empty() && !dir.exists() {
                    fs::create_dir_all(dir)?;
                }
            }
            #[cfg(windows)]
            if dest.exists() {
                fs::remove_file(dest)?;
            }
            fs::rename(source, dest)
        }
    }
}

/// Writes `data` to `path` atomically via the `-tmp` sibling.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let staged = tmp_path(path);
    {
        let mut file = create_file_ensure_dir(&staged)?;
        file.write_all(data)?;
    }
    rename_file(&staged, path)?;
    Ok(())
}

/// Reads a decimal integer from `path`, returning `default` when the file
/// is missing or unreadable.
pub fn read_int_file(path: &Path, default: i64) -> i64 {
    fs::read(path)
        .ok()
        .and_then(|data| String::from_utf8(data).ok())
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(default)
}

/// Persists a decimal integer to `path` atomically.
pub fn write_int_file(path: &Path, value: i64) -> Result<()> {
    write_atomic(path, value.to_string().as_bytes())
}
