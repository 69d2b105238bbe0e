//! Small filesystem helpers shared by the blob and manifest stores.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::error::{Result, StoreError};

/// Prefix of every temporary file this crate creates. `prune` treats
/// leftovers with this prefix as garbage.
pub const TEMP_PREFIX: &str = ".omm-";

/// Create a temporary file next to `dir`'s final entries so the later
/// rename never crosses a filesystem.
pub fn temp_in(dir: &Path) -> Result<NamedTempFile> {
    fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(dir)
        .map_err(|e| StoreError::io(dir, e))
}

/// Flush, fsync and rename `tmp` onto `path`.
pub fn commit(mut tmp: NamedTempFile, path: &Path) -> Result<()> {
    tmp.flush().map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

/// Write `bytes` to `path` atomically: temp file, fsync, rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = temp_in(dir)?;
    tmp.write_all(bytes).map_err(|e| StoreError::io(tmp.path(), e))?;
    commit(tmp, path)
}

/// Remove empty directories from `start` upwards, stopping at `stop`.
pub fn remove_empty_parents(start: &Path, stop: &Path) {
    let mut dir = start;
    while dir != stop && dir.starts_with(stop) {
        if fs::remove_dir(dir).is_err() {
            break;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }
}
