//! Content-addressed blob storage.
//!
//! Blobs are immutable files under `<root>/blobs`, named by the SHA-256
//! of their bytes. Every write is hashed while streaming to a temporary
//! file and only renamed into place once the digest is known; reads can be
//! verified the same way.
//!
//! Reference counts live in memory. They are rebuilt from the manifests
//! when the store is opened and track this process's holders: committed
//! manifests, staged imports and pinned exports. Other processes (the
//! serving runtime, a second manager) write manifests behind our back, so
//! a count reaching zero only makes a blob a deletion candidate; the file
//! goes once a fresh scan of the manifests on disk confirms nothing names it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::digest::{Digest, HashingReader, HashingWriter};
use crate::error::{Result, StoreError};
use crate::fsutil::{self, TEMP_PREFIX};
use crate::layout::StoreLayout;

/// Temporary files and unreferenced blobs younger than this may belong to
/// a transfer that is still running, here or in another process, and are
/// left alone by [`BlobStore::prune`].
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(15 * 60);

const COPY_BUF: usize = 1 << 20;

/// What a [`BlobStore::prune`] pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub blobs_removed: usize,
    pub temp_files_removed: usize,
    pub bytes_reclaimed: u64,
}

pub struct BlobStore {
    layout: StoreLayout,
    refs: Mutex<HashMap<Digest, u64>>,
}

impl BlobStore {
    /// Open (creating if needed) the blob directory. All reference counts
    /// start at zero; see [`BlobStore::rebuild_refs`].
    pub fn open(layout: StoreLayout) -> Result<Self> {
        let dir = layout.blobs_dir();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self {
            layout,
            refs: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.layout.blob_path(digest)
    }

    fn refs(&self) -> MutexGuard<'_, HashMap<Digest, u64>> {
        // A panic while holding the table cannot leave it half-updated.
        self.refs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `bytes` and take one reference to the resulting blob.
    ///
    /// If the blob already exists nothing is written; only the count is
    /// incremented.
    pub fn write(&self, bytes: &[u8]) -> Result<Digest> {
        let digest = Digest::of(bytes);
        if self.try_dedup(&digest, bytes.len() as u64)? {
            return Ok(digest);
        }
        let (got, _) = self.write_from(&mut &bytes[..], Some(digest))?;
        Ok(got)
    }

    /// Stream `reader` into the store and take one reference to the blob.
    ///
    /// With `expected` set, a digest mismatch is an integrity error and
    /// nothing is committed. Returns the digest and byte length.
    pub fn write_from<R: Read + ?Sized>(
        &self,
        reader: &mut R,
        expected: Option<Digest>,
    ) -> Result<(Digest, u64)> {
        let dir = self.layout.blobs_dir();
        let tmp = fsutil::temp_in(&dir)?;

        let mut hw = HashingWriter::new(BufWriter::with_capacity(COPY_BUF, tmp));
        io::copy(reader, &mut hw).map_err(|e| StoreError::io(&dir, e))?;
        let (buf, digest, len) = hw.finish();
        let tmp = buf
            .into_inner()
            .map_err(|e| StoreError::io(&dir, e.into_error()))?;

        if let Some(expected) = expected
            && expected != digest
        {
            return Err(StoreError::Integrity {
                digest: expected,
                detail: format!("content hashed to {digest}"),
            });
        }

        let path = self.path(&digest);
        let mut refs = self.refs();
        if path.exists() {
            // Lost a race with an identical write, or the blob was already
            // there. The temp file is dropped (and deleted) here.
            check_len(&path, &digest, len)?;
            debug!(%digest, "blob already present, skipping write");
        } else {
            fsutil::commit(tmp, &path)?;
            debug!(%digest, bytes = len, "blob committed");
        }
        *refs.entry(digest).or_insert(0) += 1;
        Ok((digest, len))
    }

    /// Take a reference if the blob is already on disk with `len` bytes.
    fn try_dedup(&self, digest: &Digest, len: u64) -> Result<bool> {
        let path = self.path(digest);
        let mut refs = self.refs();
        if !path.exists() {
            return Ok(false);
        }
        check_len(&path, digest, len)?;
        *refs.entry(*digest).or_insert(0) += 1;
        debug!(%digest, "blob deduplicated");
        Ok(true)
    }

    pub fn exists(&self, digest: &Digest) -> bool {
        self.path(digest).is_file()
    }

    pub fn size(&self, digest: &Digest) -> Result<u64> {
        let path = self.path(digest);
        match fs::metadata(&path) {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::BlobNotFound(*digest)),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn open_blob(&self, digest: &Digest) -> Result<File> {
        let path = self.path(digest);
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StoreError::BlobNotFound(*digest)
            } else {
                StoreError::io(path, e)
            }
        })
    }

    /// Read a whole blob into memory, verifying its digest.
    pub fn read(&self, digest: &Digest) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.copy_to(digest, &mut buf)?;
        Ok(buf)
    }

    /// Stream a blob into `out`, verifying its digest once the last byte
    /// has been copied. On mismatch `out` has received corrupt bytes and
    /// the caller must discard them.
    pub fn copy_to(&self, digest: &Digest, out: &mut dyn Write) -> Result<u64> {
        let file = self.open_blob(digest)?;
        let mut reader = HashingReader::new(BufReader::with_capacity(COPY_BUF, file));
        io::copy(&mut reader, out).map_err(|e| StoreError::io(self.path(digest), e))?;
        let (actual, len) = reader.finish();
        if actual != *digest {
            warn!(%digest, %actual, "blob failed verification");
            return Err(StoreError::Integrity {
                digest: *digest,
                detail: format!("stored bytes hash to {actual}"),
            });
        }
        Ok(len)
    }

    /// Re-hash a blob without keeping its bytes.
    pub fn verify(&self, digest: &Digest) -> Result<u64> {
        self.copy_to(digest, &mut io::sink())
    }

    /// Pin an existing blob (e.g. for the duration of an export).
    pub fn retain(&self, digest: &Digest) -> Result<()> {
        let mut refs = self.refs();
        if !self.exists(digest) {
            return Err(StoreError::BlobNotFound(*digest));
        }
        *refs.entry(*digest).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one reference. Returns `true` once this process holds none,
    /// making the blob a candidate for [`BlobStore::remove_unreferenced`].
    pub fn release(&self, digest: &Digest) -> bool {
        let mut refs = self.refs();
        let Some(count) = refs.get_mut(digest) else {
            debug!(%digest, "release of untracked blob");
            return true;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return false;
        }
        refs.remove(digest);
        true
    }

    /// Delete each candidate that no holder in this process and no
    /// manifest in `on_disk` references. The table lock is held
    /// throughout, so a concurrent `write` or `retain` either lands first
    /// and keeps the blob or finds it gone and writes it afresh.
    pub fn remove_unreferenced(
        &self,
        candidates: &[Digest],
        on_disk: &HashMap<Digest, u64>,
    ) -> Result<usize> {
        let refs = self.refs();
        let mut removed = 0;
        for digest in candidates {
            if refs.contains_key(digest) || on_disk.contains_key(digest) {
                continue;
            }
            let path = self.path(digest);
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(%digest, "blob removed");
                    removed += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(removed)
    }

    pub fn ref_count(&self, digest: &Digest) -> u64 {
        self.refs().get(digest).copied().unwrap_or(0)
    }

    /// Replace the reference table wholesale.
    pub fn rebuild_refs(&self, counts: HashMap<Digest, u64>) {
        let mut refs = self.refs();
        *refs = counts;
        debug!(referenced = refs.len(), "blob reference table rebuilt");
    }

    /// Delete stale temporary files and blobs that neither this process
    /// nor any manifest in `on_disk` references.
    ///
    /// Both must be older than [`STALE_TEMP_AGE`]. Files that are neither
    /// blobs nor our temporaries are left alone.
    pub fn prune(&self, on_disk: &HashMap<Digest, u64>) -> Result<PruneReport> {
        let dir = self.layout.blobs_dir();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let refs = self.refs();
        let now = SystemTime::now();
        let mut report = PruneReport::default();

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }

            let stale = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .is_some_and(|age| age >= STALE_TEMP_AGE);
            let remove = if name.starts_with(TEMP_PREFIX) {
                stale
            } else if let Some(digest) = Digest::from_file_name(name) {
                stale && !refs.contains_key(&digest) && !on_disk.contains_key(&digest)
            } else {
                false
            };
            if !remove {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    if name.starts_with(TEMP_PREFIX) {
                        report.temp_files_removed += 1;
                    } else {
                        report.blobs_removed += 1;
                    }
                    report.bytes_reclaimed += meta.len();
                }
                Err(e) => warn!(file = name, error = %e, "could not remove during prune"),
            }
        }

        info!(
            blobs = report.blobs_removed,
            temp_files = report.temp_files_removed,
            bytes = report.bytes_reclaimed,
            "prune complete"
        );
        Ok(report)
    }
}

fn check_len(path: &std::path::Path, digest: &Digest, len: u64) -> Result<()> {
    let on_disk = fs::metadata(path).map_err(|e| StoreError::io(path, e))?.len();
    if on_disk != len {
        return Err(StoreError::Integrity {
            digest: *digest,
            detail: format!("existing blob is {on_disk} bytes, new content is {len}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(StoreLayout::new(dir.path())).unwrap();
        (dir, store)
    }

    fn blob_files(store: &BlobStore) -> usize {
        fs::read_dir(store.layout.blobs_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("sha256-"))
            .count()
    }

    #[test]
    fn second_write_only_bumps_refcount() {
        let (_dir, store) = store();
        let a = store.write(b"hello").unwrap();
        let b = store.write(b"hello").unwrap();
        assert_eq!(a, b);
        assert_eq!(store.ref_count(&a), 2);
        assert_eq!(blob_files(&store), 1);
        assert_eq!(store.read(&a).unwrap(), b"hello");
    }

    #[test]
    fn streamed_write_matches_in_memory_write() {
        let (_dir, store) = store();
        let data = vec![7u8; 3 * COPY_BUF + 11];
        let (d, len) = store.write_from(&mut data.as_slice(), None).unwrap();
        assert_eq!(d, Digest::of(&data));
        assert_eq!(len, data.len() as u64);
        assert_eq!(store.size(&d).unwrap(), len);
    }

    #[test]
    fn wrong_expected_digest_commits_nothing() {
        let (_dir, store) = store();
        let err = store
            .write_from(&mut &b"abc"[..], Some(Digest::of(b"xyz")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity { .. }));
        assert_eq!(blob_files(&store), 0);
    }

    #[test]
    fn flipped_byte_is_detected_on_read() {
        let (_dir, store) = store();
        let d = store.write(b"some tensor bytes").unwrap();
        let path = store.path(&d);
        let mut bytes = fs::read(&path).unwrap();
        bytes[3] ^= 0x01;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(store.read(&d), Err(StoreError::Integrity { .. })));
        assert!(matches!(store.verify(&d), Err(StoreError::Integrity { .. })));
    }

    #[test]
    fn length_mismatch_on_dedup_is_integrity_error() {
        let (_dir, store) = store();
        let d = store.write(b"original").unwrap();
        fs::write(store.path(&d), b"truncated!!").unwrap();
        assert!(matches!(
            store.write(b"original"),
            Err(StoreError::Integrity { .. })
        ));
    }

    fn age(path: &std::path::Path) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - STALE_TEMP_AGE * 2)
            .unwrap();
    }

    #[test]
    fn release_reports_last_holder_without_deleting() {
        let (_dir, store) = store();
        let d = store.write(b"x").unwrap();
        store.retain(&d).unwrap();
        assert!(!store.release(&d));
        assert!(store.release(&d));
        assert_eq!(store.ref_count(&d), 0);
        assert!(store.exists(&d));

        assert_eq!(store.remove_unreferenced(&[d], &HashMap::new()).unwrap(), 1);
        assert!(!store.exists(&d));
        assert!(matches!(store.read(&d), Err(StoreError::BlobNotFound(_))));
        assert!(matches!(store.retain(&d), Err(StoreError::BlobNotFound(_))));
    }

    #[test]
    fn remove_unreferenced_spares_held_and_manifest_blobs() {
        let (_dir, store) = store();
        let held = store.write(b"held").unwrap();
        let named = store.write(b"named elsewhere").unwrap();
        let free = store.write(b"free").unwrap();
        store.release(&named);
        store.release(&free);

        let on_disk = HashMap::from([(named, 1)]);
        let removed = store
            .remove_unreferenced(&[held, named, free], &on_disk)
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.exists(&held));
        assert!(store.exists(&named));
        assert!(!store.exists(&free));
    }

    #[test]
    fn prune_removes_orphans_and_stale_temps_only() {
        let (_dir, store) = store();
        let kept = store.write(b"kept").unwrap();
        let orphan = store.write(b"orphan").unwrap();
        let foreign = store.write(b"named by another process").unwrap();
        let staged = store.write(b"staged by another process").unwrap();
        store.rebuild_refs(HashMap::from([(kept, 1)]));
        for d in [kept, orphan, foreign] {
            age(&store.path(&d));
        }

        let blobs = store.layout.blobs_dir();
        let stale = blobs.join(format!("{TEMP_PREFIX}stale"));
        fs::write(&stale, b"partial").unwrap();
        age(&stale);
        let fresh = blobs.join(format!("{TEMP_PREFIX}fresh"));
        fs::write(&fresh, b"in flight").unwrap();
        fs::write(blobs.join("README"), b"not ours").unwrap();

        let report = store.prune(&HashMap::from([(foreign, 1)])).unwrap();
        assert_eq!(report.blobs_removed, 1);
        assert_eq!(report.temp_files_removed, 1);
        assert!(store.exists(&kept));
        assert!(!store.exists(&orphan));
        assert!(store.exists(&foreign));
        assert!(store.exists(&staged));
        assert!(!stale.exists());
        assert!(fresh.exists());
        assert!(blobs.join("README").exists());
    }
}
