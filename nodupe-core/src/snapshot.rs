//! Content-addressable snapshot store.
//!
//! Pre-images live under `{root}/content/{aa}/{hash}` where `aa` is the
//! first byte of the hex hash, with a `{hash}.meta` sidecar holding the
//! original mode and mtime. Objects are immutable once renamed into
//! place; refcounts live in the catalog, not on disk.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::RollbackConfig;
use crate::error::{Error, Result};
use crate::hash::HashAlgo;
use crate::types::SnapshotMeta;

const PUT_CHUNK: usize = 256 * 1024;

/// Floor for the proportional `put` deadline.
const PUT_TIMEOUT_FLOOR: Duration = Duration::from_secs(30);

/// Assumed worst-case throughput when sizing the `put` deadline.
const PUT_TIMEOUT_BYTES_PER_SEC: u64 = 4 * 1024 * 1024;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Per-operation deadline, checked between chunks. A blocking syscall
/// itself cannot be interrupted; the granularity is one chunk.
struct OpDeadline {
    deadline: Instant,
    budget: Duration,
}

impl OpDeadline {
    fn for_bytes(expected_len: Option<u64>) -> Self {
        let proportional = expected_len
            .map(|len| Duration::from_secs(len / PUT_TIMEOUT_BYTES_PER_SEC + 1))
            .unwrap_or(Duration::ZERO);
        let budget = PUT_TIMEOUT_FLOOR.max(proportional);
        Self {
            deadline: Instant::now() + budget,
            budget,
        }
    }

    fn check(&self) -> Result<()> {
        if Instant::now() > self.deadline {
            Err(Error::Timeout(self.budget))
        } else {
            Ok(())
        }
    }
}

/// What snapshot GC removed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SnapshotGcReport {
    pub txns_reclaimed: u64,
    pub objects_removed: u64,
}

/// Pre-image sink; the real store plus a null variant for dry runs.
pub trait SnapshotBackend: Send + Sync {
    fn algo(&self) -> HashAlgo;

    /// Stream bytes in, return the hex content hash. `expected_len` sizes
    /// the proportional timeout.
    fn put(
        &self,
        reader: &mut dyn Read,
        meta: SnapshotMeta,
        expected_len: Option<u64>,
    ) -> Result<String>;

    fn contains(&self, content_hash: &str) -> Result<bool>;

    /// Open an object after verifying its bytes hash to `content_hash`.
    fn open_verified(&self, content_hash: &str) -> Result<(File, SnapshotMeta)>;
}

/// On-disk content-addressable store.
pub struct SnapshotStore {
    root: PathBuf,
    algo: HashAlgo,
}

impl SnapshotStore {
    pub fn open(root: impl Into<PathBuf>, algo: HashAlgo) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("content"))?;
        fs::create_dir_all(root.join("tmp"))?;
        Ok(Self { root, algo })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, content_hash: &str) -> PathBuf {
        let shard = &content_hash[..2.min(content_hash.len())];
        self.root.join("content").join(shard).join(content_hash)
    }

    fn meta_path(&self, content_hash: &str) -> PathBuf {
        let mut path = self.object_path(content_hash).into_os_string();
        path.push(".meta");
        PathBuf::from(path)
    }

    fn temp_path(&self) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join("tmp")
            .join(format!("put-{}-{}", std::process::id(), n))
    }

    fn read_meta(&self, content_hash: &str) -> Result<SnapshotMeta> {
        let raw = fs::read(self.meta_path(content_hash)).map_err(|e| {
            Error::SnapshotCorrupt(format!("missing sidecar for {content_hash}: {e}"))
        })?;
        serde_json::from_slice(&raw)
            .map_err(|e| Error::SnapshotCorrupt(format!("bad sidecar for {content_hash}: {e}")))
    }

    /// Garbage-collect pre-images of expired terminal transactions.
    ///
    /// Retention wins nothing against open work: objects referenced by any
    /// non-terminal transaction are pinned regardless of age. Returns what
    /// was removed.
    pub fn gc(&self, catalog: &dyn Catalog, config: &RollbackConfig) -> Result<SnapshotGcReport> {
        let cutoff: DateTime<Utc> =
            Utc::now() - chrono::Duration::days(i64::from(config.retention_days));
        let expired = catalog.list_reclaimable_txns(cutoff, config.max_snapshots)?;

        let mut report = SnapshotGcReport::default();
        for txn_id in expired {
            for entry in catalog.txn_entries(txn_id)? {
                if let Some(ref content_hash) = entry.pre_image_ref {
                    catalog.snapshot_ref(content_hash, -1)?;
                }
            }
            catalog.mark_reclaimed(txn_id)?;
            report.txns_reclaimed += 1;
        }

        let pinned: HashSet<String> = catalog.pinned_snapshots()?.into_iter().collect();
        report.objects_removed = self.sweep(catalog, &pinned)?;
        if report.txns_reclaimed > 0 || report.objects_removed > 0 {
            info!(
                "Snapshot GC reclaimed {} transactions, removed {} objects",
                report.txns_reclaimed, report.objects_removed
            );
        }
        Ok(report)
    }

    /// Delete objects with zero refcount that no non-terminal transaction
    /// references.
    fn sweep(&self, catalog: &dyn Catalog, pinned: &HashSet<String>) -> Result<u64> {
        let content = self.root.join("content");
        let mut removed = 0u64;

        let shards = match fs::read_dir(&content) {
            Ok(iter) => iter,
            Err(_) => return Ok(0),
        };
        for shard in shards.filter_map(std::result::Result::ok) {
            let Ok(entries) = fs::read_dir(shard.path()) else {
                continue;
            };
            for entry in entries.filter_map(std::result::Result::ok) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".meta") {
                    continue;
                }
                if pinned.contains(&name) {
                    continue;
                }
                if catalog.snapshot_refcount(&name)? == 0 {
                    debug!("Sweeping snapshot object {}", name);
                    fs::remove_file(entry.path()).ok();
                    fs::remove_file(self.meta_path(&name)).ok();
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

impl SnapshotBackend for SnapshotStore {
    fn algo(&self) -> HashAlgo {
        self.algo
    }

    fn put(
        &self,
        reader: &mut dyn Read,
        meta: SnapshotMeta,
        expected_len: Option<u64>,
    ) -> Result<String> {
        let deadline = OpDeadline::for_bytes(expected_len);
        let temp = self.temp_path();
        let mut out = File::create(&temp).map_err(|e| Error::from_io(e, &temp))?;
        let mut state = self.algo.algorithm().new_hasher();
        let mut buf = vec![0u8; PUT_CHUNK];
        let mut written = 0u64;

        loop {
            deadline.check()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
            out.write_all(&buf[..n])
                .map_err(|e| Error::from_io(e, &temp))?;
            written += n as u64;
        }
        out.sync_all().map_err(|e| Error::from_io(e, &temp))?;
        drop(out);

        let content_hash = hex::encode(state.finalize());
        let target = self.object_path(&content_hash);

        if target.exists() {
            // Same bytes already stored; the caller still takes a reference.
            fs::remove_file(&temp).ok();
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&temp, &target).map_err(|e| Error::from_io(e, &target))?;
            let meta_stored = SnapshotMeta {
                bytes_len: written,
                ..meta
            };
            fs::write(self.meta_path(&content_hash), serde_json::to_vec(&meta_stored)?)?;
        }

        debug!("Snapshot put {} ({} bytes)", content_hash, written);
        Ok(content_hash)
    }

    fn contains(&self, content_hash: &str) -> Result<bool> {
        Ok(self.object_path(content_hash).exists())
    }

    fn open_verified(&self, content_hash: &str) -> Result<(File, SnapshotMeta)> {
        let path = self.object_path(content_hash);
        let mut file = File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::SnapshotCorrupt(format!("object {content_hash} missing"))
            }
            _ => Error::from_io(e, &path),
        })?;

        let mut state = self.algo.algorithm().new_hasher();
        let mut buf = vec![0u8; PUT_CHUNK];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
        }
        let actual = hex::encode(state.finalize());
        if actual != content_hash {
            warn!("Snapshot object {} hashes to {}", content_hash, actual);
            return Err(Error::SnapshotCorrupt(format!(
                "object {content_hash} fails verification (got {actual})"
            )));
        }

        let meta = self.read_meta(content_hash)?;
        let file = File::open(&path).map_err(|e| Error::from_io(e, &path))?;
        Ok((file, meta))
    }
}

/// Dry-run sink: computes the content hash, stores nothing.
pub struct NullSnapshotStore {
    algo: HashAlgo,
}

impl NullSnapshotStore {
    pub fn new(algo: HashAlgo) -> Self {
        Self { algo }
    }
}

impl SnapshotBackend for NullSnapshotStore {
    fn algo(&self) -> HashAlgo {
        self.algo
    }

    fn put(
        &self,
        reader: &mut dyn Read,
        _meta: SnapshotMeta,
        expected_len: Option<u64>,
    ) -> Result<String> {
        let deadline = OpDeadline::for_bytes(expected_len);
        let mut state = self.algo.algorithm().new_hasher();
        let mut buf = vec![0u8; PUT_CHUNK];
        loop {
            deadline.check()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            state.update(&buf[..n]);
        }
        Ok(hex::encode(state.finalize()))
    }

    fn contains(&self, _content_hash: &str) -> Result<bool> {
        Ok(false)
    }

    fn open_verified(&self, content_hash: &str) -> Result<(File, SnapshotMeta)> {
        Err(Error::SnapshotCorrupt(format!(
            "null snapshot store holds no objects ({content_hash})"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path().join("snap"), HashAlgo::Sha256).unwrap();
        (dir, store)
    }

    fn meta() -> SnapshotMeta {
        SnapshotMeta {
            bytes_len: 0,
            original_mode: 0o644,
            original_mtime_ns: 1_700_000_000_000_000_000,
        }
    }

    #[test]
    fn put_is_content_addressed_and_idempotent() {
        let (_dir, store) = store();
        let content = vec![0x41u8; 1024];

        let h1 = store.put(&mut &content[..], meta(), Some(1024)).unwrap();
        let h2 = store.put(&mut &content[..], meta(), Some(1024)).unwrap();

        assert_eq!(h1, h2);
        assert_eq!(h1, hex::encode(HashAlgo::Sha256.hash_bytes(&content)));
        assert!(store.contains(&h1).unwrap());
    }

    #[test]
    fn layout_shards_by_first_hex_byte() {
        let (_dir, store) = store();
        let h = store.put(&mut &b"x"[..], meta(), None).unwrap();
        let expected = store
            .root()
            .join("content")
            .join(&h[..2])
            .join(&h);
        assert!(expected.exists());
        assert!(store.root().join("content").join(&h[..2]).join(format!("{h}.meta")).exists());
    }

    #[test]
    fn get_round_trips_bytes_and_meta() {
        let (_dir, store) = store();
        let content = b"snapshot me".to_vec();
        let h = store.put(&mut &content[..], meta(), None).unwrap();

        let (mut file, got_meta) = store.open_verified(&h).unwrap();
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).unwrap();

        assert_eq!(read_back, content);
        assert_eq!(got_meta.bytes_len, content.len() as u64);
        assert_eq!(got_meta.original_mode, 0o644);
    }

    #[test]
    fn corrupt_object_is_detected() {
        let (_dir, store) = store();
        let h = store.put(&mut &b"original"[..], meta(), None).unwrap();

        // Flip the stored bytes behind the store's back.
        let path = store.root().join("content").join(&h[..2]).join(&h);
        fs::write(&path, b"tampered").unwrap();

        assert!(matches!(
            store.open_verified(&h),
            Err(Error::SnapshotCorrupt(_))
        ));
    }

    #[test]
    fn null_store_hashes_without_storing() {
        let null = NullSnapshotStore::new(HashAlgo::Sha256);
        let h = null.put(&mut &b"abc"[..], meta(), None).unwrap();
        assert_eq!(h, hex::encode(HashAlgo::Sha256.hash_bytes(b"abc")));
        assert!(!null.contains(&h).unwrap());
        assert!(null.open_verified(&h).is_err());
    }
}
