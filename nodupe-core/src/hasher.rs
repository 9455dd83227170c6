//! Content fingerprinting.
//!
//! Two fingerprint tiers: a bounded-read quick hash that only prunes
//! equality candidates, and a streaming full hash. Workers share a
//! recycled buffer pool to bound peak memory, and every read loop is a
//! cancellation point.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::HashAlgo;

/// Chunk size for streaming reads.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Files at least this many times the quick window also get a suffix
/// sample, so same-prefix archives and logs still separate cheaply.
const SUFFIX_SAMPLE_FACTOR: u64 = 4;

/// Recycled read buffers shared by all hasher workers.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    buf_size: usize,
    max_idle: usize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            buf_size,
            max_idle,
        }
    }

    pub fn acquire(&self) -> Vec<u8> {
        self.buffers
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buf_size])
    }

    pub fn release(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle && buf.len() == self.buf_size {
            buffers.push(buf);
        }
    }
}

/// Computes quick and full fingerprints with one pinned algorithm.
pub struct Hasher {
    algo: HashAlgo,
    quick_bytes: u64,
    pool: Arc<BufferPool>,
    cancel: CancelToken,
}

impl Hasher {
    pub fn new(algo: HashAlgo, quick_bytes: u32, pool: Arc<BufferPool>, cancel: CancelToken) -> Self {
        Self {
            algo,
            quick_bytes: u64::from(quick_bytes),
            pool,
            cancel,
        }
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    /// Short digest over a bounded prefix (plus a suffix sample for large
    /// files) and the length. Only ever used to prune candidates.
    pub fn quick_hash(&self, path: &Path, size: u64) -> Result<Vec<u8>> {
        let run = || -> Result<Vec<u8>> {
            let mut file = File::open(path)?;
            let mut state = self.algo.algorithm().new_hasher();
            let mut buf = self.pool.acquire();

            let mut remaining = self.quick_bytes.min(size);
            while remaining > 0 {
                self.cancel.check()?;
                let want = (remaining as usize).min(buf.len());
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                state.update(&buf[..n]);
                remaining -= n as u64;
            }

            if size >= self.quick_bytes.saturating_mul(SUFFIX_SAMPLE_FACTOR) {
                file.seek(SeekFrom::Start(size - self.quick_bytes))?;
                let mut remaining = self.quick_bytes;
                while remaining > 0 {
                    self.cancel.check()?;
                    let want = (remaining as usize).min(buf.len());
                    let n = file.read(&mut buf[..want])?;
                    if n == 0 {
                        break;
                    }
                    state.update(&buf[..n]);
                    remaining -= n as u64;
                }
            }

            state.update(&size.to_le_bytes());
            self.pool.release(buf);
            Ok(state.finalize())
        };

        run().map_err(|e| hash_failed(e, path))
    }

    /// Streams the whole file.
    pub fn full_hash(&self, path: &Path) -> Result<Vec<u8>> {
        let run = || -> Result<Vec<u8>> {
            let mut file = File::open(path)?;
            let mut state = self.algo.algorithm().new_hasher();
            let mut buf = self.pool.acquire();

            loop {
                self.cancel.check()?;
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                state.update(&buf[..n]);
            }

            self.pool.release(buf);
            Ok(state.finalize())
        };

        run().map_err(|e| hash_failed(e, path))
    }
}

fn hash_failed(e: Error, path: &Path) -> Error {
    match e {
        Error::Cancelled => Error::Cancelled,
        Error::Io(io) => Error::HashFailed {
            path: path.to_path_buf(),
            code: io.kind().to_string(),
        },
        other => other,
    }
}

/// Benchmark the registered algorithms over bytes from the actual workload
/// and pick the fastest whose digest length meets the floor.
///
/// The choice is cached for the scan epoch by the orchestrator and
/// recorded in the checkpoint.
pub fn select_algorithm(sample_files: &[PathBuf], digest_length_floor: usize) -> HashAlgo {
    let candidates: Vec<HashAlgo> = HashAlgo::ALL
        .into_iter()
        .filter(|a| a.digest_len() >= digest_length_floor)
        .collect();
    if candidates.len() <= 1 {
        return candidates.first().copied().unwrap_or(HashAlgo::Blake3);
    }

    let data = benchmark_corpus(sample_files);

    let mut best = candidates[0];
    let mut best_elapsed = None;
    for algo in candidates {
        let start = Instant::now();
        let _digest = algo.hash_bytes(&data);
        let elapsed = start.elapsed();
        debug!(
            "Autotuner: {} hashed {} bytes in {:?}",
            algo.name(),
            data.len(),
            elapsed
        );
        if best_elapsed.is_none_or(|b| elapsed < b) {
            best = algo;
            best_elapsed = Some(elapsed);
        }
    }

    info!(
        "Autotuner selected {} over {} sample bytes",
        best.name(),
        data.len()
    );
    best
}

/// Up to 8 MiB read from a random subset of the sample; falls back to a
/// synthetic buffer when the workload has nothing readable.
fn benchmark_corpus(sample_files: &[PathBuf]) -> Vec<u8> {
    const CORPUS_CAP: usize = 8 * 1024 * 1024;
    const FILE_CAP: usize = 2 * 1024 * 1024;
    const MAX_FILES: usize = 4;

    let mut picks: Vec<&PathBuf> = Vec::new();
    if !sample_files.is_empty() {
        for _ in 0..MAX_FILES.min(sample_files.len()) {
            let idx = (rand::random::<u64>() as usize) % sample_files.len();
            picks.push(&sample_files[idx]);
        }
    }

    let mut data = Vec::new();
    for path in picks {
        if data.len() >= CORPUS_CAP {
            break;
        }
        if let Ok(file) = File::open(path) {
            let mut chunk = Vec::new();
            if file.take(FILE_CAP as u64).read_to_end(&mut chunk).is_ok() {
                data.extend_from_slice(&chunk);
            }
        }
    }

    if data.is_empty() {
        data = vec![0x5Au8; 4 * 1024 * 1024];
    }
    data.truncate(CORPUS_CAP);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pool() -> Arc<BufferPool> {
        Arc::new(BufferPool::new(CHUNK_SIZE, 4))
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(content).unwrap();
        path
    }

    #[test]
    fn full_hash_matches_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let content = vec![0x41u8; 300 * 1024];
        let path = write_file(dir.path(), "a.bin", &content);

        let hasher = Hasher::new(HashAlgo::Blake3, 4096, pool(), CancelToken::new());
        assert_eq!(
            hasher.full_hash(&path).unwrap(),
            HashAlgo::Blake3.hash_bytes(&content)
        );
    }

    #[test]
    fn quick_hash_equal_for_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a", &[1u8; 1024]);
        let b = write_file(dir.path(), "b", &[1u8; 1024]);

        let hasher = Hasher::new(HashAlgo::Blake3, 64, pool(), CancelToken::new());
        assert_eq!(
            hasher.quick_hash(&a, 1024).unwrap(),
            hasher.quick_hash(&b, 1024).unwrap()
        );
    }

    #[test]
    fn quick_hash_suffix_sample_separates_same_prefix() {
        let dir = tempfile::tempdir().unwrap();
        // Same 64-byte prefix, divergence only near the end; size >= 4x the
        // quick window so the suffix sample kicks in.
        let mut x = vec![7u8; 1024];
        let mut y = vec![7u8; 1024];
        x[1000] = 1;
        y[1000] = 2;
        let a = write_file(dir.path(), "x", &x);
        let b = write_file(dir.path(), "y", &y);

        let hasher = Hasher::new(HashAlgo::Blake3, 64, pool(), CancelToken::new());
        assert_ne!(
            hasher.quick_hash(&a, 1024).unwrap(),
            hasher.quick_hash(&b, 1024).unwrap()
        );
    }

    #[test]
    fn missing_file_yields_hash_failed() {
        let hasher = Hasher::new(HashAlgo::Blake3, 64, pool(), CancelToken::new());
        let err = hasher.full_hash(Path::new("/no/such/file")).unwrap_err();
        assert!(matches!(err, Error::HashFailed { .. }));
    }

    #[test]
    fn cancelled_hash_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "a", &[0u8; 1024]);

        let cancel = CancelToken::new();
        cancel.cancel();
        let hasher = Hasher::new(HashAlgo::Blake3, 64, pool(), cancel);
        assert!(matches!(hasher.full_hash(&path), Err(Error::Cancelled)));
    }

    #[test]
    fn autotuner_respects_digest_floor() {
        let algo = select_algorithm(&[], 64);
        // Only blake2b and sha512 produce 64-byte digests.
        assert!(matches!(algo, HashAlgo::Blake2b | HashAlgo::Sha512));
    }

    #[test]
    fn buffer_pool_recycles() {
        let pool = BufferPool::new(16, 2);
        let a = pool.acquire();
        pool.release(a);
        assert_eq!(pool.acquire().len(), 16);
    }
}
