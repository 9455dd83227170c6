//! Scan orchestrator.
//!
//! Drives Walker → hasher workers → catalog writer as a bounded-channel
//! pipeline of OS threads. Progressive hashing runs as two passes: pass 1
//! stats and quick-hashes every entry, pass 2 full-hashes only the
//! members of quick-hash collision groups. Files with a unique size never
//! receive a full hash.
//!
//! The writer commits in batches (all-or-nothing visibility per batch),
//! tracks a per-root watermark of contiguously committed entries, and
//! persists it as a checkpoint every few seconds and on shutdown. Resume
//! replays the walk and skips everything at or before the watermark;
//! idempotency is guaranteed by the `(root_id, relative_path)` key.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::MediaProfile;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::hash::HashAlgo;
use crate::hasher::{BufferPool, CHUNK_SIZE, Hasher, select_algorithm};
use crate::types::{FileId, FileRecord, FileState, RootId, ScanCheckpoint};
use crate::walker::{WalkItem, Walker, WalkerOptions, traversal_cmp};

/// How long the writer waits on the channel before re-checking the
/// checkpoint clock and cancellation.
const WRITER_POLL: Duration = Duration::from_millis(200);

/// Entries pre-walked to feed the autotuner benchmark.
const AUTOTUNE_SAMPLE: usize = 256;

/// Scan request.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub roots: Vec<PathBuf>,
    pub walker: WalkerOptions,
    pub resume: bool,
    pub embed: bool,
    pub workers_override: Option<u16>,
    pub media_profile_override: Option<MediaProfile>,
}

/// Scan result. A cancelled scan is a clean outcome, not an error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScanOutcome {
    pub epoch: u64,
    pub hash_algo: HashAlgo,
    pub visited: u64,
    pub committed: u64,
    pub full_hashed: u64,
    pub bytes_hashed: u64,
    pub entry_errors: u64,
    pub cancelled: bool,
}

struct WalkedEntry {
    seq: u64,
    entry: crate::types::CandidateEntry,
}

struct HashedRecord {
    seq: u64,
    record: FileRecord,
    /// Freshly computed embedding, inserted by the writer.
    vector: Option<(String, Vec<f32>)>,
    bytes_hashed: u64,
}

/// Tracks the highest entry per root for which all prior entries have
/// been committed.
struct OrderTracker {
    next_seq: u64,
    watermark: Option<String>,
    pending: BTreeMap<u64, String>,
}

impl OrderTracker {
    fn new() -> Self {
        Self {
            next_seq: 0,
            watermark: None,
            pending: BTreeMap::new(),
        }
    }

    fn committed(&mut self, seq: u64, relative_path: String) {
        self.pending.insert(seq, relative_path);
        while let Some(path) = self.pending.remove(&self.next_seq) {
            self.watermark = Some(path);
            self.next_seq += 1;
        }
    }
}

/// Bounded-concurrency scan pipeline.
pub struct ScanOrchestrator<'a> {
    context: &'a CoreContext,
    catalog: &'a dyn Catalog,
}

impl<'a> ScanOrchestrator<'a> {
    pub fn new(context: &'a CoreContext, catalog: &'a dyn Catalog) -> Self {
        Self { context, catalog }
    }

    pub fn scan(&self, options: &ScanOptions) -> Result<ScanOutcome> {
        if options.roots.is_empty() {
            return Err(Error::InvalidInput("scan requires at least one root".into()));
        }

        let cancel = self.context.child_token();
        let scan_config = {
            let mut sc = self.context.config().scan.clone();
            if let Some(workers) = options.workers_override {
                sc.workers = workers;
            }
            if let Some(profile) = options.media_profile_override {
                sc.media_profile = profile;
            }
            sc
        };
        let workers = scan_config.effective_workers().max(1);

        let mut roots = Vec::with_capacity(options.roots.len());
        for raw in &options.roots {
            let absolute = std::path::absolute(raw)
                .map_err(|e| Error::InvalidInput(format!("bad root {}: {e}", raw.display())))?;
            let root_id = self.catalog.intern_root(&absolute)?;
            roots.push((root_id, absolute));
        }

        // Resume state: per-root watermarks plus the counters and
        // epoch/algorithm of the interrupted run.
        let mut watermarks: HashMap<RootId, String> = HashMap::new();
        let mut resume_base: HashMap<RootId, (u64, u64)> = HashMap::new();
        let mut resumed: Option<(u64, HashAlgo)> = None;
        if options.resume {
            for (root_id, _) in &roots {
                if let Some(cp) = self.catalog.load_checkpoint(*root_id)? {
                    watermarks.insert(*root_id, cp.last_completed_subpath.clone());
                    resume_base.insert(*root_id, (cp.visited_count, cp.bytes_hashed));
                    resumed = Some((cp.epoch, cp.hash_algo));
                }
            }
        }
        let base_visited: u64 = resume_base.values().map(|(v, _)| v).sum();
        let base_bytes: u64 = resume_base.values().map(|(_, b)| b).sum();

        let (epoch, algo) = match resumed {
            Some((epoch, algo)) => {
                info!("Resuming scan at epoch {} with {}", epoch, algo.name());
                (epoch, algo)
            }
            None => {
                let epoch = self.catalog.begin_epoch()?;
                let sample = self.autotune_sample(&roots, &options.walker)?;
                let algo = select_algorithm(
                    &sample,
                    usize::from(scan_config.digest_length_floor),
                );
                (epoch, algo)
            }
        };

        info!(
            "Scan epoch {} starting: {} roots, {} workers, algorithm {}",
            epoch,
            roots.len(),
            workers,
            algo.name()
        );

        let pool = Arc::new(BufferPool::new(CHUNK_SIZE, workers * 2));
        let stats = ScanStats::default();

        self.pass_one(
            options,
            &scan_config,
            &roots,
            &watermarks,
            &resume_base,
            epoch,
            algo,
            workers,
            &pool,
            &cancel,
            &stats,
        )?;

        let mut cancelled = cancel.is_cancelled();
        let mut full_hashed = 0u64;

        if !cancelled {
            full_hashed = self.pass_two(&roots, epoch, workers, &pool, &cancel, &stats)?;
            cancelled = cancel.is_cancelled();
        }

        if !cancelled {
            for (root_id, _) in &roots {
                let changed = self.catalog.mark_missing(*root_id, epoch)?;
                if changed > 0 {
                    info!("Marked {} records under root {} missing", changed, root_id);
                }
                self.catalog.clear_checkpoint(*root_id)?;
            }
        }

        let outcome = ScanOutcome {
            epoch,
            hash_algo: algo,
            visited: base_visited + stats.visited.load(Ordering::SeqCst),
            committed: base_visited + stats.committed.load(Ordering::SeqCst),
            full_hashed,
            bytes_hashed: base_bytes + stats.bytes_hashed.load(Ordering::SeqCst),
            entry_errors: stats.entry_errors.load(Ordering::SeqCst),
            cancelled,
        };
        info!(
            "Scan epoch {} {}: {} visited, {} committed, {} full hashes, {} errors",
            epoch,
            if cancelled { "cancelled" } else { "complete" },
            outcome.visited,
            outcome.committed,
            outcome.full_hashed,
            outcome.entry_errors
        );
        Ok(outcome)
    }

    /// Bounded pre-walk feeding the autotuner.
    fn autotune_sample(
        &self,
        roots: &[(RootId, PathBuf)],
        walker_options: &WalkerOptions,
    ) -> Result<Vec<PathBuf>> {
        let walker = Walker::new(roots.to_vec(), walker_options)?;
        Ok(walker
            .filter_map(|item| match item {
                WalkItem::Entry(e) => Some(e.absolute_path),
                WalkItem::Error(_) => None,
            })
            .take(AUTOTUNE_SAMPLE)
            .collect())
    }

    /// Pass 1: walk, stat, quick-hash, optionally embed, commit.
    #[allow(clippy::too_many_arguments)]
    fn pass_one(
        &self,
        options: &ScanOptions,
        scan_config: &crate::config::ScanConfig,
        roots: &[(RootId, PathBuf)],
        watermarks: &HashMap<RootId, String>,
        resume_base: &HashMap<RootId, (u64, u64)>,
        epoch: u64,
        algo: HashAlgo,
        workers: usize,
        pool: &Arc<BufferPool>,
        cancel: &crate::cancel::CancelToken,
        stats: &ScanStats,
    ) -> Result<()> {
        let (entry_tx, entry_rx) = bounded::<WalkedEntry>(workers * 2);
        let (record_tx, record_rx) = bounded::<HashedRecord>(workers * 2);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);

        let walker = Walker::new(roots.to_vec(), &options.walker)?;
        let root_paths: HashMap<RootId, PathBuf> = roots.iter().cloned().collect();

        std::thread::scope(|scope| {
            // Walker thread: emits entries tagged with a per-root sequence
            // number in traversal order.
            scope.spawn(|| {
                let mut seqs: HashMap<RootId, u64> = HashMap::new();
                for item in walker {
                    if cancel.is_cancelled() {
                        break;
                    }
                    match item {
                        WalkItem::Entry(entry) => {
                            if let Some(watermark) = watermarks.get(&entry.root_id) {
                                if traversal_cmp(&entry.relative_path, watermark)
                                    != std::cmp::Ordering::Greater
                                {
                                    continue;
                                }
                            }
                            let seq = seqs.entry(entry.root_id).or_insert(0);
                            let tagged = WalkedEntry { seq: *seq, entry };
                            *seq += 1;
                            stats.visited.fetch_add(1, Ordering::SeqCst);
                            if entry_tx.send(tagged).is_err() {
                                break;
                            }
                        }
                        WalkItem::Error(e) => {
                            warn!("Walk error at {}: {:?} {}", e.path.display(), e.kind, e.detail);
                            stats.entry_errors.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
                drop(entry_tx);
            });

            // Hasher workers.
            for _ in 0..workers {
                let entry_rx = entry_rx.clone();
                let record_tx = record_tx.clone();
                let hasher = Hasher::new(
                    algo,
                    scan_config.quick_hash_bytes,
                    Arc::clone(pool),
                    cancel.clone(),
                );
                let catalog = self.catalog;
                let registry = self.context.registry();
                let embed = options.embed;
                let stats: &ScanStats = stats;
                let cancel = cancel.clone();

                scope.spawn(move || {
                    while let Ok(WalkedEntry { seq, entry }) = entry_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let hashed =
                            hash_entry(catalog, registry, &hasher, embed, epoch, seq, &entry, &cancel);
                        match hashed {
                            Ok(record) => {
                                if record_tx.send(record).is_err() {
                                    break;
                                }
                            }
                            Err(Error::Cancelled) => break,
                            Err(e) => {
                                warn!("Dropping {}: {}", entry.relative_path, e);
                                stats.entry_errors.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                });
            }
            drop(entry_rx);
            drop(record_tx);

            // Catalog writer: single thread, batch commits, checkpoints.
            let writer_error = &first_error;
            scope.spawn(move || {
                let result = run_writer(
                    self.catalog,
                    &record_rx,
                    scan_config,
                    &root_paths,
                    watermarks,
                    resume_base,
                    epoch,
                    algo,
                    cancel,
                    stats,
                );
                if let Err(e) = result {
                    warn!("Catalog writer failed: {}", e);
                    cancel.cancel();
                    *writer_error.lock() = Some(e);
                }
            });
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Pass 2: full-hash quick-hash collision groups.
    fn pass_two(
        &self,
        roots: &[(RootId, PathBuf)],
        epoch: u64,
        workers: usize,
        pool: &Arc<BufferPool>,
        cancel: &crate::cancel::CancelToken,
        stats: &ScanStats,
    ) -> Result<u64> {
        let root_paths: HashMap<RootId, PathBuf> = roots.iter().cloned().collect();
        let work = self.collision_work(&root_paths)?;
        if work.is_empty() {
            debug!("Pass 2: no quick-hash collision groups need full hashes");
            return Ok(0);
        }
        info!("Pass 2: full-hashing {} files", work.len());

        let batch_size = self.context.config().scan.batch_size as usize;
        let (work_tx, work_rx) = bounded::<(FileId, PathBuf, HashAlgo)>(workers * 2);
        let (done_tx, done_rx) = bounded::<(FileId, Result<Vec<u8>>, u64)>(workers * 2);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let full_hashed = AtomicU64::new(0);

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for item in work {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if work_tx.send(item).is_err() {
                        break;
                    }
                }
                drop(work_tx);
            });

            for _ in 0..workers {
                let work_rx = work_rx.clone();
                let done_tx = done_tx.clone();
                let pool = Arc::clone(pool);
                let cancel = cancel.clone();
                let quick_bytes = self.context.config().scan.quick_hash_bytes;

                scope.spawn(move || {
                    while let Ok((file_id, path, algo)) = work_rx.recv() {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let hasher =
                            Hasher::new(algo, quick_bytes, Arc::clone(&pool), cancel.clone());
                        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                        let result = hasher.full_hash(&path);
                        if matches!(result, Err(Error::Cancelled)) {
                            break;
                        }
                        if done_tx.send((file_id, result, size)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(work_rx);
            drop(done_tx);

            let writer_error = &first_error;
            let full_hashed = &full_hashed;
            scope.spawn(move || {
                let mut batch: Vec<FileRecord> = Vec::with_capacity(batch_size);
                let flush = |batch: &mut Vec<FileRecord>| -> Result<()> {
                    if !batch.is_empty() {
                        self.catalog.upsert_files(batch)?;
                        batch.clear();
                    }
                    Ok(())
                };

                let mut run = || -> Result<()> {
                    while let Ok((file_id, result, size)) = done_rx.recv() {
                        let Some(mut record) = self.catalog.get_file(file_id)? else {
                            continue;
                        };
                        match result {
                            Ok(digest) => {
                                record.full_hash = Some(digest);
                                record.state = FileState::Present;
                                record.error_code = None;
                                full_hashed.fetch_add(1, Ordering::SeqCst);
                                stats.bytes_hashed.fetch_add(size, Ordering::SeqCst);
                            }
                            Err(e) => {
                                record.state = FileState::Stale;
                                record.error_code = Some(e.code().to_string());
                                stats.entry_errors.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        batch.push(record);
                        if batch.len() >= batch_size {
                            flush(&mut batch)?;
                        }
                    }
                    flush(&mut batch)
                };
                if let Err(e) = run() {
                    warn!("Pass 2 writer failed: {}", e);
                    cancel.cancel();
                    *writer_error.lock() = Some(e);
                }
            });
        });

        match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(full_hashed.load(Ordering::SeqCst)),
        }
    }

    /// Files needing a full hash: members of (size, algo, quick-hash)
    /// groups of two or more, current epoch, not yet full-hashed.
    fn collision_work(
        &self,
        root_paths: &HashMap<RootId, PathBuf>,
    ) -> Result<Vec<(FileId, PathBuf, HashAlgo)>> {
        let mut work = Vec::new();
        for (_size, file_ids) in self.catalog.iter_size_buckets(2)? {
            let mut groups: HashMap<(HashAlgo, Vec<u8>), Vec<FileRecord>> = HashMap::new();
            for file_id in file_ids {
                let Some(record) = self.catalog.get_file(file_id)? else {
                    continue;
                };
                if record.state != FileState::Present {
                    continue;
                }
                let (Some(algo), Some(quick)) = (record.hash_algo, record.quick_hash.clone())
                else {
                    continue;
                };
                groups.entry((algo, quick)).or_default().push(record);
            }
            for ((algo, _), members) in groups {
                if members.len() < 2 {
                    continue;
                }
                for record in members {
                    if record.full_hash.is_some() {
                        continue;
                    }
                    let Some(root) = root_paths.get(&record.root_id) else {
                        continue;
                    };
                    work.push((
                        record.file_id,
                        root.join(&record.relative_path),
                        algo,
                    ));
                }
            }
        }
        // Deterministic dispatch order.
        work.sort_by_key(|(file_id, _, _)| *file_id);
        Ok(work)
    }
}

#[derive(Default)]
struct ScanStats {
    visited: AtomicU64,
    committed: AtomicU64,
    bytes_hashed: AtomicU64,
    entry_errors: AtomicU64,
}

/// Stat, quick-hash and optionally embed one walked entry.
#[allow(clippy::too_many_arguments)]
fn hash_entry(
    catalog: &dyn Catalog,
    registry: &crate::registry::BackendRegistry,
    hasher: &Hasher,
    embed: bool,
    epoch: u64,
    seq: u64,
    entry: &crate::types::CandidateEntry,
    cancel: &crate::cancel::CancelToken,
) -> Result<HashedRecord> {
    let previous = catalog.find_by_key(entry.root_id, &entry.relative_path)?;

    // Unchanged since the last scan: carry the fingerprints forward. The
    // record still flows through the writer so its epoch advances; only a
    // missing embedding is computed fresh when `--embed` asks for one.
    let reused = match &previous {
        Some(prev) if !prev.content_changed(&entry.stat) => {
            let mut record = prev.clone();
            record.scan_epoch = epoch;
            record.state = FileState::Present;
            record.error_code = None;
            Some(record)
        }
        _ => None,
    };

    let mut bytes_hashed = 0u64;
    let record = match reused {
        Some(record) => record,
        None => {
            let mut record = FileRecord::from_candidate(entry, epoch);
            if let Some(prev) = previous {
                record.file_id = prev.file_id;
            }
            record.mime = mime_guess::from_path(&entry.absolute_path)
                .first_raw()
                .map(str::to_owned);

            match hasher.quick_hash(&entry.absolute_path, entry.stat.size) {
                Ok(digest) => {
                    record.quick_hash = Some(digest);
                    record.hash_algo = Some(hasher.algo());
                    bytes_hashed = entry.stat.size.min(128 * 1024);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    record.state = FileState::Stale;
                    record.error_code = Some(e.code().to_string());
                }
            }
            record
        }
    };

    let mut vector = None;
    if embed && record.state == FileState::Present && record.embedding_id.is_none() {
        if let Some(mime) = record.mime.as_deref() {
            if let Some(model) = registry.model_for_mime(mime) {
                match std::fs::File::open(&entry.absolute_path) {
                    Ok(mut file) => match model.embed(&mut file, cancel) {
                        Ok(v) => vector = Some((model.id().to_string(), v)),
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => {
                            warn!("Embedding failed for {}: {}", entry.relative_path, e);
                        }
                    },
                    Err(e) => {
                        warn!("Cannot open {} for embedding: {}", entry.relative_path, e);
                    }
                }
            }
        }
    }

    Ok(HashedRecord {
        seq,
        record,
        vector,
        bytes_hashed,
    })
}

/// Single catalog-writer loop: batch commits, watermark tracking,
/// periodic checkpoints, final checkpoint on shutdown.
#[allow(clippy::too_many_arguments)]
fn run_writer(
    catalog: &dyn Catalog,
    record_rx: &Receiver<HashedRecord>,
    scan_config: &crate::config::ScanConfig,
    root_paths: &HashMap<RootId, PathBuf>,
    resume_watermarks: &HashMap<RootId, String>,
    resume_base: &HashMap<RootId, (u64, u64)>,
    epoch: u64,
    algo: HashAlgo,
    cancel: &crate::cancel::CancelToken,
    stats: &ScanStats,
) -> Result<()> {
    let batch_size = scan_config.batch_size as usize;
    let checkpoint_every = Duration::from_secs(u64::from(scan_config.checkpoint_interval_s));

    let mut trackers: HashMap<RootId, OrderTracker> = HashMap::new();
    let mut per_root_bytes: HashMap<RootId, u64> = HashMap::new();
    let mut batch: Vec<HashedRecord> = Vec::with_capacity(batch_size);
    let mut last_checkpoint = Instant::now();

    let commit_batch = |batch: &mut Vec<HashedRecord>,
                        trackers: &mut HashMap<RootId, OrderTracker>,
                        per_root_bytes: &mut HashMap<RootId, u64>|
     -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut records = Vec::with_capacity(batch.len());
        for hashed in batch.iter_mut() {
            if let Some((model_id, vector)) = hashed.vector.take() {
                let embedding_id = catalog.insert_embedding(&vector, &model_id)?;
                hashed.record.embedding_id = Some(embedding_id);
            }
            records.push(hashed.record.clone());
        }
        catalog.upsert_files(&records)?;

        for hashed in batch.iter() {
            let root_id = hashed.record.root_id;
            trackers
                .entry(root_id)
                .or_insert_with(OrderTracker::new)
                .committed(hashed.seq, hashed.record.relative_path.clone());
            *per_root_bytes.entry(root_id).or_insert(0) += hashed.bytes_hashed;
            stats.committed.fetch_add(1, Ordering::SeqCst);
            stats.bytes_hashed.fetch_add(hashed.bytes_hashed, Ordering::SeqCst);
        }
        batch.clear();
        Ok(())
    };

    // The checkpoint records the contiguous prefix only (`next_seq`), so a
    // resume that replays from the watermark never double-counts.
    let write_checkpoints = |trackers: &HashMap<RootId, OrderTracker>,
                             per_root_bytes: &HashMap<RootId, u64>|
     -> Result<()> {
        for (root_id, tracker) in trackers {
            let resumed_from = resume_watermarks.get(root_id);
            let Some(watermark) = tracker.watermark.clone().or_else(|| resumed_from.cloned())
            else {
                continue;
            };
            let Some(root_path) = root_paths.get(root_id) else {
                continue;
            };
            let (base_visited, base_bytes) =
                resume_base.get(root_id).copied().unwrap_or((0, 0));
            let checkpoint = ScanCheckpoint {
                root_id: *root_id,
                root_path: root_path.clone(),
                last_completed_subpath: watermark,
                epoch,
                visited_count: base_visited + tracker.next_seq,
                bytes_hashed: base_bytes + per_root_bytes.get(root_id).copied().unwrap_or(0),
                hash_algo: algo,
            };
            catalog.save_checkpoint(&checkpoint)?;
        }
        Ok(())
    };

    loop {
        match record_rx.recv_timeout(WRITER_POLL) {
            Ok(hashed) => {
                batch.push(hashed);
                if batch.len() >= batch_size {
                    commit_batch(&mut batch, &mut trackers, &mut per_root_bytes)?;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        if last_checkpoint.elapsed() >= checkpoint_every {
            commit_batch(&mut batch, &mut trackers, &mut per_root_bytes)?;
            write_checkpoints(&trackers, &per_root_bytes)?;
            last_checkpoint = Instant::now();
        }
    }

    // Shutdown (graceful or cancelled): commit the in-flight batch and
    // leave a final checkpoint behind.
    commit_batch(&mut batch, &mut trackers, &mut per_root_bytes)?;
    write_checkpoints(&trackers, &per_root_bytes)?;
    if cancel.is_cancelled() {
        debug!("Writer shut down after cancellation at epoch {}", epoch);
    }
    Ok(())
}
