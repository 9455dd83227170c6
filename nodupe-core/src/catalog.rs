//! Storage seam for the catalog.
//!
//! The core talks to persistence exclusively through this trait; the
//! shipping implementation is `nodupe-catalog-redb`. Implementations
//! guarantee serializable reads within a query, snapshot isolation between
//! readers and the single writer, and durable commits.

use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::hash::HashAlgo;
use crate::types::{
    CatalogStatistics, CompactReport, EmbeddingId, EmbeddingRecord, FileId, FileRecord, Plan,
    PlanId, RootId, ScanCheckpoint, Transaction, TxnEntry, TxnId, TxnState,
};

/// A size bucket: every file id sharing one size.
pub type SizeBucket = (u64, Vec<FileId>);

/// A hash bucket: `(full_hash, size, members)` for one content class.
pub type HashBucket = (Vec<u8>, u64, Vec<FileId>);

/// ACID catalog operations.
pub trait Catalog: Send + Sync {
    // ========== Roots and epochs ==========

    /// Intern a root path, returning its stable id.
    fn intern_root(&self, path: &Path) -> Result<RootId>;

    fn root_path(&self, root_id: RootId) -> Result<Option<PathBuf>>;

    fn list_roots(&self) -> Result<Vec<(RootId, PathBuf)>>;

    /// Current scan epoch.
    fn epoch(&self) -> Result<u64>;

    /// Increment and return the new scan epoch.
    fn begin_epoch(&self) -> Result<u64>;

    // ========== File records ==========

    /// Insert or update one record by `(root_id, relative_path)`. A zero
    /// `file_id` on insert is replaced by a fresh surrogate; the assigned
    /// id is returned.
    fn upsert_file(&self, record: &FileRecord) -> Result<FileId>;

    /// Batch upsert inside a single write transaction; visibility is
    /// all-or-nothing.
    fn upsert_files(&self, records: &[FileRecord]) -> Result<Vec<FileId>>;

    fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>>;

    fn find_by_key(&self, root_id: RootId, relative_path: &str) -> Result<Option<FileRecord>>;

    /// Every record, optionally restricted to one root.
    fn list_files(&self, root_id: Option<RootId>) -> Result<Vec<FileRecord>>;

    /// Size buckets with at least `min_bucket_size` present members.
    fn iter_size_buckets(&self, min_bucket_size: usize) -> Result<Vec<SizeBucket>>;

    /// Content classes `(full_hash, size)` for one algorithm with at least
    /// `min_bucket_size` present members.
    fn iter_hash_buckets(&self, hash_algo: HashAlgo, min_bucket_size: usize)
    -> Result<Vec<HashBucket>>;

    /// Mark records under `root_id` not seen by `epoch` as missing.
    /// Returns how many rows changed.
    fn mark_missing(&self, root_id: RootId, epoch: u64) -> Result<u64>;

    // ========== Embeddings ==========

    /// Insert an L2-normalized copy of `vector` and return its id.
    fn insert_embedding(&self, vector: &[f32], model_id: &str) -> Result<EmbeddingId>;

    fn get_embedding(&self, embedding_id: EmbeddingId) -> Result<Option<EmbeddingRecord>>;

    /// Every stored embedding id and vector, for building the similarity
    /// index.
    fn list_embeddings(&self) -> Result<Vec<(EmbeddingId, Vec<f32>)>>;

    // ========== Plans ==========

    fn store_plan(&self, plan: &Plan) -> Result<()>;

    fn get_plan(&self, plan_id: PlanId) -> Result<Option<Plan>>;

    // ========== Transaction log ==========

    /// Open a transaction for a plan. Fails with `TransactionAlreadyOpen`
    /// while any other transaction is non-terminal.
    fn begin_txn(&self, plan_id: PlanId) -> Result<TxnId>;

    fn append_txn_entry(&self, entry: &TxnEntry) -> Result<()>;

    /// Update the outcome of an already-appended entry.
    fn set_txn_entry_state(
        &self,
        txn_id: TxnId,
        seq: u32,
        post_state: crate::types::PostState,
        error_code: Option<String>,
    ) -> Result<()>;

    /// Move a transaction to a terminal state.
    fn finalize_txn(&self, txn_id: TxnId, state: TxnState) -> Result<()>;

    fn get_txn(&self, txn_id: TxnId) -> Result<Option<Transaction>>;

    /// Entries of a transaction in ascending `seq`.
    fn txn_entries(&self, txn_id: TxnId) -> Result<Vec<TxnEntry>>;

    fn list_txns(&self, state_filter: Option<TxnState>) -> Result<Vec<Transaction>>;

    // ========== Snapshot refcounts ==========

    /// Adjust the refcount for a snapshot object by `delta`; returns the
    /// new count. Never drops below zero.
    fn snapshot_ref(&self, content_hash: &str, delta: i64) -> Result<u64>;

    fn snapshot_refcount(&self, content_hash: &str) -> Result<u64>;

    /// Hex hashes of every snapshot object referenced by any non-terminal
    /// transaction. These are never garbage-collected.
    fn pinned_snapshots(&self) -> Result<Vec<String>>;

    /// Terminal, not-yet-reclaimed transactions eligible for snapshot GC:
    /// finished before `cutoff`, excluding the newest `keep_latest`.
    fn list_reclaimable_txns(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        keep_latest: u32,
    ) -> Result<Vec<TxnId>>;

    /// Record that snapshot GC has released a transaction's pre-images.
    fn mark_reclaimed(&self, txn_id: TxnId) -> Result<()>;

    // ========== Checkpoints ==========

    fn save_checkpoint(&self, checkpoint: &ScanCheckpoint) -> Result<()>;

    fn load_checkpoint(&self, root_id: RootId) -> Result<Option<ScanCheckpoint>>;

    fn clear_checkpoint(&self, root_id: RootId) -> Result<()>;

    // ========== Maintenance ==========

    /// Remove `missing` records older than `older_than_epochs` and
    /// embeddings whose refcount dropped to zero.
    fn compact(&self, older_than_epochs: u64) -> Result<CompactReport>;

    fn statistics(&self) -> Result<CatalogStatistics>;
}
