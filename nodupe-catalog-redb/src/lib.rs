//! # NoDupe Catalog - redb
//!
//! Embedded ACID catalog for the deduplication core, backed by redb.
//!
//! This crate provides:
//! - File records with secondary indexes by key, size and content hash
//! - Embedding storage with refcounts
//! - The append-only transaction log behind apply/verify/rollback
//! - Scan checkpoints and snapshot refcounts
//! - Versioned, forward-only, transactional schema migrations
//! - Postcard serialization for compact row storage
//!
//! Readers run under redb's MVCC snapshots; there is a single writer at a
//! time and commits are fsync'd before returning unless group commit is
//! configured.
//!
//! ## Example
//!
//! ```no_run
//! use nodupe_catalog_redb::RedbCatalog;
//! use std::path::Path;
//!
//! # fn example() -> nodupe_core::Result<()> {
//! let catalog = RedbCatalog::open(Path::new("./nodupe.redb"), 0)?;
//! # Ok(())
//! # }
//! ```

use std::path::Path;

use redb::{Database, Durability, ReadTransaction, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use nodupe_core::error::{Error, Result};
use nodupe_core::types::{Transaction, TxnState};

mod checkpoints;
mod compact;
mod embeddings;
mod files;
mod migrations;
mod roots;
mod tables;
mod txns;


pub use tables::SCHEMA_VERSION;

/// Maximum size accepted when deserializing a file record (1 MiB).
///
/// Guards against corrupt rows exhausting memory.
pub const MAX_ROW_SIZE: usize = 1_000_000;

/// Maximum size accepted when deserializing an embedding row (4 MiB).
pub const MAX_EMBEDDING_ROW_SIZE: usize = 4_000_000;

/// redb-backed catalog.
pub struct RedbCatalog {
    pub(crate) db: Database,
    durability: Durability,
}

impl RedbCatalog {
    /// Open (or create) the catalog, run pending migrations, and mark any
    /// transaction left `open` by a crash as `partial`.
    ///
    /// `group_commit_ms == 0` keeps every commit fsync'd; a positive value
    /// opts into redb's eventual durability (bounded flush window).
    pub fn open(path: &Path, group_commit_ms: u32) -> Result<Self> {
        info!("Opening catalog at {}", path.display());
        let db = Database::create(path)
            .map_err(|e| Error::Catalog(format!("Failed to open catalog database: {e}")))?;

        let durability = if group_commit_ms == 0 {
            Durability::Immediate
        } else {
            Durability::None
        };

        let catalog = Self { db, durability };
        migrations::migrate(&catalog)?;
        catalog.recover_incomplete_txns()?;
        Ok(catalog)
    }

    pub(crate) fn begin_write(&self) -> Result<WriteTransaction> {
        let mut txn = self
            .db
            .begin_write()
            .map_err(|e| Error::Catalog(format!("Failed to begin write transaction: {e}")))?;
        txn.set_durability(self.durability);
        Ok(txn)
    }

    pub(crate) fn begin_read(&self) -> Result<ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| Error::Catalog(format!("Failed to begin read transaction: {e}")))
    }

    pub(crate) fn commit(txn: WriteTransaction) -> Result<()> {
        txn.commit()
            .map_err(|e| Error::Catalog(format!("Failed to commit transaction: {e}")))
    }

    /// Crash recovery: an `open` transaction at open time means the
    /// process died mid-apply. It becomes terminal `partial` and is left
    /// for the verifier.
    fn recover_incomplete_txns(&self) -> Result<()> {
        let open_ids: Vec<String> = {
            let read = self.begin_read()?;
            let table = read
                .open_table(tables::TXNS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
            let mut ids = Vec::new();
            for item in table
                .iter()
                .map_err(|e| Error::Catalog(format!("Failed to iterate txns: {e}")))?
            {
                let (key, value) = item
                    .map_err(|e| Error::Catalog(format!("Failed to read txn row: {e}")))?;
                let txn: Transaction = decode("transaction", value.value())?;
                if txn.state == TxnState::Open {
                    ids.push(key.value().to_string());
                }
            }
            ids
        };

        if open_ids.is_empty() {
            return Ok(());
        }

        let write = self.begin_write()?;
        {
            let mut table = write
                .open_table(tables::TXNS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;
            for id in &open_ids {
                let mut txn: Transaction = {
                    let guard = table
                        .get(id.as_str())
                        .map_err(|e| Error::Catalog(format!("Failed to get txn: {e}")))?
                        .ok_or_else(|| Error::CatalogCorrupt(format!("txn {id} vanished")))?;
                    decode("transaction", guard.value())?
                };
                warn!(
                    "Transaction {} was left open by a previous run; marking partial",
                    id
                );
                txn.state = TxnState::Partial;
                txn.finished_at = Some(chrono::Utc::now());
                let bytes = encode("transaction", &txn)?;
                table
                    .insert(id.as_str(), bytes.as_slice())
                    .map_err(|e| Error::Catalog(format!("Failed to update txn: {e}")))?;
            }
        }
        Self::commit(write)
    }
}

// ============================================================================
// Row serialization
// ============================================================================

pub(crate) fn encode<T: Serialize>(what: &str, value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value)
        .map_err(|e| Error::Catalog(format!("Failed to serialize {what}: {e}")))
}

pub(crate) fn decode<T: DeserializeOwned>(what: &str, bytes: &[u8]) -> Result<T> {
    if bytes.len() > MAX_EMBEDDING_ROW_SIZE {
        return Err(Error::CatalogCorrupt(format!(
            "{what} row of {} bytes exceeds the deserialization limit",
            bytes.len()
        )));
    }
    postcard::from_bytes(bytes)
        .map_err(|e| Error::CatalogCorrupt(format!("Failed to deserialize {what}: {e}")))
}

// ============================================================================
// Catalog trait
// ============================================================================

impl nodupe_core::Catalog for RedbCatalog {
    fn intern_root(&self, path: &Path) -> Result<nodupe_core::RootId> {
        self.intern_root_impl(path)
    }

    fn root_path(&self, root_id: nodupe_core::RootId) -> Result<Option<std::path::PathBuf>> {
        self.root_path_impl(root_id)
    }

    fn list_roots(&self) -> Result<Vec<(nodupe_core::RootId, std::path::PathBuf)>> {
        self.list_roots_impl()
    }

    fn epoch(&self) -> Result<u64> {
        self.meta_get(tables::META_EPOCH)
    }

    fn begin_epoch(&self) -> Result<u64> {
        self.bump_epoch()
    }

    fn upsert_file(&self, record: &nodupe_core::FileRecord) -> Result<nodupe_core::FileId> {
        Ok(self.upsert_files_impl(std::slice::from_ref(record))?[0])
    }

    fn upsert_files(&self, records: &[nodupe_core::FileRecord]) -> Result<Vec<nodupe_core::FileId>> {
        self.upsert_files_impl(records)
    }

    fn get_file(&self, file_id: nodupe_core::FileId) -> Result<Option<nodupe_core::FileRecord>> {
        self.get_file_impl(file_id)
    }

    fn find_by_key(
        &self,
        root_id: nodupe_core::RootId,
        relative_path: &str,
    ) -> Result<Option<nodupe_core::FileRecord>> {
        self.find_by_key_impl(root_id, relative_path)
    }

    fn list_files(&self, root_id: Option<nodupe_core::RootId>) -> Result<Vec<nodupe_core::FileRecord>> {
        self.list_files_impl(root_id)
    }

    fn iter_size_buckets(&self, min_bucket_size: usize) -> Result<Vec<nodupe_core::catalog::SizeBucket>> {
        self.iter_size_buckets_impl(min_bucket_size)
    }

    fn iter_hash_buckets(
        &self,
        hash_algo: nodupe_core::HashAlgo,
        min_bucket_size: usize,
    ) -> Result<Vec<nodupe_core::catalog::HashBucket>> {
        self.iter_hash_buckets_impl(hash_algo, min_bucket_size)
    }

    fn mark_missing(&self, root_id: nodupe_core::RootId, epoch: u64) -> Result<u64> {
        self.mark_missing_impl(root_id, epoch)
    }

    fn insert_embedding(&self, vector: &[f32], model_id: &str) -> Result<nodupe_core::EmbeddingId> {
        self.insert_embedding_impl(vector, model_id)
    }

    fn get_embedding(
        &self,
        embedding_id: nodupe_core::EmbeddingId,
    ) -> Result<Option<nodupe_core::EmbeddingRecord>> {
        self.get_embedding_impl(embedding_id)
    }

    fn list_embeddings(&self) -> Result<Vec<(nodupe_core::EmbeddingId, Vec<f32>)>> {
        self.list_embeddings_impl()
    }

    fn store_plan(&self, plan: &nodupe_core::Plan) -> Result<()> {
        self.store_plan_impl(plan)
    }

    fn get_plan(&self, plan_id: nodupe_core::PlanId) -> Result<Option<nodupe_core::Plan>> {
        self.get_plan_impl(plan_id)
    }

    fn begin_txn(&self, plan_id: nodupe_core::PlanId) -> Result<nodupe_core::TxnId> {
        self.begin_txn_impl(plan_id)
    }

    fn append_txn_entry(&self, entry: &nodupe_core::TxnEntry) -> Result<()> {
        self.append_txn_entry_impl(entry)
    }

    fn set_txn_entry_state(
        &self,
        txn_id: nodupe_core::TxnId,
        seq: u32,
        post_state: nodupe_core::PostState,
        error_code: Option<String>,
    ) -> Result<()> {
        self.set_txn_entry_state_impl(txn_id, seq, post_state, error_code)
    }

    fn finalize_txn(&self, txn_id: nodupe_core::TxnId, state: TxnState) -> Result<()> {
        self.finalize_txn_impl(txn_id, state)
    }

    fn get_txn(&self, txn_id: nodupe_core::TxnId) -> Result<Option<Transaction>> {
        self.get_txn_impl(txn_id)
    }

    fn txn_entries(&self, txn_id: nodupe_core::TxnId) -> Result<Vec<nodupe_core::TxnEntry>> {
        self.txn_entries_impl(txn_id)
    }

    fn list_txns(&self, state_filter: Option<TxnState>) -> Result<Vec<Transaction>> {
        self.list_txns_impl(state_filter)
    }

    fn snapshot_ref(&self, content_hash: &str, delta: i64) -> Result<u64> {
        self.snapshot_ref_impl(content_hash, delta)
    }

    fn snapshot_refcount(&self, content_hash: &str) -> Result<u64> {
        self.snapshot_refcount_impl(content_hash)
    }

    fn pinned_snapshots(&self) -> Result<Vec<String>> {
        self.pinned_snapshots_impl()
    }

    fn list_reclaimable_txns(
        &self,
        cutoff: chrono::DateTime<chrono::Utc>,
        keep_latest: u32,
    ) -> Result<Vec<nodupe_core::TxnId>> {
        self.list_reclaimable_txns_impl(cutoff, keep_latest)
    }

    fn mark_reclaimed(&self, txn_id: nodupe_core::TxnId) -> Result<()> {
        self.mark_reclaimed_impl(txn_id)
    }

    fn save_checkpoint(&self, checkpoint: &nodupe_core::ScanCheckpoint) -> Result<()> {
        self.save_checkpoint_impl(checkpoint)
    }

    fn load_checkpoint(
        &self,
        root_id: nodupe_core::RootId,
    ) -> Result<Option<nodupe_core::ScanCheckpoint>> {
        self.load_checkpoint_impl(root_id)
    }

    fn clear_checkpoint(&self, root_id: nodupe_core::RootId) -> Result<()> {
        self.clear_checkpoint_impl(root_id)
    }

    fn compact(&self, older_than_epochs: u64) -> Result<nodupe_core::types::CompactReport> {
        self.compact_impl(older_than_epochs)
    }

    fn statistics(&self) -> Result<nodupe_core::CatalogStatistics> {
        self.statistics_impl()
    }
}
