//! Catalog maintenance: compaction and statistics.

use redb::{ReadableTable, ReadableTableMetadata};
use tracing::info;

use nodupe_core::error::{Error, Result};
use nodupe_core::types::{CatalogStatistics, CompactReport, EmbeddingRecord, FileRecord, FileState};

use crate::tables::{
    hash_index_key, EMBEDDINGS_TABLE, FILES_BY_KEY_TABLE, FILES_TABLE, HASH_INDEX_TABLE,
    META_EPOCH, SIZE_INDEX_TABLE, TXNS_TABLE,
};
use crate::{decode, RedbCatalog};

impl RedbCatalog {
    /// Hard-delete `missing` records older than `older_than_epochs` and
    /// drop embeddings whose refcount reached zero.
    pub(crate) fn compact_impl(&self, older_than_epochs: u64) -> Result<CompactReport> {
        let epoch = self.meta_get(META_EPOCH)?;
        let cutoff = epoch.saturating_sub(older_than_epochs);

        let doomed: Vec<FileRecord> = self
            .list_files_impl(None)?
            .into_iter()
            .filter(|r| r.state == FileState::Missing && r.scan_epoch < cutoff)
            .collect();

        let mut report = CompactReport::default();
        let write = self.begin_write()?;
        {
            let mut files = write
                .open_table(FILES_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open files table: {e}")))?;
            let mut by_key = write
                .open_table(FILES_BY_KEY_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open key index: {e}")))?;
            let mut size_index = write
                .open_table(SIZE_INDEX_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open size index: {e}")))?;
            let mut hash_index = write
                .open_table(HASH_INDEX_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open hash index: {e}")))?;
            let mut embeddings = write
                .open_table(EMBEDDINGS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open embeddings table: {e}")))?;

            for record in &doomed {
                files
                    .remove(record.file_id)
                    .map_err(|e| Error::Catalog(format!("Failed to remove file row: {e}")))?;
                by_key
                    .remove((record.root_id, record.relative_path.as_str()))
                    .map_err(|e| Error::Catalog(format!("Failed to remove key index: {e}")))?;
                size_index
                    .remove((record.size, record.file_id))
                    .map_err(|e| Error::Catalog(format!("Failed to remove size index: {e}")))?;
                if let (Some(algo), Some(hash)) = (record.hash_algo, record.full_hash.as_deref())
                {
                    let key = hash_index_key(algo, hash);
                    hash_index
                        .remove((key.as_str(), record.file_id))
                        .map_err(|e| Error::Catalog(format!("Failed to remove hash index: {e}")))?;
                }
                if let Some(embedding_id) = record.embedding_id {
                    crate::files::adjust_embedding_refcount(&mut embeddings, embedding_id, -1)?;
                }
                report.files_removed += 1;
            }

            // Sweep embeddings that nothing references anymore.
            let orphaned: Vec<u64> = {
                let mut ids = Vec::new();
                for item in embeddings
                    .iter()
                    .map_err(|e| Error::Catalog(format!("Failed to iterate embeddings: {e}")))?
                {
                    let (key, value) = item
                        .map_err(|e| Error::Catalog(format!("Failed to read embedding: {e}")))?;
                    let record: EmbeddingRecord = decode("embedding", value.value())?;
                    if record.refcount == 0 {
                        ids.push(key.value());
                    }
                }
                ids
            };
            for embedding_id in orphaned {
                embeddings
                    .remove(embedding_id)
                    .map_err(|e| Error::Catalog(format!("Failed to remove embedding: {e}")))?;
                report.embeddings_removed += 1;
            }
        }
        Self::commit(write)?;

        info!(
            "Compaction removed {} file rows and {} embeddings (cutoff epoch {})",
            report.files_removed, report.embeddings_removed, cutoff
        );
        Ok(report)
    }

    pub(crate) fn statistics_impl(&self) -> Result<CatalogStatistics> {
        let read = self.begin_read()?;
        let files = read
            .open_table(FILES_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open files table: {e}")))?;
        let embeddings = read
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open embeddings table: {e}")))?;
        let txns = read
            .open_table(TXNS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open txns table: {e}")))?;

        let file_count = files
            .len()
            .map_err(|e| Error::Catalog(format!("Failed to count files: {e}")))?;
        let embedding_count = embeddings
            .len()
            .map_err(|e| Error::Catalog(format!("Failed to count embeddings: {e}")))?;
        let txn_count = txns
            .len()
            .map_err(|e| Error::Catalog(format!("Failed to count txns: {e}")))?;

        let mut missing_count = 0u64;
        for item in files
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate files: {e}")))?
        {
            let (_, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read file row: {e}")))?;
            let record: FileRecord = decode("file record", value.value())?;
            if record.state == FileState::Missing {
                missing_count += 1;
            }
        }

        Ok(CatalogStatistics {
            file_count,
            missing_count,
            embedding_count,
            txn_count,
            epoch: self.meta_get(META_EPOCH)?,
        })
    }
}
