//! File record storage and secondary indexes.

use redb::ReadableTable;
use tracing::debug;

use nodupe_core::catalog::{HashBucket, SizeBucket};
use nodupe_core::error::{Error, Result};
use nodupe_core::types::{EmbeddingRecord, FileId, FileRecord, FileState, RootId};
use nodupe_core::HashAlgo;

use crate::tables::{
    hash_index_key, EMBEDDINGS_TABLE, FILES_BY_KEY_TABLE, FILES_TABLE, HASH_INDEX_TABLE,
    META_NEXT_FILE_ID, META_TABLE, SIZE_INDEX_TABLE,
};
use crate::{decode, encode, RedbCatalog};

impl RedbCatalog {
    /// Insert or update a batch of records in one write transaction.
    /// Visibility is all-or-nothing.
    pub(crate) fn upsert_files_impl(&self, records: &[FileRecord]) -> Result<Vec<FileId>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let write = self.begin_write()?;
        let mut assigned = Vec::with_capacity(records.len());
        {
            let mut meta = write
                .open_table(META_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open meta table: {e}")))?;
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

            for record in records {
                let file_id = if record.file_id != 0 {
                    record.file_id
                } else {
                    let existing = by_key
                        .get((record.root_id, record.relative_path.as_str()))
                        .map_err(|e| Error::Catalog(format!("Failed to look up key: {e}")))?
                        .map(|guard| guard.value());
                    match existing {
                        Some(id) => id,
                        None => Self::allocate_id(&mut meta, META_NEXT_FILE_ID, 1)?,
                    }
                };

                let old: Option<FileRecord> = files
                    .get(file_id)
                    .map_err(|e| Error::Catalog(format!("Failed to read file row: {e}")))?
                    .map(|guard| decode("file record", guard.value()))
                    .transpose()?;

                if let Some(old) = &old {
                    size_index
                        .remove((old.size, file_id))
                        .map_err(|e| Error::Catalog(format!("Failed to drop size index: {e}")))?;
                    if let (Some(algo), Some(hash)) = (old.hash_algo, old.full_hash.as_deref()) {
                        let key = hash_index_key(algo, hash);
                        hash_index.remove((key.as_str(), file_id)).map_err(|e| {
                            Error::Catalog(format!("Failed to drop hash index: {e}"))
                        })?;
                    }
                    if old.embedding_id != record.embedding_id {
                        if let Some(id) = old.embedding_id {
                            adjust_embedding_refcount(&mut embeddings, id, -1)?;
                        }
                        if let Some(id) = record.embedding_id {
                            adjust_embedding_refcount(&mut embeddings, id, 1)?;
                        }
                    }
                } else if let Some(id) = record.embedding_id {
                    adjust_embedding_refcount(&mut embeddings, id, 1)?;
                }

                let mut stored = record.clone();
                stored.file_id = file_id;
                let bytes = encode("file record", &stored)?;
                files
                    .insert(file_id, bytes.as_slice())
                    .map_err(|e| Error::Catalog(format!("Failed to insert file row: {e}")))?;
                by_key
                    .insert((stored.root_id, stored.relative_path.as_str()), file_id)
                    .map_err(|e| Error::Catalog(format!("Failed to insert key index: {e}")))?;
                size_index
                    .insert((stored.size, file_id), ())
                    .map_err(|e| Error::Catalog(format!("Failed to insert size index: {e}")))?;
                if let (Some(algo), Some(hash)) = (stored.hash_algo, stored.full_hash.as_deref()) {
                    let key = hash_index_key(algo, hash);
                    hash_index
                        .insert((key.as_str(), file_id), stored.size)
                        .map_err(|e| Error::Catalog(format!("Failed to insert hash index: {e}")))?;
                }

                assigned.push(file_id);
            }
        }
        Self::commit(write)?;
        Ok(assigned)
    }

    pub(crate) fn get_file_impl(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(FILES_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open files table: {e}")))?;
        table
            .get(file_id)
            .map_err(|e| Error::Catalog(format!("Failed to read file row: {e}")))?
            .map(|guard| decode("file record", guard.value()))
            .transpose()
    }

    pub(crate) fn find_by_key_impl(
        &self,
        root_id: RootId,
        relative_path: &str,
    ) -> Result<Option<FileRecord>> {
        let read = self.begin_read()?;
        let by_key = read
            .open_table(FILES_BY_KEY_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open key index: {e}")))?;
        let Some(file_id) = by_key
            .get((root_id, relative_path))
            .map_err(|e| Error::Catalog(format!("Failed to look up key: {e}")))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let files = read
            .open_table(FILES_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open files table: {e}")))?;
        files
            .get(file_id)
            .map_err(|e| Error::Catalog(format!("Failed to read file row: {e}")))?
            .map(|guard| decode("file record", guard.value()))
            .transpose()
    }

    pub(crate) fn list_files_impl(&self, root_id: Option<RootId>) -> Result<Vec<FileRecord>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(FILES_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open files table: {e}")))?;
        let mut records = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate files: {e}")))?
        {
            let (_, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read file row: {e}")))?;
            let record: FileRecord = decode("file record", value.value())?;
            if root_id.is_none_or(|r| record.root_id == r) {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub(crate) fn iter_size_buckets_impl(&self, min_bucket_size: usize) -> Result<Vec<SizeBucket>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(SIZE_INDEX_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open size index: {e}")))?;

        let mut buckets: Vec<SizeBucket> = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate size index: {e}")))?
        {
            let (key, _) =
                item.map_err(|e| Error::Catalog(format!("Failed to read size row: {e}")))?;
            let (size, file_id) = key.value();
            match buckets.last_mut() {
                Some((last_size, members)) if *last_size == size => members.push(file_id),
                _ => buckets.push((size, vec![file_id])),
            }
        }
        buckets.retain(|(_, members)| members.len() >= min_bucket_size);
        Ok(buckets)
    }

    pub(crate) fn iter_hash_buckets_impl(
        &self,
        hash_algo: HashAlgo,
        min_bucket_size: usize,
    ) -> Result<Vec<HashBucket>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(HASH_INDEX_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open hash index: {e}")))?;

        let prefix = format!("{}:", hash_algo.name());
        let mut buckets: Vec<(String, u64, Vec<FileId>)> = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate hash index: {e}")))?
        {
            let (key, size) =
                item.map_err(|e| Error::Catalog(format!("Failed to read hash row: {e}")))?;
            let (hash_key, file_id) = key.value();
            if !hash_key.starts_with(&prefix) {
                continue;
            }
            match buckets.last_mut() {
                Some((last_key, _, members)) if *last_key == hash_key => members.push(file_id),
                _ => buckets.push((hash_key.to_string(), size.value(), vec![file_id])),
            }
        }

        let mut result = Vec::new();
        for (hash_key, size, members) in buckets {
            if members.len() < min_bucket_size {
                continue;
            }
            let hex_part = &hash_key[prefix.len()..];
            let hash = hex::decode(hex_part).map_err(|e| {
                Error::CatalogCorrupt(format!("bad hash index key {hash_key:?}: {e}"))
            })?;
            result.push((hash, size, members));
        }
        Ok(result)
    }

    /// Mark everything under `root_id` not seen by `epoch` as missing.
    pub(crate) fn mark_missing_impl(&self, root_id: RootId, epoch: u64) -> Result<u64> {
        let stale: Vec<FileRecord> = self
            .list_files_impl(Some(root_id))?
            .into_iter()
            .filter(|r| r.scan_epoch < epoch && r.state != FileState::Missing)
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        let mut updated = Vec::with_capacity(stale.len());
        for mut record in stale {
            debug!("Marking {} missing", record.relative_path);
            record.state = FileState::Missing;
            updated.push(record);
        }
        let count = updated.len() as u64;
        self.upsert_files_impl(&updated)?;
        Ok(count)
    }
}

/// Adjust an embedding's refcount inside an open write transaction.
/// Refcounts never go below zero; rows are removed by `compact`.
pub(crate) fn adjust_embedding_refcount(
    table: &mut redb::Table<u64, &[u8]>,
    embedding_id: u64,
    delta: i64,
) -> Result<()> {
    let record: Option<EmbeddingRecord> = table
        .get(embedding_id)
        .map_err(|e| Error::Catalog(format!("Failed to read embedding: {e}")))?
        .map(|guard| decode("embedding", guard.value()))
        .transpose()?;
    let Some(mut record) = record else {
        return Ok(());
    };

    record.refcount = if delta >= 0 {
        record.refcount.saturating_add(delta as u64)
    } else {
        record.refcount.saturating_sub(delta.unsigned_abs())
    };

    let bytes = encode("embedding", &record)?;
    table
        .insert(embedding_id, bytes.as_slice())
        .map_err(|e| Error::Catalog(format!("Failed to update embedding: {e}")))?;
    Ok(())
}
