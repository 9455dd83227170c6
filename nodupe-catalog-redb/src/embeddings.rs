//! Embedding vector storage.
//!
//! Vectors are L2-normalized before they hit disk; refcounts track how
//! many file rows reference each vector and are maintained by the file
//! upsert path.

use redb::ReadableTable;
use tracing::debug;

use nodupe_core::embed::l2_normalize;
use nodupe_core::error::{Error, Result};
use nodupe_core::types::{EmbeddingId, EmbeddingRecord};

use crate::tables::{EMBEDDINGS_TABLE, META_NEXT_EMBEDDING_ID, META_TABLE};
use crate::{decode, encode, RedbCatalog};

impl RedbCatalog {
    /// Insert a vector; the caller's file upsert takes the reference.
    /// Returns the new embedding id.
    pub(crate) fn insert_embedding_impl(
        &self,
        vector: &[f32],
        model_id: &str,
    ) -> Result<EmbeddingId> {
        if vector.is_empty() {
            return Err(Error::InvalidInput("embedding vector is empty".into()));
        }

        let mut stored = vector.to_vec();
        let norm = l2_normalize(&mut stored);

        let write = self.begin_write()?;
        let embedding_id = {
            let mut meta = write
                .open_table(META_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open meta table: {e}")))?;
            let mut table = write
                .open_table(EMBEDDINGS_TABLE)
                .map_err(|e| Error::Catalog(format!("Failed to open embeddings table: {e}")))?;

            let embedding_id = Self::allocate_id(&mut meta, META_NEXT_EMBEDDING_ID, 1)?;
            let record = EmbeddingRecord {
                embedding_id,
                model_id: model_id.to_string(),
                dim: stored.len() as u16,
                norm,
                vector: stored,
                refcount: 0,
            };
            let bytes = encode("embedding", &record)?;
            table
                .insert(embedding_id, bytes.as_slice())
                .map_err(|e| Error::Catalog(format!("Failed to insert embedding: {e}")))?;
            embedding_id
        };
        Self::commit(write)?;

        debug!("Stored embedding {} for model {}", embedding_id, model_id);
        Ok(embedding_id)
    }

    pub(crate) fn get_embedding_impl(
        &self,
        embedding_id: EmbeddingId,
    ) -> Result<Option<EmbeddingRecord>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open embeddings table: {e}")))?;
        table
            .get(embedding_id)
            .map_err(|e| Error::Catalog(format!("Failed to read embedding: {e}")))?
            .map(|guard| decode("embedding", guard.value()))
            .transpose()
    }

    pub(crate) fn list_embeddings_impl(&self) -> Result<Vec<(EmbeddingId, Vec<f32>)>> {
        let read = self.begin_read()?;
        let table = read
            .open_table(EMBEDDINGS_TABLE)
            .map_err(|e| Error::Catalog(format!("Failed to open embeddings table: {e}")))?;
        let mut embeddings = Vec::new();
        for item in table
            .iter()
            .map_err(|e| Error::Catalog(format!("Failed to iterate embeddings: {e}")))?
        {
            let (_, value) =
                item.map_err(|e| Error::Catalog(format!("Failed to read embedding row: {e}")))?;
            let record: EmbeddingRecord = decode("embedding", value.value())?;
            embeddings.push((record.embedding_id, record.vector));
        }
        Ok(embeddings)
    }
}
