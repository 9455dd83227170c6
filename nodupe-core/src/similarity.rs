//! Reference similarity index.
//!
//! Exact cosine similarity over a contiguous f32 matrix. Vectors arrive
//! L2-normalized from the catalog, so cosine reduces to a dot product.
//! External approximate backends plug in through [`SimilarityBackend`]
//! without affecting core semantics.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::types::EmbeddingId;

/// Rows processed per batch in a query pass.
const QUERY_BATCH: usize = 1024;

/// A nearest-neighbor backend over embeddings.
///
/// Backends must be deterministic given equal inputs and must not mutate
/// shared state outside `add`/`load`.
pub trait SimilarityBackend: Send + Sync {
    fn add(&mut self, id: EmbeddingId, vector: &[f32]) -> Result<()>;

    /// Top-`k` ids by cosine similarity, threshold-filtered after top-k,
    /// ordered by descending score then ascending id.
    fn query(&self, vector: &[f32], k: usize, threshold: f32)
    -> Result<Vec<(EmbeddingId, f32)>>;

    fn persist(&self, path: &Path) -> Result<()>;

    fn load(&mut self, path: &Path) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct PersistedIndex {
    dim: u16,
    ids: Vec<EmbeddingId>,
    data: Vec<f32>,
}

/// Brute-force in-memory index.
pub struct BruteForceIndex {
    dim: u16,
    ids: Vec<EmbeddingId>,
    /// Row-major `ids.len() x dim` matrix.
    data: Vec<f32>,
}

impl BruteForceIndex {
    pub fn new(dim: u16) -> Self {
        Self {
            dim,
            ids: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dim(&self) -> u16 {
        self.dim
    }

    fn row(&self, idx: usize) -> &[f32] {
        let d = usize::from(self.dim);
        &self.data[idx * d..(idx + 1) * d]
    }

    fn scores(&self, vector: &[f32]) -> Vec<f32> {
        let mut scores = Vec::with_capacity(self.ids.len());
        for batch_start in (0..self.ids.len()).step_by(QUERY_BATCH) {
            let batch_end = (batch_start + QUERY_BATCH).min(self.ids.len());
            for idx in batch_start..batch_end {
                let row = self.row(idx);
                let dot: f32 = row.iter().zip(vector).map(|(a, b)| a * b).sum();
                scores.push(dot);
            }
        }
        scores
    }

    /// Greedy clustering: every vector joins the cluster of the first
    /// unassigned vector it is within `threshold` of. Singleton clusters
    /// are included; callers filter as needed.
    pub fn clusters(&self, threshold: f32) -> Vec<Vec<EmbeddingId>> {
        let mut assigned = vec![false; self.ids.len()];
        let mut clusters = Vec::new();

        for seed in 0..self.ids.len() {
            if assigned[seed] {
                continue;
            }
            assigned[seed] = true;
            let mut members = vec![self.ids[seed]];
            let seed_row = self.row(seed);

            for other in (seed + 1)..self.ids.len() {
                if assigned[other] {
                    continue;
                }
                let dot: f32 = self.row(other).iter().zip(seed_row).map(|(a, b)| a * b).sum();
                if dot >= threshold {
                    assigned[other] = true;
                    members.push(self.ids[other]);
                }
            }
            clusters.push(members);
        }
        clusters
    }
}

impl SimilarityBackend for BruteForceIndex {
    fn add(&mut self, id: EmbeddingId, vector: &[f32]) -> Result<()> {
        if vector.len() != usize::from(self.dim) {
            return Err(Error::InvalidInput(format!(
                "embedding {} has dimension {}, index expects {}",
                id,
                vector.len(),
                self.dim
            )));
        }
        self.ids.push(id);
        self.data.extend_from_slice(vector);
        Ok(())
    }

    fn query(
        &self,
        vector: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<(EmbeddingId, f32)>> {
        if vector.len() != usize::from(self.dim) {
            return Err(Error::InvalidInput(format!(
                "query vector has dimension {}, index expects {}",
                vector.len(),
                self.dim
            )));
        }

        let scores = self.scores(vector);
        let mut ranked: Vec<(EmbeddingId, f32)> = self
            .ids
            .iter()
            .copied()
            .zip(scores)
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        ranked.retain(|(_, score)| *score >= threshold);
        Ok(ranked)
    }

    fn persist(&self, path: &Path) -> Result<()> {
        let persisted = PersistedIndex {
            dim: self.dim,
            ids: self.ids.clone(),
            data: self.data.clone(),
        };
        let bytes = postcard::to_allocvec(&persisted)
            .map_err(|e| Error::Catalog(format!("Failed to serialize similarity index: {e}")))?;
        fs::write(path, bytes)?;
        info!(
            "Persisted similarity index ({} vectors) to {}",
            self.ids.len(),
            path.display()
        );
        Ok(())
    }

    fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = fs::read(path)?;
        let persisted: PersistedIndex = postcard::from_bytes(&bytes)
            .map_err(|e| Error::Catalog(format!("Failed to deserialize similarity index: {e}")))?;
        if persisted.data.len() != persisted.ids.len() * usize::from(persisted.dim) {
            return Err(Error::CatalogCorrupt(format!(
                "similarity index at {} has inconsistent dimensions",
                path.display()
            )));
        }
        self.dim = persisted.dim;
        self.ids = persisted.ids;
        self.data = persisted.data;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::l2_normalize;

    fn unit(v: &[f32]) -> Vec<f32> {
        let mut v = v.to_vec();
        l2_normalize(&mut v);
        v
    }

    #[test]
    fn query_ranks_by_cosine() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, &unit(&[1.0, 0.0])).unwrap();
        index.add(2, &unit(&[0.0, 1.0])).unwrap();
        index.add(3, &unit(&[1.0, 0.2])).unwrap();

        let results = index.query(&unit(&[1.0, 0.0]), 3, -1.0).unwrap();
        assert_eq!(results[0].0, 1);
        assert_eq!(results[1].0, 3);
        assert_eq!(results[2].0, 2);
    }

    #[test]
    fn threshold_applies_after_top_k() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, &unit(&[1.0, 0.0])).unwrap();
        index.add(2, &unit(&[0.9, 0.1])).unwrap();
        index.add(3, &unit(&[0.0, 1.0])).unwrap();

        let results = index.query(&unit(&[1.0, 0.0]), 2, 0.5).unwrap();
        // Orthogonal vector is cut by top-k, near-parallel ones survive.
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, s)| *s >= 0.5));
    }

    #[test]
    fn dimension_mismatch_is_invalid_input() {
        let mut index = BruteForceIndex::new(3);
        assert!(index.add(1, &[1.0, 0.0]).is_err());
        assert!(index.query(&[1.0], 1, 0.0).is_err());
    }

    #[test]
    fn persist_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.bin");

        let mut index = BruteForceIndex::new(2);
        index.add(10, &unit(&[1.0, 0.0])).unwrap();
        index.add(20, &unit(&[0.0, 1.0])).unwrap();
        index.persist(&path).unwrap();

        let mut loaded = BruteForceIndex::new(0);
        loaded.load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.dim(), 2);

        let results = loaded.query(&unit(&[1.0, 0.0]), 1, 0.0).unwrap();
        assert_eq!(results[0].0, 10);
    }

    #[test]
    fn clusters_group_similar_vectors() {
        let mut index = BruteForceIndex::new(2);
        index.add(1, &unit(&[1.0, 0.0])).unwrap();
        index.add(2, &unit(&[1.0, 0.01])).unwrap();
        index.add(3, &unit(&[0.0, 1.0])).unwrap();

        let clusters = index.clusters(0.99);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0], vec![1, 2]);
        assert_eq!(clusters[1], vec![3]);
    }
}
