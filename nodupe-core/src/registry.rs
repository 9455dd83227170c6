//! Compile-time backend registry.
//!
//! Backends are registered through this declared capability table rather
//! than discovered at runtime; the core asks the registry for a backend by
//! name. No arbitrary code loading happens here.

use crate::embed::{EmbeddingModel, PseudoEmbeddingModel, mime_matches};
use crate::hash::{HashAlgo, HashAlgorithm};

/// Capability table wiring hash algorithms and embedding models.
pub struct BackendRegistry {
    models: Vec<Box<dyn EmbeddingModel>>,
}

impl BackendRegistry {
    /// Registry with the built-in backends: every [`HashAlgo`] plus the
    /// reference pseudo-embedding model.
    pub fn builtin() -> Self {
        Self {
            models: vec![Box::new(PseudoEmbeddingModel::new())],
        }
    }

    /// Registry with no embedding models (hash algorithms are always
    /// available).
    pub fn without_models() -> Self {
        Self { models: Vec::new() }
    }

    pub fn register_model(&mut self, model: Box<dyn EmbeddingModel>) {
        self.models.push(model);
    }

    pub fn hash_algorithm(&self, algo: HashAlgo) -> &'static dyn HashAlgorithm {
        algo.algorithm()
    }

    /// First registered model whose mime patterns accept `mime`.
    pub fn model_for_mime(&self, mime: &str) -> Option<&dyn EmbeddingModel> {
        self.models
            .iter()
            .find(|m| m.mime_patterns().iter().any(|p| mime_matches(p, mime)))
            .map(AsRef::as_ref)
    }

    pub fn model_by_id(&self, id: &str) -> Option<&dyn EmbeddingModel> {
        self.models
            .iter()
            .find(|m| m.id() == id)
            .map(AsRef::as_ref)
    }

    pub fn model_ids(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.id()).collect()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_has_pseudo_model() {
        let registry = BackendRegistry::builtin();
        assert!(registry.model_for_mime("application/octet-stream").is_some());
        assert!(registry.model_by_id(PseudoEmbeddingModel::MODEL_ID).is_some());
    }

    #[test]
    fn empty_registry_matches_nothing() {
        let registry = BackendRegistry::without_models();
        assert!(registry.model_for_mime("image/png").is_none());
    }

    #[test]
    fn every_algo_resolves() {
        let registry = BackendRegistry::builtin();
        for algo in HashAlgo::ALL {
            assert_eq!(registry.hash_algorithm(algo).name(), algo.name());
        }
    }
}
