//! Perceptual embedding models.
//!
//! **⚠️ WARNING: the built-in model is a mock/reference implementation**
//!
//! `PseudoEmbeddingModel` produces deterministic hash-seeded vectors that
//! are NOT perceptually meaningful. It exists so the embedding and
//! similarity plumbing can be exercised end to end without model files:
//! - Unit and integration testing
//! - Development/demonstration purposes
//! - Fallback when no real model is registered
//!
//! Real perceptual models plug in through [`EmbeddingModel`] via the
//! backend registry.

use std::io::Read;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};

/// Epsilon guarding L2 normalization against division by zero.
pub const NORM_EPSILON: f32 = 1e-12;

/// A perceptual embedding backend.
///
/// Backends must be deterministic given equal inputs, must not mutate
/// shared state, and must return promptly from `embed` once the
/// cancellation flag is set.
pub trait EmbeddingModel: Send + Sync {
    /// Stable model identifier recorded on every vector it produces.
    fn id(&self) -> &str;

    /// Mime patterns this model accepts, e.g. `"image/*"` or
    /// `"application/octet-stream"`.
    fn mime_patterns(&self) -> &[&str];

    /// Vector dimensionality; fixed per model id.
    fn dim(&self) -> u16;

    fn embed(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<Vec<f32>>;
}

/// Whether `pattern` (possibly `type/*` or `*/*`) matches a mime string.
pub fn mime_matches(pattern: &str, mime: &str) -> bool {
    if pattern == "*/*" {
        return true;
    }
    match pattern.strip_suffix("/*") {
        Some(prefix) => mime
            .split('/')
            .next()
            .is_some_and(|top| top.eq_ignore_ascii_case(prefix)),
        None => pattern.eq_ignore_ascii_case(mime),
    }
}

/// L2-normalize in place; returns the pre-normalization magnitude.
pub fn l2_normalize(vector: &mut [f32]) -> f32 {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    let divisor = norm.max(NORM_EPSILON);
    for x in vector.iter_mut() {
        *x /= divisor;
    }
    norm
}

/// Deterministic hash-seeded pseudo-embedding over sampled file bytes.
///
/// Same bytes, same vector; different bytes, almost surely different
/// vectors. Similarity between outputs is essentially random and carries
/// no perceptual meaning.
pub struct PseudoEmbeddingModel {
    dim: u16,
}

impl PseudoEmbeddingModel {
    pub const MODEL_ID: &'static str = "pseudo-384";

    pub fn new() -> Self {
        Self { dim: 384 }
    }
}

impl Default for PseudoEmbeddingModel {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingModel for PseudoEmbeddingModel {
    fn id(&self) -> &str {
        Self::MODEL_ID
    }

    fn mime_patterns(&self) -> &[&str] {
        &["*/*"]
    }

    fn dim(&self) -> u16 {
        self.dim
    }

    fn embed(&self, reader: &mut dyn Read, cancel: &CancelToken) -> Result<Vec<f32>> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::Hasher;

        let mut hasher = DefaultHasher::new();
        let mut buf = [0u8; 8192];
        loop {
            cancel.check()?;
            let n = reader.read(&mut buf).map_err(Error::Io)?;
            if n == 0 {
                break;
            }
            hasher.write(&buf[..n]);
        }
        let hash = hasher.finish();

        // Simple PRNG seeded from the content hash, range [-1, 1].
        let mut embedding = Vec::with_capacity(usize::from(self.dim));
        let mut seed = hash;
        for _ in 0..self.dim {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let value = ((seed >> 16) as f32) / 32_768.0 - 1.0;
            embedding.push(value);
        }

        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_model_is_deterministic() {
        let model = PseudoEmbeddingModel::new();
        let cancel = CancelToken::new();

        let a = model.embed(&mut &b"hello world"[..], &cancel).unwrap();
        let b = model.embed(&mut &b"hello world"[..], &cancel).unwrap();
        let c = model.embed(&mut &b"other bytes"[..], &cancel).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 384);
    }

    #[test]
    fn vectors_are_unit_length() {
        let model = PseudoEmbeddingModel::new();
        let cancel = CancelToken::new();
        let v = model.embed(&mut &b"content"[..], &cancel).unwrap();
        let magnitude: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((magnitude - 1.0).abs() < 0.001);
    }

    #[test]
    fn normalize_handles_zero_vector() {
        let mut v = vec![0.0f32; 4];
        let norm = l2_normalize(&mut v);
        assert_eq!(norm, 0.0);
        assert!(v.iter().all(|x| x.is_finite()));
    }

    #[test]
    fn embed_stops_on_cancel() {
        let model = PseudoEmbeddingModel::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = model.embed(&mut &b"bytes"[..], &cancel);
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn mime_pattern_matching() {
        assert!(mime_matches("*/*", "image/png"));
        assert!(mime_matches("image/*", "image/png"));
        assert!(!mime_matches("image/*", "text/plain"));
        assert!(mime_matches("text/plain", "text/plain"));
        assert!(!mime_matches("text/plain", "text/html"));
    }
}
