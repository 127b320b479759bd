//! Deterministic lexical embedding model.
//!
//! Feature hashing over lowercase alphanumeric tokens. This is not a neural
//! model; it gives a stable, offline baseline that is good enough for
//! example retrieval in tests and air-gapped deployments.

use async_trait::async_trait;
use blake3::Hasher;

use super::{EmbeddingError, EmbeddingModel, normalize};

/// Default dimensionality for lexical embeddings.
pub const DEFAULT_EMBEDDING_DIM: usize = 64;

fn tokenize(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
}

/// Feature-hashing embedding model backed by blake3.
#[derive(Debug, Clone, Copy)]
pub struct LexicalEmbeddingModel {
    dimensions: usize,
}

impl LexicalEmbeddingModel {
    /// Create a model producing vectors with `dimensions` components.
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// Embed one text synchronously.
    #[must_use]
    pub fn embed(&self, text: &str) -> Vec<f32> {
        if self.dimensions == 0 {
            return Vec::new();
        }

        let mut vec = vec![0.0f32; self.dimensions];
        let lowered = text.to_ascii_lowercase();

        for token in tokenize(&lowered) {
            let mut h = Hasher::new();
            h.update(token.as_bytes());
            let hash = h.finalize();
            let bytes = hash.as_bytes();

            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&bytes[..8]);
            let bucket = u64::from_le_bytes(bucket_bytes);

            let idx = (bucket % self.dimensions as u64) as usize;
            let sign = if (bytes[8] & 1) == 0 { 1.0f32 } else { -1.0f32 };
            vec[idx] += sign;
        }

        normalize(&mut vec);
        vec
    }
}

impl Default for LexicalEmbeddingModel {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIM)
    }
}

#[async_trait]
impl EmbeddingModel for LexicalEmbeddingModel {
    fn embedding_size(&self) -> usize {
        self.dimensions
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed(text)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lexical_embedding_is_deterministic() {
        let model = LexicalEmbeddingModel::default();
        assert_eq!(model.embed("hello world"), model.embed("hello world"));
    }

    #[test]
    fn lexical_embedding_ignores_case_and_punctuation() {
        let model = LexicalEmbeddingModel::default();
        assert_eq!(model.embed("Hello, World!"), model.embed("hello world"));
    }

    #[test]
    fn lexical_embedding_dim_is_respected() {
        let model = LexicalEmbeddingModel::new(13);
        assert_eq!(model.embed("x").len(), 13);
        assert_eq!(model.embedding_size(), 13);
    }

    #[tokio::test]
    async fn encode_preserves_order() {
        let model = LexicalEmbeddingModel::default();
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let vectors = model.encode(&texts).await.unwrap();
        assert_eq!(vectors[0], model.embed("alpha"));
        assert_eq!(vectors[1], model.embed("beta"));
    }
}
