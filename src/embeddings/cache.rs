//! Content-addressed embedding cache
//!
//! Wraps the embedding-computation step (never the search step): vectors are
//! stored under the blake3 digest of the input text, so a hit skips the model
//! call entirely. The cache never changes results, only latency and the number
//! of model calls.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use super::{EmbeddingError, EmbeddingModel, check_dimensions};
use crate::runtime::storage;

/// Errors raised by cache stores.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Atomic write or other storage helper failure
    #[error("cache storage failed: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Deterministic cache key for a text: its blake3 hex digest.
pub fn cache_key(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

/// Key/value store for cached vectors.
pub trait CacheStore: Send + Sync {
    /// Fetch a cached vector.
    fn get(&self, key: &str) -> Result<Option<Vec<f32>>, CacheError>;
    /// Store a vector.
    fn set(&self, key: &str, vector: &[f32]) -> Result<(), CacheError>;
    /// Drop every entry.
    fn clear(&self) -> Result<(), CacheError>;
}

/// Process-local cache store.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: Mutex<HashMap<String, Vec<f32>>>,
}

impl InMemoryCacheStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl CacheStore for InMemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<f32>>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, vector: &[f32]) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_string(), vector.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}

/// Cache store persisting one JSON file per key.
#[derive(Debug, Clone)]
pub struct FilesystemCacheStore {
    root: PathBuf,
}

impl FilesystemCacheStore {
    /// Open (creating if needed) a cache directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory holding the entries.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}.json", key))
    }
}

impl CacheStore for FilesystemCacheStore {
    fn get(&self, key: &str) -> Result<Option<Vec<f32>>, CacheError> {
        let path = self.entry_path(key);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set(&self, key: &str, vector: &[f32]) -> Result<(), CacheError> {
        let data = serde_json::to_vec(vector)?;
        storage::write_atomic(&self.entry_path(key), &data)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Embedding model wrapper that memoises vectors by content hash.
pub struct CachedEmbeddingModel {
    inner: Arc<dyn EmbeddingModel>,
    store: Arc<dyn CacheStore>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedEmbeddingModel {
    /// Wrap `inner` with the provided store.
    pub fn new(inner: Arc<dyn EmbeddingModel>, store: Arc<dyn CacheStore>) -> Self {
        Self {
            inner,
            store,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of texts served from the cache so far.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of texts that required a model call so far.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        match self.store.get(key) {
            Ok(Some(vector)) if vector.len() == self.inner.embedding_size() => Some(vector),
            Ok(Some(vector)) => {
                tracing::warn!(
                    key,
                    found = vector.len(),
                    expected = self.inner.embedding_size(),
                    "ignoring cached vector with wrong dimensionality"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key, error = %err, "embedding cache read failed");
                None
            }
        }
    }
}

#[async_trait]
impl EmbeddingModel for CachedEmbeddingModel {
    fn embedding_size(&self) -> usize {
        self.inner.embedding_size()
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut slots: Vec<Option<Vec<f32>>> = Vec::with_capacity(texts.len());
        // Unique missing texts, each with the slots it fills.
        let mut missing: Vec<(String, Vec<usize>)> = Vec::new();
        let mut missing_by_key: HashMap<String, usize> = HashMap::new();

        for (slot, text) in texts.iter().enumerate() {
            let key = cache_key(text);
            if let Some(vector) = self.lookup(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                slots.push(Some(vector));
                continue;
            }
            slots.push(None);
            match missing_by_key.get(&key) {
                Some(&idx) => missing[idx].1.push(slot),
                None => {
                    missing_by_key.insert(key, missing.len());
                    missing.push((text.clone(), vec![slot]));
                }
            }
        }

        if !missing.is_empty() {
            self.misses.fetch_add(missing.len() as u64, Ordering::Relaxed);
            let batch: Vec<String> = missing.iter().map(|(text, _)| text.clone()).collect();
            let vectors = self.inner.encode(&batch).await?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::CountMismatch {
                    expected: batch.len(),
                    found: vectors.len(),
                });
            }
            check_dimensions(&vectors, self.inner.embedding_size())?;

            for ((text, targets), vector) in missing.into_iter().zip(vectors) {
                if let Err(err) = self.store.set(&cache_key(&text), &vector) {
                    tracing::warn!(error = %err, "embedding cache write failed");
                }
                for slot in targets {
                    slots[slot] = Some(vector.clone());
                }
            }
        }

        Ok(slots.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct CountingModel {
        texts_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    impl CountingModel {
        fn new() -> Self {
            Self {
                texts_seen: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingModel for CountingModel {
        fn embedding_size(&self) -> usize {
            2
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts_seen.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, 1.0])
                .collect())
        }
    }

    #[test]
    fn cache_key_is_content_hash() {
        assert_eq!(cache_key("hi"), cache_key("hi"));
        assert_ne!(cache_key("hi"), cache_key("hello"));
        assert_eq!(cache_key("hi").len(), 64);
    }

    #[tokio::test]
    async fn hits_skip_the_model() {
        let inner = Arc::new(CountingModel::new());
        let cached = CachedEmbeddingModel::new(inner.clone(), Arc::new(InMemoryCacheStore::new()));

        let texts = vec!["hello".to_string(), "hi".to_string()];
        let first = cached.encode(&texts).await.unwrap();
        let second = cached.encode(&texts).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.hits(), 2);
        assert_eq!(cached.misses(), 2);
    }

    #[tokio::test]
    async fn duplicate_texts_in_one_call_are_encoded_once() {
        let inner = Arc::new(CountingModel::new());
        let cached = CachedEmbeddingModel::new(inner.clone(), Arc::new(InMemoryCacheStore::new()));

        let texts = vec!["same".to_string(), "same".to_string(), "other".to_string()];
        let vectors = cached.encode(&texts).await.unwrap();

        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        assert_eq!(inner.texts_seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn filesystem_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let store = FilesystemCacheStore::new(temp.path()).unwrap();
        store.set(&cache_key("hello"), &[0.5, 0.25]).unwrap();

        let reopened = FilesystemCacheStore::new(temp.path()).unwrap();
        assert_eq!(
            reopened.get(&cache_key("hello")).unwrap(),
            Some(vec![0.5, 0.25])
        );
        assert_eq!(reopened.get(&cache_key("missing")).unwrap(), None);

        reopened.clear().unwrap();
        assert_eq!(reopened.get(&cache_key("hello")).unwrap(), None);
    }
}
