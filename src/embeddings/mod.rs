//! Embedding models and nearest-neighbour indices
//!
//! An [`EmbeddingModel`] turns text into fixed-length vectors. An
//! [`EmbeddingsIndex`] stores `(text, metadata)` items together with their
//! vectors and answers top-K similarity queries. Two optional layers wrap the
//! model call: [`CachedEmbeddingModel`] memoises vectors by content hash and
//! [`BatchingEmbeddingModel`] coalesces concurrent requests into one call.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::flow::Value;

pub mod batch;
pub mod cache;
pub mod index;
pub mod model;

pub use batch::BatchingEmbeddingModel;
pub use cache::{
    CacheError, CacheStore, CachedEmbeddingModel, FilesystemCacheStore, InMemoryCacheStore,
    cache_key,
};
pub use index::BasicEmbeddingsIndex;
pub use model::LexicalEmbeddingModel;

/// Errors raised by embedding models.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    /// The underlying model call failed (network, provider, etc.).
    #[error("embedding computation failed: {0}")]
    Computation(String),

    /// A vector did not have the configured dimensionality.
    #[error("embedding has {found} dimensions, expected {expected}")]
    DimensionMismatch {
        /// Configured dimensionality.
        expected: usize,
        /// Dimensionality actually produced.
        found: usize,
    },

    /// The model returned a different number of vectors than texts.
    #[error("model returned {found} vectors for {expected} texts")]
    CountMismatch {
        /// Number of texts submitted.
        expected: usize,
        /// Number of vectors returned.
        found: usize,
    },
}

/// Errors raised by embeddings indices.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IndexError {
    /// Computing an embedding failed.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// Search was issued against an index with no items.
    #[error("index is empty")]
    EmptyIndex,

    /// Items were added but not embedded and auto-build is disabled.
    #[error("index has {pending} unbuilt items; call build() first")]
    IndexNotBuilt {
        /// Number of items awaiting embedding.
        pending: usize,
    },

    /// Caller passed an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Convenience result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Text model capable of encoding strings into vectors.
///
/// Implementations must be deterministic for identical input text, otherwise
/// the cache layer would change search results.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    /// Dimensionality of every vector produced by this model.
    fn embedding_size(&self) -> usize;

    /// Encode a batch of texts, returning one vector per text in order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// A searchable item: text plus arbitrary metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexItem {
    /// Text that gets embedded.
    pub text: String,
    /// Metadata returned alongside search hits (e.g. canonical form label).
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl IndexItem {
    /// Create an item without metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            meta: BTreeMap::new(),
        }
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// One hit returned by [`EmbeddingsIndex::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// The stored item.
    pub item: IndexItem,
    /// Stable position of the item inside the index.
    pub position: usize,
    /// Cosine distance (`1 - cosine similarity`); smaller is closer.
    pub distance: f32,
}

impl SearchResult {
    /// Structured form used in event payloads.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("text".to_string(), Value::String(self.item.text.clone()));
        map.insert("meta".to_string(), Value::Map(self.item.meta.clone()));
        map.insert("position".to_string(), Value::Int(self.position as i64));
        map.insert("distance".to_string(), Value::Float(f64::from(self.distance)));
        Value::Map(map)
    }
}

/// Collection of embedded items supporting nearest-neighbour search.
#[async_trait]
pub trait EmbeddingsIndex: Send + Sync {
    /// Dimensionality of the vectors stored in this index.
    fn embedding_size(&self) -> usize;

    /// Number of items added so far (built or not).
    fn len(&self) -> usize;

    /// Whether no items have been added.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a single item.
    fn add_item(&self, item: IndexItem) -> IndexResult<()> {
        self.add_items(vec![item])
    }

    /// Append several items; positions follow insertion order.
    fn add_items(&self, items: Vec<IndexItem>) -> IndexResult<()>;

    /// Embed every item that has not been embedded yet. Idempotent.
    async fn build(&self) -> IndexResult<()>;

    /// Return up to `max_results` items closest to `text`, nearest first.
    async fn search(&self, text: &str, max_results: usize) -> IndexResult<Vec<SearchResult>>;

    /// Like [`EmbeddingsIndex::search`] but drops hits farther than `max_distance`.
    async fn search_with_threshold(
        &self,
        text: &str,
        max_results: usize,
        max_distance: f32,
    ) -> IndexResult<Vec<SearchResult>> {
        let hits = self.search(text, max_results).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.distance <= max_distance)
            .collect())
    }
}

/// Where cached vectors are stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheStoreConfig {
    /// Process-local hash map.
    InMemory,
    /// One JSON file per key under `path`.
    Filesystem {
        /// Directory holding cache entries.
        path: PathBuf,
    },
}

/// Embedding cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache layer is installed.
    pub enabled: bool,
    /// Backing store.
    pub store: CacheStoreConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            store: CacheStoreConfig::InMemory,
        }
    }
}

/// Request batching configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Whether the batching layer is installed.
    pub enabled: bool,
    /// Maximum number of texts per model call.
    pub max_batch_size: usize,
    /// How long the first request of a batch waits for company, in milliseconds.
    pub max_batch_hold_ms: u64,
}

impl BatchConfig {
    /// Hold time as a [`Duration`].
    pub fn max_batch_hold(&self) -> Duration {
        Duration::from_millis(self.max_batch_hold_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_batch_size: 10,
            max_batch_hold_ms: 10,
        }
    }
}

/// Configuration for embedding computation and indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    /// Dimensionality for the built-in lexical model.
    pub dimensions: usize,
    /// Whether `search` embeds unbuilt items on demand instead of failing.
    pub auto_build: bool,
    /// Cache layer settings.
    pub cache: CacheConfig,
    /// Batching layer settings.
    pub batching: BatchConfig,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            dimensions: model::DEFAULT_EMBEDDING_DIM,
            auto_build: true,
            cache: CacheConfig::default(),
            batching: BatchConfig::default(),
        }
    }
}

/// Wrap a base model with the cache and batching layers enabled in `config`.
///
/// The cache sits outermost so hits never wait for a batch window.
pub fn layered_model(
    config: &EmbeddingsConfig,
    base: Arc<dyn EmbeddingModel>,
) -> Result<Arc<dyn EmbeddingModel>, CacheError> {
    let mut model = base;
    if config.batching.enabled {
        model = Arc::new(BatchingEmbeddingModel::new(
            model,
            config.batching.max_batch_size,
            config.batching.max_batch_hold(),
        ));
    }
    if config.cache.enabled {
        let store: Arc<dyn CacheStore> = match &config.cache.store {
            CacheStoreConfig::InMemory => Arc::new(InMemoryCacheStore::new()),
            CacheStoreConfig::Filesystem { path } => Arc::new(FilesystemCacheStore::new(path)?),
        };
        model = Arc::new(CachedEmbeddingModel::new(model, store));
    }
    Ok(model)
}

/// Build an index over `base` wrapped according to `config`.
pub fn index_from_config(
    config: &EmbeddingsConfig,
    base: Arc<dyn EmbeddingModel>,
) -> Result<BasicEmbeddingsIndex, CacheError> {
    let model = layered_model(config, base)?;
    Ok(BasicEmbeddingsIndex::new(model).with_auto_build(config.auto_build))
}

/// Scale a vector to unit length in place. Zero vectors are left untouched.
pub(crate) fn normalize(vector: &mut [f32]) {
    let norm2: f64 = vector.iter().map(|x| f64::from(*x) * f64::from(*x)).sum();
    if norm2 > 0.0 {
        #[allow(clippy::cast_possible_truncation)]
        let inv = norm2.sqrt().recip() as f32;
        for x in vector.iter_mut() {
            *x *= inv;
        }
    }
}

/// Check that every vector matches `expected` dimensions.
pub(crate) fn check_dimensions(
    vectors: &[Vec<f32>],
    expected: usize,
) -> Result<(), EmbeddingError> {
    match vectors.iter().find(|v| v.len() != expected) {
        Some(bad) => Err(EmbeddingError::DimensionMismatch {
            expected,
            found: bad.len(),
        }),
        None => Ok(()),
    }
}
