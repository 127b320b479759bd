//! Flat cosine-distance embeddings index
//!
//! Items are appended to an ordered list; `build` embeds the tail that has not
//! been embedded yet and stores unit-length vectors, so search is an exact
//! scan of dot products. Positions never change once assigned.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::sync::Arc;

use super::{
    EmbeddingError, EmbeddingModel, EmbeddingsIndex, IndexError, IndexItem, IndexResult,
    SearchResult, check_dimensions, normalize,
};

#[derive(Default)]
struct IndexState {
    items: Vec<IndexItem>,
    /// Unit vectors for `items[..vectors.len()]`.
    vectors: Vec<Vec<f32>>,
}

impl IndexState {
    fn pending(&self) -> usize {
        self.items.len() - self.vectors.len()
    }
}

/// Exact nearest-neighbour index over a pluggable embedding model.
///
/// Adding items after `build` is allowed; the new items are embedded by the
/// next `build` (or on demand by `search` when auto-build is on).
pub struct BasicEmbeddingsIndex {
    model: Arc<dyn EmbeddingModel>,
    auto_build: bool,
    state: RwLock<IndexState>,
}

impl BasicEmbeddingsIndex {
    /// Create an empty index. Auto-build is enabled by default.
    pub fn new(model: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            model,
            auto_build: true,
            state: RwLock::new(IndexState::default()),
        }
    }

    /// Toggle whether `search` embeds pending items instead of failing.
    pub fn with_auto_build(mut self, auto_build: bool) -> Self {
        self.auto_build = auto_build;
        self
    }

    /// Number of items that still need embedding.
    pub fn pending(&self) -> usize {
        self.state.read().pending()
    }

    /// Item stored at `position`.
    pub fn item(&self, position: usize) -> Option<IndexItem> {
        self.state.read().items.get(position).cloned()
    }

    async fn embed_query(&self, text: &str) -> IndexResult<Vec<f32>> {
        let mut vectors = self.model.encode(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                expected: 1,
                found: vectors.len(),
            }
            .into());
        }
        check_dimensions(&vectors, self.model.embedding_size())?;
        let mut query = vectors.remove(0);
        normalize(&mut query);
        Ok(query)
    }
}

#[async_trait]
impl EmbeddingsIndex for BasicEmbeddingsIndex {
    fn embedding_size(&self) -> usize {
        self.model.embedding_size()
    }

    fn len(&self) -> usize {
        self.state.read().items.len()
    }

    fn add_items(&self, items: Vec<IndexItem>) -> IndexResult<()> {
        self.state.write().items.extend(items);
        Ok(())
    }

    async fn build(&self) -> IndexResult<()> {
        let (start, texts) = {
            let state = self.state.read();
            let start = state.vectors.len();
            let texts: Vec<String> = state.items[start..]
                .iter()
                .map(|item| item.text.clone())
                .collect();
            (start, texts)
        };
        if texts.is_empty() {
            return Ok(());
        }

        tracing::debug!(count = texts.len(), "embedding index items");
        let mut vectors = self.model.encode(&texts).await?;
        if vectors.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                found: vectors.len(),
            }
            .into());
        }
        check_dimensions(&vectors, self.model.embedding_size())?;
        for vector in vectors.iter_mut() {
            normalize(vector);
        }

        let mut state = self.state.write();
        // A concurrent build may already have embedded part of this range.
        let already = state.vectors.len().saturating_sub(start);
        if already < vectors.len() {
            state.vectors.extend(vectors.into_iter().skip(already));
        }
        Ok(())
    }

    async fn search(&self, text: &str, max_results: usize) -> IndexResult<Vec<SearchResult>> {
        if max_results == 0 {
            return Err(IndexError::InvalidArgument(
                "max_results must be a positive integer".into(),
            ));
        }

        let pending = {
            let state = self.state.read();
            if state.items.is_empty() {
                return Err(IndexError::EmptyIndex);
            }
            state.pending()
        };
        if pending > 0 {
            if !self.auto_build {
                return Err(IndexError::IndexNotBuilt { pending });
            }
            self.build().await?;
        }

        let query = self.embed_query(text).await?;

        let state = self.state.read();
        let mut scored: Vec<(usize, f32)> = state
            .vectors
            .iter()
            .enumerate()
            .map(|(position, vector)| {
                let dot: f32 = vector.iter().zip(&query).map(|(a, b)| a * b).sum();
                (position, 1.0 - dot)
            })
            .collect();
        scored.sort_by(|a, b| match a.1.total_cmp(&b.1) {
            Ordering::Equal => a.0.cmp(&b.0),
            other => other,
        });

        Ok(scored
            .into_iter()
            .take(max_results)
            .map(|(position, distance)| SearchResult {
                item: state.items[position].clone(),
                position,
                distance,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::{CachedEmbeddingModel, InMemoryCacheStore, LexicalEmbeddingModel};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    /// Dense pseudo-random vectors derived from the text hash; distinct texts
    /// get distinct directions.
    struct HashModel {
        calls: AtomicUsize,
    }

    impl HashModel {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingModel for HashModel {
        fn embedding_size(&self) -> usize {
            32
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(texts
                .iter()
                .map(|text| {
                    let hash = blake3::hash(text.as_bytes());
                    hash.as_bytes()
                        .iter()
                        .map(|b| f32::from(*b) - 127.5)
                        .collect()
                })
                .collect())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl EmbeddingModel for FailingModel {
        fn embedding_size(&self) -> usize {
            4
        }

        async fn encode(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Err(EmbeddingError::Computation("connection refused".into()))
        }
    }

    struct WrongSizeModel;

    #[async_trait]
    impl EmbeddingModel for WrongSizeModel {
        fn embedding_size(&self) -> usize {
            4
        }

        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn three_item_index() -> BasicEmbeddingsIndex {
        let index = BasicEmbeddingsIndex::new(Arc::new(HashModel::new()));
        index
            .add_items(vec![
                IndexItem::new("hello there"),
                IndexItem::new("what is the weather"),
                IndexItem::new("book a flight"),
            ])
            .unwrap();
        index
    }

    #[tokio::test]
    async fn search_returns_at_most_the_number_of_items() {
        let index = three_item_index();
        index.build().await.unwrap();
        let hits = index.search("anything at all", 10).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn search_orders_nearest_first() {
        let index = three_item_index();
        let hits = index.search("what is the weather", 3).await.unwrap();
        assert_eq!(hits[0].item.text, "what is the weather");
        assert!(hits[0].distance.abs() < 1e-5);
        assert!(hits[0].distance <= hits[1].distance);
        assert!(hits[1].distance <= hits[2].distance);
    }

    #[tokio::test]
    async fn zero_max_results_is_rejected() {
        let index = three_item_index();
        let err = index.search("hello", 0).await.unwrap_err();
        assert!(matches!(err, IndexError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_index_is_an_error() {
        let index = BasicEmbeddingsIndex::new(Arc::new(HashModel::new()));
        assert_eq!(index.search("hello", 1).await.unwrap_err(), IndexError::EmptyIndex);
    }

    #[tokio::test]
    async fn unbuilt_index_fails_without_auto_build() {
        let index = three_item_index().with_auto_build(false);
        let err = index.search("hello", 1).await.unwrap_err();
        assert_eq!(err, IndexError::IndexNotBuilt { pending: 3 });

        index.build().await.unwrap();
        assert_eq!(index.search("hello there", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn build_is_idempotent() {
        let model = Arc::new(HashModel::new());
        let index = BasicEmbeddingsIndex::new(model.clone());
        index.add_item(IndexItem::new("a")).unwrap();
        index.add_item(IndexItem::new("b")).unwrap();

        index.build().await.unwrap();
        let before = index.search("a", 2).await.unwrap();
        index.build().await.unwrap();
        let after = index.search("a", 2).await.unwrap();

        assert_eq!(before, after);
        // one build call plus two query encodes
        assert_eq!(model.calls.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn items_added_after_build_keep_earlier_positions() {
        let index = three_item_index();
        index.build().await.unwrap();
        index
            .add_item(IndexItem::new("cancel my order").with_meta("canonical_form", "cancel"))
            .unwrap();
        assert_eq!(index.pending(), 1);

        let hits = index.search("cancel my order", 1).await.unwrap();
        assert_eq!(hits[0].position, 3);
        assert_eq!(index.item(0).unwrap().text, "hello there");
    }

    #[tokio::test]
    async fn model_failures_surface_as_embedding_errors() {
        let index = BasicEmbeddingsIndex::new(Arc::new(FailingModel));
        index.add_item(IndexItem::new("a")).unwrap();
        let err = index.build().await.unwrap_err();
        assert!(matches!(err, IndexError::Embedding(EmbeddingError::Computation(_))));
    }

    #[tokio::test]
    async fn inconsistent_dimensions_are_rejected() {
        let index = BasicEmbeddingsIndex::new(Arc::new(WrongSizeModel));
        index.add_item(IndexItem::new("a")).unwrap();
        let err = index.build().await.unwrap_err();
        assert_eq!(
            err,
            IndexError::Embedding(EmbeddingError::DimensionMismatch {
                expected: 4,
                found: 2
            })
        );
    }

    #[tokio::test]
    async fn threshold_drops_distant_hits() {
        let index = BasicEmbeddingsIndex::new(Arc::new(LexicalEmbeddingModel::new(256)));
        index
            .add_items(vec![
                IndexItem::new("hello there"),
                IndexItem::new("book a flight"),
                IndexItem::new("hello there"),
            ])
            .unwrap();
        let hits = index
            .search_with_threshold("hello there", 5, 0.01)
            .await
            .unwrap();
        let positions: Vec<usize> = hits.iter().map(|hit| hit.position).collect();
        assert_eq!(positions, vec![0, 2]);

        let dyn_index: Arc<dyn EmbeddingsIndex> = Arc::new(index);
        let all = dyn_index.search_with_threshold("hello there", 5, 2.5).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn cache_does_not_change_results_and_saves_calls() {
        let queries = ["book a flight", "hello there", "book a flight", "hello there"];

        let plain_model = Arc::new(HashModel::new());
        let plain = BasicEmbeddingsIndex::new(plain_model.clone());

        let cached_inner = Arc::new(HashModel::new());
        let cached = BasicEmbeddingsIndex::new(Arc::new(CachedEmbeddingModel::new(
            cached_inner.clone(),
            Arc::new(InMemoryCacheStore::new()),
        )));

        for index in [&plain, &cached] {
            index
                .add_items(vec![
                    IndexItem::new("hello there"),
                    IndexItem::new("what is the weather"),
                    IndexItem::new("book a flight"),
                ])
                .unwrap();
        }

        for query in queries {
            assert_eq!(
                plain.search(query, 2).await.unwrap(),
                cached.search(query, 2).await.unwrap()
            );
        }

        let plain_calls = plain_model.calls.load(AtomicOrdering::SeqCst);
        let cached_calls = cached_inner.calls.load(AtomicOrdering::SeqCst);
        assert!(cached_calls < plain_calls);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn every_item_retrieves_itself(texts in prop::collection::btree_set("[a-z]{1,6}( [a-z]{1,6}){0,3}", 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let index = BasicEmbeddingsIndex::new(Arc::new(HashModel::new()));
                index
                    .add_items(texts.iter().map(|t| IndexItem::new(t.clone())).collect())
                    .unwrap();
                for text in &texts {
                    let hits = index.search(text, 1).await.unwrap();
                    assert_eq!(&hits[0].item.text, text);
                }
            });
        }
    }
}
