//! Request coalescing for embedding model calls
//!
//! Concurrent encode requests that arrive within `max_batch_hold` of the first
//! request in an empty batch are sent to the model as one call. A batch that
//! reaches `max_batch_size` is flushed immediately. Each caller receives
//! exactly the vectors for its own texts.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use super::{EmbeddingError, EmbeddingModel, check_dimensions};

type Reply = oneshot::Sender<Result<Vec<f32>, EmbeddingError>>;

struct BatchRequest {
    text: String,
    reply: Reply,
}

#[derive(Default)]
struct PendingBatch {
    /// Bumped every time a batch is taken for flushing.
    generation: u64,
    requests: Vec<BatchRequest>,
}

impl PendingBatch {
    fn take(&mut self) -> Vec<BatchRequest> {
        self.generation += 1;
        std::mem::take(&mut self.requests)
    }
}

struct BatchShared {
    inner: Arc<dyn EmbeddingModel>,
    max_batch_size: usize,
    max_batch_hold: Duration,
    pending: Mutex<PendingBatch>,
}

impl BatchShared {
    fn enqueue(self: &Arc<Self>, text: String) -> oneshot::Receiver<Result<Vec<f32>, EmbeddingError>> {
        let (reply, receiver) = oneshot::channel();
        let mut pending = self.pending.lock();
        let opens_batch = pending.requests.is_empty();
        pending.requests.push(BatchRequest { text, reply });

        if pending.requests.len() >= self.max_batch_size {
            let batch = pending.take();
            drop(pending);
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.flush(batch).await });
        } else if opens_batch {
            let generation = pending.generation;
            drop(pending);
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(shared.max_batch_hold).await;
                shared.flush_generation(generation).await;
            });
        }

        receiver
    }

    async fn flush_generation(&self, generation: u64) {
        let batch = {
            let mut pending = self.pending.lock();
            if pending.generation != generation || pending.requests.is_empty() {
                // Already flushed because it filled up.
                return;
            }
            pending.take()
        };
        self.flush(batch).await;
    }

    async fn flush(&self, batch: Vec<BatchRequest>) {
        let texts: Vec<String> = batch.iter().map(|req| req.text.clone()).collect();
        tracing::debug!(size = texts.len(), "flushing embedding batch");

        let outcome = match self.inner.encode(&texts).await {
            Ok(vectors) if vectors.len() != texts.len() => Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                found: vectors.len(),
            }),
            Ok(vectors) => check_dimensions(&vectors, self.inner.embedding_size()).map(|_| vectors),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(vectors) => {
                for (req, vector) in batch.into_iter().zip(vectors) {
                    let _ = req.reply.send(Ok(vector));
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, size = texts.len(), "embedding batch failed");
                for req in batch {
                    let _ = req.reply.send(Err(err.clone()));
                }
            }
        }
    }
}

/// Embedding model wrapper that coalesces concurrent requests.
///
/// Must be used from within a tokio runtime: flushes run on spawned tasks so
/// a cancelled caller never strands the other members of its batch.
pub struct BatchingEmbeddingModel {
    shared: Arc<BatchShared>,
}

impl BatchingEmbeddingModel {
    /// Wrap `inner`. A `max_batch_size` of zero is treated as one.
    pub fn new(inner: Arc<dyn EmbeddingModel>, max_batch_size: usize, max_batch_hold: Duration) -> Self {
        Self {
            shared: Arc::new(BatchShared {
                inner,
                max_batch_size: max_batch_size.max(1),
                max_batch_hold,
                pending: Mutex::new(PendingBatch::default()),
            }),
        }
    }
}

#[async_trait]
impl EmbeddingModel for BatchingEmbeddingModel {
    fn embedding_size(&self) -> usize {
        self.shared.inner.embedding_size()
    }

    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let receivers: Vec<_> = texts
            .iter()
            .map(|text| self.shared.enqueue(text.clone()))
            .collect();

        let mut vectors = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let vector = receiver.await.map_err(|_| {
                EmbeddingError::Computation("embedding batch was dropped before completion".into())
            })??;
            vectors.push(vector);
        }
        Ok(vectors)
    }
}
