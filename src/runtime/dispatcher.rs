//! In-flight action and retrieval tracking
//!
//! Every call runs on its own tokio task. The dispatcher keeps the join
//! handles in a `FuturesUnordered` so completions come back in arrival
//! order, and keeps abort handles so local calls can be cancelled when the
//! requesting flow instance goes away.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::AbortHandle;

use super::action::{Action, ActionError, ActionRequest, ActionResult};
use crate::embeddings::{EmbeddingsIndex, IndexResult, SearchResult};

/// Outcome of one dispatched call.
#[derive(Debug)]
pub struct Completion {
    /// Correlation id the call was started under.
    pub correlation_id: String,
    /// What completed.
    pub kind: CompletionKind,
}

/// Action or retrieval result.
#[derive(Debug)]
pub enum CompletionKind {
    /// An action call returned.
    Action {
        /// Action name.
        action_name: String,
        /// Action outcome.
        result: Result<ActionResult, ActionError>,
    },
    /// An index search returned.
    Retrieval {
        /// Index name.
        index: String,
        /// Search outcome.
        result: IndexResult<Vec<SearchResult>>,
    },
}

struct Handle {
    abort: AbortHandle,
    local: bool,
}

/// Runs actions and searches concurrently and yields their completions.
#[derive(Default)]
pub struct Dispatcher {
    in_flight: FuturesUnordered<BoxFuture<'static, Option<Completion>>>,
    handles: HashMap<String, Handle>,
}

impl Dispatcher {
    /// Empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an action call. `action` is `None` when the name is not
    /// registered; the call then fails immediately.
    pub fn dispatch_action(&mut self, action: Option<Arc<dyn Action>>, request: ActionRequest) {
        let correlation_id = request.correlation_id.clone();
        let action_name = request.action_name.clone();
        tracing::debug!(action = %action_name, correlation_id = %correlation_id, "dispatching action");

        let Some(action) = action else {
            let completion = Completion {
                correlation_id,
                kind: CompletionKind::Action {
                    result: Err(ActionError::UnknownAction(action_name.clone())),
                    action_name,
                },
            };
            self.in_flight
                .push(Box::pin(async move { Some(completion) }));
            return;
        };

        let local = action.is_local();
        let task = tokio::spawn(async move { action.call(request).await });
        self.track(correlation_id.clone(), task.abort_handle(), local);

        self.in_flight.push(Box::pin(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => return None,
                Err(err) => Err(ActionError::Failed(format!("action panicked: {err}"))),
            };
            Some(Completion {
                correlation_id,
                kind: CompletionKind::Action {
                    action_name,
                    result,
                },
            })
        }));
    }

    /// Start an index search.
    pub fn dispatch_retrieval(
        &mut self,
        correlation_id: String,
        index_name: String,
        index: Arc<dyn EmbeddingsIndex>,
        query: String,
        max_results: usize,
        max_distance: Option<f32>,
    ) {
        tracing::debug!(index = %index_name, correlation_id = %correlation_id, "dispatching retrieval");
        let task = tokio::spawn(async move {
            match max_distance {
                Some(max_distance) => {
                    index
                        .search_with_threshold(&query, max_results, max_distance)
                        .await
                }
                None => index.search(&query, max_results).await,
            }
        });
        self.track(correlation_id.clone(), task.abort_handle(), true);

        self.in_flight.push(Box::pin(async move {
            let result = match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => return None,
                Err(err) => Err(crate::embeddings::IndexError::Embedding(
                    crate::embeddings::EmbeddingError::Computation(format!(
                        "search panicked: {err}"
                    )),
                )),
            };
            Some(Completion {
                correlation_id,
                kind: CompletionKind::Retrieval {
                    index: index_name,
                    result,
                },
            })
        }));
    }

    fn track(&mut self, correlation_id: String, abort: AbortHandle, local: bool) {
        self.handles.insert(correlation_id, Handle { abort, local });
    }

    /// Wait for the next completion. Returns `None` once nothing is in
    /// flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        while let Some(outcome) = self.in_flight.next().await {
            if let Some(completion) = outcome {
                self.handles.remove(&completion.correlation_id);
                return Some(completion);
            }
        }
        None
    }

    /// Cancel a local call. Remote calls keep running and their completion
    /// is delivered (and discarded by the interpreter) as usual.
    pub fn cancel(&mut self, correlation_id: &str) -> bool {
        match self.handles.get(correlation_id) {
            Some(handle) if handle.local => {
                handle.abort.abort();
                self.handles.remove(correlation_id);
                tracing::debug!(correlation_id, "cancelled action");
                true
            }
            _ => false,
        }
    }

    /// Abort every call, local or not.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.handles.drain() {
            handle.abort.abort();
        }
        self.in_flight.clear();
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Number of calls in flight.
    pub fn len(&self) -> usize {
        self.in_flight.len()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Context;
    use crate::runtime::action::FnAction;
    use std::time::Duration;

    fn request(name: &str, correlation_id: &str) -> ActionRequest {
        ActionRequest {
            action_name: name.into(),
            params: Default::default(),
            correlation_id: correlation_id.into(),
            context: Context::new(),
        }
    }

    fn sleeper(name: &str, millis: u64, value: &'static str) -> Arc<dyn Action> {
        Arc::new(FnAction::new(name, move |_req: ActionRequest| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, ActionError>(ActionResult::value(value))
        }))
    }

    #[tokio::test]
    async fn completions_arrive_in_finish_order() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch_action(Some(sleeper("slow", 50, "slow")), request("slow", "a"));
        dispatcher.dispatch_action(Some(sleeper("fast", 1, "fast")), request("fast", "b"));
        assert_eq!(dispatcher.len(), 2);

        let first = dispatcher.next_completion().await.unwrap();
        assert_eq!(first.correlation_id, "b");
        let second = dispatcher.next_completion().await.unwrap();
        assert_eq!(second.correlation_id, "a");
        assert!(dispatcher.next_completion().await.is_none());
    }

    #[tokio::test]
    async fn unknown_actions_fail_immediately() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch_action(None, request("missing", "x"));
        let completion = dispatcher.next_completion().await.unwrap();
        match completion.kind {
            CompletionKind::Action { result, .. } => {
                assert!(matches!(result, Err(ActionError::UnknownAction(name)) if name == "missing"));
            }
            CompletionKind::Retrieval { .. } => panic!("expected an action completion"),
        }
    }

    #[tokio::test]
    async fn cancelled_local_calls_never_complete() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch_action(Some(sleeper("slow", 10_000, "never")), request("slow", "a"));
        assert!(dispatcher.cancel("a"));
        assert!(dispatcher.next_completion().await.is_none());
    }

    #[tokio::test]
    async fn remote_calls_ignore_cancel() {
        let remote: Arc<dyn Action> = Arc::new(
            FnAction::new("llm", |_req: ActionRequest| async {
                Ok::<_, ActionError>(ActionResult::value("done"))
            })
            .remote(),
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.dispatch_action(Some(remote), request("llm", "r"));
        assert!(!dispatcher.cancel("r"));
        assert!(dispatcher.next_completion().await.is_some());
    }
}
