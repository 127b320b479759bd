//! Actions and the action registry
//!
//! Actions are the opaque asynchronous collaborators a flow can invoke: LLM
//! calls, tool calls, moderation providers. The runtime only sees the
//! [`Action`] trait; implementations are registered by name and resolved when
//! the runtime is built.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

use super::event::EventDraft;
use crate::flow::{Context, InstanceId, Value};

/// Failure reported by an action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The action ran and reported failure.
    #[error("{0}")]
    Failed(String),

    /// Parameters were missing or had the wrong type.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// No action is registered under the name.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// Any other error surfaced by a plugin.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<crate::flow::ValueTypeError> for ActionError {
    fn from(err: crate::flow::ValueTypeError) -> Self {
        ActionError::InvalidParams(err.to_string())
    }
}

/// Input handed to an action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    /// Name the action was invoked under.
    pub action_name: String,
    /// Evaluated parameters.
    pub params: BTreeMap<String, Value>,
    /// Correlation id of this invocation.
    pub correlation_id: String,
    /// Context snapshot taken when the action started.
    pub context: Context,
}

impl ActionRequest {
    /// Required parameter.
    pub fn param(&self, name: &str) -> Result<&Value, ActionError> {
        self.params
            .get(name)
            .ok_or_else(|| ActionError::InvalidParams(format!("missing parameter '{name}'")))
    }

    /// Required string parameter.
    pub fn str_param(&self, name: &str) -> Result<&str, ActionError> {
        Ok(self.param(name)?.expect_str()?)
    }
}

/// Successful action outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionResult {
    /// Value bound to the statement's output.
    pub return_value: Value,
    /// Extra events to feed back into the conversation.
    pub events: Vec<EventDraft>,
    /// Context variables to set before the completion is delivered.
    pub context_updates: BTreeMap<String, Value>,
}

impl ActionResult {
    /// Result carrying only a return value.
    pub fn value(return_value: impl Into<Value>) -> Self {
        Self {
            return_value: return_value.into(),
            ..Self::default()
        }
    }

    /// Append an event.
    pub fn with_event(mut self, event: EventDraft) -> Self {
        self.events.push(event);
        self
    }

    /// Set a context variable.
    pub fn with_context_update(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context_updates.insert(key.into(), value.into());
        self
    }
}

/// Named asynchronous operation a flow can invoke.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Whether aborting the requesting flow may cancel the call. Remote calls
    /// return `false`; their late completions are discarded instead.
    fn is_local(&self) -> bool {
        true
    }

    /// Run the action.
    async fn call(&self, request: ActionRequest) -> Result<ActionResult, ActionError>;
}

/// Action backed by a closure.
pub struct FnAction<F> {
    name: String,
    local: bool,
    f: F,
}

impl<F, Fut> FnAction<F>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionResult, ActionError>> + Send,
{
    /// Wrap a closure as a local action.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            local: true,
            f,
        }
    }

    /// Mark the action as not cancellable.
    pub fn remote(mut self) -> Self {
        self.local = false;
        self
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F>
where
    F: Fn(ActionRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ActionResult, ActionError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn call(&self, request: ActionRequest) -> Result<ActionResult, ActionError> {
        (self.f)(request).await
    }
}

/// Name → action table, fixed once the runtime is built.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under its own name, replacing any previous one.
    pub fn register(&mut self, action: Arc<dyn Action>) {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::warn!(action = %name, "replacing registered action");
        }
    }

    /// Register a closure as a local action.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, ActionError>> + Send + 'static,
    {
        self.register(Arc::new(FnAction::new(name, f)));
    }

    /// Look up an action.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// Whether an action is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

/// Lifecycle of an invocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Dispatched, no completion yet.
    Started,
    /// Completed successfully; completion not yet consumed.
    Finished,
    /// Completed with a failure; completion not yet consumed.
    Failed,
    /// Cancelled because its instance was aborted.
    Cancelled,
}

/// Record of one in-flight action or retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInvocation {
    /// Action name, or `retrieval:<index>` for searches.
    pub action_name: String,
    /// Evaluated parameters.
    pub params: BTreeMap<String, Value>,
    /// Correlation id.
    pub correlation_id: String,
    /// Current status.
    pub status: InvocationStatus,
    /// Requesting instance, when known.
    pub instance: Option<InstanceId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(params: &[(&str, Value)]) -> ActionRequest {
        ActionRequest {
            action_name: "echo".into(),
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            correlation_id: "act_1".into(),
            context: Context::new(),
        }
    }

    #[tokio::test]
    async fn closures_register_as_actions() {
        let mut registry = ActionRegistry::new();
        registry.register_fn("echo", |req: ActionRequest| async move {
            Ok::<_, ActionError>(ActionResult::value(
                req.str_param("text")?.to_uppercase(),
            ))
        });

        let action = registry.get("echo").unwrap();
        assert!(action.is_local());
        let result = action.call(request(&[("text", "hi".into())])).await.unwrap();
        assert_eq!(result.return_value, Value::from("HI"));
        assert_eq!(registry.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn missing_and_mistyped_params_are_reported() {
        let req = request(&[("count", Value::Int(1))]);
        assert!(matches!(req.str_param("text"), Err(ActionError::InvalidParams(_))));
        assert!(matches!(req.str_param("count"), Err(ActionError::InvalidParams(_))));
    }

    #[test]
    fn remote_closures_are_not_local() {
        let action = FnAction::new("llm", |_req: ActionRequest| async {
            Ok::<_, ActionError>(ActionResult::default())
        })
        .remote();
        assert!(!action.is_local());
    }
}
