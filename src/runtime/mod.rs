//! Runtime loop and public API
//!
//! [`Runtime`] ties the interpreter, the action registry and the embeddings
//! indices together. A turn feeds the caller's events through the
//! interpreter one at a time, dispatches the actions and retrievals the
//! interpreter asks for, and feeds their completions back in arrival order
//! until nothing is queued and nothing is in flight.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;

pub mod action;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod state;
pub mod storage;

pub use action::{
    Action, ActionError, ActionInvocation, ActionRegistry, ActionRequest, ActionResult, FnAction,
    InvocationStatus,
};
pub use dispatcher::{Completion, CompletionKind, Dispatcher};
pub use error::{RuntimeError, RuntimeResult};
pub use event::{Clock, Event, EventDraft, FixedClock, SystemClock, kinds};
pub use state::{ConversationState, HistoryEntry, Role};

use crate::embeddings::{
    BasicEmbeddingsIndex, EmbeddingModel, EmbeddingsConfig, EmbeddingsIndex, IndexError,
    IndexItem, LexicalEmbeddingModel, layered_model,
};
use crate::flow::{
    AbortReason, Awaiting, CanonicalExample, ConfigError, ExampleCatalog, FlowDefinition,
    FlowSet, InstanceId, Interpreter, Value, build_flow_set,
};

/// Bot message emitted when a turn fails internally.
pub const DEFAULT_FALLBACK_MESSAGE: &str = "I'm sorry, an internal error has occurred.";

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Events processed per turn before the turn is declared runaway
    pub max_events_per_turn: usize,

    /// Non-suspending instructions one instance may run per advance
    pub max_steps_per_advance: usize,

    /// Utterances kept in the conversation history
    pub history_window: usize,

    /// Bot message emitted on internal errors
    pub fallback_message: String,

    /// Embedding model and index settings
    pub embeddings: EmbeddingsConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_events_per_turn: 500,
            max_steps_per_advance: 1000,
            history_window: 20,
            fallback_message: DEFAULT_FALLBACK_MESSAGE.to_string(),
            embeddings: EmbeddingsConfig::default(),
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnOutput {
    /// Updated conversation state.
    pub state: ConversationState,
    /// Events produced during the turn, in order. Input events are not
    /// repeated.
    pub events: Vec<Event>,
}

impl TurnOutput {
    /// Texts of the `BotSay` events, in order.
    pub fn bot_messages(&self) -> Vec<String> {
        self.events
            .iter()
            .filter(|event| event.is(kinds::BOT_SAY))
            .filter_map(|event| event.get("text").map(Value::to_string))
            .collect()
    }
}

/// Assembles a [`Runtime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    flows: Vec<FlowDefinition>,
    actions: ActionRegistry,
    indices: BTreeMap<String, Arc<dyn EmbeddingsIndex>>,
    examples: BTreeMap<String, Vec<CanonicalExample>>,
    model: Option<Arc<dyn EmbeddingModel>>,
    clock: Option<Arc<dyn Clock>>,
}

impl RuntimeBuilder {
    /// Builder with the given settings.
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            flows: Vec::new(),
            actions: ActionRegistry::new(),
            indices: BTreeMap::new(),
            examples: BTreeMap::new(),
            model: None,
            clock: None,
        }
    }

    /// Builder from a JSON config file and a JSON array of flow definitions.
    pub fn from_files(config: &Path, flows: &Path) -> RuntimeResult<Self> {
        let config = storage::load_config(config)?;
        let flows = storage::load_flow_definitions(flows)?;
        Ok(Self::new(config).flows(flows))
    }

    /// Add a flow definition.
    pub fn flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.push(flow);
        self
    }

    /// Add several flow definitions.
    pub fn flows(mut self, flows: impl IntoIterator<Item = FlowDefinition>) -> Self {
        self.flows.extend(flows);
        self
    }

    /// Register an action.
    pub fn action(mut self, action: Arc<dyn Action>) -> Self {
        self.actions.register(action);
        self
    }

    /// Register a closure as a local action.
    pub fn action_fn<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ActionResult, ActionError>> + Send + 'static,
    {
        self.actions.register_fn(name, f);
        self
    }

    /// Register a pre-populated index.
    pub fn index(mut self, name: impl Into<String>, index: Arc<dyn EmbeddingsIndex>) -> Self {
        self.indices.insert(name.into(), index);
        self
    }

    /// Canonical-form examples for an index. The index is created from the
    /// embeddings settings unless one was registered under the same name.
    pub fn examples(
        mut self,
        index: impl Into<String>,
        examples: impl IntoIterator<Item = CanonicalExample>,
    ) -> Self {
        self.examples
            .entry(index.into())
            .or_default()
            .extend(examples);
        self
    }

    /// Base embedding model for created indices; defaults to the lexical
    /// model.
    pub fn embedding_model(mut self, model: Arc<dyn EmbeddingModel>) -> Self {
        self.model = Some(model);
        self
    }

    /// Timestamp source for engine events.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the flows, populate and build the example indices.
    pub async fn build(self) -> RuntimeResult<Runtime> {
        let flow_set = build_flow_set(&self.flows)?;
        let mut indices = self.indices;

        let base = self.model.unwrap_or_else(|| -> Arc<dyn EmbeddingModel> {
            Arc::new(LexicalEmbeddingModel::new(self.config.embeddings.dimensions))
        });
        let model = layered_model(&self.config.embeddings, base)?;

        let mut catalog = ExampleCatalog::new();
        for (name, examples) in self.examples {
            let index = indices.entry(name.clone()).or_insert_with(|| -> Arc<dyn EmbeddingsIndex> {
                Arc::new(
                    BasicEmbeddingsIndex::new(model.clone())
                        .with_auto_build(self.config.embeddings.auto_build),
                )
            });
            index.add_items(
                examples
                    .iter()
                    .map(|example| {
                        IndexItem::new(example.text.as_str())
                            .with_meta("canonical_form", example.canonical_form.as_str())
                    })
                    .collect(),
            )?;
            index.build().await?;
            tracing::info!(index = %name, items = index.len(), "index built");
            catalog.add(&name, examples);
        }

        check_references(&flow_set, &self.actions, &indices)?;

        let flows = Arc::new(flow_set.with_examples(catalog));
        tracing::info!(flows = flows.len(), actions = ?self.actions.names(), "runtime ready");
        Ok(Runtime {
            interpreter: Interpreter::new(flows, self.config.max_steps_per_advance),
            config: self.config,
            actions: self.actions,
            indices: indices.into_iter().collect(),
            clock: self
                .clock
                .unwrap_or_else(|| -> Arc<dyn Clock> { Arc::new(SystemClock) }),
        })
    }
}

fn check_references(
    flows: &FlowSet,
    actions: &ActionRegistry,
    indices: &BTreeMap<String, Arc<dyn EmbeddingsIndex>>,
) -> Result<(), ConfigError> {
    for (_, flow) in flows.iter() {
        if let Some(action) = flow.referenced_actions().find(|a| !actions.contains(a)) {
            return Err(ConfigError::UnknownAction {
                flow: flow.name.clone(),
                action: action.to_string(),
            });
        }
        if let Some(index) = flow.referenced_indices().find(|i| !indices.contains_key(*i)) {
            return Err(ConfigError::UnknownIndex {
                flow: flow.name.clone(),
                index: index.to_string(),
            });
        }
    }
    Ok(())
}

/// Event-driven dialog runtime.
pub struct Runtime {
    config: RuntimeConfig,
    interpreter: Interpreter,
    actions: ActionRegistry,
    indices: HashMap<String, Arc<dyn EmbeddingsIndex>>,
    clock: Arc<dyn Clock>,
}

impl Runtime {
    /// Builder with default settings.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new(RuntimeConfig::default())
    }

    /// Current settings.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Loaded flows.
    pub fn flows(&self) -> &FlowSet {
        self.interpreter.flows()
    }

    /// Registered actions.
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Index by name.
    pub fn index(&self, name: &str) -> Option<Arc<dyn EmbeddingsIndex>> {
        self.indices.get(name).cloned()
    }

    /// Run one turn. Never fails: a runaway turn becomes an `InternalError`
    /// event followed by the fallback message, and stored instances that no
    /// longer fit the loaded flows are aborted without disturbing the rest.
    pub async fn process_events(&self, mut state: ConversationState, events: Vec<Event>) -> TurnOutput {
        let pruned = state.prune_terminated();
        let span = tracing::info_span!("turn", conversation = %state.conversation_id);

        let mut turn = Turn {
            runtime: self,
            state,
            dispatcher: Dispatcher::new(),
            queue: events.into(),
            out: Vec::new(),
            processed: 0,
            fallback_sent: false,
        };
        turn.run().instrument(span).await;

        tracing::info!(
            conversation = %turn.state.conversation_id,
            processed = turn.processed,
            emitted = turn.out.len(),
            pruned,
            "turn finished"
        );
        TurnOutput {
            state: turn.state,
            events: turn.out,
        }
    }

    /// Feed one user utterance and collect the bot's replies.
    pub async fn generate(
        &self,
        state: ConversationState,
        text: impl Into<String>,
    ) -> (ConversationState, Vec<String>) {
        let output = self
            .process_events(state, vec![Event::user_said(text)])
            .await;
        let messages = output.bot_messages();
        (output.state, messages)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("flows", &self.interpreter.flows().len())
            .field("actions", &self.actions)
            .field("indices", &self.indices.keys().collect::<Vec<_>>())
            .finish()
    }
}

struct Turn<'r> {
    runtime: &'r Runtime,
    state: ConversationState,
    dispatcher: Dispatcher,
    queue: VecDeque<Event>,
    out: Vec<Event>,
    processed: usize,
    fallback_sent: bool,
}

impl Turn<'_> {
    async fn run(&mut self) {
        let limit = self.runtime.config.max_events_per_turn;
        loop {
            while let Some(event) = self.queue.pop_front() {
                if self.processed >= limit {
                    self.fail(format!("turn exceeded {limit} events"));
                    self.halt();
                    return;
                }
                self.processed += 1;
                self.process(&event);
            }

            if self.dispatcher.is_empty() {
                return;
            }
            match self.dispatcher.next_completion().await {
                Some(completion) => self.complete(completion),
                None => return,
            }
        }
    }

    fn process(&mut self, event: &Event) {
        let window = self.runtime.config.history_window;
        if event.is(kinds::USER_SAID) {
            if let Some(text) = event.get_str("text") {
                self.state.record_utterance(Role::User, text, window);
            }
        } else if event.is(kinds::BOT_SAY) {
            let text = event.get("text").map(Value::to_string).unwrap_or_default();
            self.state.record_utterance(Role::Bot, text, window);
        }

        let runtime = self.runtime;
        for draft in runtime.interpreter.tick(&mut self.state, event) {
            self.emit(draft, "interpreter");
        }

        if event.is(kinds::ACTION_FINISHED) || event.is(kinds::RETRIEVAL_FINISHED) {
            if let Some(correlation_id) = event.get_str("correlation_id") {
                self.state.invocations.remove(correlation_id);
            }
        }
    }

    fn stamp(&mut self, draft: EventDraft, source: &str) -> Event {
        Event {
            id: self.state.mint_event_id(),
            event_type: draft.event_type,
            payload: draft.payload,
            source: source.to_string(),
            created_at: self.runtime.clock.now(),
        }
    }

    /// Record an event, act on requests and queue it for the interpreter.
    fn emit(&mut self, draft: EventDraft, source: &str) {
        let event = self.stamp(draft, source);
        if event.is(kinds::ACTION_STARTED) {
            self.start_action(&event);
        } else if event.is(kinds::RETRIEVAL_STARTED) {
            self.start_retrieval(&event);
        } else if event.is(kinds::STOP_ACTION) {
            self.stop(&event);
        }
        self.out.push(event.clone());
        self.queue.push_back(event);
    }

    fn start_action(&mut self, event: &Event) {
        let (Some(action_name), Some(correlation_id)) =
            (event.get_str("action_name"), event.get_str("correlation_id"))
        else {
            tracing::warn!(event = %event.id, "malformed action request");
            return;
        };
        let params = event
            .get("params")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();

        self.state.invocations.insert(
            correlation_id.to_string(),
            ActionInvocation {
                action_name: action_name.to_string(),
                params: params.clone(),
                correlation_id: correlation_id.to_string(),
                status: InvocationStatus::Started,
                instance: instance_of(event),
            },
        );
        let request = ActionRequest {
            action_name: action_name.to_string(),
            params,
            correlation_id: correlation_id.to_string(),
            context: self.state.context.clone(),
        };
        self.dispatcher
            .dispatch_action(self.runtime.actions.get(action_name), request);
    }

    fn start_retrieval(&mut self, event: &Event) {
        let (Some(index_name), Some(correlation_id)) =
            (event.get_str("index"), event.get_str("correlation_id"))
        else {
            tracing::warn!(event = %event.id, "malformed retrieval request");
            return;
        };
        let query = event.get_str("query").unwrap_or_default().to_string();
        let max_results = event
            .get("max_results")
            .and_then(Value::as_i64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(0);
        let max_distance = event
            .get("max_distance")
            .and_then(Value::as_f64)
            .map(|d| d as f32);

        let mut params = BTreeMap::new();
        params.insert("query".to_string(), Value::String(query.clone()));
        params.insert("max_results".to_string(), Value::from(max_results));
        if let Some(max_distance) = max_distance {
            params.insert("max_distance".to_string(), Value::from(f64::from(max_distance)));
        }
        self.state.invocations.insert(
            correlation_id.to_string(),
            ActionInvocation {
                action_name: format!("retrieval:{index_name}"),
                params,
                correlation_id: correlation_id.to_string(),
                status: InvocationStatus::Started,
                instance: instance_of(event),
            },
        );

        match self.runtime.index(index_name) {
            Some(index) => self.dispatcher.dispatch_retrieval(
                correlation_id.to_string(),
                index_name.to_string(),
                index,
                query,
                max_results,
                max_distance,
            ),
            None => self.complete(Completion {
                correlation_id: correlation_id.to_string(),
                kind: CompletionKind::Retrieval {
                    index: index_name.to_string(),
                    result: Err(IndexError::InvalidArgument(format!(
                        "unknown index '{index_name}'"
                    ))),
                },
            }),
        }
    }

    fn stop(&mut self, event: &Event) {
        let Some(correlation_id) = event.get_str("correlation_id") else {
            return;
        };
        if self.dispatcher.cancel(correlation_id) {
            if let Some(invocation) = self.state.invocations.get_mut(correlation_id) {
                invocation.status = InvocationStatus::Cancelled;
            }
            self.state.invocations.remove(correlation_id);
        }
    }

    fn complete(&mut self, completion: Completion) {
        let correlation_id = completion.correlation_id;
        match completion.kind {
            CompletionKind::Action {
                action_name,
                result,
            } => {
                self.mark(&correlation_id, result.is_ok());
                let finished = EventDraft::new(kinds::ACTION_FINISHED)
                    .with("action_name", action_name.as_str())
                    .with("correlation_id", correlation_id.as_str());
                match result {
                    Ok(result) => {
                        if !result.context_updates.is_empty() {
                            self.emit(
                                EventDraft::new(kinds::CONTEXT_UPDATE)
                                    .with("data", Value::Map(result.context_updates)),
                                "runtime",
                            );
                        }
                        self.emit(
                            finished
                                .with("status", "success")
                                .with("return_value", result.return_value),
                            "runtime",
                        );
                        let source = format!("action:{action_name}");
                        for draft in result.events {
                            self.emit(draft, &source);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(action = %action_name, error = %err, "action failed");
                        self.emit(
                            finished
                                .with("status", "failure")
                                .with("error", err.to_string()),
                            "runtime",
                        );
                    }
                }
            }
            CompletionKind::Retrieval { index, result } => {
                self.mark(&correlation_id, result.is_ok());
                let finished = EventDraft::new(kinds::RETRIEVAL_FINISHED)
                    .with("index", index.as_str())
                    .with("correlation_id", correlation_id.as_str());
                let finished = match result {
                    Ok(hits) => finished.with("status", "success").with(
                        "results",
                        Value::List(hits.iter().map(|hit| hit.to_value()).collect()),
                    ),
                    Err(err) => {
                        tracing::warn!(index = %index, error = %err, "retrieval failed");
                        finished
                            .with("status", "failure")
                            .with("error", err.to_string())
                    }
                };
                self.emit(finished, "runtime");
            }
        }
    }

    fn mark(&mut self, correlation_id: &str, ok: bool) {
        if let Some(invocation) = self.state.invocations.get_mut(correlation_id) {
            invocation.status = if ok {
                InvocationStatus::Finished
            } else {
                InvocationStatus::Failed
            };
        }
    }

    /// Record an internal error and the fallback message. Neither is fed
    /// back to the interpreter.
    fn fail(&mut self, message: String) {
        tracing::error!(error = %message, "internal error during turn");
        let error = self.stamp(
            EventDraft::new(kinds::INTERNAL_ERROR).with("message", message),
            "runtime",
        );
        self.out.push(error);

        if !self.fallback_sent {
            self.fallback_sent = true;
            let text = self.runtime.config.fallback_message.clone();
            let window = self.runtime.config.history_window;
            self.state.record_utterance(Role::Bot, text.as_str(), window);
            let fallback = self.stamp(EventDraft::new(kinds::BOT_SAY).with("text", text), "runtime");
            self.out.push(fallback);
        }
    }

    /// Stop the turn: cancel everything in flight and abort the instances
    /// that were waiting on it.
    fn halt(&mut self) {
        self.dispatcher.cancel_all();
        self.queue.clear();

        let waiting: Vec<InstanceId> = self
            .state
            .live_instances()
            .filter(|inst| {
                matches!(
                    inst.awaiting,
                    Some(Awaiting::Action { .. } | Awaiting::Retrieval { .. })
                )
            })
            .map(|inst| inst.id)
            .collect();
        let runtime = self.runtime;
        for id in waiting {
            let drafts =
                runtime
                    .interpreter
                    .abort_instance(&mut self.state, id, AbortReason::Internal);
            for draft in drafts {
                let event = self.stamp(draft, "interpreter");
                self.out.push(event);
            }
        }
        self.state.invocations.clear();
    }
}

fn instance_of(event: &Event) -> Option<InstanceId> {
    event
        .get("instance")
        .and_then(Value::as_i64)
        .and_then(|n| u64::try_from(n).ok())
        .map(InstanceId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{EventPattern, Expr, Statement, Target};

    fn echo_flow() -> FlowDefinition {
        FlowDefinition::new(
            "echo",
            vec![
                Statement::matching(EventPattern::new(kinds::USER_SAID).capture("text", "text")),
                Statement::execute("shout")
                    .param("text", Expr::var("text"))
                    .output(Target::local("loud"))
                    .build(),
                Statement::say("$loud"),
            ],
        )
    }

    async fn runtime() -> Runtime {
        Runtime::builder()
            .flow(echo_flow())
            .action_fn("shout", |req: ActionRequest| async move {
                Ok::<_, ActionError>(ActionResult::value(req.str_param("text")?.to_uppercase()))
            })
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn generate_round_trips_through_an_action() {
        let runtime = runtime().await;
        let (state, messages) = runtime.generate(ConversationState::random(), "hello").await;

        assert_eq!(messages, vec!["HELLO"]);
        assert!(state.invocations.is_empty());
        let roles: Vec<Role> = state.history.iter().map(|h| h.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Bot]);
    }

    #[tokio::test]
    async fn input_events_are_not_echoed() {
        let runtime = runtime().await;
        let input = Event::user_said("hi");
        let output = runtime
            .process_events(ConversationState::random(), vec![input.clone()])
            .await;
        assert!(output.events.iter().all(|event| event.id != input.id));
        assert!(output.events.iter().all(|event| event.source != "external"));
    }

    #[tokio::test]
    async fn unregistered_actions_are_rejected_at_build() {
        let err = Runtime::builder().flow(echo_flow()).build().await.unwrap_err();
        assert!(matches!(
            err,
            RuntimeError::Config(ConfigError::UnknownAction { ref action, .. }) if action == "shout"
        ));
    }

    #[tokio::test]
    async fn builds_from_files() {
        let temp = tempfile::TempDir::new().unwrap();
        let config_path = temp.path().join("config.json");
        let flows_path = temp.path().join("flows.json");
        std::fs::write(&config_path, br#"{"history_window": 2}"#).unwrap();
        storage::write_atomic(&flows_path, &serde_json::to_vec(&vec![echo_flow()]).unwrap())
            .unwrap();

        let runtime = RuntimeBuilder::from_files(&config_path, &flows_path)
            .unwrap()
            .action_fn("shout", |_req: ActionRequest| async {
                Ok::<_, ActionError>(ActionResult::value("OK"))
            })
            .build()
            .await
            .unwrap();
        assert_eq!(runtime.config().history_window, 2);
        assert_eq!(runtime.flows().index_of("echo"), Some(0));

        let missing = RuntimeBuilder::from_files(&temp.path().join("nope.json"), &flows_path);
        assert!(matches!(missing, Err(RuntimeError::Storage(_))));
    }

    #[test]
    fn config_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_events_per_turn, 500);
        assert_eq!(config.fallback_message, DEFAULT_FALLBACK_MESSAGE);
    }
}
