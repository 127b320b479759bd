use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::expr::Expr;
use super::pattern::EventPattern;

/// Priority given to flows that do not declare one.
pub const DEFAULT_PRIORITY: f64 = 1.0;

fn default_priority() -> f64 {
    DEFAULT_PRIORITY
}

fn default_max_results() -> usize {
    3
}

fn default_max_candidates() -> usize {
    5
}

/// Behavioural flags of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowFlags {
    /// May interrupt lower-priority flows at decision points.
    pub extension: bool,
    /// Several instances may be live at once.
    pub parallel: bool,
    /// Only started by `Subflow` statements; never spawned by events.
    pub subflow: bool,
}

/// Parsed flow as produced by an external loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// Unique flow name.
    pub name: String,
    /// Higher wins when flows compete at a decision point.
    #[serde(default = "default_priority")]
    pub priority: f64,
    /// Flow flags.
    #[serde(default)]
    pub flags: FlowFlags,
    /// Ordered statements.
    pub body: Vec<Statement>,
}

impl FlowDefinition {
    /// Flow with default priority and no flags.
    pub fn new(name: impl Into<String>, body: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            flags: FlowFlags::default(),
            body,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    /// Flag as an extension flow.
    pub fn extension(mut self) -> Self {
        self.flags.extension = true;
        self
    }

    /// Allow concurrent instances.
    pub fn parallel(mut self) -> Self {
        self.flags.parallel = true;
        self
    }

    /// Flag as a subflow.
    pub fn subflow(mut self) -> Self {
        self.flags.subflow = true;
        self
    }
}

/// Where an assignment or binding writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "name", rename_all = "snake_case")]
pub enum Target {
    /// Instance-local variable.
    Local(String),
    /// Conversation context variable.
    Context(String),
}

impl Target {
    /// Local target helper.
    pub fn local(name: impl Into<String>) -> Self {
        Target::Local(name.into())
    }

    /// Context target helper.
    pub fn context(name: impl Into<String>) -> Self {
        Target::Context(name.into())
    }
}

/// One `if`/`elif` arm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalArm {
    /// Condition tested for truthiness.
    pub condition: Expr,
    /// Statements run when it holds.
    pub body: Vec<Statement>,
}

/// Action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStatement {
    /// Registered action name.
    pub action: String,
    /// Parameters evaluated at the decision point.
    #[serde(default)]
    pub params: BTreeMap<String, Expr>,
    /// Where the return value is bound.
    #[serde(default)]
    pub output: Option<Target>,
    /// Statements run when the action fails; `error` is bound locally.
    #[serde(default)]
    pub on_failure: Option<Vec<Statement>>,
}

/// Resolution of free text to a canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalFormStatement {
    /// Text to resolve.
    pub input: Expr,
    /// Embeddings index holding the examples.
    pub index: String,
    /// Nearest examples handed to the chooser.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Action that picks among the candidates.
    pub chooser: String,
    /// Where the canonical form is bound.
    pub output: Target,
    /// Statements run when retrieval or the chooser fails.
    #[serde(default)]
    pub on_failure: Option<Vec<Statement>>,
}

/// Nearest-neighbour retrieval from an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrieveStatement {
    /// Embeddings index to search.
    pub index: String,
    /// Query text.
    pub query: Expr,
    /// Number of hits.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Hits farther than this cosine distance are dropped.
    #[serde(default)]
    pub max_distance: Option<f32>,
    /// Where the hit list is bound.
    pub output: Target,
    /// Statements run when the search fails.
    #[serde(default)]
    pub on_failure: Option<Vec<Statement>>,
}

/// Statement node of a flow body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Statement {
    /// Wait for an event matching the pattern.
    Match(EventPattern),
    /// Run an action and wait for its completion.
    Execute(ExecuteStatement),
    /// Emit an event.
    Emit {
        /// Type of the emitted event.
        event_type: String,
        /// Payload expressions.
        #[serde(default)]
        payload: BTreeMap<String, Expr>,
    },
    /// Emit `BotSay { text }`.
    Say(Expr),
    /// Bind a value.
    Assign {
        /// Destination.
        target: Target,
        /// Value expression.
        value: Expr,
    },
    /// Conditional.
    If {
        /// Arms tested in order.
        arms: Vec<ConditionalArm>,
        /// Fallback when no arm holds.
        #[serde(default)]
        otherwise: Option<Vec<Statement>>,
    },
    /// Loop while the condition holds.
    While {
        /// Loop condition.
        condition: Expr,
        /// Loop body.
        body: Vec<Statement>,
    },
    /// Run a subflow and wait for it to finish.
    Subflow(String),
    /// Start another flow without waiting.
    Start(String),
    /// Resolve text to a canonical form.
    GenerateCanonicalForm(CanonicalFormStatement),
    /// Retrieve nearest items from an index.
    Retrieve(RetrieveStatement),
    /// Finish the flow.
    Return,
    /// Abort the flow.
    Abort,
}

impl Statement {
    /// `match <pattern>`
    pub fn matching(pattern: EventPattern) -> Self {
        Statement::Match(pattern)
    }

    /// `execute <action>` without parameters or output.
    pub fn execute(action: impl Into<String>) -> ExecuteBuilder {
        ExecuteBuilder(ExecuteStatement {
            action: action.into(),
            params: BTreeMap::new(),
            output: None,
            on_failure: None,
        })
    }

    /// `bot say "<text>"` with `$var` interpolation.
    pub fn say(text: impl Into<String>) -> Self {
        Statement::Say(Expr::template(text))
    }

    /// `emit <event_type>` with payload expressions.
    pub fn emit<K: Into<String>>(
        event_type: impl Into<String>,
        payload: impl IntoIterator<Item = (K, Expr)>,
    ) -> Self {
        Statement::Emit {
            event_type: event_type.into(),
            payload: payload.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// `set <target> = <value>`
    pub fn assign(target: Target, value: Expr) -> Self {
        Statement::Assign { target, value }
    }

    /// `if <condition> <body>` with no other arms.
    pub fn when(condition: Expr, body: Vec<Statement>) -> Self {
        Statement::If {
            arms: vec![ConditionalArm { condition, body }],
            otherwise: None,
        }
    }
}

/// Fluent builder for [`ExecuteStatement`].
#[derive(Debug, Clone)]
pub struct ExecuteBuilder(ExecuteStatement);

impl ExecuteBuilder {
    /// Add a parameter.
    pub fn param(mut self, name: impl Into<String>, value: Expr) -> Self {
        self.0.params.insert(name.into(), value);
        self
    }

    /// Bind the return value.
    pub fn output(mut self, target: Target) -> Self {
        self.0.output = Some(target);
        self
    }

    /// Attach a failure branch.
    pub fn on_failure(mut self, body: Vec<Statement>) -> Self {
        self.0.on_failure = Some(body);
        self
    }

    /// Finish the statement.
    pub fn build(self) -> Statement {
        Statement::Execute(self.0)
    }
}

impl From<ExecuteBuilder> for Statement {
    fn from(builder: ExecuteBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_deserialize_with_defaults() {
        let json = r#"{
            "name": "greeting",
            "body": [
                {"kind": "match", "value": {"event_type": "UserIntent", "fields": {"intent": {"kind": "exact", "value": "express greeting"}}}},
                {"kind": "say", "value": {"op": "template", "args": "Hello!"}},
                {"kind": "return"}
            ]
        }"#;
        let flow: FlowDefinition = serde_json::from_str(json).unwrap();
        assert_eq!(flow.priority, DEFAULT_PRIORITY);
        assert_eq!(flow.flags, FlowFlags::default());
        assert_eq!(flow.body.len(), 3);
        assert_eq!(flow.body[1], Statement::say("Hello!"));
        assert_eq!(flow.body[2], Statement::Return);
    }

    #[test]
    fn retrieval_statements_default_their_limits() {
        let json = r#"{"kind": "retrieve", "value": {
            "index": "kb",
            "query": {"op": "var", "args": "question"},
            "output": {"scope": "local", "name": "chunks"}
        }}"#;
        let statement: Statement = serde_json::from_str(json).unwrap();
        match statement {
            Statement::Retrieve(retrieve) => {
                assert_eq!(retrieve.max_results, 3);
                assert_eq!(retrieve.output, Target::local("chunks"));
            }
            other => panic!("unexpected statement {other:?}"),
        }
    }
}
