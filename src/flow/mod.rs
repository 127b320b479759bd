//! Flow definitions and the flow interpreter
//!
//! Flows arrive as a pre-parsed statement tree ([`ast`]), are validated and
//! lowered into a flat instruction arena ([`ir`], [`builder`]), and are then
//! executed by the [`interpreter`] one event at a time against
//! [`instance::FlowInstance`] records owned by the conversation state.

/// Statement trees for flow definitions.
pub mod ast;
/// Validation and lowering of statement trees.
pub mod builder;
/// Expressions evaluated inside flows.
pub mod expr;
/// Per-instance execution state.
pub mod instance;
/// The tick-based flow interpreter.
pub mod interpreter;
/// Flat instruction representation.
pub mod ir;
/// Event patterns.
pub mod pattern;
/// Dynamically typed values and the conversation context.
pub mod value;

pub use ast::{ConditionalArm, FlowDefinition, FlowFlags, Statement, Target};
pub use builder::build_flow_set;
pub use expr::{Expr, FrameScope, Scope};
pub use instance::{AbortReason, Awaiting, FlowInstance, InstanceId, InstanceStatus};
pub use interpreter::{Interpreter, InterpreterError, MAX_STARTS_PER_TICK, MAX_SUBFLOW_DEPTH};
pub use ir::{CanonicalExample, CompiledFlow, ExampleCatalog, FlowSet, Instruction};
pub use pattern::{EventPattern, FieldPattern};
pub use value::{Context, Value, ValueTypeError, map_value};

use thiserror::Error;

/// Convenience result alias for configuration-time operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Fatal errors detected while loading flow definitions.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    /// A flow was declared without a name.
    #[error("flow at position {position} has an empty name")]
    EmptyName {
        /// Position of the definition in the input list.
        position: usize,
    },

    /// Two flows share a name.
    #[error("duplicate flow name '{0}'")]
    DuplicateFlow(String),

    /// A flow has no statements.
    #[error("flow '{0}' has an empty body")]
    EmptyBody(String),

    /// A startable flow does not begin with a match statement.
    #[error("flow '{0}' must start with a match statement unless it is a subflow")]
    MissingEntryMatch(String),

    /// Priority is NaN or infinite.
    #[error("flow '{flow}' has invalid priority {priority}")]
    InvalidPriority {
        /// Offending flow.
        flow: String,
        /// Declared priority.
        priority: f64,
    },

    /// A statement references a flow that does not exist.
    #[error("flow '{flow}' references unknown flow '{target}'")]
    UnknownFlow {
        /// Referencing flow.
        flow: String,
        /// Missing flow name.
        target: String,
    },

    /// A subflow call targets a flow not flagged as a subflow.
    #[error("flow '{flow}' calls '{target}' as a subflow but it is not flagged as one")]
    NotASubflow {
        /// Calling flow.
        flow: String,
        /// Called flow.
        target: String,
    },

    /// A statement references an action missing from the registry.
    #[error("flow '{flow}' references unregistered action '{action}'")]
    UnknownAction {
        /// Referencing flow.
        flow: String,
        /// Missing action name.
        action: String,
    },

    /// A statement references an embeddings index that is not configured.
    #[error("flow '{flow}' references unknown index '{index}'")]
    UnknownIndex {
        /// Referencing flow.
        flow: String,
        /// Missing index name.
        index: String,
    },

    /// A statement carries an invalid argument.
    #[error("flow '{flow}': {message}")]
    InvalidArgument {
        /// Offending flow.
        flow: String,
        /// What is wrong.
        message: String,
    },
}

/// Recoverable errors raised while evaluating expressions or patterns.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    /// A variable was referenced before being bound.
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    /// A value had the wrong type.
    #[error(transparent)]
    Type(#[from] ValueTypeError),

    /// An operator was applied to values it does not support.
    #[error("cannot apply '{op}' to {left} and {right}")]
    InvalidOperands {
        /// Operator name.
        op: &'static str,
        /// Left operand type.
        left: &'static str,
        /// Right operand type.
        right: &'static str,
    },
}
