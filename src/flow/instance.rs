use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::value::{Value, map_value};

/// Monotonic identifier of a flow instance within a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<InstanceId> for Value {
    fn from(id: InstanceId) -> Self {
        Value::Int(i64::try_from(id.0).unwrap_or(i64::MAX))
    }
}

/// Lifecycle state of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Created but not yet run.
    Pending,
    /// Suspended at a match point.
    ActiveMatching,
    /// Runnable; may be parked at a decision point.
    Advancing,
    /// Blocked on an action or retrieval.
    AwaitingAction,
    /// Blocked on a subflow.
    AwaitingSubflow,
    /// Reached `return` or the end of its body.
    Completed,
    /// Interrupted, failed or explicitly stopped.
    Aborted,
}

impl InstanceStatus {
    /// Whether the instance can no longer run.
    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceStatus::Completed | InstanceStatus::Aborted)
    }
}

/// Why an instance was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A higher-priority extension flow won the decision.
    Interrupted,
    /// An action failed without a failure branch.
    ActionFailed,
    /// A retrieval failed without a failure branch.
    RetrievalFailed,
    /// An expression or pattern could not be evaluated.
    EvaluationError,
    /// Too many instructions ran without suspending.
    StepLimit,
    /// Subflows nested too deeply.
    SubflowDepth,
    /// Too many flows started while processing one event.
    StartLimit,
    /// The flow executed `abort`.
    Explicit,
    /// The subflow caller went away.
    ParentAborted,
    /// A called subflow was aborted.
    SubflowAborted,
    /// The stored instance no longer fits the loaded flows.
    Internal,
}

impl AbortReason {
    /// Stable name used in `FlowAborted` events.
    pub fn as_str(self) -> &'static str {
        match self {
            AbortReason::Interrupted => "interrupted",
            AbortReason::ActionFailed => "action_failed",
            AbortReason::RetrievalFailed => "retrieval_failed",
            AbortReason::EvaluationError => "evaluation_error",
            AbortReason::StepLimit => "step_limit",
            AbortReason::SubflowDepth => "subflow_depth",
            AbortReason::StartLimit => "start_limit",
            AbortReason::Explicit => "explicit",
            AbortReason::ParentAborted => "parent_aborted",
            AbortReason::SubflowAborted => "subflow_aborted",
            AbortReason::Internal => "internal",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a suspended instance is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Awaiting {
    /// An action started by this instance.
    Action {
        /// Correlation id of the invocation.
        correlation_id: String,
        /// Action name.
        action: String,
    },
    /// A retrieval started by this instance.
    Retrieval {
        /// Correlation id of the search.
        correlation_id: String,
        /// Index name.
        index: String,
    },
    /// A subflow instance.
    Subflow {
        /// Child instance.
        child: InstanceId,
    },
}

impl Awaiting {
    /// Correlation id for action and retrieval waits.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Awaiting::Action { correlation_id, .. } | Awaiting::Retrieval { correlation_id, .. } => {
                Some(correlation_id)
            }
            Awaiting::Subflow { .. } => None,
        }
    }
}

/// Canonical-form candidate assembled from retrieval hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Example text.
    pub text: String,
    /// Its canonical form.
    pub canonical_form: String,
}

impl Candidate {
    /// Map form handed to the chooser action.
    pub fn to_value(&self) -> Value {
        map_value([
            ("text", self.text.as_str()),
            ("canonical_form", self.canonical_form.as_str()),
        ])
    }
}

/// Runtime instantiation of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    /// Instance id.
    pub id: InstanceId,
    /// Definition index in the flow set.
    pub flow: usize,
    /// Flow name, checked against the flow set when state is restored.
    pub flow_name: String,
    /// Program counter.
    pub head: usize,
    /// Local variables.
    #[serde(default)]
    pub locals: BTreeMap<String, Value>,
    /// Lifecycle state.
    pub status: InstanceStatus,
    /// Outstanding wait, if suspended on something other than a match.
    #[serde(default)]
    pub awaiting: Option<Awaiting>,
    /// Calling instance when this is a subflow.
    #[serde(default)]
    pub parent: Option<InstanceId>,
    /// Subflow nesting depth.
    #[serde(default)]
    pub depth: u32,
    /// Retrieval candidates waiting for the chooser.
    #[serde(default)]
    pub candidates: Option<Vec<Candidate>>,
}

impl FlowInstance {
    /// Fresh instance at the start of its flow.
    pub fn new(id: InstanceId, flow: usize, flow_name: impl Into<String>) -> Self {
        Self {
            id,
            flow,
            flow_name: flow_name.into(),
            head: 0,
            locals: BTreeMap::new(),
            status: InstanceStatus::Pending,
            awaiting: None,
            parent: None,
            depth: 0,
            candidates: None,
        }
    }

    /// Whether the instance is neither completed nor aborted.
    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Whether the instance waits on the given correlation id.
    pub fn awaits(&self, correlation_id: &str) -> bool {
        self.awaiting
            .as_ref()
            .and_then(Awaiting::correlation_id)
            .is_some_and(|id| id == correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_serialize_with_readable_status() {
        let mut instance = FlowInstance::new(InstanceId(7), 2, "greeting");
        instance.status = InstanceStatus::AwaitingAction;
        instance.awaiting = Some(Awaiting::Action {
            correlation_id: "c-1".into(),
            action: "resolve_intent".into(),
        });

        let json = serde_json::to_value(&instance).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["status"], "awaiting_action");
        assert_eq!(json["awaiting"]["kind"], "action");

        let back: FlowInstance = serde_json::from_value(json).unwrap();
        assert_eq!(back, instance);
        assert!(back.awaits("c-1"));
        assert!(!back.awaits("c-2"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Aborted.is_terminal());
        assert!(!InstanceStatus::AwaitingSubflow.is_terminal());
    }
}
