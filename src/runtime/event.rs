//! Conversation events, ids and clocks
//!
//! Events are the only unit of communication between the runtime loop, the
//! interpreter and actions. Events created by the engine get ids derived from
//! the conversation id and a per-conversation sequence number, so a replayed
//! conversation produces the same ids.

use blake3::Hasher;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::flow::Value;

/// Event type names understood by the engine.
pub mod kinds {
    /// Raw user utterance (`text`).
    pub const USER_SAID: &str = "UserSaid";
    /// Resolved user intent (`intent`).
    pub const USER_INTENT: &str = "UserIntent";
    /// Bot utterance returned to the caller (`text`).
    pub const BOT_SAY: &str = "BotSay";
    /// Action start request and trace record.
    pub const ACTION_STARTED: &str = "ActionStarted";
    /// Action completion (`status` is `success` or `failure`).
    pub const ACTION_FINISHED: &str = "ActionFinished";
    /// An action failed and its flow had no failure branch.
    pub const ACTION_FAILED: &str = "ActionFailed";
    /// Request to cancel an in-flight action.
    pub const STOP_ACTION: &str = "StopAction";
    /// Index search request.
    pub const RETRIEVAL_STARTED: &str = "RetrievalStarted";
    /// Index search completion.
    pub const RETRIEVAL_FINISHED: &str = "RetrievalFinished";
    /// Context variables changed (`data`).
    pub const CONTEXT_UPDATE: &str = "ContextUpdate";
    /// A flow instance started.
    pub const FLOW_STARTED: &str = "FlowStarted";
    /// A flow instance completed.
    pub const FLOW_FINISHED: &str = "FlowFinished";
    /// A flow instance was aborted (`reason`).
    pub const FLOW_ABORTED: &str = "FlowAborted";
    /// A recoverable error inside one flow instance (`message`).
    pub const FLOW_ERROR: &str = "FlowError";
    /// A turn-level failure caught by the runtime loop.
    pub const INTERNAL_ERROR: &str = "InternalError";
}

/// Immutable conversational event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: String,
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Arbitrary payload.
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
    /// Who produced the event.
    pub source: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Event {
    /// Event supplied by the caller, with a random id and the current time.
    pub fn external(event_type: impl Into<String>, payload: BTreeMap<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            payload,
            source: "external".to_string(),
            created_at: Utc::now(),
        }
    }

    /// `UserSaid { text }` from the caller.
    pub fn user_said(text: impl Into<String>) -> Self {
        let mut payload = BTreeMap::new();
        payload.insert("text".to_string(), Value::String(text.into()));
        Self::external(kinds::USER_SAID, payload)
    }

    /// Whether the event has the given type.
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Payload field as a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }
}

/// Event content before the runtime assigns an id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    /// Event type tag.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Payload.
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
}

impl EventDraft {
    /// Draft with an empty payload.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload: BTreeMap::new(),
        }
    }

    /// Add a payload field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    /// Whether the draft has the given type.
    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    /// Payload field as a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Source of timestamps for engine-created events.
pub trait Clock: Send + Sync {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant, for reproducible traces.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Deterministic id for the `seq`-th object of `domain` in a conversation.
pub fn derive_id(conversation: &Uuid, domain: &str, seq: u64) -> String {
    let mut hasher = Hasher::new();
    hasher.update(conversation.as_bytes());
    hasher.update(domain.as_bytes());
    hasher.update(&seq.to_le_bytes());
    let hash = hasher.finalize();
    let hex = hash.to_hex();
    format!("{}_{}", domain, &hex.as_str()[..32])
}
