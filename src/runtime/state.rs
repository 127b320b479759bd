//! Per-conversation state carried between turns
//!
//! The caller owns a [`ConversationState`] and hands it to
//! `Runtime::process_events` for every turn; the runtime returns the updated
//! state alongside the turn's events. The state is plain data and
//! round-trips through serde for persistence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::action::ActionInvocation;
use super::event::derive_id;
use crate::flow::{Context, FlowInstance, InstanceId, Value, map_value};

/// Who produced an utterance in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// End user.
    User,
    /// The bot.
    Bot,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Bot => "bot",
        }
    }
}

/// One utterance in the rolling history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Speaker.
    pub role: Role,
    /// Utterance text.
    pub text: String,
}

impl HistoryEntry {
    /// Map form handed to chooser actions.
    pub fn to_value(&self) -> Value {
        map_value([("role", self.role.as_str()), ("text", self.text.as_str())])
    }
}

/// Everything the engine remembers about one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    /// Conversation id; seeds every derived id.
    pub conversation_id: Uuid,
    /// Conversation context.
    #[serde(default)]
    pub context: Context,
    /// Flow instances ordered by id. Terminated instances stay visible until
    /// the start of the next turn.
    #[serde(default)]
    pub instances: Vec<FlowInstance>,
    /// In-flight actions and retrievals by correlation id.
    #[serde(default)]
    pub invocations: BTreeMap<String, ActionInvocation>,
    /// Recent utterances, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    next_instance: u64,
    #[serde(default)]
    next_event: u64,
    #[serde(default)]
    next_correlation: u64,
}

impl ConversationState {
    /// Fresh state for a new conversation.
    pub fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            context: Context::new(),
            instances: Vec::new(),
            invocations: BTreeMap::new(),
            history: Vec::new(),
            next_instance: 0,
            next_event: 0,
            next_correlation: 0,
        }
    }

    /// Fresh state with a random conversation id.
    pub fn random() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Allocate the next instance id.
    pub fn mint_instance_id(&mut self) -> InstanceId {
        self.next_instance += 1;
        InstanceId(self.next_instance)
    }

    /// Allocate the next event id.
    pub fn mint_event_id(&mut self) -> String {
        self.next_event += 1;
        derive_id(&self.conversation_id, "evt", self.next_event)
    }

    /// Allocate the next correlation id.
    pub fn mint_correlation_id(&mut self) -> String {
        self.next_correlation += 1;
        derive_id(&self.conversation_id, "act", self.next_correlation)
    }

    /// Instance by id.
    pub fn instance(&self, id: InstanceId) -> Option<&FlowInstance> {
        self.instances.iter().find(|inst| inst.id == id)
    }

    /// Instances that have not terminated.
    pub fn live_instances(&self) -> impl Iterator<Item = &FlowInstance> {
        self.instances.iter().filter(|inst| inst.is_live())
    }

    /// Instances of the named flow, live or not.
    pub fn instances_of<'a>(&'a self, flow_name: &'a str) -> impl Iterator<Item = &'a FlowInstance> {
        self.instances
            .iter()
            .filter(move |inst| inst.flow_name == flow_name)
    }

    /// Drop completed and aborted instances.
    pub fn prune_terminated(&mut self) -> usize {
        let before = self.instances.len();
        self.instances.retain(FlowInstance::is_live);
        before - self.instances.len()
    }

    /// Append an utterance, keeping at most `window` entries.
    pub fn record_utterance(&mut self, role: Role, text: impl Into<String>, window: usize) {
        self.history.push(HistoryEntry {
            role,
            text: text.into(),
        });
        if self.history.len() > window {
            let excess = self.history.len() - window;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::InstanceStatus;

    #[test]
    fn minted_ids_follow_the_conversation() {
        let mut a = ConversationState::new(Uuid::from_u128(1));
        let mut b = ConversationState::new(Uuid::from_u128(1));
        let mut c = ConversationState::new(Uuid::from_u128(2));

        assert_eq!(a.mint_event_id(), b.mint_event_id());
        assert_ne!(a.mint_event_id(), c.mint_event_id());
        assert_eq!(a.mint_instance_id(), InstanceId(1));
        assert_eq!(a.mint_instance_id(), InstanceId(2));
        assert_ne!(a.mint_correlation_id(), a.mint_correlation_id());
    }

    #[test]
    fn history_is_bounded() {
        let mut state = ConversationState::random();
        for turn in 0..5 {
            state.record_utterance(Role::User, format!("message {turn}"), 3);
        }
        let texts: Vec<&str> = state.history.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["message 2", "message 3", "message 4"]);
    }

    #[test]
    fn pruning_keeps_live_instances() {
        let mut state = ConversationState::random();
        let mut done = FlowInstance::new(state.mint_instance_id(), 0, "a");
        done.status = InstanceStatus::Completed;
        let mut live = FlowInstance::new(state.mint_instance_id(), 0, "a");
        live.status = InstanceStatus::ActiveMatching;
        state.instances = vec![done, live];

        assert_eq!(state.prune_terminated(), 1);
        assert_eq!(state.instances.len(), 1);
        assert_eq!(state.instances_of("a").count(), 1);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = ConversationState::new(Uuid::from_u128(9));
        state.context.set("user_name", "Ada");
        state.record_utterance(Role::Bot, "Hello!", 10);
        let _ = state.mint_event_id();

        let json = serde_json::to_string(&state).unwrap();
        let back: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
