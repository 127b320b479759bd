#![allow(dead_code)]

use std::sync::{Arc, Once};

use chrono::{TimeZone, Utc};
use guardflow::flow::{EventPattern, FlowDefinition, Statement};
use guardflow::runtime::{ConversationState, Event, FixedClock, RuntimeBuilder, RuntimeConfig, kinds};
use uuid::Uuid;

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness; `RUST_LOG` filters it.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builder with a frozen clock so traces are reproducible.
pub fn builder() -> RuntimeBuilder {
    builder_with(RuntimeConfig::default())
}

pub fn builder_with(config: RuntimeConfig) -> RuntimeBuilder {
    init_tracing();
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    RuntimeBuilder::new(config).clock(Arc::new(FixedClock(at)))
}

pub fn state() -> ConversationState {
    ConversationState::new(Uuid::from_u128(0x5eed))
}

/// `UserSaid` with a fixed id and timestamp.
pub fn user_said(text: &str) -> Event {
    let mut event = Event::user_said(text);
    event.id = format!("input-{text}");
    event.created_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    event
}

/// Flow started by any user utterance, binding it to `$text`.
pub fn on_user_said(name: &str, body: Vec<Statement>) -> FlowDefinition {
    let mut full = vec![Statement::matching(
        EventPattern::new(kinds::USER_SAID).capture("text", "text"),
    )];
    full.extend(body);
    FlowDefinition::new(name, full)
}

/// `(type, text-ish summary)` pairs for compact assertions.
pub fn trace(events: &[Event], types: &[&str]) -> Vec<(String, String)> {
    events
        .iter()
        .filter(|event| types.contains(&event.event_type.as_str()))
        .map(|event| {
            let detail = event
                .get_str("text")
                .or_else(|| event.get_str("action_name"))
                .unwrap_or_default()
                .to_string();
            (event.event_type.clone(), detail)
        })
        .collect()
}
