//! Guardflow – an event-driven dialog-flow runtime for guarding LLM conversations
//!
//! This crate implements the orchestration core of a guardrails engine:
//! - A flow interpreter that matches conversational events against
//!   declaratively defined flows and decides the next step
//! - Priority and interruption resolution between competing flows
//! - An action dispatcher that runs named asynchronous actions concurrently
//! - An embeddings index (with caching and batching layers) used to resolve
//!   free text to canonical forms by nearest-neighbour retrieval

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Embedding models and nearest-neighbour indices.
pub mod embeddings;
/// Flow definitions, lowering and the flow interpreter.
pub mod flow;
/// Runtime loop, events and action dispatch.
pub mod runtime;

// Re-export key types for convenience
pub use flow::{FlowDefinition, FlowSet, Value};
pub use runtime::{ConversationState, Event, Runtime, RuntimeConfig, TurnOutput};

/// Current version of the guardflow runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
