use std::collections::{BTreeMap, HashMap};

use super::ast::{FlowFlags, Target};
use super::expr::Expr;
use super::pattern::EventPattern;

/// Lowered instruction. Jump targets are absolute indices into the owning
/// flow's code vector.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Suspend until a matching event arrives.
    Match(EventPattern),
    /// Decision point: start an action.
    Execute {
        /// Action name.
        action: String,
        /// Parameter expressions.
        params: BTreeMap<String, Expr>,
        /// Return value binding.
        output: Option<Target>,
        /// Start of the failure branch.
        on_failure: Option<usize>,
    },
    /// Decision point: emit an event.
    Emit {
        /// Event type.
        event_type: String,
        /// Payload expressions.
        payload: BTreeMap<String, Expr>,
    },
    /// Bind a value.
    Assign {
        /// Destination.
        target: Target,
        /// Value expression.
        value: Expr,
    },
    /// Continue at `target` when the condition is falsy.
    JumpUnless {
        /// Condition.
        condition: Expr,
        /// Jump target.
        target: usize,
    },
    /// Unconditional jump.
    Jump(usize),
    /// Run a subflow (by flow index) and wait for it.
    CallSubflow(usize),
    /// Start a flow (by flow index) without waiting.
    StartFlow(usize),
    /// Exact lookup, or a decision point for retrieval and choice.
    GenerateCanonicalForm {
        /// Text to resolve.
        input: Expr,
        /// Index name.
        index: String,
        /// Candidate count.
        max_candidates: usize,
        /// Chooser action name.
        chooser: String,
        /// Canonical form binding.
        output: Target,
        /// Start of the failure branch.
        on_failure: Option<usize>,
    },
    /// Decision point: search an index.
    Retrieve {
        /// Index name.
        index: String,
        /// Query expression.
        query: Expr,
        /// Number of hits.
        max_results: usize,
        /// Distance cut-off.
        max_distance: Option<f32>,
        /// Hit list binding.
        output: Target,
        /// Start of the failure branch.
        on_failure: Option<usize>,
    },
    /// Complete the instance.
    Return,
    /// Abort the instance.
    Abort,
}

/// A validated, lowered flow.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFlow {
    /// Flow name.
    pub name: String,
    /// Priority.
    pub priority: f64,
    /// Flags.
    pub flags: FlowFlags,
    /// Instruction arena.
    pub code: Vec<Instruction>,
}

impl CompiledFlow {
    /// Pattern that spawns new instances, if the flow is event-started.
    pub fn entry_pattern(&self) -> Option<&EventPattern> {
        if self.flags.subflow {
            return None;
        }
        match self.code.first() {
            Some(Instruction::Match(pattern)) => Some(pattern),
            _ => None,
        }
    }

    /// Names of actions this flow may start.
    pub fn referenced_actions(&self) -> impl Iterator<Item = &str> {
        self.code.iter().filter_map(|instr| match instr {
            Instruction::Execute { action, .. } => Some(action.as_str()),
            Instruction::GenerateCanonicalForm { chooser, .. } => Some(chooser.as_str()),
            _ => None,
        })
    }

    /// Names of indices this flow may search.
    pub fn referenced_indices(&self) -> impl Iterator<Item = &str> {
        self.code.iter().filter_map(|instr| match instr {
            Instruction::GenerateCanonicalForm { index, .. } | Instruction::Retrieve { index, .. } => {
                Some(index.as_str())
            }
            _ => None,
        })
    }
}

/// Example utterance labelled with its canonical form.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CanonicalExample {
    /// Example text.
    pub text: String,
    /// Canonical form label.
    pub canonical_form: String,
}

impl CanonicalExample {
    /// Pair a text with its label.
    pub fn new(text: impl Into<String>, canonical_form: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            canonical_form: canonical_form.into(),
        }
    }
}

fn normalize_utterance(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Exact-match table of canonical-form examples, per index name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExampleCatalog {
    exact: HashMap<String, HashMap<String, String>>,
}

impl ExampleCatalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register examples under `index`. On duplicate texts the first label wins.
    pub fn add(&mut self, index: &str, examples: impl IntoIterator<Item = CanonicalExample>) {
        let exact = self.exact.entry(index.to_string()).or_default();
        for example in examples {
            exact
                .entry(normalize_utterance(&example.text))
                .or_insert(example.canonical_form);
        }
    }

    /// Case-insensitive, whitespace-trimmed exact lookup.
    pub fn lookup(&self, index: &str, text: &str) -> Option<&str> {
        self.exact
            .get(index)?
            .get(&normalize_utterance(text))
            .map(String::as_str)
    }
}

/// Every compiled flow of a configuration, in definition order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlowSet {
    flows: Vec<CompiledFlow>,
    by_name: HashMap<String, usize>,
    examples: ExampleCatalog,
}

impl FlowSet {
    pub(crate) fn from_compiled(flows: Vec<CompiledFlow>) -> Self {
        let by_name = flows
            .iter()
            .enumerate()
            .map(|(idx, flow)| (flow.name.clone(), idx))
            .collect();
        Self {
            flows,
            by_name,
            examples: ExampleCatalog::new(),
        }
    }

    /// Attach the canonical-form examples.
    pub fn with_examples(mut self, examples: ExampleCatalog) -> Self {
        self.examples = examples;
        self
    }

    /// Canonical-form examples.
    pub fn examples(&self) -> &ExampleCatalog {
        &self.examples
    }

    /// Number of flows.
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    /// Whether no flows are defined.
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Flow by definition index.
    pub fn get(&self, index: usize) -> Option<&CompiledFlow> {
        self.flows.get(index)
    }

    /// Definition index of a named flow.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Flows with their definition indices.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &CompiledFlow)> {
        self.flows.iter().enumerate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_lookup_ignores_case_and_padding() {
        let mut catalog = ExampleCatalog::new();
        catalog.add(
            "user_messages",
            [
                CanonicalExample::new("Hi", "express greeting"),
                CanonicalExample::new("hi", "something else"),
            ],
        );
        assert_eq!(
            catalog.lookup("user_messages", "  HI "),
            Some("express greeting")
        );
        assert_eq!(catalog.lookup("user_messages", "hello"), None);
        assert_eq!(catalog.lookup("other", "hi"), None);
    }
}
