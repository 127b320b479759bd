use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::EvalError;
use super::expr::{Expr, Scope};
use super::value::Value;

/// Event type accepted by every pattern whose type is the wildcard.
pub const ANY_EVENT: &str = "*";

/// Constraint on a single payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum FieldPattern {
    /// Field must equal the literal.
    Exact(Value),
    /// Field must be present with any value.
    Any,
    /// Field must be present; its value is bound to the named local.
    Capture(String),
    /// Field must equal the evaluated expression.
    Expr(Expr),
}

/// Structural pattern over an event's type and payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    /// Expected event type, or `*`.
    pub event_type: String,
    /// Per-field constraints; fields not listed are ignored.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldPattern>,
}

impl EventPattern {
    /// Pattern matching every event of `event_type`.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a field constraint.
    pub fn field(mut self, name: impl Into<String>, pattern: FieldPattern) -> Self {
        self.fields.insert(name.into(), pattern);
        self
    }

    /// Require `name == value`.
    pub fn exact(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.field(name, FieldPattern::Exact(value.into()))
    }

    /// Bind `name` into the local `var`.
    pub fn capture(self, name: impl Into<String>, var: impl Into<String>) -> Self {
        self.field(name, FieldPattern::Capture(var.into()))
    }

    /// Whether the type part of the pattern accepts `event_type`.
    pub fn accepts_type(&self, event_type: &str) -> bool {
        self.event_type == ANY_EVENT || self.event_type == event_type
    }

    /// Test an event. Returns the captured bindings on a match.
    ///
    /// Fails only when an `Expr` constraint cannot be evaluated, which the
    /// interpreter treats as a matching error of the owning instance.
    pub fn matches(
        &self,
        event_type: &str,
        payload: &BTreeMap<String, Value>,
        scope: &dyn Scope,
    ) -> Result<Option<BTreeMap<String, Value>>, EvalError> {
        if !self.accepts_type(event_type) {
            return Ok(None);
        }

        let mut captures = BTreeMap::new();
        for (name, constraint) in &self.fields {
            let Some(actual) = payload.get(name) else {
                return Ok(None);
            };
            let accepted = match constraint {
                FieldPattern::Any => true,
                FieldPattern::Exact(expected) => actual.loosely_equals(expected),
                FieldPattern::Capture(var) => {
                    captures.insert(var.clone(), actual.clone());
                    true
                }
                FieldPattern::Expr(expr) => actual.loosely_equals(&expr.eval(scope)?),
            };
            if !accepted {
                return Ok(None);
            }
        }
        Ok(Some(captures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::value::Context;

    fn payload(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn type_and_literal_fields_must_agree() {
        let pattern = EventPattern::new("UserIntent").exact("intent", "express greeting");
        let context = Context::new();

        let hit = payload(&[("intent", "express greeting".into())]);
        let miss = payload(&[("intent", "ask weather".into())]);

        assert!(pattern.matches("UserIntent", &hit, &context).unwrap().is_some());
        assert!(pattern.matches("UserIntent", &miss, &context).unwrap().is_none());
        assert!(pattern.matches("BotSay", &hit, &context).unwrap().is_none());
    }

    #[test]
    fn captures_bind_values() {
        let pattern = EventPattern::new(ANY_EVENT)
            .capture("text", "utterance")
            .field("source", FieldPattern::Any);
        let context = Context::new();
        let event = payload(&[("text", "hi".into()), ("source", "web".into())]);

        let captures = pattern.matches("UserSaid", &event, &context).unwrap().unwrap();
        assert_eq!(captures.get("utterance"), Some(&Value::from("hi")));

        let missing = payload(&[("text", "hi".into())]);
        assert!(pattern.matches("UserSaid", &missing, &context).unwrap().is_none());
    }

    #[test]
    fn expression_fields_resolve_against_scope() {
        let pattern = EventPattern::new("UserIntent")
            .field("intent", FieldPattern::Expr(Expr::var("expected_intent")));
        let mut context = Context::new();
        let event = payload(&[("intent", "affirm".into())]);

        let err = pattern.matches("UserIntent", &event, &context).unwrap_err();
        assert_eq!(err, EvalError::UndefinedVariable("expected_intent".into()));

        context.set("expected_intent", "affirm");
        assert!(pattern.matches("UserIntent", &event, &context).unwrap().is_some());
    }
}
