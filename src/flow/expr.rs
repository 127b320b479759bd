use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use super::EvalError;
use super::value::{Context, Value};

/// Variable lookup used during expression evaluation.
pub trait Scope {
    /// Resolve a bare variable name.
    fn lookup(&self, name: &str) -> Option<&Value>;

    /// Resolve a possibly dotted path such as `user.name`.
    fn resolve(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.lookup(path) {
            return Some(value);
        }
        let mut segments = path.split('.');
        let root = self.lookup(segments.next()?)?;
        segments.try_fold(root, |value, key| value.get(key))
    }
}

/// Scope of a running flow instance: its locals shadow the context.
pub struct FrameScope<'a> {
    locals: &'a BTreeMap<String, Value>,
    context: &'a Context,
}

impl<'a> FrameScope<'a> {
    /// Combine instance locals with the conversation context.
    pub fn new(locals: &'a BTreeMap<String, Value>, context: &'a Context) -> Self {
        Self { locals, context }
    }
}

impl Scope for FrameScope<'_> {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals.get(name).or_else(|| self.context.get(name))
    }
}

impl Scope for Context {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Expression language used by conditions, assignments and parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Expr {
    /// Constant value.
    Literal(Value),
    /// Variable reference (locals first, then context). Dotted paths index maps.
    Var(String),
    /// Whether a variable is bound.
    Defined(String),
    /// String with `$name` placeholders.
    Template(String),
    /// Logical negation of truthiness.
    Not(Box<Expr>),
    /// Equality (ints and floats compare numerically).
    Eq(Box<Expr>, Box<Expr>),
    /// Inequality.
    Ne(Box<Expr>, Box<Expr>),
    /// Less than.
    Lt(Box<Expr>, Box<Expr>),
    /// Less than or equal.
    Le(Box<Expr>, Box<Expr>),
    /// Greater than.
    Gt(Box<Expr>, Box<Expr>),
    /// Greater than or equal.
    Ge(Box<Expr>, Box<Expr>),
    /// Short-circuit conjunction.
    And(Vec<Expr>),
    /// Short-circuit disjunction.
    Or(Vec<Expr>),
    /// List membership, substring test, or map key test.
    Contains(Box<Expr>, Box<Expr>),
    /// Field access on a map value.
    Field(Box<Expr>, String),
    /// List built from element expressions.
    List(Vec<Expr>),
}

impl Expr {
    /// Literal helper.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Variable helper.
    pub fn var(name: impl Into<String>) -> Self {
        Expr::Var(name.into())
    }

    /// Template helper.
    pub fn template(text: impl Into<String>) -> Self {
        Expr::Template(text.into())
    }

    /// `left == right`
    pub fn eq(left: Expr, right: Expr) -> Self {
        Expr::Eq(Box::new(left), Box::new(right))
    }

    /// `left != right`
    pub fn ne(left: Expr, right: Expr) -> Self {
        Expr::Ne(Box::new(left), Box::new(right))
    }

    /// `left < right`
    pub fn lt(left: Expr, right: Expr) -> Self {
        Expr::Lt(Box::new(left), Box::new(right))
    }

    /// `left > right`
    pub fn gt(left: Expr, right: Expr) -> Self {
        Expr::Gt(Box::new(left), Box::new(right))
    }

    /// `not expr`
    #[allow(clippy::should_implement_trait)]
    pub fn not(expr: Expr) -> Self {
        Expr::Not(Box::new(expr))
    }

    /// `haystack contains needle`
    pub fn contains(haystack: Expr, needle: Expr) -> Self {
        Expr::Contains(Box::new(haystack), Box::new(needle))
    }

    /// Evaluate against a scope.
    pub fn eval(&self, scope: &dyn Scope) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Var(name) => scope
                .resolve(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
            Expr::Defined(name) => Ok(Value::Bool(scope.resolve(name).is_some())),
            Expr::Template(text) => render_template(text, scope).map(Value::String),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(scope)?.is_truthy())),
            Expr::Eq(left, right) => {
                let (left, right) = (left.eval(scope)?, right.eval(scope)?);
                Ok(Value::Bool(left.loosely_equals(&right)))
            }
            Expr::Ne(left, right) => {
                let (left, right) = (left.eval(scope)?, right.eval(scope)?);
                Ok(Value::Bool(!left.loosely_equals(&right)))
            }
            Expr::Lt(left, right) => ordering("<", left, right, scope, |o| o == Ordering::Less),
            Expr::Le(left, right) => ordering("<=", left, right, scope, |o| o != Ordering::Greater),
            Expr::Gt(left, right) => ordering(">", left, right, scope, |o| o == Ordering::Greater),
            Expr::Ge(left, right) => ordering(">=", left, right, scope, |o| o != Ordering::Less),
            Expr::And(items) => {
                for item in items {
                    if !item.eval(scope)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if item.eval(scope)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Contains(haystack, needle) => {
                let (haystack, needle) = (haystack.eval(scope)?, needle.eval(scope)?);
                let found = match (&haystack, &needle) {
                    (Value::List(items), _) => items.iter().any(|item| item.loosely_equals(&needle)),
                    (Value::String(text), Value::String(part)) => text.contains(part.as_str()),
                    (Value::Map(map), Value::String(key)) => map.contains_key(key),
                    _ => {
                        return Err(EvalError::InvalidOperands {
                            op: "contains",
                            left: haystack.type_name(),
                            right: needle.type_name(),
                        });
                    }
                };
                Ok(Value::Bool(found))
            }
            Expr::Field(base, key) => {
                let base = base.eval(scope)?;
                let map = base.expect_map()?;
                Ok(map.get(key).cloned().unwrap_or(Value::Null))
            }
            Expr::List(items) => items
                .iter()
                .map(|item| item.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
        }
    }
}

fn ordering(
    op: &'static str,
    left: &Expr,
    right: &Expr,
    scope: &dyn Scope,
    accept: impl Fn(Ordering) -> bool,
) -> Result<Value, EvalError> {
    let (left, right) = (left.eval(scope)?, right.eval(scope)?);
    match left.compare(&right) {
        Some(order) => Ok(Value::Bool(accept(order))),
        None => Err(EvalError::InvalidOperands {
            op,
            left: left.type_name(),
            right: right.type_name(),
        }),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Expand `$name` (and `$user.name`) placeholders. A `$` not followed by a
/// name is kept literally; `$$` produces a single `$`.
pub fn render_template(text: &str, scope: &dyn Scope) -> Result<String, EvalError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 1..];

        if let Some(stripped) = rest.strip_prefix('$') {
            out.push('$');
            rest = stripped;
            continue;
        }

        let len = rest.find(|c: char| !is_name_char(c)).unwrap_or(rest.len());
        // trailing dots belong to the sentence, not the path
        let name = rest[..len].trim_end_matches('.');
        if name.is_empty() {
            out.push('$');
            continue;
        }

        let value = scope
            .resolve(name)
            .ok_or_else(|| EvalError::UndefinedVariable(name.to_string()))?;
        out.push_str(&value.to_string());
        rest = &rest[name.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::value::map_value;

    fn scope_fixture() -> (BTreeMap<String, Value>, Context) {
        let mut locals = BTreeMap::new();
        locals.insert("name".to_string(), Value::from("Ada"));
        locals.insert("count".to_string(), Value::Int(3));

        let mut context = Context::new();
        context.set("name", "shadowed");
        context.set("user", map_value([("tier", "gold")]));
        context.set("topics", Value::List(vec!["weather".into(), "sports".into()]));
        (locals, context)
    }

    #[test]
    fn locals_shadow_context() {
        let (locals, context) = scope_fixture();
        let scope = FrameScope::new(&locals, &context);
        assert_eq!(Expr::var("name").eval(&scope).unwrap(), Value::from("Ada"));
        assert_eq!(
            Expr::var("user.tier").eval(&scope).unwrap(),
            Value::from("gold")
        );
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let (locals, context) = scope_fixture();
        let scope = FrameScope::new(&locals, &context);
        assert_eq!(
            Expr::var("missing").eval(&scope),
            Err(EvalError::UndefinedVariable("missing".into()))
        );
        assert_eq!(
            Expr::Defined("missing".into()).eval(&scope).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn templates_interpolate_values() {
        let (locals, context) = scope_fixture();
        let scope = FrameScope::new(&locals, &context);
        let rendered = render_template("Hi $name, you are $user.tier. Cost: $$5", &scope).unwrap();
        assert_eq!(rendered, "Hi Ada, you are gold. Cost: $5");
        assert_eq!(render_template("just $ sign", &scope).unwrap(), "just $ sign");
    }

    #[test]
    fn comparisons_and_logic() {
        let (locals, context) = scope_fixture();
        let scope = FrameScope::new(&locals, &context);

        let expr = Expr::And(vec![
            Expr::gt(Expr::var("count"), Expr::lit(2.5)),
            Expr::contains(Expr::var("topics"), Expr::lit("weather")),
            Expr::not(Expr::eq(Expr::var("name"), Expr::lit("Bob"))),
        ]);
        assert_eq!(expr.eval(&scope).unwrap(), Value::Bool(true));

        let err = Expr::lt(Expr::var("name"), Expr::lit(1)).eval(&scope).unwrap_err();
        assert!(matches!(err, EvalError::InvalidOperands { op: "<", .. }));
    }

    #[test]
    fn or_short_circuits_past_undefined_variables() {
        let (locals, context) = scope_fixture();
        let scope = FrameScope::new(&locals, &context);
        let expr = Expr::Or(vec![Expr::lit(true), Expr::var("missing")]);
        assert_eq!(expr.eval(&scope).unwrap(), Value::Bool(true));
    }

    #[test]
    fn expressions_deserialize_from_tagged_json() {
        let json = r#"{"op": "eq", "args": [{"op": "var", "args": "intent"}, {"op": "literal", "args": "greet"}]}"#;
        let expr: Expr = serde_json::from_str(json).unwrap();
        assert_eq!(expr, Expr::eq(Expr::var("intent"), Expr::lit("greet")));
    }
}
