//! Guard evaluation.
//!
//! A guard wraps an expression that must evaluate to a boolean. Guards are
//! either inline on a transition or declared by name on a state machine and
//! referenced from transitions.

use crate::error::CoreError;
use crate::expression::{Expression, Scope};
use serde_json::Value;

/// A boolean condition over the instance's extent.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    name: Option<String>,
    expression: Expression,
}

impl Guard {
    /// Creates an anonymous guard.
    pub fn new(expression: Expression) -> Self {
        Self {
            name: None,
            expression,
        }
    }

    /// Creates a named guard.
    pub fn named(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            name: Some(name.into()),
            expression,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn expression(&self) -> &Expression {
        &self.expression
    }

    /// Evaluates the guard. Non-boolean results are an error.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<bool, CoreError> {
        match self.expression.evaluate(scope)? {
            Value::Bool(b) => Ok(b),
            _ => Err(CoreError::GuardNotBoolean {
                expression: self.expression.source().to_string(),
            }),
        }
    }

    /// Re-resolves a named guard against `named`, keeping it if absent.
    pub fn rebind(&self, named: &[Guard]) -> Guard {
        match &self.name {
            Some(name) => named
                .iter()
                .find(|guard| guard.name() == Some(name.as_str()))
                .cloned()
                .unwrap_or_else(|| self.clone()),
            None => self.clone(),
        }
    }
}

/// Evaluates guard lists.
pub struct GuardEvaluator;

impl GuardEvaluator {
    /// Evaluates a single guard.
    pub fn evaluate(guard: &Guard, scope: &dyn Scope) -> Result<bool, CoreError> {
        guard.evaluate(scope)
    }

    /// Returns true if all guards pass (an empty list always passes).
    ///
    /// Evaluation stops at the first failing guard.
    pub fn evaluate_all(guards: &[Guard], scope: &dyn Scope) -> Result<bool, CoreError> {
        for guard in guards {
            if !guard.evaluate(scope)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn guard(source: &str) -> Guard {
        Guard::new(Expression::new(source).unwrap())
    }

    fn scope(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_boolean_guard() {
        let g = guard("v > 10");
        assert!(g.evaluate(&scope(json!({"v": 11}))).unwrap());
        assert!(!g.evaluate(&scope(json!({"v": 10}))).unwrap());
    }

    #[test]
    fn test_non_boolean_guard_is_error() {
        let g = guard("v + 1");
        assert!(matches!(
            g.evaluate(&scope(json!({"v": 1}))),
            Err(CoreError::GuardNotBoolean { .. })
        ));
    }

    #[test]
    fn test_evaluation_failure_propagates() {
        let g = guard("missing == 1");
        assert!(matches!(
            g.evaluate(&scope(json!({}))),
            Err(CoreError::Expression { .. })
        ));
    }

    #[test]
    fn test_evaluate_all() {
        let vars = scope(json!({"a": true, "b": false}));
        assert!(GuardEvaluator::evaluate_all(&[], &vars).unwrap());
        assert!(GuardEvaluator::evaluate_all(&[guard("a")], &vars).unwrap());
        assert!(!GuardEvaluator::evaluate_all(&[guard("a"), guard("b")], &vars).unwrap());
        // stops before the failing expression
        assert!(!GuardEvaluator::evaluate_all(&[guard("b"), guard("missing")], &vars).unwrap());
    }

    #[test]
    fn test_rebind_named_guard() {
        let base = Guard::named("guard2", Expression::new("false").unwrap());
        let overrides = vec![Guard::named("guard2", Expression::new("true").unwrap())];

        let rebound = base.rebind(&overrides);
        assert!(rebound.evaluate(&Map::new()).unwrap());

        let inline = guard("false");
        assert_eq!(inline.rebind(&overrides), inline);
    }
}
