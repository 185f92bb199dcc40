//! Context variables and variable stores.

use crate::error::CoreError;
use crate::expression::{Expression, Scope};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;

/// Value of a context variable.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    /// A concrete value.
    Value(Value),
    /// An expression that has not been evaluated yet.
    Lazy(Expression),
}

/// A named variable whose value may be deferred.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextVariable {
    name: String,
    value: VariableValue,
}

impl ContextVariable {
    /// Creates a variable with a concrete value.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: VariableValue::Value(value),
        }
    }

    /// Creates a variable whose value is evaluated later.
    pub fn lazy(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            name: name.into(),
            value: VariableValue::Lazy(expression),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &VariableValue {
        &self.value
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self.value, VariableValue::Lazy(_))
    }

    /// Returns the concrete value, failing if the variable is still lazy.
    pub fn evaluated_value(&self) -> Result<&Value, CoreError> {
        match &self.value {
            VariableValue::Value(value) => Ok(value),
            VariableValue::Lazy(_) => Err(CoreError::NotEvaluated {
                name: self.name.clone(),
            }),
        }
    }

    /// Returns an evaluated copy of this variable.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<ContextVariable, CoreError> {
        match &self.value {
            VariableValue::Value(_) => Ok(self.clone()),
            VariableValue::Lazy(expression) => Ok(ContextVariable::new(
                self.name.clone(),
                expression.evaluate(scope)?,
            )),
        }
    }

    /// Consumes the variable and returns its name and concrete value.
    pub fn into_pair(self) -> Result<(String, Value), CoreError> {
        match self.value {
            VariableValue::Value(value) => Ok((self.name, value)),
            VariableValue::Lazy(_) => Err(CoreError::NotEvaluated { name: self.name }),
        }
    }
}

/// A mutable store of named variables.
///
/// Implementations must be safe to share between instances executing on
/// different threads. Missing names fail with [`CoreError::VariableMissing`],
/// duplicate creation with [`CoreError::VariableExists`].
pub trait Context: Send + Sync + fmt::Debug {
    /// Returns the value of a variable.
    fn get(&self, name: &str) -> Result<Value, CoreError>;

    /// Creates a new variable.
    fn create(&self, name: &str, value: Value) -> Result<(), CoreError>;

    /// Assigns a new value to an existing variable.
    fn assign(&self, name: &str, value: Value) -> Result<(), CoreError>;

    /// Deletes a variable.
    fn delete(&self, name: &str) -> Result<(), CoreError>;

    /// Returns all variables, ordered by name.
    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError>;
}

/// Context backed by a concurrent in-process map.
#[derive(Debug, Default)]
pub struct InMemoryContext {
    variables: DashMap<String, Value>,
}

impl InMemoryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context holding the given variables, evaluating lazy ones
    /// against `scope`.
    pub fn with_variables<'a>(
        variables: impl IntoIterator<Item = &'a ContextVariable>,
        scope: &dyn Scope,
    ) -> Result<Self, CoreError> {
        let context = Self::new();
        for variable in variables {
            let (name, value) = variable.evaluate(scope)?.into_pair()?;
            context.create(&name, value)?;
        }
        Ok(context)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}

impl Context for InMemoryContext {
    fn get(&self, name: &str) -> Result<Value, CoreError> {
        self.variables
            .get(name)
            .map(|value| value.clone())
            .ok_or_else(|| CoreError::VariableMissing {
                name: name.to_string(),
            })
    }

    fn create(&self, name: &str, value: Value) -> Result<(), CoreError> {
        match self.variables.entry(name.to_string()) {
            Entry::Occupied(_) => Err(CoreError::VariableExists {
                name: name.to_string(),
            }),
            Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), CoreError> {
        match self.variables.get_mut(name) {
            Some(mut slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(CoreError::VariableMissing {
                name: name.to_string(),
            }),
        }
    }

    fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.variables
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CoreError::VariableMissing {
                name: name.to_string(),
            })
    }

    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError> {
        let mut variables: Vec<ContextVariable> = self
            .variables
            .iter()
            .map(|entry| ContextVariable::new(entry.key().clone(), entry.value().clone()))
            .collect();
        variables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(variables)
    }
}
