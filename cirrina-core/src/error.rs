//! Core error types.

use thiserror::Error;

/// Errors raised while building classes or evaluating expressions and contexts.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cannot extend '{base}', state machine does not exist (in '{machine}')")]
    InvalidBase { machine: String, base: String },

    #[error("inheritance cycle detected at state machine '{machine}'")]
    InheritanceCycle { machine: String },

    #[error("state '{state}' of '{machine}' overrides a base state that is neither virtual nor abstract")]
    IllegalOverride { machine: String, state: String },

    #[error("abstract state '{state}' must be overridden by concrete state machine '{machine}'")]
    MissingOverride { machine: String, state: String },

    #[error("state '{state}' of '{machine}' is abstract but the state machine is not abstract")]
    StrayAbstractState { machine: String, state: String },

    #[error("an action with the name '{name}' does not exist in '{machine}'")]
    UnresolvedAction { machine: String, name: String },

    #[error("a guard with the name '{name}' does not exist in '{machine}'")]
    UnresolvedGuard { machine: String, name: String },

    #[error("after action of state '{state}' in '{machine}' is not a timeout action")]
    InvalidAfterAction { machine: String, state: String },

    #[error("{kind} name '{name}' is not unique in '{machine}'")]
    DuplicateName {
        machine: String,
        kind: &'static str,
        name: String,
    },

    #[error("invalid state machine definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("expression '{source_text}' failed: {reason}")]
    Expression { source_text: String, reason: String },

    #[error("guard expression '{expression}' did not evaluate to a boolean")]
    GuardNotBoolean { expression: String },

    #[error("context variable '{name}' already exists")]
    VariableExists { name: String },

    #[error("context variable '{name}' does not exist")]
    VariableMissing { name: String },

    #[error("context variable '{name}' has not been evaluated")]
    NotEvaluated { name: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns whether this error belongs to class building rather than evaluation.
    pub fn is_build_error(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidBase { .. }
                | CoreError::InheritanceCycle { .. }
                | CoreError::IllegalOverride { .. }
                | CoreError::MissingOverride { .. }
                | CoreError::StrayAbstractState { .. }
                | CoreError::UnresolvedAction { .. }
                | CoreError::UnresolvedGuard { .. }
                | CoreError::InvalidAfterAction { .. }
                | CoreError::DuplicateName { .. }
                | CoreError::InvalidDefinition { .. }
        )
    }

    /// Returns a stable error code.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::InvalidBase { .. } => "INVALID_BASE",
            CoreError::InheritanceCycle { .. } => "INVALID_BASE",
            CoreError::IllegalOverride { .. } => "ILLEGAL_OVERRIDE",
            CoreError::MissingOverride { .. } => "MISSING_OVERRIDE",
            CoreError::StrayAbstractState { .. } => "STRAY_ABSTRACT_STATE",
            CoreError::UnresolvedAction { .. } => "UNRESOLVED_REFERENCE",
            CoreError::UnresolvedGuard { .. } => "UNRESOLVED_REFERENCE",
            CoreError::InvalidAfterAction { .. } => "INVALID_AFTER_ACTION",
            CoreError::DuplicateName { .. } => "BAD_REQUEST",
            CoreError::InvalidDefinition { .. } => "BAD_REQUEST",
            CoreError::Expression { .. } => "EXPRESSION_FAILED",
            CoreError::GuardNotBoolean { .. } => "EXPRESSION_FAILED",
            CoreError::VariableExists { .. } => "VARIABLE_EXISTS",
            CoreError::VariableMissing { .. } => "VARIABLE_MISSING",
            CoreError::NotEvaluated { .. } => "BAD_REQUEST",
            CoreError::Json(_) => "BAD_REQUEST",
        }
    }
}
