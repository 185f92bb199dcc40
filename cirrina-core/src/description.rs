//! Collaborative state machine descriptions.
//!
//! Descriptions are the declarative input to the class builders and can be
//! read from JSON or YAML:
//!
//! ```json
//! {
//!   "name": "pingpong",
//!   "persistent_context": {"variables": [{"name": "v", "value": "0"}]},
//!   "state_machines": [
//!     {
//!       "name": "ping",
//!       "states": [
//!         {"name": "a", "initial": true,
//!          "entry": [{"type": "raise", "event": {"name": "e1", "channel": "global"}}],
//!          "on": [{"event": "e2", "target": "b"}]},
//!         {"name": "b",
//!          "entry": [{"type": "assign", "variable": {"name": "v", "value": "v + 1"}}],
//!          "always": [{"target": "a"}]}
//!       ]
//!     }
//!   ]
//! }
//! ```
//!
//! Action lists accept inline actions or `{"reference": "name"}` entries
//! pointing at named actions; guard lists accept `{"expression": "..."}` or
//! `{"reference": "name"}`.

use crate::event::EventChannel;
use crate::expression::Expression;
use serde::{Deserialize, Serialize};

/// Top-level description of a collaborative state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborativeStateMachineDescription {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub state_machines: Vec<StateMachineDescription>,
    #[serde(default)]
    pub local_context: ContextDescription,
    #[serde(default)]
    pub persistent_context: ContextDescription,
}

fn default_version() -> String {
    "0.1".to_string()
}

/// Description of one state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateMachineDescription {
    pub name: String,
    #[serde(default)]
    pub states: Vec<StateDescription>,
    /// Nested state machines, instantiated together with this one.
    #[serde(default)]
    pub machines: Vec<StateMachineDescription>,
    #[serde(default)]
    pub local_context: ContextDescription,
    #[serde(default)]
    pub persistent_context: ContextDescription,
    #[serde(default)]
    pub guards: Vec<NamedGuardDescription>,
    #[serde(default)]
    pub actions: Vec<NamedActionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
}

/// Description of one state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDescription {
    pub name: String,
    #[serde(default)]
    pub initial: bool,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub entry: Vec<ActionOrReference>,
    #[serde(default)]
    pub exit: Vec<ActionOrReference>,
    #[serde(default, rename = "while")]
    pub while_actions: Vec<ActionOrReference>,
    #[serde(default)]
    pub after: Vec<ActionOrReference>,
    #[serde(default)]
    pub on: Vec<OnTransitionDescription>,
    #[serde(default)]
    pub always: Vec<TransitionDescription>,
}

/// Description of a transition. A missing target means a self-transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub guards: Vec<GuardOrReference>,
    #[serde(default)]
    pub actions: Vec<ActionOrReference>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub else_target: Option<String>,
}

/// Description of an event-triggered transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnTransitionDescription {
    pub event: String,
    #[serde(flatten)]
    pub transition: TransitionDescription,
}

/// Variable declarations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextDescription {
    #[serde(default)]
    pub variables: Vec<VariableDescription>,
}

/// A variable name with a value expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDescription {
    pub name: String,
    pub value: Expression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDescription {
    pub name: String,
    pub channel: EventChannel,
    #[serde(default)]
    pub data: Vec<VariableDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedGuardDescription {
    pub name: String,
    pub expression: Expression,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedActionDescription {
    pub name: String,
    pub action: ActionDescription,
}

/// A guard given inline or by reference to a named guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GuardOrReference {
    Reference { reference: String },
    Inline { expression: Expression },
}

/// An action given inline or by reference to a named action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionOrReference {
    Reference { reference: String },
    Action(ActionDescription),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCaseDescription {
    pub case: Expression,
    pub action: ActionOrReference,
}

/// Inline action, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDescription {
    Assign {
        variable: VariableDescription,
    },
    Create {
        variable: VariableDescription,
        #[serde(default)]
        persistent: bool,
    },
    Invoke {
        service_type: String,
        #[serde(default)]
        local: bool,
        #[serde(default)]
        input: Vec<VariableDescription>,
        #[serde(default)]
        output: Vec<String>,
        #[serde(default)]
        done: Vec<EventDescription>,
    },
    Raise {
        event: EventDescription,
    },
    Match {
        value: Expression,
        cases: Vec<MatchCaseDescription>,
    },
    Timeout {
        name: String,
        delay: Expression,
        action: Box<ActionOrReference>,
    },
    TimeoutReset {
        action: String,
    },
}
