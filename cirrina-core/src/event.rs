//! Events exchanged between state machine instances.

use crate::context::ContextVariable;
use crate::error::CoreError;
use crate::expression::Scope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Scope of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventChannel {
    /// Delivered to the raising instance only.
    Internal,
    /// Delivered to instances bound to the raising instance.
    External,
    /// Delivered to every instance handling the event name.
    Global,
}

/// A named event with ordered data.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    id: Uuid,
    created_at: DateTime<Utc>,
    name: String,
    channel: EventChannel,
    data: Vec<ContextVariable>,
}

impl Event {
    pub fn new(name: impl Into<String>, channel: EventChannel, data: Vec<ContextVariable>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            name: name.into(),
            channel,
            data,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> EventChannel {
        self.channel
    }

    pub fn data(&self) -> &[ContextVariable] {
        &self.data
    }

    /// Returns a new event with the same name and channel but different data.
    pub fn with_data(&self, data: Vec<ContextVariable>) -> Self {
        Self::new(self.name.clone(), self.channel, data)
    }

    /// Returns whether every data variable holds a concrete value.
    pub fn has_evaluated_data(&self) -> bool {
        self.data.iter().all(|variable| !variable.is_lazy())
    }

    /// Fails if any data variable is still lazy.
    pub fn ensure_has_evaluated_data(&self) -> Result<(), CoreError> {
        match self.data.iter().find(|variable| variable.is_lazy()) {
            Some(variable) => Err(CoreError::NotEvaluated {
                name: variable.name().to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Returns a fresh event with all data evaluated against `scope`.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Self, CoreError> {
        let data = self
            .data
            .iter()
            .map(|variable| variable.evaluate(scope))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_data(data))
    }

    /// Returns the data as an object keyed by variable name.
    pub fn data_object(&self) -> Result<Map<String, Value>, CoreError> {
        let mut map = Map::new();
        for variable in &self.data {
            map.insert(
                variable.name().to_string(),
                variable.evaluated_value()?.clone(),
            );
        }
        Ok(map)
    }

    /// Encodes the event as JSON. Data must be evaluated.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let data = self
            .data
            .iter()
            .map(|variable| {
                Ok(EncodedVariable {
                    name: variable.name().to_string(),
                    value: variable.evaluated_value()?.clone(),
                })
            })
            .collect::<Result<Vec<_>, CoreError>>()?;

        let encoded = EncodedEvent {
            id: self.id,
            created_at: self.created_at,
            name: self.name.clone(),
            channel: self.channel,
            data,
        };
        Ok(serde_json::to_vec(&encoded)?)
    }

    /// Decodes an event produced by [`Event::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, CoreError> {
        let encoded: EncodedEvent = serde_json::from_slice(bytes)?;
        Ok(Self {
            id: encoded.id,
            created_at: encoded.created_at,
            name: encoded.name,
            channel: encoded.channel,
            data: encoded
                .data
                .into_iter()
                .map(|variable| ContextVariable::new(variable.name, variable.value))
                .collect(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct EncodedEvent {
    id: Uuid,
    created_at: DateTime<Utc>,
    name: String,
    channel: EventChannel,
    #[serde(default)]
    data: Vec<EncodedVariable>,
}

#[derive(Serialize, Deserialize)]
struct EncodedVariable {
    name: String,
    value: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Expression;
    use serde_json::json;

    fn sample_event() -> Event {
        Event::new(
            "e1",
            EventChannel::Global,
            vec![
                ContextVariable::new("a", json!(1)),
                ContextVariable::lazy("b", Expression::new("v * 2").unwrap()),
            ],
        )
    }

    #[test]
    fn test_evaluate_data() {
        let event = sample_event();
        assert!(!event.has_evaluated_data());
        assert!(event.ensure_has_evaluated_data().is_err());

        let mut scope = Map::new();
        scope.insert("v".to_string(), json!(21));
        let evaluated = event.evaluate(&scope).unwrap();

        assert!(evaluated.ensure_has_evaluated_data().is_ok());
        assert_ne!(evaluated.id(), event.id());
        assert_eq!(evaluated.name(), "e1");
        assert_eq!(
            Value::Object(evaluated.data_object().unwrap()),
            json!({"a": 1, "b": 42})
        );
    }

    #[test]
    fn test_encode_requires_evaluated_data() {
        assert!(matches!(
            sample_event().encode(),
            Err(CoreError::NotEvaluated { .. })
        ));
    }

    #[test]
    fn test_encode_decode_preserves_identity() {
        let event = Event::new(
            "done",
            EventChannel::External,
            vec![ContextVariable::new("out", json!({"x": [1, 2]}))],
        );
        let decoded = Event::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_channel_serde_names() {
        assert_eq!(
            serde_json::to_value(EventChannel::Internal).unwrap(),
            json!("internal")
        );
        let channel: EventChannel = serde_json::from_value(json!("global")).unwrap();
        assert_eq!(channel, EventChannel::Global);
    }
}
