//! Prioritised chains of contexts.
//!
//! An extent orders contexts from lowest to highest priority. For an
//! instance this is typically `persistent < ancestor locals < own local`.
//! Reads resolve from the highest layer down; targeted writes go to the
//! highest layer that already owns the name.

use crate::context::Context;
use crate::error::CoreError;
use crate::expression::Scope;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// An ordered chain of contexts, lowest priority first.
#[derive(Clone)]
pub struct Extent {
    low: Arc<dyn Context>,
    upper: Vec<Arc<dyn Context>>,
}

impl Extent {
    /// Creates an extent with a single layer.
    pub fn new(context: Arc<dyn Context>) -> Self {
        Self {
            low: context,
            upper: Vec::new(),
        }
    }

    /// Returns a new extent with `context` pushed as the highest layer.
    ///
    /// The receiver is left untouched.
    pub fn extend(&self, context: Arc<dyn Context>) -> Self {
        let mut upper = self.upper.clone();
        upper.push(context);
        Self {
            low: self.low.clone(),
            upper,
        }
    }

    /// Returns the lowest priority layer.
    pub fn low(&self) -> &Arc<dyn Context> {
        &self.low
    }

    /// Returns the highest priority layer.
    pub fn high(&self) -> &Arc<dyn Context> {
        self.upper.last().unwrap_or(&self.low)
    }

    /// Returns the number of layers.
    pub fn depth(&self) -> usize {
        self.upper.len() + 1
    }

    fn layers_high_to_low(&self) -> impl Iterator<Item = &Arc<dyn Context>> {
        self.upper.iter().rev().chain(std::iter::once(&self.low))
    }

    /// Resolves a variable from the highest layer down.
    ///
    /// Missing names yield `Ok(None)`; other store failures are returned.
    pub fn try_resolve(&self, name: &str) -> Result<Option<Value>, CoreError> {
        for context in self.layers_high_to_low() {
            match context.get(name) {
                Ok(value) => return Ok(Some(value)),
                Err(CoreError::VariableMissing { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Assigns to the highest layer that owns `name`.
    ///
    /// Fails with [`CoreError::VariableMissing`] if no layer owns it.
    pub fn try_set(&self, name: &str, value: Value) -> Result<(), CoreError> {
        for context in self.layers_high_to_low() {
            match context.assign(name, value.clone()) {
                Ok(()) => return Ok(()),
                Err(CoreError::VariableMissing { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(CoreError::VariableMissing {
            name: name.to_string(),
        })
    }

    /// Assigns in the highest layer, creating the variable there if needed.
    pub fn set_or_create(&self, name: &str, value: Value) -> Result<(), CoreError> {
        let high = self.high();
        match high.assign(name, value.clone()) {
            Err(CoreError::VariableMissing { .. }) => high.create(name, value),
            other => other,
        }
    }
}

impl Scope for Extent {
    fn resolve(&self, name: &str) -> Option<Value> {
        match self.try_resolve(name) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Failed to resolve variable '{}': {}", name, e);
                None
            }
        }
    }
}

impl fmt::Debug for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("depth", &self.depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::InMemoryContext;
    use proptest::prelude::*;
    use serde_json::json;

    fn two_layers() -> (Arc<InMemoryContext>, Arc<InMemoryContext>, Extent) {
        let low = Arc::new(InMemoryContext::new());
        let high = Arc::new(InMemoryContext::new());
        let extent = Extent::new(low.clone()).extend(high.clone());
        (low, high, extent)
    }

    #[test]
    fn test_create_then_resolve() {
        let (_, _, extent) = two_layers();
        extent.high().create("v", json!(5)).unwrap();
        assert_eq!(extent.resolve("v"), Some(json!(5)));
        assert_eq!(extent.resolve("missing"), None);
    }

    #[test]
    fn test_highest_layer_wins() {
        let (low, high, extent) = two_layers();
        low.create("v", json!("low")).unwrap();
        high.create("v", json!("high")).unwrap();
        assert_eq!(extent.resolve("v"), Some(json!("high")));
    }

    #[test]
    fn test_try_set_targets_owning_layer() {
        let (low, high, extent) = two_layers();
        low.create("counter", json!(0)).unwrap();

        extent.try_set("counter", json!(1)).unwrap();

        assert_eq!(low.get("counter").unwrap(), json!(1));
        assert!(high.get("counter").is_err());
    }

    #[test]
    fn test_try_set_missing_everywhere_fails() {
        let (_, _, extent) = two_layers();
        assert!(matches!(
            extent.try_set("nope", json!(1)),
            Err(CoreError::VariableMissing { .. })
        ));
    }

    #[test]
    fn test_set_or_create_uses_high_layer() {
        let (low, high, extent) = two_layers();
        extent.set_or_create("x", json!(1)).unwrap();
        extent.set_or_create("x", json!(2)).unwrap();
        assert_eq!(high.get("x").unwrap(), json!(2));
        assert!(low.get("x").is_err());
    }

    #[test]
    fn test_extend_does_not_mutate_original() {
        let base = Extent::new(Arc::new(InMemoryContext::new()));
        let extended = base.extend(Arc::new(InMemoryContext::new()));
        assert_eq!(base.depth(), 1);
        assert_eq!(extended.depth(), 2);
        assert!(Arc::ptr_eq(base.low(), extended.low()));
        assert!(Arc::ptr_eq(base.low(), base.high()));
    }

    proptest! {
        #[test]
        fn prop_resolve_returns_highest_owner(owners in proptest::collection::vec(any::<bool>(), 1..6)) {
            let contexts: Vec<Arc<InMemoryContext>> =
                owners.iter().map(|_| Arc::new(InMemoryContext::new())).collect();
            let mut extent = Extent::new(contexts[0].clone());
            for context in &contexts[1..] {
                extent = extent.extend(context.clone());
            }
            for (layer, owns) in owners.iter().enumerate() {
                if *owns {
                    contexts[layer].create("v", json!(layer)).unwrap();
                }
            }

            let expected = owners.iter().rposition(|owns| *owns).map(|layer| json!(layer));
            prop_assert_eq!(extent.resolve("v"), expected);
        }
    }
}
