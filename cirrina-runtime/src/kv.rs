//! Contexts backed by a shared key-value store.
//!
//! [`KeyValueContext`] keeps JSON-encoded variable values in a byte-level
//! [`KeyValueStore`], so any store offering atomic create and update can
//! back a persistent context shared between runtimes.

use cirrina_core::{Context, ContextVariable, CoreError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A byte-level key-value store.
pub trait KeyValueStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stores a value if the key is absent. Returns false if it exists.
    fn create(&self, key: &str, value: Vec<u8>) -> bool;

    /// Replaces the value of an existing key. Returns false if it is absent.
    fn update(&self, key: &str, value: Vec<u8>) -> bool;

    /// Removes a key. Returns false if it was absent.
    fn delete(&self, key: &str) -> bool;

    /// Returns all keys starting with `prefix`.
    fn keys(&self, prefix: &str) -> Vec<String>;
}

/// In-process key-value store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn create(&self, key: &str, value: Vec<u8>) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    fn update(&self, key: &str, value: Vec<u8>) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                *entry = value;
                true
            }
            None => false,
        }
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn keys(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

/// A context stored in a bucket of a key-value store.
#[derive(Debug, Clone)]
pub struct KeyValueContext {
    store: Arc<dyn KeyValueStore>,
    bucket: String,
}

impl KeyValueContext {
    /// Creates a context using keys `<bucket>.<name>`.
    pub fn new(store: Arc<dyn KeyValueStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.bucket, name)
    }

    fn decode(name: &str, bytes: &[u8]) -> Result<Value, CoreError> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Expression {
            source_text: name.to_string(),
            reason: format!("stored value is not valid JSON: {}", e),
        })
    }
}

impl Context for KeyValueContext {
    fn get(&self, name: &str) -> Result<Value, CoreError> {
        let bytes = self
            .store
            .get(&self.key(name))
            .ok_or_else(|| CoreError::VariableMissing {
                name: name.to_string(),
            })?;
        Self::decode(name, &bytes)
    }

    fn create(&self, name: &str, value: Value) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&value)?;
        if self.store.create(&self.key(name), bytes) {
            Ok(())
        } else {
            Err(CoreError::VariableExists {
                name: name.to_string(),
            })
        }
    }

    fn assign(&self, name: &str, value: Value) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(&value)?;
        if self.store.update(&self.key(name), bytes) {
            Ok(())
        } else {
            Err(CoreError::VariableMissing {
                name: name.to_string(),
            })
        }
    }

    fn delete(&self, name: &str) -> Result<(), CoreError> {
        if self.store.delete(&self.key(name)) {
            Ok(())
        } else {
            Err(CoreError::VariableMissing {
                name: name.to_string(),
            })
        }
    }

    fn get_all(&self) -> Result<Vec<ContextVariable>, CoreError> {
        let prefix = format!("{}.", self.bucket);
        let mut variables = Vec::new();
        for key in self.store.keys(&prefix) {
            let name = &key[prefix.len()..];
            // Deleted between listing and reading
            let Some(bytes) = self.store.get(&key) else {
                continue;
            };
            variables.push(ContextVariable::new(name, Self::decode(name, &bytes)?));
        }
        variables.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(variables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_context(bucket: &str) -> (Arc<MemoryKeyValueStore>, KeyValueContext) {
        let store = Arc::new(MemoryKeyValueStore::new());
        let context = KeyValueContext::new(store.clone(), bucket);
        (store, context)
    }

    #[test]
    fn test_create_get_assign_delete() {
        let (_, context) = sample_context("persistent");

        context.create("v", json!(1)).unwrap();
        assert_eq!(context.get("v").unwrap(), json!(1));
        assert!(matches!(
            context.create("v", json!(2)),
            Err(CoreError::VariableExists { .. })
        ));

        context.assign("v", json!({"a": [1, 2]})).unwrap();
        assert_eq!(context.get("v").unwrap(), json!({"a": [1, 2]}));

        context.delete("v").unwrap();
        assert!(matches!(
            context.get("v"),
            Err(CoreError::VariableMissing { .. })
        ));
        assert!(matches!(
            context.assign("v", json!(0)),
            Err(CoreError::VariableMissing { .. })
        ));
        assert!(matches!(
            context.delete("v"),
            Err(CoreError::VariableMissing { .. })
        ));
    }

    #[test]
    fn test_buckets_are_isolated() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let a = KeyValueContext::new(store.clone(), "a");
        let b = KeyValueContext::new(store.clone(), "b");

        a.create("v", json!(1)).unwrap();
        b.create("v", json!(2)).unwrap();
        b.create("w", json!(3)).unwrap();

        assert_eq!(a.get("v").unwrap(), json!(1));
        assert_eq!(a.get_all().unwrap().len(), 1);

        let names: Vec<_> = b
            .get_all()
            .unwrap()
            .into_iter()
            .map(|v| v.name().to_string())
            .collect();
        assert_eq!(names, vec!["v", "w"]);
    }

    #[test]
    fn test_corrupt_value() {
        let (store, context) = sample_context("p");
        store.create("p.v", b"not json".to_vec());
        assert!(matches!(
            context.get("v"),
            Err(CoreError::Expression { .. })
        ));
    }

    #[test]
    fn test_shared_between_contexts() {
        let (store, first) = sample_context("shared");
        let second = KeyValueContext::new(store, "shared");

        first.create("counter", json!(0)).unwrap();
        second.assign("counter", json!(5)).unwrap();
        assert_eq!(first.get("counter").unwrap(), json!(5));
    }
}
