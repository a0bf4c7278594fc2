//! Named schema cache with get-or-create semantics

use crate::error::{Result, StreamerError};
use crate::schema::Struct;
use std::collections::HashMap;
use std::sync::Mutex;

/// Cache of named envelope schemas. Names are the identity: two factories
/// registered under the same name resolve to whichever ran first.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: Mutex<HashMap<String, Struct>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached schema for `name`, building and caching it with
    /// `factory` on first use. The factory runs at most once per name.
    pub fn get_or_create<F>(&self, name: &str, factory: F) -> Struct
    where
        F: FnOnce() -> Struct,
    {
        let mut schemas = self.schemas.lock().unwrap();
        if let Some(schema) = schemas.get(name) {
            return schema.clone();
        }
        let schema = factory();
        schemas.insert(name.to_string(), schema.clone());
        schema
    }

    /// Return the cached schema for `name` or fail
    pub fn get(&self, name: &str) -> Result<Struct> {
        self.schemas
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StreamerError::UnknownSchema(name.to_string()))
    }

    /// Register a schema under a fixed name, replacing nothing if present
    pub fn register(&self, name: &str, schema: Struct) {
        self.schemas
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(schema);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_factory_runs_once_per_name() {
        let registry = SchemaRegistry::new();
        let calls = AtomicUsize::new(0);

        let first = registry.get_or_create("a", || {
            calls.fetch_add(1, Ordering::SeqCst);
            json!({"v": 1})
        });
        let second = registry.get_or_create("a", || {
            calls.fetch_add(1, Ordering::SeqCst);
            json!({"v": 2})
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(first, second);
        assert_eq!(first["v"], 1);
    }

    #[test]
    fn test_get_unknown_schema_fails() {
        let registry = SchemaRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, StreamerError::UnknownSchema(name) if name == "missing"));
    }

    #[test]
    fn test_register_keeps_first() {
        let registry = SchemaRegistry::new();
        registry.register("k", json!({"v": 1}));
        registry.register("k", json!({"v": 2}));
        assert_eq!(registry.get("k").unwrap()["v"], 1);
    }
}
