//! Identity generator registry
//!
//! Generators are registered by name at startup and referenced by name in
//! persisted definitions. Deserializing an unknown generator name is a
//! configuration error, never a fallback.

use ahash::AHashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{json, Value};

use crate::clock::now_ms;
use crate::error::{DbError, Result};
use crate::storage::backend::StorageBackend;

/// Produces an identity value from the backend's current state
pub type IdGenerator = fn(&dyn StorageBackend) -> Value;

fn auto_inc(backend: &dyn StorageBackend) -> Value {
    // the list's running counter, one past the last assigned
    json!(backend.counter() + 1)
}

fn auto_timestamp(_backend: &dyn StorageBackend) -> Value {
    json!(now_ms())
}

static REGISTRY: Lazy<RwLock<AHashMap<String, IdGenerator>>> = Lazy::new(|| {
    let mut m: AHashMap<String, IdGenerator> = AHashMap::new();
    m.insert("autoIncIdGen".to_string(), auto_inc);
    m.insert("autoTimestamp".to_string(), auto_timestamp);
    RwLock::new(m)
});

/// Resolve a persisted generator name.
pub fn resolve_generator(name: &str) -> Result<IdGenerator> {
    REGISTRY
        .read()
        .get(name)
        .copied()
        .ok_or_else(|| DbError::InvalidConfig(format!("unknown identity generator '{}'", name)))
}

/// Register a custom generator (process-wide, startup-time).
pub fn register_generator(name: impl Into<String>, gen: IdGenerator) {
    REGISTRY.write().insert(name.into(), gen);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list::List;

    #[test]
    fn test_auto_inc_follows_counter() {
        let mut list = List::new("t", false);
        let gen = resolve_generator("autoIncIdGen").unwrap();
        assert_eq!(gen(&list), json!(1));
        list.set("1", json!({"id": 1})).unwrap();
        list.set("2", json!({"id": 2})).unwrap();
        assert_eq!(gen(&list), json!(3));
    }

    #[test]
    fn test_auto_timestamp_is_millis() {
        let list = List::new("t", false);
        let gen = resolve_generator("autoTimestamp").unwrap();
        let v = gen(&list).as_i64().unwrap();
        assert!(v > 1_600_000_000_000);
    }

    #[test]
    fn test_unknown_generator_rejected() {
        assert!(resolve_generator("eval-me").is_err());
    }

    #[test]
    fn test_custom_registration() {
        fn fixed(_: &dyn StorageBackend) -> Value {
            json!("fixed-id")
        }
        register_generator("fixedGen", fixed);
        let gen = resolve_generator("fixedGen").unwrap();
        let list = List::new("t", false);
        assert_eq!(gen(&list), json!("fixed-id"));
    }
}
