//! Single-file list backend
//!
//! In-memory `identity -> record` map with a monotonic insertion counter.
//! Forward iteration follows insertion order. Persists into the owning
//! collection's snapshot as `{counter, _count, _counter, hash}`.

use ahash::AHashMap;
use serde_json::{Map, Value};

use crate::error::{DbError, Result};
use crate::storage::audit::AuditEnvelope;
use crate::storage::backend::StorageBackend;

#[derive(Debug, Clone)]
enum Stored {
    Plain(Value),
    Audited(AuditEnvelope),
}

impl Stored {
    fn payload(&self) -> Option<Value> {
        match self {
            Stored::Plain(v) => Some(v.clone()),
            Stored::Audited(env) if env.is_deleted() => None,
            Stored::Audited(env) => Some(env.data.clone()),
        }
    }
}

/// In-memory keyed record store
pub struct List {
    name: String,
    hash: AHashMap<String, Stored>,
    /// live ids in insertion order
    order: Vec<String>,
    counter: u64,
    audit: bool,
}

impl List {
    pub fn new(name: impl Into<String>, audit: bool) -> Self {
        Self {
            name: name.into(),
            hash: AHashMap::new(),
            order: Vec::new(),
            counter: 0,
            audit,
        }
    }

    fn wrap(&self, id: &str, record: Value) -> Stored {
        if self.audit {
            Stored::Audited(AuditEnvelope::create(Value::String(id.to_string()), record))
        } else {
            Stored::Plain(record)
        }
    }
}

impl StorageBackend for List {
    fn get(&self, id: &str) -> Option<Value> {
        self.hash.get(id).and_then(Stored::payload)
    }

    fn set(&mut self, id: &str, record: Value) -> Result<Value> {
        match self.hash.get_mut(id) {
            Some(Stored::Audited(env)) if !env.is_deleted() => {
                env.apply_update(record.clone());
            }
            Some(Stored::Plain(existing)) => {
                *existing = record.clone();
            }
            _ => {
                // new id (or re-created after an audit tombstone)
                let stored = self.wrap(id, record.clone());
                self.hash.insert(id.to_string(), stored);
                self.order.push(id.to_string());
                self.counter += 1;
            }
        }
        Ok(record)
    }

    fn update(&mut self, id: &str, record: Value) -> Result<Value> {
        match self.hash.get_mut(id) {
            Some(Stored::Audited(env)) if !env.is_deleted() => {
                env.apply_update(record.clone());
                Ok(record)
            }
            Some(Stored::Plain(existing)) => {
                *existing = record.clone();
                Ok(record)
            }
            _ => Err(DbError::validation(
                &self.name,
                format!("cannot update unknown id '{}'", id),
            )),
        }
    }

    fn delete(&mut self, id: &str) -> Result<Option<Value>> {
        let payload = match self.hash.get_mut(id) {
            Some(Stored::Audited(env)) if !env.is_deleted() => {
                let payload = env.data.clone();
                env.mark_deleted();
                Some(payload)
            }
            Some(Stored::Plain(_)) => match self.hash.remove(id) {
                Some(Stored::Plain(v)) => Some(v),
                _ => None,
            },
            _ => None,
        };
        if payload.is_some() {
            self.order.retain(|o| o != id);
        }
        Ok(payload)
    }

    fn reset(&mut self) -> Result<()> {
        self.hash.clear();
        self.order.clear();
        self.counter = 0;
        Ok(())
    }

    fn forward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a> {
        Box::new(self.order.iter().filter_map(|id| {
            self.hash
                .get(id)
                .and_then(Stored::payload)
                .map(|p| (id.clone(), p))
        }))
    }

    fn backward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a> {
        Box::new(self.order.iter().rev().filter_map(|id| {
            self.hash
                .get(id)
                .and_then(Stored::payload)
                .map(|p| (id.clone(), p))
        }))
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn envelope(&self, id: &str) -> Option<AuditEnvelope> {
        match self.hash.get(id) {
            Some(Stored::Audited(env)) => Some(env.clone()),
            _ => None,
        }
    }

    fn persist_blob(&self) -> Result<Value> {
        let mut hash = Map::new();
        // live records first, in insertion order
        for id in &self.order {
            if let Some(stored) = self.hash.get(id) {
                let value = match stored {
                    Stored::Plain(v) => v.clone(),
                    Stored::Audited(env) => serde_json::to_value(env)?,
                };
                hash.insert(id.clone(), value);
            }
        }
        // tombstoned envelopes keep their history at the tail
        for (id, stored) in &self.hash {
            if let Stored::Audited(env) = stored {
                if env.is_deleted() {
                    hash.insert(id.clone(), serde_json::to_value(env)?);
                }
            }
        }

        Ok(serde_json::json!({
            "counter": self.counter,
            "_count": self.order.len(),
            "_counter": self.counter,
            "hash": hash,
        }))
    }

    fn load_blob(&mut self, blob: Value) -> Result<()> {
        self.hash.clear();
        self.order.clear();

        let obj = blob
            .as_object()
            .ok_or_else(|| DbError::Serialization("list blob is not an object".into()))?;

        self.counter = obj
            .get("_counter")
            .or_else(|| obj.get("counter"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        if let Some(hash) = obj.get("hash").and_then(Value::as_object) {
            for (id, value) in hash {
                let stored = if self.audit {
                    Stored::Audited(serde_json::from_value(value.clone())?)
                } else {
                    Stored::Plain(value.clone())
                };
                let live = stored.payload().is_some();
                self.hash.insert(id.clone(), stored);
                if live {
                    self.order.push(id.clone());
                }
            }
        }
        Ok(())
    }
}
