//! Versioned audit envelopes
//!
//! When a collection enables audit, the backend stores each record wrapped
//! in an envelope carrying version counters, lifecycle timestamps and a
//! history of diffs. Deletes tombstone the envelope instead of dropping it.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::clock::now_ms;

/// One history entry: the diff that produced `version`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub version: u64,
    pub delta: Value,
    pub date: i64,
}

/// Envelope wrapped around an audited record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEnvelope {
    pub id: Value,
    pub version: u64,
    #[serde(rename = "next_version")]
    pub next_version: u64,
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<i64>,
    pub data: Value,
    #[serde(default)]
    pub history: Vec<AuditEntry>,
}

impl AuditEnvelope {
    pub fn create(id: Value, payload: Value) -> Self {
        Self {
            id,
            version: 1,
            next_version: 2,
            created: now_ms(),
            updated: None,
            deleted: None,
            data: payload,
            history: Vec::new(),
        }
    }

    /// Replace the payload, appending the diff to the history.
    pub fn apply_update(&mut self, payload: Value) {
        let delta = diff(&self.data, &payload);
        let now = now_ms();
        self.history.push(AuditEntry {
            version: self.version,
            delta,
            date: now,
        });
        self.version = self.next_version;
        self.next_version += 1;
        self.updated = Some(now);
        self.data = payload;
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = Some(now_ms());
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }
}

/// Recursive JSON diff from `old` to `new`.
///
/// Objects diff key by key (removed keys map to null); any other change
/// records the new value outright.
pub fn diff(old: &Value, new: &Value) -> Value {
    match (old, new) {
        (Value::Object(o), Value::Object(n)) => {
            let mut out = Map::new();
            for (k, nv) in n {
                match o.get(k) {
                    Some(ov) if ov == nv => {}
                    Some(ov) => {
                        out.insert(k.clone(), diff(ov, nv));
                    }
                    None => {
                        out.insert(k.clone(), nv.clone());
                    }
                }
            }
            for k in o.keys() {
                if !n.contains_key(k) {
                    out.insert(k.clone(), Value::Null);
                }
            }
            Value::Object(out)
        }
        _ => new.clone(),
    }
}
