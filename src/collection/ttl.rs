//! TTL sweeps
//!
//! Collections with a `ttl` carry a hidden sparse index on `__ttltime`,
//! written with the insertion timestamp on every create. The sweep scans
//! that index for keys at or below `now - ttl`, deletes those records and
//! persists immediately. Sweeps never join a transaction.

use serde_json::json;
use tracing::info;

use crate::clock::now_ms;
use crate::error::Result;
use crate::index::btree::Pointer;

use super::core::Collection;

/// Hidden field carrying the insertion timestamp
pub const TTL_FIELD: &str = "__ttltime";

impl Collection {
    /// Delete every record whose TTL timestamp is at or below the cutoff.
    /// Returns the number of records removed.
    pub fn ensure_ttl(&self) -> Result<usize> {
        let ttl = match self.ttl() {
            Some(t) => t,
            None => return Ok(0),
        };
        let cutoff = now_ms() - ttl.as_millis() as i64;

        let expired: Vec<Pointer> = {
            let indexes = self.indexes.read();
            match indexes.iter().find(|s| s.name == TTL_FIELD) {
                Some(slot) => slot
                    .index
                    .tree()
                    .range(None, Some(&cutoff.to_string()))
                    .into_iter()
                    .map(|(_, pointer)| pointer)
                    .collect(),
                None => return Ok(0),
            }
        };
        if expired.is_empty() {
            return Ok(0);
        }

        for token in &expired {
            self.remove_by_id(&json!(token))?;
        }
        self.persist(None)?;
        info!(collection = %self.name(), removed = expired.len(), "ttl sweep");
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionOptions, Ttl};
    use serde_json::Value;

    fn backdate(c: &Collection, id: i64, age_ms: i64) {
        let stamp = now_ms() - age_ms;
        c.update_by_id(&json!(id), &json!({ TTL_FIELD: stamp }), true)
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_ttl_sweep_removes_expired() {
        let c = Collection::build(
            CollectionOptions::new("events")
                .in_memory()
                .with_ttl(Ttl(1_000)),
        )
        .unwrap();

        // records inserted at t=0, t=500, t=1500 as seen from t=2000
        c.create(json!({"id": 1})).unwrap();
        c.create(json!({"id": 2})).unwrap();
        c.create(json!({"id": 3})).unwrap();
        backdate(&c, 1, 2_000);
        backdate(&c, 2, 1_500);
        backdate(&c, 3, 500);

        let removed = c.ensure_ttl().unwrap();
        assert_eq!(removed, 2);
        assert!(c.find_by_id(&json!(1)).unwrap().is_none());
        assert!(c.find_by_id(&json!(2)).unwrap().is_none());
        assert!(c.find_by_id(&json!(3)).unwrap().is_some());
    }

    #[test]
    fn test_ttl_noop_when_nothing_expired() {
        let c = Collection::build(
            CollectionOptions::new("events")
                .in_memory()
                .with_ttl(Ttl(60_000)),
        )
        .unwrap();
        c.create(json!({"id": 1})).unwrap();
        assert_eq!(c.ensure_ttl().unwrap(), 0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_ttl_records_carry_timestamp() {
        let c = Collection::build(
            CollectionOptions::new("events")
                .in_memory()
                .with_ttl(Ttl(1_000)),
        )
        .unwrap();
        let r = c.create(json!({"id": 1})).unwrap();
        assert!(matches!(r.get(TTL_FIELD), Some(Value::Number(_))));
    }

    #[test]
    fn test_oldest_latest_follow_ttl_index() {
        let c = Collection::build(
            CollectionOptions::new("events")
                .in_memory()
                .with_ttl(Ttl(60_000)),
        )
        .unwrap();
        c.create(json!({"id": 1})).unwrap();
        c.create(json!({"id": 2})).unwrap();
        c.create(json!({"id": 3})).unwrap();
        backdate(&c, 2, 10_000); // oldest stamp
        backdate(&c, 1, 1_000);

        assert_eq!(c.oldest().unwrap().unwrap()["id"], json!(2));
        assert_eq!(c.latest().unwrap().unwrap()["id"], json!(3));
    }
}
