//! Transaction-aware record store
//!
//! Wraps a [`StorageBackend`] with per-transaction change buffers, the
//! counterpart of the transactional index on the record side. The owning
//! collection drives both through the same two-phase commit.

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_ms;
use crate::error::{DbError, Result};
use crate::storage::backend::StorageBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListChangeKind {
    Insert,
    Update,
    Delete,
}

/// One buffered record mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListChange {
    #[serde(rename = "type")]
    pub kind: ListChangeKind,
    pub id: String,
    #[serde(rename = "oldValue", default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(rename = "newValue", default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub timestamp: i64,
}

/// Record store with per-transaction buffering
pub struct TransactionalList {
    name: String,
    backend: Box<dyn StorageBackend>,
    changes: AHashMap<String, Vec<ListChange>>,
    prepared: AHashSet<String>,
}

impl TransactionalList {
    pub fn new(name: impl Into<String>, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            changes: AHashMap::new(),
            prepared: AHashSet::new(),
        }
    }

    /// Direct access for non-transactional operation
    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn StorageBackend {
        self.backend.as_mut()
    }

    pub fn replace_backend(&mut self, backend: Box<dyn StorageBackend>) {
        self.backend = backend;
    }

    /// The record visible to `tx` under `id`
    pub fn get_in_transaction(&self, tx: &str, id: &str) -> Option<Value> {
        let mut visible = self.backend.get(id);
        if let Some(changes) = self.changes.get(tx) {
            for change in changes.iter().filter(|c| c.id == id) {
                visible = match change.kind {
                    ListChangeKind::Insert | ListChangeKind::Update => change.new_value.clone(),
                    ListChangeKind::Delete => None,
                };
            }
        }
        visible
    }

    /// All `(id, record)` pairs visible to `tx`: base order first, then
    /// buffered inserts in buffer order.
    pub fn iterate_in_transaction(&self, tx: &str) -> Vec<(String, Value)> {
        let mut seen: AHashSet<String> = AHashSet::new();
        let mut out = Vec::new();
        for (id, _) in self.backend.forward() {
            if let Some(value) = self.get_in_transaction(tx, &id) {
                seen.insert(id.clone());
                out.push((id, value));
            } else {
                seen.insert(id);
            }
        }
        if let Some(changes) = self.changes.get(tx) {
            for change in changes {
                if seen.contains(&change.id) {
                    continue;
                }
                if let Some(value) = self.get_in_transaction(tx, &change.id) {
                    seen.insert(change.id.clone());
                    out.push((change.id.clone(), value));
                }
            }
        }
        out
    }

    pub fn insert_in_transaction(&mut self, tx: &str, id: &str, record: Value) -> Result<()> {
        if self.get_in_transaction(tx, id).is_some() {
            return Err(DbError::validation(
                &self.name,
                format!("duplicate id '{}' in transaction '{}'", id, tx),
            ));
        }
        self.push_change(tx, ListChange {
            kind: ListChangeKind::Insert,
            id: id.to_string(),
            old_value: None,
            new_value: Some(record),
            timestamp: now_ms(),
        });
        Ok(())
    }

    pub fn update_in_transaction(&mut self, tx: &str, id: &str, record: Value) -> Result<()> {
        let old = self.get_in_transaction(tx, id).ok_or_else(|| {
            DbError::validation(&self.name, format!("cannot update unknown id '{}'", id))
        })?;
        self.push_change(tx, ListChange {
            kind: ListChangeKind::Update,
            id: id.to_string(),
            old_value: Some(old),
            new_value: Some(record),
            timestamp: now_ms(),
        });
        Ok(())
    }

    pub fn delete_in_transaction(&mut self, tx: &str, id: &str) -> Result<Option<Value>> {
        let old = match self.get_in_transaction(tx, id) {
            Some(v) => v,
            None => return Ok(None),
        };
        self.push_change(tx, ListChange {
            kind: ListChangeKind::Delete,
            id: id.to_string(),
            old_value: Some(old.clone()),
            new_value: None,
            timestamp: now_ms(),
        });
        Ok(Some(old))
    }

    fn push_change(&mut self, tx: &str, change: ListChange) {
        self.changes.entry(tx.to_string()).or_default().push(change);
    }

    /// Revalidate the buffer against the base store.
    pub fn prepare(&mut self, tx: &str) -> bool {
        let changes = match self.changes.get(tx) {
            Some(c) => c,
            None => {
                self.prepared.insert(tx.to_string());
                return true;
            }
        };

        let mut simulated: AHashMap<String, bool> = AHashMap::new();
        let mut ok = true;
        for change in changes {
            let exists = simulated
                .entry(change.id.clone())
                .or_insert_with(|| self.backend.get(&change.id).is_some());
            match change.kind {
                ListChangeKind::Insert => {
                    if *exists {
                        ok = false;
                        break;
                    }
                    *exists = true;
                }
                ListChangeKind::Update => {
                    if !*exists {
                        ok = false;
                        break;
                    }
                }
                ListChangeKind::Delete => {
                    *exists = false;
                }
            }
        }

        if ok {
            self.prepared.insert(tx.to_string());
            true
        } else {
            self.changes.remove(tx);
            false
        }
    }

    /// Apply the buffer to the base store.
    pub fn finalize(&mut self, tx: &str) -> Result<()> {
        if !self.prepared.contains(tx) {
            return Err(DbError::NotPrepared {
                resource: self.name.clone(),
                transaction: tx.to_string(),
            });
        }
        if let Some(changes) = self.changes.remove(tx) {
            for change in changes {
                match change.kind {
                    ListChangeKind::Insert | ListChangeKind::Update => {
                        if let Some(value) = change.new_value {
                            self.backend.set(&change.id, value)?;
                        }
                    }
                    ListChangeKind::Delete => {
                        self.backend.delete(&change.id)?;
                    }
                }
            }
        }
        self.prepared.remove(tx);
        Ok(())
    }

    pub fn rollback(&mut self, tx: &str) {
        self.changes.remove(tx);
        self.prepared.remove(tx);
    }

    pub fn buffer_snapshot(&self, tx: &str) -> Vec<ListChange> {
        self.changes.get(tx).cloned().unwrap_or_default()
    }

    pub fn restore_buffer(&mut self, tx: &str, buffer: Vec<ListChange>) {
        if buffer.is_empty() {
            self.changes.remove(tx);
        } else {
            self.changes.insert(tx.to_string(), buffer);
        }
    }

    pub fn has_buffer(&self, tx: &str) -> bool {
        self.changes.contains_key(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::list::List;
    use serde_json::json;

    fn tx_list() -> TransactionalList {
        let mut backend = List::new("t", false);
        backend.set("1", json!({"id": "1", "v": 1})).unwrap();
        backend.set("2", json!({"id": "2", "v": 2})).unwrap();
        TransactionalList::new("t", Box::new(backend))
    }

    #[test]
    fn test_view_overlays_buffer() {
        let mut list = tx_list();

        list.insert_in_transaction("t1", "3", json!({"id": "3"})).unwrap();
        list.update_in_transaction("t1", "1", json!({"id": "1", "v": 10})).unwrap();
        list.delete_in_transaction("t1", "2").unwrap();

        assert_eq!(list.get_in_transaction("t1", "1").unwrap()["v"], 10);
        assert!(list.get_in_transaction("t1", "2").is_none());
        assert!(list.get_in_transaction("t1", "3").is_some());

        // other transactions see the base only
        assert_eq!(list.get_in_transaction("t2", "1").unwrap()["v"], 1);
        assert!(list.get_in_transaction("t2", "2").is_some());
        assert!(list.get_in_transaction("t2", "3").is_none());

        let visible: Vec<String> = list
            .iterate_in_transaction("t1")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(visible, vec!["1", "3"]);
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut list = tx_list();
        assert!(list.insert_in_transaction("t", "1", json!({})).is_err());

        // deleting first makes the id available again
        list.delete_in_transaction("t", "1").unwrap();
        list.insert_in_transaction("t", "1", json!({"v": "new"})).unwrap();
        assert_eq!(list.get_in_transaction("t", "1").unwrap()["v"], "new");
    }

    #[test]
    fn test_two_phase_apply() {
        let mut list = tx_list();
        list.insert_in_transaction("t", "3", json!({"id": "3"})).unwrap();
        list.delete_in_transaction("t", "1").unwrap();

        assert!(list.prepare("t"));
        list.finalize("t").unwrap();

        assert!(list.backend().get("3").is_some());
        assert!(list.backend().get("1").is_none());
        assert!(!list.has_buffer("t"));
    }

    #[test]
    fn test_prepare_fails_on_base_conflict() {
        let mut list = tx_list();
        list.insert_in_transaction("t", "9", json!({"id": "9"})).unwrap();

        // another writer claims the id directly in the base store
        list.backend_mut().set("9", json!({"id": "9", "winner": true})).unwrap();

        assert!(!list.prepare("t"));
        assert!(!list.has_buffer("t"));
        assert_eq!(list.backend().get("9").unwrap()["winner"], true);
    }

    #[test]
    fn test_finalize_requires_prepare() {
        let mut list = tx_list();
        list.insert_in_transaction("t", "5", json!({})).unwrap();
        assert!(matches!(
            list.finalize("t").unwrap_err(),
            DbError::NotPrepared { .. }
        ));
    }

    #[test]
    fn test_savepoint_buffer_round_trip() {
        let mut list = tx_list();
        list.update_in_transaction("t", "1", json!({"v": 10})).unwrap();
        let sp = list.buffer_snapshot("t");
        list.delete_in_transaction("t", "2").unwrap();

        list.restore_buffer("t", sp);
        assert!(list.get_in_transaction("t", "2").is_some());
        assert_eq!(list.get_in_transaction("t", "1").unwrap()["v"], 10);
    }
}
