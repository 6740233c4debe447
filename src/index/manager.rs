//! Transaction-aware index
//!
//! Decorates the base B+Tree with per-transaction change buffers and the
//! two-phase-commit hooks. Buffered changes are invisible to other
//! transactions; the owning transaction reads through its buffer
//! (committed base, minus buffered removes, plus buffered inserts).

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};

use crate::clock::now_ms;
use crate::error::{DbError, Result};
use crate::index::btree::{BPlusTree, Pointer};
use crate::keys::is_null_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexChangeKind {
    Insert,
    Remove,
}

/// One buffered index mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexChange {
    #[serde(rename = "type")]
    pub kind: IndexChangeKind,
    pub key: String,
    /// Pointer for inserts and targeted removes; `None` removes the key
    /// outright (only produced internally before expansion)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Pointer>,
    pub timestamp: i64,
}

/// Ordered index with per-transaction buffering and 2PC hooks
pub struct TransactionalIndex {
    name: String,
    base: BPlusTree,
    unique: bool,
    changes: AHashMap<String, Vec<IndexChange>>,
    prepared: AHashSet<String>,
}

impl TransactionalIndex {
    pub fn new(name: impl Into<String>, base: BPlusTree) -> Self {
        let unique = base.is_unique();
        Self {
            name: name.into(),
            base,
            unique,
            changes: AHashMap::new(),
            prepared: AHashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tree(&self) -> &BPlusTree {
        &self.base
    }

    pub fn replace_tree(&mut self, base: BPlusTree) {
        self.unique = base.is_unique();
        self.base = base;
    }

    /// Entries visible to `tx` for `key`: committed base minus buffered
    /// removes plus buffered inserts, in buffer order.
    pub fn get_all_in_transaction(&self, tx: &str, key: &str) -> Vec<Pointer> {
        let mut visible = self.base.find(key);
        if let Some(changes) = self.changes.get(tx) {
            for change in changes {
                if change.key != key {
                    continue;
                }
                match change.kind {
                    IndexChangeKind::Insert => {
                        if let Some(v) = &change.value {
                            visible.push(v.clone());
                        }
                    }
                    IndexChangeKind::Remove => match &change.value {
                        Some(v) => {
                            if let Some(pos) = visible.iter().position(|p| p == v) {
                                visible.remove(pos);
                            }
                        }
                        None => visible.clear(),
                    },
                }
            }
        }
        visible
    }

    /// Buffer an insert after validating against the per-tx view.
    pub fn insert_in_transaction(&mut self, tx: &str, key: &str, value: Pointer) -> Result<()> {
        if self.unique && !is_null_key(key) && !self.get_all_in_transaction(tx, key).is_empty() {
            return Err(DbError::unique(&self.name, key));
        }
        self.push_change(tx, IndexChangeKind::Insert, key, Some(value));
        Ok(())
    }

    /// Buffer removal of one `(key, value)` pair, or of every entry
    /// currently visible for `key` when `value` is `None`.
    pub fn remove_in_transaction(&mut self, tx: &str, key: &str, value: Option<Pointer>) {
        match value {
            Some(v) => self.push_change(tx, IndexChangeKind::Remove, key, Some(v)),
            None => {
                for visible in self.get_all_in_transaction(tx, key) {
                    self.push_change(tx, IndexChangeKind::Remove, key, Some(visible));
                }
            }
        }
    }

    fn push_change(&mut self, tx: &str, kind: IndexChangeKind, key: &str, value: Option<Pointer>) {
        self.changes
            .entry(tx.to_string())
            .or_default()
            .push(IndexChange {
                kind,
                key: key.to_string(),
                value,
                timestamp: now_ms(),
            });
    }

    /// Revalidate the buffer against the base index. A violation clears
    /// the buffer and reports `false`; success marks the tx prepared.
    pub fn prepare(&mut self, tx: &str) -> bool {
        let changes = match self.changes.get(tx) {
            Some(c) => c,
            None => {
                // nothing buffered: trivially preparable
                self.prepared.insert(tx.to_string());
                return true;
            }
        };

        // replay the buffer over the committed state
        let mut simulated: AHashMap<String, Vec<Pointer>> = AHashMap::new();
        let mut ok = true;
        for change in changes {
            let entry = simulated
                .entry(change.key.clone())
                .or_insert_with(|| self.base.find(&change.key));
            match change.kind {
                IndexChangeKind::Insert => {
                    if self.unique && !is_null_key(&change.key) && !entry.is_empty() {
                        ok = false;
                        break;
                    }
                    if let Some(v) = &change.value {
                        entry.push(v.clone());
                    }
                }
                IndexChangeKind::Remove => match &change.value {
                    Some(v) => {
                        if let Some(pos) = entry.iter().position(|p| p == v) {
                            entry.remove(pos);
                        }
                    }
                    None => entry.clear(),
                },
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

    /// Apply the buffer to the base index. Requires a prior successful
    /// [`prepare`](TransactionalIndex::prepare).
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
                    IndexChangeKind::Insert => {
                        let value = change.value.unwrap_or_default();
                        if !self.base.insert(&change.key, value) {
                            // prepare validated this; a duplicate here means
                            // the base moved underneath us
                            return Err(DbError::unique(&self.name, &change.key));
                        }
                    }
                    IndexChangeKind::Remove => match change.value {
                        Some(v) => {
                            self.base.remove_specific(&change.key, &|p| *p == v);
                        }
                        None => {
                            self.base.remove(&change.key);
                        }
                    },
                }
            }
        }
        self.prepared.remove(tx);
        Ok(())
    }

    /// Drop the buffer. Unknown transactions are a no-op.
    pub fn rollback(&mut self, tx: &str) {
        self.changes.remove(tx);
        self.prepared.remove(tx);
    }

    /// Clone of the buffered changes, for savepoints.
    pub fn buffer_snapshot(&self, tx: &str) -> Vec<IndexChange> {
        self.changes.get(tx).cloned().unwrap_or_default()
    }

    /// Restore a savepoint's buffer, discarding later changes.
    pub fn restore_buffer(&mut self, tx: &str, buffer: Vec<IndexChange>) {
        if buffer.is_empty() {
            self.changes.remove(tx);
        } else {
            self.changes.insert(tx.to_string(), buffer);
        }
    }

    pub fn has_buffer(&self, tx: &str) -> bool {
        self.changes.contains_key(tx)
    }

    // ---- non-transactional shortcuts ----

    pub fn insert(&mut self, key: &str, value: Pointer) -> Result<()> {
        if !self.base.insert(key, value) {
            return Err(DbError::unique(&self.name, key));
        }
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Vec<Pointer> {
        self.base.remove(key)
    }

    pub fn remove_specific(&mut self, key: &str, pred: &dyn Fn(&Pointer) -> bool) -> Vec<Pointer> {
        self.base.remove_specific(key, pred)
    }

    pub fn find_first(&self, key: &str) -> Option<Pointer> {
        self.base.find_first(key)
    }

    pub fn find_last(&self, key: &str) -> Option<Pointer> {
        self.base.find_last(key)
    }

    pub fn find_all(&self, key: &str) -> Vec<Pointer> {
        self.base.find(key)
    }

    pub fn min(&self) -> Option<(String, Pointer)> {
        self.base.min()
    }

    pub fn max(&self) -> Option<(String, Pointer)> {
        self.base.max()
    }

    pub fn len(&self) -> usize {
        self.base.len()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::compare::default_comparator;
    use crate::keys::DEFAULT_SEPARATOR;

    fn index(unique: bool) -> TransactionalIndex {
        TransactionalIndex::new(
            "test",
            BPlusTree::new(default_comparator(DEFAULT_SEPARATOR), unique),
        )
    }

    fn seeded() -> TransactionalIndex {
        let mut idx = index(false);
        idx.insert("key1", "value1".into()).unwrap();
        idx.insert("key2", "value2".into()).unwrap();
        idx.insert("key3", "value3".into()).unwrap();
        idx
    }

    #[test]
    fn test_transactional_insert_visibility() {
        let mut idx = seeded();

        idx.insert_in_transaction("t1", "key1", "newValue1".into())
            .unwrap();

        // own view sees both, other transactions see base only
        let mut t1_view = idx.get_all_in_transaction("t1", "key1");
        t1_view.sort();
        assert_eq!(t1_view, vec!["newValue1".to_string(), "value1".to_string()]);
        assert_eq!(idx.get_all_in_transaction("t2", "key1"), vec!["value1".to_string()]);

        idx.remove_in_transaction("t1", "key2", None);
        assert!(idx.get_all_in_transaction("t1", "key2").is_empty());
        assert_eq!(idx.get_all_in_transaction("t2", "key2"), vec!["value2".to_string()]);

        // 2PC applies the buffer to the base index
        assert!(idx.prepare("t1"));
        idx.finalize("t1").unwrap();

        let mut base = idx.find_all("key1");
        base.sort();
        assert_eq!(base, vec!["newValue1".to_string(), "value1".to_string()]);
        assert!(idx.find_all("key2").is_empty());
        assert_eq!(idx.find_all("key3"), vec!["value3".to_string()]);
    }

    #[test]
    fn test_buffered_remove_of_buffered_insert() {
        let mut idx = index(false);
        idx.insert_in_transaction("t", "k", "a".into()).unwrap();
        idx.remove_in_transaction("t", "k", Some("a".into()));
        assert!(idx.get_all_in_transaction("t", "k").is_empty());

        assert!(idx.prepare("t"));
        idx.finalize("t").unwrap();
        assert!(idx.find_all("k").is_empty());
    }

    #[test]
    fn test_unique_conflict_inside_transaction() {
        let mut idx = index(true);
        idx.insert("k", "r0".into()).unwrap();

        let err = idx
            .insert_in_transaction("t", "k", "r1".into())
            .unwrap_err();
        assert!(matches!(err, DbError::UniqueConstraint { .. }));

        // removing the committed entry first makes room
        idx.remove_in_transaction("t", "k", None);
        idx.insert_in_transaction("t", "k", "r1".into()).unwrap();
        assert!(idx.prepare("t"));
        idx.finalize("t").unwrap();
        assert_eq!(idx.find_all("k"), vec!["r1".to_string()]);
    }

    #[test]
    fn test_unique_rejection_during_prepare() {
        let mut idx = index(true);

        // T2 buffers an insert while the key is still free
        idx.insert_in_transaction("t2", "k", "r2".into()).unwrap();

        // T1 commits the same key first
        idx.insert_in_transaction("t1", "k", "r1".into()).unwrap();
        assert!(idx.prepare("t1"));
        idx.finalize("t1").unwrap();

        // T2's prepare now fails and clears its buffer
        assert!(!idx.prepare("t2"));
        assert!(!idx.has_buffer("t2"));
        assert_eq!(idx.find_all("k"), vec!["r1".to_string()]);

        // finalize without successful prepare is rejected
        assert!(matches!(
            idx.finalize("t2").unwrap_err(),
            DbError::NotPrepared { .. }
        ));
    }

    #[test]
    fn test_rollback_discards_buffer_and_is_idempotent() {
        let mut idx = seeded();
        idx.insert_in_transaction("t", "key1", "x".into()).unwrap();
        idx.rollback("t");
        assert_eq!(idx.get_all_in_transaction("t", "key1"), vec!["value1".to_string()]);

        // unknown transaction: no-op
        idx.rollback("never-began");
    }

    #[test]
    fn test_savepoint_buffer_restore() {
        let mut idx = seeded();
        idx.insert_in_transaction("t", "key1", "a".into()).unwrap();
        let sp = idx.buffer_snapshot("t");
        idx.insert_in_transaction("t", "key1", "b".into()).unwrap();
        idx.remove_in_transaction("t", "key3", None);

        idx.restore_buffer("t", sp);
        let mut view = idx.get_all_in_transaction("t", "key1");
        view.sort();
        assert_eq!(view, vec!["a".to_string(), "value1".to_string()]);
        assert_eq!(idx.get_all_in_transaction("t", "key3"), vec!["value3".to_string()]);
    }

    #[test]
    fn test_null_keys_bypass_unique_check() {
        use crate::keys::NULL_KEY;

        let mut idx = index(true);
        idx.insert_in_transaction("t", NULL_KEY, "a".into()).unwrap();
        idx.insert_in_transaction("t", NULL_KEY, "b".into()).unwrap();
        idx.insert_in_transaction("t", "", "c".into()).unwrap();
        assert!(idx.prepare("t"));
        idx.finalize("t").unwrap();

        // duplicate null keys land in the unique base index too
        assert_eq!(idx.find_all(NULL_KEY).len(), 2);
        assert_eq!(idx.find_all("").len(), 1);
    }
}
