//! Collection CRUD and queries (non-transactional paths)
//!
//! Mutations are atomic at the record level: constraints are checked
//! against every index before the list or any tree is touched, so a
//! rejected mutation leaves no partial state behind.

use serde_json::{json, Value};

use crate::clock::now_ms;
use crate::error::{DbError, Result};
use crate::index::btree::Pointer;
use crate::keys::is_null_key;

use super::core::Collection;
use super::ttl::TTL_FIELD;

impl Collection {
    /// Insert a record: assign identity, validate, store and fan out to
    /// every index in registration order.
    pub fn create(&self, mut record: Value) -> Result<Value> {
        self.validate(&record)?;
        if self.ttl().is_some() {
            record[TTL_FIELD] = json!(now_ms());
        }
        if self.has_wildcard() {
            self.ensure_wildcard(&record)?;
        }

        let mut list = self.list.write();
        let id_value = self.ensure_identity(&mut record, list.backend())?;
        let token = self.id_token(&id_value)?;

        let mut indexes = self.indexes.write();
        // constraint pass first, mutation pass second
        let mut keys: Vec<Option<String>> = Vec::with_capacity(indexes.len());
        for slot in indexes.iter() {
            let key = slot.key_for(&record)?;
            if let Some(k) = &key {
                if slot.def.unique && !is_null_key(k) && !slot.index.find_all(k).is_empty() {
                    return Err(DbError::unique(&slot.name, k.clone()));
                }
            }
            keys.push(key);
        }

        list.backend_mut().set(&token, record.clone())?;
        for (slot, key) in indexes.iter_mut().zip(&keys) {
            if let Some(k) = key {
                slot.index.insert(k, token.clone())?;
            }
        }
        Ok(record)
    }

    pub fn find_by_id(&self, id: &Value) -> Result<Option<Value>> {
        let token = self.id_token(id)?;
        Ok(self.list.read().backend().get(&token))
    }

    fn pointers_by(&self, key: &str, value: &Value) -> Result<Vec<Pointer>> {
        let indexes = self.indexes.read();
        let slot = indexes
            .iter()
            .find(|s| s.name == key)
            .ok_or_else(|| DbError::IndexNotFound(key.to_string()))?;
        Ok(slot.index.find_all(&slot.key_for_value(value)))
    }

    /// Every record whose indexed `key` equals `value`
    pub fn find_by(&self, key: &str, value: &Value) -> Result<Vec<Value>> {
        let pointers = self.pointers_by(key, value)?;
        Ok(pointers
            .iter()
            .filter_map(|p| self.record_by_pointer(p))
            .collect())
    }

    pub fn find_first_by(&self, key: &str, value: &Value) -> Result<Option<Value>> {
        let pointers = self.pointers_by(key, value)?;
        Ok(pointers.first().and_then(|p| self.record_by_pointer(p)))
    }

    pub fn find_last_by(&self, key: &str, value: &Value) -> Result<Option<Value>> {
        let pointers = self.pointers_by(key, value)?;
        Ok(pointers.last().and_then(|p| self.record_by_pointer(p)))
    }

    /// First record in the backend's native order
    pub fn first(&self) -> Option<Value> {
        self.list.read().backend().forward().next().map(|(_, v)| v)
    }

    pub fn last(&self) -> Option<Value> {
        self.list.read().backend().backward().next().map(|(_, v)| v)
    }

    /// Record with the smallest key in the named index
    pub fn lowest(&self, key: &str) -> Result<Option<Value>> {
        let pointer = {
            let indexes = self.indexes.read();
            let slot = indexes
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| DbError::IndexNotFound(key.to_string()))?;
            slot.index.min().map(|(_, p)| p)
        };
        Ok(pointer.and_then(|p| self.record_by_pointer(&p)))
    }

    /// Record with the greatest key in the named index
    pub fn greatest(&self, key: &str) -> Result<Option<Value>> {
        let pointer = {
            let indexes = self.indexes.read();
            let slot = indexes
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| DbError::IndexNotFound(key.to_string()))?;
            slot.index.max().map(|(_, p)| p)
        };
        Ok(pointer.and_then(|p| self.record_by_pointer(&p)))
    }

    /// Earliest inserted record by TTL timestamp (falls back to insertion
    /// order when the collection has no TTL index).
    pub fn oldest(&self) -> Result<Option<Value>> {
        if self.ttl().is_some() {
            self.lowest(TTL_FIELD)
        } else {
            Ok(self.first())
        }
    }

    pub fn latest(&self) -> Result<Option<Value>> {
        if self.ttl().is_some() {
            self.greatest(TTL_FIELD)
        } else {
            Ok(self.last())
        }
    }

    /// Records matching an externally supplied predicate
    pub fn find(&self, predicate: &dyn Fn(&Value) -> bool) -> Vec<Value> {
        self.list
            .read()
            .backend()
            .forward()
            .map(|(_, v)| v)
            .filter(|v| predicate(v))
            .collect()
    }

    pub fn find_first(&self, predicate: &dyn Fn(&Value) -> bool) -> Option<Value> {
        self.list
            .read()
            .backend()
            .forward()
            .map(|(_, v)| v)
            .find(|v| predicate(v))
    }

    pub fn find_last(&self, predicate: &dyn Fn(&Value) -> bool) -> Option<Value> {
        self.list
            .read()
            .backend()
            .backward()
            .map(|(_, v)| v)
            .find(|v| predicate(v))
    }

    /// Update one record by id. `merge` deep-merges the patch; otherwise
    /// top-level assign. Returns the new record, or `None` when the id is
    /// unknown.
    pub fn update_by_id(&self, id: &Value, patch: &Value, merge: bool) -> Result<Option<Value>> {
        let token = self.id_token(id)?;

        let old = match self.list.read().backend().get(&token) {
            Some(o) => o,
            None => return Ok(None),
        };
        let mut next = if merge {
            Self::deep_merge(&old, patch)
        } else {
            Self::assign(&old, patch)
        };
        // identity is immutable through updates
        next[self.id_field()] = id.clone();
        self.validate(&next)?;
        if self.has_wildcard() {
            self.ensure_wildcard(&next)?;
        }

        let mut list = self.list.write();
        let mut indexes = self.indexes.write();

        // key movement per slot, constraints checked before mutation
        let mut moves: Vec<(Option<String>, Option<String>)> = Vec::with_capacity(indexes.len());
        for slot in indexes.iter() {
            let old_key = slot.key_for(&old)?;
            let new_key = slot.key_for(&next)?;
            if new_key != old_key {
                if let Some(k) = &new_key {
                    if slot.def.unique && !is_null_key(k) {
                        let existing = slot.index.find_all(k);
                        if existing.iter().any(|p| *p != token) {
                            return Err(DbError::unique(&slot.name, k.clone()));
                        }
                    }
                }
            }
            moves.push((old_key, new_key));
        }

        list.backend_mut().update(&token, next.clone())?;
        for (slot, (old_key, new_key)) in indexes.iter_mut().zip(moves) {
            if old_key == new_key {
                continue;
            }
            if let Some(k) = old_key {
                slot.index.remove_specific(&k, &|p| *p == token);
            }
            if let Some(k) = new_key {
                slot.index.insert(&k, token.clone())?;
            }
        }
        Ok(Some(next))
    }

    /// Update every record matching the predicate; returns the new
    /// records.
    pub fn update_where(
        &self,
        predicate: &dyn Fn(&Value) -> bool,
        patch: &Value,
        merge: bool,
    ) -> Result<Vec<Value>> {
        let id_field = self.id_field();
        let matched: Vec<Value> = self
            .find(predicate)
            .into_iter()
            .filter_map(|r| r.get(&id_field).cloned())
            .collect();
        let mut updated = Vec::with_capacity(matched.len());
        for id in matched {
            if let Some(next) = self.update_by_id(&id, patch, merge)? {
                updated.push(next);
            }
        }
        Ok(updated)
    }

    /// Remove one record by id, returning it.
    pub fn remove_by_id(&self, id: &Value) -> Result<Option<Value>> {
        let token = self.id_token(id)?;
        let mut list = self.list.write();
        let old = match list.backend().get(&token) {
            Some(o) => o,
            None => return Ok(None),
        };

        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            if let Some(key) = slot.key_for(&old)? {
                slot.index.remove_specific(&key, &|p| *p == token);
            }
        }
        list.backend_mut().delete(&token)?;
        Ok(Some(old))
    }

    /// Remove every record matching the predicate; returns the removed
    /// records.
    pub fn remove_where(&self, predicate: &dyn Fn(&Value) -> bool) -> Result<Vec<Value>> {
        let id_field = self.id_field();
        let matched: Vec<Value> = self
            .find(predicate)
            .into_iter()
            .filter_map(|r| r.get(&id_field).cloned())
            .collect();
        let mut removed = Vec::with_capacity(matched.len());
        for id in matched {
            if let Some(old) = self.remove_by_id(&id)? {
                removed.push(old);
            }
        }
        Ok(removed)
    }

    /// Audit envelope of a record (None without audit mode)
    pub fn envelope_of(&self, id: &Value) -> Result<Option<crate::storage::audit::AuditEnvelope>> {
        let token = self.id_token(id)?;
        Ok(self.list.read().backend().envelope(&token))
    }
}
