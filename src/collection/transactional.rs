//! Transactional collection operations and 2PC participation
//!
//! Mutations inside a transaction buffer into the transactional list and
//! every affected index; nothing touches the base store until the
//! transaction manager drives prepare/finalize. Reads go through the
//! per-transaction view.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::clock::now_ms;
use crate::error::{DbError, Result};
use crate::keys::codec::{is_null_key, key_token};
use crate::storage::tx_list::{ListChange, TransactionalList};
use crate::txn::manager::TransactionManager;
use crate::txn::resource::{BufferSnapshot, TransactionalResource};
use crate::txn::transaction::ChangeRecord;

use super::core::Collection;
use super::ttl::TTL_FIELD;

impl Collection {
    fn require_manager(&self) -> Result<Arc<TransactionManager>> {
        self.manager.read().clone().ok_or_else(|| {
            DbError::TransactionState(format!(
                "collection '{}' has no transaction manager attached",
                self.name
            ))
        })
    }

    fn resource_key(&self) -> String {
        format!("collection:{}", self.name)
    }

    /// Note fields for wildcard expansion, deferred until commit.
    fn defer_wildcard(&self, tx_id: &str, record: &Value) {
        if !self.has_wildcard() {
            return;
        }
        let fields = self.wildcard_candidates(record);
        if fields.is_empty() {
            return;
        }
        let mut pending = self.pending_wildcard.lock();
        let entry = pending.entry(tx_id.to_string()).or_default();
        for field in fields {
            if !entry.contains(&field) {
                entry.push(field);
            }
        }
    }

    /// Identity assignment inside a transaction. Buffered inserts have
    /// not advanced the backend counter, so generated ids walk forward
    /// past anything already visible to the transaction.
    fn ensure_identity_tx(
        &self,
        record: &mut Value,
        list: &TransactionalList,
        tx_id: &str,
    ) -> Result<Value> {
        let identity = self.identity();
        if let Some(v) = record.get(&identity.field) {
            if !v.is_null() {
                return Ok(v.clone());
            }
        }
        if !identity.auto {
            return Err(DbError::validation(
                &self.name,
                format!("missing identity field '{}'", identity.field),
            ));
        }
        let gen = super::identity::resolve_generator(&identity.gen)?;
        let mut value = gen(list.backend());
        loop {
            let token = match key_token(&value) {
                Some(t) => t,
                None => break,
            };
            if list.get_in_transaction(tx_id, &token).is_none() {
                break;
            }
            match value.as_u64() {
                Some(n) => value = json!(n + 1),
                None => break,
            }
        }
        record[&identity.field] = value.clone();
        Ok(value)
    }

    /// Insert a record inside a transaction.
    pub fn create_tx(&self, tx_id: &str, mut record: Value) -> Result<Value> {
        let manager = self.require_manager()?;
        manager.get(tx_id)?;
        self.validate(&record)?;
        if self.ttl().is_some() {
            record[TTL_FIELD] = json!(now_ms());
        }
        self.defer_wildcard(tx_id, &record);

        let mut list = self.list.write();
        let id_value = self.ensure_identity_tx(&mut record, &list, tx_id)?;
        let token = self.id_token(&id_value)?;
        if list.get_in_transaction(tx_id, &token).is_some() {
            return Err(DbError::unique(self.id_field(), &token));
        }

        let mut indexes = self.indexes.write();
        let mut keys: Vec<Option<String>> = Vec::with_capacity(indexes.len());
        for slot in indexes.iter() {
            let key = slot.key_for(&record)?;
            if let Some(k) = &key {
                if slot.def.unique
                    && !is_null_key(k)
                    && !slot.index.get_all_in_transaction(tx_id, k).is_empty()
                {
                    return Err(DbError::unique(&slot.name, k.clone()));
                }
            }
            keys.push(key);
        }

        manager.record_change(
            tx_id,
            &self.resource_key(),
            ChangeRecord::insert(&self.name, id_value, record.clone()),
        )?;
        list.insert_in_transaction(tx_id, &token, record.clone())?;
        for (slot, key) in indexes.iter_mut().zip(&keys) {
            if let Some(k) = key {
                slot.index.insert_in_transaction(tx_id, k, token.clone())?;
                manager.record_index_change(
                    tx_id,
                    &self.name,
                    &slot.name,
                    json!(k),
                    None,
                    Some(json!(token)),
                )?;
            }
        }
        Ok(record)
    }

    /// Update one record by id inside a transaction.
    pub fn update_tx(
        &self,
        tx_id: &str,
        id: &Value,
        patch: &Value,
        merge: bool,
    ) -> Result<Option<Value>> {
        let manager = self.require_manager()?;
        manager.get(tx_id)?;
        let token = self.id_token(id)?;

        let old = match self.list.read().get_in_transaction(tx_id, &token) {
            Some(o) => o,
            None => return Ok(None),
        };
        let mut next = if merge {
            Self::deep_merge(&old, patch)
        } else {
            Self::assign(&old, patch)
        };
        next[self.id_field()] = id.clone();
        self.validate(&next)?;
        self.defer_wildcard(tx_id, &next);

        let mut list = self.list.write();
        let mut indexes = self.indexes.write();

        let mut moves: Vec<(Option<String>, Option<String>)> = Vec::with_capacity(indexes.len());
        for slot in indexes.iter() {
            let old_key = slot.key_for(&old)?;
            let new_key = slot.key_for(&next)?;
            if new_key != old_key {
                if let Some(k) = &new_key {
                    if slot.def.unique && !is_null_key(k) {
                        let existing = slot.index.get_all_in_transaction(tx_id, k);
                        if existing.iter().any(|p| *p != token) {
                            return Err(DbError::unique(&slot.name, k.clone()));
                        }
                    }
                }
            }
            moves.push((old_key, new_key));
        }

        manager.record_change(
            tx_id,
            &self.resource_key(),
            ChangeRecord::update(&self.name, id.clone(), old, next.clone()),
        )?;
        list.update_in_transaction(tx_id, &token, next.clone())?;
        for (slot, (old_key, new_key)) in indexes.iter_mut().zip(moves) {
            if old_key == new_key {
                continue;
            }
            if let Some(k) = &old_key {
                slot.index.remove_in_transaction(tx_id, k, Some(token.clone()));
            }
            if let Some(k) = &new_key {
                slot.index.insert_in_transaction(tx_id, k, token.clone())?;
            }
            manager.record_index_change(
                tx_id,
                &self.name,
                &slot.name,
                json!(new_key.or(old_key)),
                None,
                Some(json!(token)),
            )?;
        }
        Ok(Some(next))
    }

    /// Remove one record by id inside a transaction.
    pub fn remove_tx(&self, tx_id: &str, id: &Value) -> Result<Option<Value>> {
        let manager = self.require_manager()?;
        manager.get(tx_id)?;
        let token = self.id_token(id)?;

        let mut list = self.list.write();
        let old = match list.get_in_transaction(tx_id, &token) {
            Some(o) => o,
            None => return Ok(None),
        };

        manager.record_change(
            tx_id,
            &self.resource_key(),
            ChangeRecord::delete(&self.name, id.clone(), old.clone()),
        )?;
        list.delete_in_transaction(tx_id, &token)?;

        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            if let Some(key) = slot.key_for(&old)? {
                slot.index.remove_in_transaction(tx_id, &key, Some(token.clone()));
                manager.record_index_change(
                    tx_id,
                    &self.name,
                    &slot.name,
                    json!(key),
                    Some(json!(token)),
                    None,
                )?;
            }
        }
        Ok(Some(old))
    }

    /// Per-transaction point lookup
    pub fn find_by_id_tx(&self, tx_id: &str, id: &Value) -> Result<Option<Value>> {
        let token = self.id_token(id)?;
        Ok(self.list.read().get_in_transaction(tx_id, &token))
    }

    /// Per-transaction indexed lookup: committed matches minus buffered
    /// removes plus buffered inserts.
    pub fn find_by_tx(&self, tx_id: &str, key: &str, value: &Value) -> Result<Vec<Value>> {
        let pointers = {
            let indexes = self.indexes.read();
            let slot = indexes
                .iter()
                .find(|s| s.name == key)
                .ok_or_else(|| DbError::IndexNotFound(key.to_string()))?;
            slot.index
                .get_all_in_transaction(tx_id, &slot.key_for_value(value))
        };
        let list = self.list.read();
        Ok(pointers
            .iter()
            .filter_map(|p| list.get_in_transaction(tx_id, p))
            .collect())
    }

    /// Every record visible to the transaction
    pub fn find_all_tx(&self, tx_id: &str) -> Vec<Value> {
        self.list
            .read()
            .iterate_in_transaction(tx_id)
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }
}

impl Collection {
    /// Apply replayed WAL entries to the base store (recovery path).
    ///
    /// Record operations are upserts/deletes keyed by the logged identity;
    /// INDEX_CHANGE and checkpoint entries are skipped because indexes are
    /// rebuilt from the records afterwards.
    pub fn apply_recovery(&self, entries: &[crate::txn::wal::WalEntry]) -> Result<()> {
        use crate::txn::wal::WalOperation;

        {
            let mut list = self.list.write();
            for entry in entries {
                let token = match key_token(&entry.data.key) {
                    Some(t) => t,
                    None => continue,
                };
                match entry.operation {
                    WalOperation::Insert | WalOperation::Update => {
                        if let Some(new_value) = &entry.data.new_value {
                            list.backend_mut().set(&token, new_value.clone())?;
                        }
                    }
                    WalOperation::Delete => {
                        list.backend_mut().delete(&token)?;
                    }
                    _ => {}
                }
            }
        }

        let records: Vec<(String, Value)> = self.list.read().backend().forward().collect();
        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            slot.rebuild(&records)?;
        }
        Ok(())
    }
}

impl TransactionalResource for Collection {
    fn resource_id(&self) -> String {
        self.resource_key()
    }

    fn prepare(&self, tx: &str) -> Result<bool> {
        let mut list = self.list.write();
        if !list.prepare(tx) {
            return Ok(false);
        }
        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            if !slot.index.prepare(tx) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn finalize(&self, tx: &str) -> Result<()> {
        {
            let mut list = self.list.write();
            list.finalize(tx)?;
            let mut indexes = self.indexes.write();
            for slot in indexes.iter_mut() {
                slot.index.finalize(tx)?;
            }
        }

        // wildcard expansion was deferred while the transaction ran
        if let Some(fields) = self.pending_wildcard.lock().remove(tx) {
            let template = {
                let config = self.config.read();
                config
                    .indexes
                    .iter()
                    .find(|(n, _)| n == "*")
                    .map(|(_, def)| def.clone())
            };
            if let Some(template) = template {
                for field in fields {
                    let mut def = template.clone();
                    def.key = Some(field.clone());
                    def.keys = None;
                    self.install_index(&field, def)?;
                }
            }
        }

        // collections persist on transactional commit
        self.persist(None)
    }

    fn rollback(&self, tx: &str) -> Result<()> {
        self.list.write().rollback(tx);
        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            slot.index.rollback(tx);
        }
        self.pending_wildcard.lock().remove(tx);
        Ok(())
    }

    fn savepoint_state(&self, tx: &str) -> Result<BufferSnapshot> {
        let list_buffer = self.list.read().buffer_snapshot(tx);
        let indexes = self.indexes.read();
        let mut index_buffers = serde_json::Map::new();
        for slot in indexes.iter() {
            index_buffers.insert(
                slot.name.clone(),
                serde_json::to_value(slot.index.buffer_snapshot(tx))?,
            );
        }
        let wildcard = self
            .pending_wildcard
            .lock()
            .get(tx)
            .cloned()
            .unwrap_or_default();
        Ok(json!({
            "list": serde_json::to_value(list_buffer)?,
            "indexes": Value::Object(index_buffers),
            "wildcard": wildcard,
        }))
    }

    fn restore_savepoint_state(&self, tx: &str, snapshot: &BufferSnapshot) -> Result<()> {
        let list_buffer: Vec<ListChange> =
            serde_json::from_value(snapshot["list"].clone())?;
        self.list.write().restore_buffer(tx, list_buffer);

        let mut indexes = self.indexes.write();
        if let Some(buffers) = snapshot["indexes"].as_object() {
            for slot in indexes.iter_mut() {
                let buffer = buffers
                    .get(&slot.name)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .unwrap_or_default();
                slot.index.restore_buffer(tx, buffer);
            }
        }

        let wildcard: Vec<String> = snapshot["wildcard"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();
        let mut pending = self.pending_wildcard.lock();
        if wildcard.is_empty() {
            pending.remove(tx);
        } else {
            pending.insert(tx.to_string(), wildcard);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionOptions, IndexDef, TransactionOptions};

    fn setup() -> (Arc<Collection>, Arc<TransactionManager>) {
        let collection =
            Collection::build(CollectionOptions::new("users").in_memory()).unwrap();
        let manager = Arc::new(TransactionManager::new(None));
        collection.attach_manager(manager.clone());
        manager.register_resource(collection.clone());
        (collection, manager)
    }

    fn begin(manager: &TransactionManager) -> String {
        manager.begin(TransactionOptions::default()).unwrap()
    }

    #[test]
    fn test_tx_insert_invisible_until_commit() {
        let (c, m) = setup();
        let tx = begin(&m);

        c.create_tx(&tx, json!({"id": 1, "name": "ann"})).unwrap();

        // visible to the transaction, invisible outside
        assert!(c.find_by_id_tx(&tx, &json!(1)).unwrap().is_some());
        assert!(c.find_by_id(&json!(1)).unwrap().is_none());
        assert_eq!(c.len(), 0);

        m.commit(&tx).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.find_by_id(&json!(1)).unwrap().unwrap()["name"], "ann");
    }

    #[test]
    fn test_tx_rollback_discards_everything() {
        let (c, m) = setup();
        c.create(json!({"id": 1, "v": "base"})).unwrap();

        let tx = begin(&m);
        c.update_tx(&tx, &json!(1), &json!({"v": "changed"}), true).unwrap();
        c.create_tx(&tx, json!({"id": 2})).unwrap();
        m.rollback(&tx).unwrap();

        assert_eq!(c.find_by_id(&json!(1)).unwrap().unwrap()["v"], "base");
        assert!(c.find_by_id(&json!(2)).unwrap().is_none());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_tx_index_visibility() {
        let (c, m) = setup();
        c.create_index("name", IndexDef::field("name")).unwrap();
        c.create(json!({"id": 1, "name": "ann"})).unwrap();

        let t1 = begin(&m);
        let t2 = begin(&m);
        c.create_tx(&t1, json!({"id": 2, "name": "ann"})).unwrap();

        assert_eq!(c.find_by_tx(&t1, "name", &json!("ann")).unwrap().len(), 2);
        assert_eq!(c.find_by_tx(&t2, "name", &json!("ann")).unwrap().len(), 1);
        assert_eq!(c.find_by("name", &json!("ann")).unwrap().len(), 1);

        m.commit(&t1).unwrap();
        assert_eq!(c.find_by("name", &json!("ann")).unwrap().len(), 2);
        m.rollback(&t2).unwrap();
    }

    #[test]
    fn test_unique_conflict_resolved_at_prepare() {
        let (c, m) = setup();
        c.create_index("email", IndexDef::field("email").unique()).unwrap();

        // T2 buffers while the key is free, T1 commits it first
        let t1 = begin(&m);
        let t2 = begin(&m);
        c.create_tx(&t2, json!({"id": 2, "email": "a@x"})).unwrap();
        c.create_tx(&t1, json!({"id": 1, "email": "a@x"})).unwrap();
        m.commit(&t1).unwrap();

        // T2's prepare fails; nothing from T2 lands in the base
        assert!(m.commit(&t2).is_err());
        assert_eq!(c.len(), 1);
        let found = c.find_by("email", &json!("a@x")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], json!(1));
    }

    #[test]
    fn test_auto_identity_inside_transaction() {
        let (c, m) = setup();
        c.create(json!({"name": "base"})).unwrap(); // id 1

        let tx = begin(&m);
        let r2 = c.create_tx(&tx, json!({"name": "a"})).unwrap();
        let r3 = c.create_tx(&tx, json!({"name": "b"})).unwrap();
        assert_eq!(r2["id"], json!(2));
        assert_eq!(r3["id"], json!(3));
        m.commit(&tx).unwrap();
        assert_eq!(c.len(), 3);
    }

    #[test]
    fn test_savepoint_restores_records_and_indexes() {
        let (c, m) = setup();
        c.create_index("name", IndexDef::field("name")).unwrap();

        let tx = begin(&m);
        c.create_tx(&tx, json!({"id": 10, "name": "ten"})).unwrap();

        let sp = m.create_savepoint(&tx, "A").unwrap();

        c.create_tx(&tx, json!({"id": 11, "name": "eleven"})).unwrap();
        c.update_tx(&tx, &json!(10), &json!({"name": "TEN"}), true).unwrap();

        m.rollback_to_savepoint(&tx, &sp).unwrap();

        // id 10 back to its pre-savepoint state, id 11 gone
        let r10 = c.find_by_id_tx(&tx, &json!(10)).unwrap().unwrap();
        assert_eq!(r10["name"], "ten");
        assert!(c.find_by_id_tx(&tx, &json!(11)).unwrap().is_none());
        assert_eq!(c.find_by_tx(&tx, "name", &json!("eleven")).unwrap().len(), 0);
        assert!(m.list_savepoints(&tx).unwrap().is_empty());

        m.commit(&tx).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(c.find_by_id(&json!(10)).unwrap().unwrap()["name"], "ten");
        assert!(c.find_by("name", &json!("TEN")).unwrap().is_empty());
        assert_eq!(c.find_by("name", &json!("ten")).unwrap().len(), 1);
    }

    #[test]
    fn test_wildcard_expansion_deferred_to_commit() {
        let collection = Collection::build(
            CollectionOptions::new("t")
                .in_memory()
                .with_index("*", IndexDef::default()),
        )
        .unwrap();
        let manager = Arc::new(TransactionManager::new(None));
        collection.attach_manager(manager.clone());
        manager.register_resource(collection.clone());

        let tx = manager.begin(TransactionOptions::default()).unwrap();
        collection
            .create_tx(&tx, json!({"id": 1, "city": "kyoto"}))
            .unwrap();

        // not expanded while the transaction runs
        assert!(collection.list_indexes(Some("city")).is_empty());

        manager.commit(&tx).unwrap();
        assert_eq!(collection.list_indexes(Some("city")).len(), 1);
        assert_eq!(
            collection.find_by("city", &json!("kyoto")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_remove_tx_updates_view_and_base() {
        let (c, m) = setup();
        c.create(json!({"id": 1, "v": 1})).unwrap();

        let tx = begin(&m);
        let removed = c.remove_tx(&tx, &json!(1)).unwrap().unwrap();
        assert_eq!(removed["v"], 1);
        assert!(c.find_by_id_tx(&tx, &json!(1)).unwrap().is_none());
        assert!(c.find_by_id(&json!(1)).unwrap().is_some());

        m.commit(&tx).unwrap();
        assert!(c.find_by_id(&json!(1)).unwrap().is_none());
    }
}
