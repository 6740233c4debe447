//! Collection: construction, index machinery, snapshots
//!
//! CRUD lives in `crud.rs`, transactional variants in `transactional.rs`.
//! The collection owns its list and indexes outright; the adapter and the
//! validator are consulted through call-time context, never through back
//! references.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{AdapterKind, CollectionOptions, IdentityDef, IndexDef, StorageKind, Ttl};
use crate::error::{DbError, Result};
use crate::index::btree::{BPlusTree, Pointer};
use crate::index::manager::TransactionalIndex;
use crate::keys::codec::{key_token, serialize, DEFAULT_SEPARATOR};
use crate::keys::compare::create_comparator;
use crate::keys::fields::{extract_values, index_name, normalize_fields, FieldSpec};
use crate::keys::process::KeyTransform;
use crate::storage::adapter::{CollectionSnapshot, FileAdapter, MemoryAdapter, StorageAdapter};
use crate::storage::backend::StorageBackend;
use crate::storage::file_store::FileStore;
use crate::storage::list::List;
use crate::storage::tx_list::TransactionalList;
use crate::txn::manager::TransactionManager;
use crate::txn::transaction::TxId;

use super::identity::resolve_generator;
use super::rotation::RotationHandle;
use super::ttl::TTL_FIELD;

/// Record validator supplied by the embedding application
pub type Validator = Box<dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync>;

/// Public listing entry for `list_indexes`
#[derive(Debug, Clone)]
pub struct IndexInfo {
    pub name: String,
    pub def: IndexDef,
    pub entries: usize,
}

/// One index attached to a collection: definition, normalized fields and
/// the transactional tree, with the key-extraction logic alongside.
pub(crate) struct IndexSlot {
    pub name: String,
    pub def: IndexDef,
    pub fields: Vec<FieldSpec>,
    pub separator: char,
    pub transform: KeyTransform,
    pub index: TransactionalIndex,
}

impl IndexSlot {
    pub(crate) fn build(name: &str, def: IndexDef) -> Result<IndexSlot> {
        let fields = normalize_fields(&def);
        if fields.is_empty() {
            return Err(DbError::InvalidConfig(format!(
                "index '{}' defines no key",
                name
            )));
        }
        let separator = def
            .separator
            .as_ref()
            .and_then(|s| s.chars().next())
            .unwrap_or(DEFAULT_SEPARATOR);
        let transform = match &def.process {
            Some(process) => KeyTransform::resolve(process)?,
            None if def.ignore_case => KeyTransform::Lowercase,
            None => KeyTransform::Identity,
        };
        if let Some(gen) = &def.gen {
            // fail early on unresolvable generator names
            resolve_generator(gen)?;
        }
        let name = if name.is_empty() {
            index_name(&fields)
        } else {
            name.to_string()
        };
        let cmp = create_comparator(&fields, separator);
        let tree = BPlusTree::new(cmp, def.unique);
        Ok(IndexSlot {
            name: name.clone(),
            def,
            fields,
            separator,
            transform,
            index: TransactionalIndex::new(name, tree),
        })
    }

    /// Encoded key for a record. `Ok(None)` means the sparse index skips
    /// this record.
    pub(crate) fn key_for(&self, record: &Value) -> Result<Option<String>> {
        let values = extract_values(record, &self.fields);
        let is_null = |v: &Option<Value>| matches!(v, None | Some(Value::Null));

        if self.def.required {
            if let Some(pos) = values.iter().position(is_null) {
                return Err(DbError::required(&self.name, &self.fields[pos].path));
            }
        }
        if self.def.sparse && values.iter().all(is_null) {
            return Ok(None);
        }
        let encoded = serialize(&values, self.separator);
        Ok(Some(self.transform.apply(encoded)))
    }

    /// Encoded point-lookup key for a single queried value.
    pub(crate) fn key_for_value(&self, value: &Value) -> String {
        let encoded = serialize(std::slice::from_ref(&Some(value.clone())), self.separator);
        self.transform.apply(encoded)
    }

    pub(crate) fn rebuild(&mut self, records: &[(String, Value)]) -> Result<()> {
        let cmp = create_comparator(&self.fields, self.separator);
        let mut tree = BPlusTree::new(cmp, self.def.unique);
        for (id, record) in records {
            if let Some(key) = self.key_for(record)? {
                if !tree.insert(&key, id.clone()) {
                    return Err(DbError::unique(&self.name, &key));
                }
            }
        }
        self.index.replace_tree(tree);
        Ok(())
    }
}

/// Named container of records with its own indexes and storage backend
pub struct Collection {
    pub(crate) name: String,
    pub(crate) config: RwLock<CollectionOptions>,
    pub(crate) list: RwLock<TransactionalList>,
    pub(crate) indexes: RwLock<Vec<IndexSlot>>,
    pub(crate) adapter: Mutex<Box<dyn StorageAdapter>>,
    pub(crate) validator: RwLock<Option<Validator>>,
    pub(crate) manager: RwLock<Option<Arc<TransactionManager>>>,
    /// top-level fields first seen inside a transaction, expanded by the
    /// wildcard index at commit
    pub(crate) pending_wildcard: Mutex<AHashMap<TxId, Vec<String>>>,
    pub(crate) rotation: Mutex<Option<RotationHandle>>,
}

impl Collection {
    /// Build a collection from its options, wiring backend and adapter,
    /// then load any previously stored snapshot.
    pub fn build(options: CollectionOptions) -> Result<Arc<Collection>> {
        let root = options
            .root
            .clone()
            .unwrap_or_else(|| std::path::PathBuf::from("./data"));

        let mut adapter: Box<dyn StorageAdapter> = match options.adapter {
            AdapterKind::Memory => Box::new(MemoryAdapter::new()),
            AdapterKind::File => Box::new(FileAdapter::new(&root)),
        };
        adapter.init(&options)?;

        let backend: Box<dyn StorageBackend> = match options.storage {
            StorageKind::List => Box::new(List::new(&options.name, options.audit)),
            StorageKind::PerFile => {
                Box::new(FileStore::new(&root, &options.name, options.audit)?)
            }
        };

        let name = options.name.clone();
        let collection = Collection {
            name: name.clone(),
            list: RwLock::new(TransactionalList::new(&name, backend)),
            indexes: RwLock::new(Vec::new()),
            adapter: Mutex::new(adapter),
            validator: RwLock::new(None),
            manager: RwLock::new(None),
            pending_wildcard: Mutex::new(AHashMap::new()),
            rotation: Mutex::new(None),
            config: RwLock::new(options),
        };

        collection.install_identity_index()?;
        let configured: Vec<(String, IndexDef)> = collection.config.read().indexes.clone();
        for (index_name, def) in configured {
            if index_name == "*" {
                continue; // wildcard template, expanded per field
            }
            collection.install_index(&index_name, def)?;
        }
        if collection.config.read().ttl.is_some() {
            collection.install_ttl_index()?;
        }

        collection.load(None)?;
        info!(collection = %name, "collection ready");
        Ok(Arc::new(collection))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.list.read().backend().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ttl(&self) -> Option<Ttl> {
        self.config.read().ttl
    }

    pub fn identity(&self) -> IdentityDef {
        self.config.read().id.clone()
    }

    pub fn set_validator(&self, validator: Validator) {
        *self.validator.write() = Some(validator);
    }

    /// Attach the transaction manager (done by the database when
    /// transactions are enabled).
    pub fn attach_manager(&self, manager: Arc<TransactionManager>) {
        *self.manager.write() = Some(manager);
    }

    pub(crate) fn validate(&self, record: &Value) -> Result<()> {
        if !record.is_object() {
            return Err(DbError::validation(&self.name, "record is not an object"));
        }
        if let Some(validator) = self.validator.read().as_ref() {
            validator(record).map_err(|reason| DbError::validation(&self.name, reason))?;
        }
        Ok(())
    }

    pub(crate) fn id_field(&self) -> String {
        self.config.read().id.field.clone()
    }

    /// Canonical identity token for a record id value
    pub(crate) fn id_token(&self, id: &Value) -> Result<String> {
        key_token(id).ok_or_else(|| DbError::validation(&self.name, "identity value is null"))
    }

    /// Assign the identity when missing (auto mode), returning its value.
    pub(crate) fn ensure_identity(
        &self,
        record: &mut Value,
        backend: &dyn StorageBackend,
    ) -> Result<Value> {
        let identity = self.identity();
        match record.get(&identity.field) {
            Some(v) if !v.is_null() => Ok(v.clone()),
            _ => {
                if !identity.auto {
                    return Err(DbError::validation(
                        &self.name,
                        format!("missing identity field '{}'", identity.field),
                    ));
                }
                let gen = resolve_generator(&identity.gen)?;
                let value = gen(backend);
                record[&identity.field] = value.clone();
                Ok(value)
            }
        }
    }

    // ---- index management ----

    fn install_identity_index(&self) -> Result<()> {
        let identity = self.identity();
        let def = IndexDef {
            key: Some(identity.field.clone()),
            auto: identity.auto,
            unique: true,
            required: true,
            gen: Some(identity.gen.clone()),
            ..Default::default()
        };
        self.install_index(&identity.field, def)
    }

    fn install_ttl_index(&self) -> Result<()> {
        let def = IndexDef {
            key: Some(TTL_FIELD.to_string()),
            sparse: true,
            ..Default::default()
        };
        self.install_index(TTL_FIELD, def)
    }

    /// Add a slot without touching stored config (used at build/load).
    pub(crate) fn install_index(&self, index_name: &str, def: IndexDef) -> Result<()> {
        if self.indexes.read().iter().any(|s| s.name == index_name) {
            return Ok(());
        }
        let mut slot = IndexSlot::build(index_name, def)?;
        let records: Vec<(String, Value)> = self.list.read().backend().forward().collect();
        slot.rebuild(&records)?;
        let mut indexes = self.indexes.write();
        if indexes.iter().any(|s| s.name == index_name) {
            return Ok(());
        }
        indexes.push(slot);
        Ok(())
    }

    /// Create an index and record it in the collection config.
    pub fn create_index(&self, index_name: &str, def: IndexDef) -> Result<()> {
        {
            let indexes = self.indexes.read();
            if indexes.iter().any(|s| s.name == index_name) {
                return Err(DbError::validation(
                    &self.name,
                    format!("index '{}' already exists", index_name),
                ));
            }
        }
        self.install_index(index_name, def.clone())?;
        let mut config = self.config.write();
        config.indexes.retain(|(n, _)| n != index_name);
        config.indexes.push((index_name.to_string(), def));
        debug!(collection = %self.name, index = %index_name, "index created");
        Ok(())
    }

    pub fn drop_index(&self, index_name: &str) -> Result<()> {
        if index_name == self.id_field() {
            return Err(DbError::validation(
                &self.name,
                "cannot drop the identity index",
            ));
        }
        let mut indexes = self.indexes.write();
        let before = indexes.len();
        indexes.retain(|s| s.name != index_name);
        if indexes.len() == before {
            return Err(DbError::IndexNotFound(index_name.to_string()));
        }
        self.config.write().indexes.retain(|(n, _)| n != index_name);
        debug!(collection = %self.name, index = %index_name, "index dropped");
        Ok(())
    }

    pub fn list_indexes(&self, name: Option<&str>) -> Vec<IndexInfo> {
        self.indexes
            .read()
            .iter()
            .filter(|s| name.map_or(true, |n| s.name == n))
            .map(|s| IndexInfo {
                name: s.name.clone(),
                def: s.def.clone(),
                entries: s.index.len(),
            })
            .collect()
    }

    /// Apply the wildcard template to top-level fields of `record` that
    /// have no index yet. No-op without a `*` template.
    pub(crate) fn ensure_wildcard(&self, record: &Value) -> Result<()> {
        let template = {
            let config = self.config.read();
            match config.indexes.iter().find(|(n, _)| n == "*") {
                Some((_, def)) => def.clone(),
                None => return Ok(()),
            }
        };
        let fields = self.wildcard_candidates(record);
        for field in fields {
            let mut def = template.clone();
            def.key = Some(field.clone());
            def.keys = None;
            self.install_index(&field, def)?;
            debug!(collection = %self.name, index = %field, "wildcard index expanded");
        }
        Ok(())
    }

    /// Top-level fields of `record` with no index slot yet
    pub(crate) fn wildcard_candidates(&self, record: &Value) -> Vec<String> {
        let id_field = self.id_field();
        let indexes = self.indexes.read();
        record
            .as_object()
            .map(|obj| {
                obj.keys()
                    .filter(|k| {
                        *k != &id_field
                            && !k.starts_with("__")
                            && !indexes.iter().any(|s| &s.name == *k)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn has_wildcard(&self) -> bool {
        self.config.read().indexes.iter().any(|(n, _)| n == "*")
    }

    // ---- snapshots ----

    /// The serializable snapshot of the collection state.
    pub fn store(&self) -> Result<CollectionSnapshot> {
        let list_blob = self.list.read().backend().persist_blob()?;
        let indexes = self.indexes.read();
        let mut portable = BTreeMap::new();
        let mut defs = BTreeMap::new();
        for slot in indexes.iter() {
            portable.insert(slot.name.clone(), slot.index.tree().to_portable());
            defs.insert(slot.name.clone(), slot.def.clone());
        }
        Ok(CollectionSnapshot {
            config: self.config.read().clone(),
            list: list_blob,
            indexes: portable,
            index_defs: defs,
        })
    }

    /// Persist the snapshot through the adapter, optionally under an
    /// archive name.
    pub fn persist(&self, name: Option<&str>) -> Result<()> {
        let snapshot = self.store()?;
        self.adapter.lock().store(name, &snapshot)
    }

    /// Restore state from the adapter. Returns `false` when no snapshot
    /// exists. Indexes with a portable dump are loaded; anything else is
    /// rebuilt from records.
    pub fn load(&self, name: Option<&str>) -> Result<bool> {
        let snapshot = match self.adapter.lock().restore(name)? {
            Some(s) => s,
            None => return Ok(false),
        };

        self.list.write().backend_mut().load_blob(snapshot.list)?;

        // install stored definitions this collection doesn't know yet
        for (index_name, def) in &snapshot.index_defs {
            self.install_index(index_name, def.clone())?;
        }

        let records: Vec<(String, Value)> = self.list.read().backend().forward().collect();
        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            match snapshot.indexes.get(&slot.name) {
                Some(portable) => {
                    let cmp = create_comparator(&slot.fields, slot.separator);
                    slot.index.replace_tree(BPlusTree::from_portable(
                        portable.clone(),
                        cmp,
                        slot.def.unique,
                    ));
                }
                None => slot.rebuild(&records)?,
            }
        }
        debug!(collection = %self.name, records = records.len(), "collection loaded");
        Ok(true)
    }

    /// Drop every record and index entry.
    pub fn reset(&self) -> Result<()> {
        self.list.write().backend_mut().reset()?;
        let mut indexes = self.indexes.write();
        for slot in indexes.iter_mut() {
            slot.rebuild(&[])?;
        }
        Ok(())
    }

    /// Pointer lookup helper shared by the query paths
    pub(crate) fn record_by_pointer(&self, pointer: &Pointer) -> Option<Value> {
        self.list.read().backend().get(pointer)
    }

    /// Deep merge `patch` into `current` (objects merge recursively,
    /// everything else replaces; `null` in the patch removes the key).
    pub fn deep_merge(current: &Value, patch: &Value) -> Value {
        match (current, patch) {
            (Value::Object(cur), Value::Object(p)) => {
                let mut out = cur.clone();
                for (k, pv) in p {
                    if pv.is_null() {
                        out.remove(k);
                    } else {
                        let merged = match out.get(k) {
                            Some(cv) => Self::deep_merge(cv, pv),
                            None => pv.clone(),
                        };
                        out.insert(k.clone(), merged);
                    }
                }
                Value::Object(out)
            }
            _ => patch.clone(),
        }
    }

    /// Shallow assign: top-level keys of `patch` replace `current`'s.
    pub fn assign(current: &Value, patch: &Value) -> Value {
        match (current, patch) {
            (Value::Object(cur), Value::Object(p)) => {
                let mut out = cur.clone();
                for (k, pv) in p {
                    out.insert(k.clone(), pv.clone());
                }
                Value::Object(out)
            }
            _ => patch.clone(),
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection").field("name", &self.name).finish()
    }
}

impl Drop for Collection {
    fn drop(&mut self) {
        if let Some(mut handle) = self.rotation.get_mut().take() {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    pub(crate) fn memory_collection(name: &str) -> Arc<Collection> {
        Collection::build(CollectionOptions::new(name).in_memory()).unwrap()
    }

    #[test]
    fn test_build_installs_identity_index() {
        let c = memory_collection("users");
        let infos = c.list_indexes(None);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].name, "id");
        assert!(infos[0].def.unique);
        assert!(infos[0].def.required);
    }

    #[test]
    fn test_create_and_drop_index() {
        let c = memory_collection("users");
        c.create_index("name", IndexDef::field("name")).unwrap();
        assert_eq!(c.list_indexes(None).len(), 2);
        assert!(c.create_index("name", IndexDef::field("name")).is_err());

        c.drop_index("name").unwrap();
        assert_eq!(c.list_indexes(None).len(), 1);
        assert!(matches!(
            c.drop_index("name").unwrap_err(),
            DbError::IndexNotFound(_)
        ));
        assert!(c.drop_index("id").is_err());
    }

    #[test]
    fn test_deep_merge_semantics() {
        let cur = json!({"a": {"x": 1, "y": 2}, "b": 3, "c": 4});
        let patch = json!({"a": {"y": 20}, "b": null, "d": 5});
        let merged = Collection::deep_merge(&cur, &patch);
        assert_eq!(merged, json!({"a": {"x": 1, "y": 20}, "c": 4, "d": 5}));
    }

    #[test]
    fn test_assign_is_shallow() {
        let cur = json!({"a": {"x": 1}, "b": 2});
        let patch = json!({"a": {"y": 9}});
        assert_eq!(
            Collection::assign(&cur, &patch),
            json!({"a": {"y": 9}, "b": 2})
        );
    }

    #[test]
    fn test_required_index_key() {
        let slot = IndexSlot::build("email", IndexDef::field("email").required()).unwrap();
        assert!(slot.key_for(&json!({"email": "a@b"})).is_ok());
        assert!(matches!(
            slot.key_for(&json!({"other": 1})).unwrap_err(),
            DbError::RequiredField { .. }
        ));
    }

    #[test]
    fn test_sparse_index_skips_null() {
        let slot = IndexSlot::build("tag", IndexDef::field("tag").sparse()).unwrap();
        assert_eq!(slot.key_for(&json!({"tag": null})).unwrap(), None);
        assert_eq!(slot.key_for(&json!({})).unwrap(), None);
        assert!(slot.key_for(&json!({"tag": "x"})).unwrap().is_some());
    }

    #[test]
    fn test_ignore_case_keys() {
        let mut def = IndexDef::field("name");
        def.ignore_case = true;
        let slot = IndexSlot::build("name", def).unwrap();
        assert_eq!(
            slot.key_for(&json!({"name": "Alice"})).unwrap().unwrap(),
            "alice"
        );
    }
}
