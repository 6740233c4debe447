//! Per-file storage backend
//!
//! Every record lives in its own JSON file under `<root>/<collection>/`;
//! a B+Tree maps the canonical identity to the filename, so iteration
//! follows identity order rather than insertion order.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::error::{DbError, Result};
use crate::index::btree::BPlusTree;
use crate::keys::compare::default_comparator;
use crate::keys::DEFAULT_SEPARATOR;
use crate::storage::audit::AuditEnvelope;
use crate::storage::backend::StorageBackend;

/// One JSON file per record, indexed by identity
pub struct FileStore {
    name: String,
    root: PathBuf,
    /// identity -> filename
    tree: BPlusTree,
    counter: u64,
    live: usize,
    audit: bool,
}

fn file_name_for(id: &str) -> String {
    let safe = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe && !id.is_empty() {
        format!("{}.json", id)
    } else {
        // identities with path-hostile characters fall back to hex
        format!("x{}.json", hex::encode(id.as_bytes()))
    }
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>, audit: bool) -> Result<Self> {
        let name = name.into();
        let root = root.into().join(&name);
        fs::create_dir_all(&root)?;
        Ok(Self {
            name,
            root,
            tree: BPlusTree::new(default_comparator(DEFAULT_SEPARATOR), true),
            counter: 0,
            live: 0,
            audit,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    fn read_file(&self, file: &str) -> Option<Value> {
        let path = self.path_for(file);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "record file unreadable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "record file unparsable");
                None
            }
        }
    }

    fn write_file(&self, file: &str, value: &Value) -> Result<()> {
        let path = self.path_for(file);
        fs::write(&path, serde_json::to_vec_pretty(value)?)?;
        Ok(())
    }

    fn read_envelope(&self, file: &str) -> Option<AuditEnvelope> {
        self.read_file(file)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn payload_of(&self, file: &str) -> Option<Value> {
        if self.audit {
            let env = self.read_envelope(file)?;
            if env.is_deleted() {
                None
            } else {
                Some(env.data)
            }
        } else {
            self.read_file(file)
        }
    }
}

impl StorageBackend for FileStore {
    fn get(&self, id: &str) -> Option<Value> {
        let file = self.tree.find_first(id)?;
        self.payload_of(&file)
    }

    fn set(&mut self, id: &str, record: Value) -> Result<Value> {
        match self.tree.find_first(id) {
            Some(file) => {
                if self.audit {
                    match self.read_envelope(&file) {
                        Some(mut env) if !env.is_deleted() => {
                            env.apply_update(record.clone());
                            self.write_file(&file, &serde_json::to_value(&env)?)?;
                        }
                        _ => {
                            let env =
                                AuditEnvelope::create(Value::String(id.to_string()), record.clone());
                            self.write_file(&file, &serde_json::to_value(&env)?)?;
                            self.live += 1;
                            self.counter += 1;
                        }
                    }
                } else {
                    self.write_file(&file, &record)?;
                }
            }
            None => {
                let file = file_name_for(id);
                let value = if self.audit {
                    serde_json::to_value(AuditEnvelope::create(
                        Value::String(id.to_string()),
                        record.clone(),
                    ))?
                } else {
                    record.clone()
                };
                self.write_file(&file, &value)?;
                self.tree.insert(id, file);
                self.live += 1;
                self.counter += 1;
            }
        }
        Ok(record)
    }

    fn update(&mut self, id: &str, record: Value) -> Result<Value> {
        let file = self.tree.find_first(id).ok_or_else(|| {
            DbError::validation(&self.name, format!("cannot update unknown id '{}'", id))
        })?;
        if self.audit {
            let mut env = self.read_envelope(&file).ok_or_else(|| {
                DbError::validation(&self.name, format!("missing envelope for id '{}'", id))
            })?;
            if env.is_deleted() {
                return Err(DbError::validation(
                    &self.name,
                    format!("cannot update deleted id '{}'", id),
                ));
            }
            env.apply_update(record.clone());
            self.write_file(&file, &serde_json::to_value(&env)?)?;
        } else {
            self.write_file(&file, &record)?;
        }
        Ok(record)
    }

    fn delete(&mut self, id: &str) -> Result<Option<Value>> {
        let file = match self.tree.find_first(id) {
            Some(f) => f,
            None => return Ok(None),
        };
        if self.audit {
            match self.read_envelope(&file) {
                Some(mut env) if !env.is_deleted() => {
                    let payload = env.data.clone();
                    env.mark_deleted();
                    self.write_file(&file, &serde_json::to_value(&env)?)?;
                    self.live -= 1;
                    Ok(Some(payload))
                }
                _ => Ok(None),
            }
        } else {
            let payload = self.read_file(&file);
            if self.path_for(&file).exists() {
                fs::remove_file(self.path_for(&file))?;
            }
            self.tree.remove(id);
            if payload.is_some() {
                self.live -= 1;
            }
            Ok(payload)
        }
    }

    fn reset(&mut self) -> Result<()> {
        for (_, file) in self.tree.range(None, None) {
            let path = self.path_for(&file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        self.tree.clear();
        self.counter = 0;
        self.live = 0;
        Ok(())
    }

    fn forward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a> {
        Box::new(
            self.tree
                .range(None, None)
                .into_iter()
                .filter_map(move |(id, file)| self.payload_of(&file).map(|p| (id, p))),
        )
    }

    fn backward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a> {
        Box::new(
            self.tree
                .range(None, None)
                .into_iter()
                .rev()
                .filter_map(move |(id, file)| self.payload_of(&file).map(|p| (id, p))),
        )
    }

    fn len(&self) -> usize {
        self.live
    }

    fn counter(&self) -> u64 {
        self.counter
    }

    fn envelope(&self, id: &str) -> Option<AuditEnvelope> {
        if !self.audit {
            return None;
        }
        let file = self.tree.find_first(id)?;
        self.read_envelope(&file)
    }

    fn persist_blob(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "counter": self.counter,
            "_count": self.live,
            "_counter": self.counter,
            "index": serde_json::to_value(self.tree.to_portable())?,
        }))
    }

    fn load_blob(&mut self, blob: Value) -> Result<()> {
        let obj = blob
            .as_object()
            .ok_or_else(|| DbError::Serialization("file store blob is not an object".into()))?;
        self.counter = obj
            .get("_counter")
            .or_else(|| obj.get("counter"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let entries = obj
            .get("index")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        self.tree = BPlusTree::from_portable(entries, default_comparator(DEFAULT_SEPARATOR), true);
        self.live = self
            .tree
            .range(None, None)
            .into_iter()
            .filter(|(_, file)| self.payload_of(file).is_some())
            .count();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_set_get_delete_on_disk() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path(), "users", false).unwrap();

        store.set("1", json!({"id": 1, "name": "ann"})).unwrap();
        store.set("2", json!({"id": 2, "name": "bo"})).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get("1").unwrap()["name"], "ann");

        // record files actually land on disk
        assert!(dir.path().join("users").join("1.json").exists());

        store.delete("1").unwrap();
        assert!(store.get("1").is_none());
        assert!(!dir.path().join("users").join("1.json").exists());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_iteration_is_identity_order() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path(), "t", false).unwrap();
        for id in ["10", "2", "33", "4"] {
            store.set(id, json!({ "id": id })).unwrap();
        }
        let ids: Vec<String> = store.forward().map(|(id, _)| id).collect();
        // numeric identity order, not insertion order
        assert_eq!(ids, vec!["2", "4", "10", "33"]);
        let back: Vec<String> = store.backward().map(|(id, _)| id).collect();
        assert_eq!(back, vec!["33", "10", "4", "2"]);
    }

    #[test]
    fn test_hostile_identity_characters() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path(), "t", false).unwrap();
        store.set("a/b..c", json!({"v": 1})).unwrap();
        assert_eq!(store.get("a/b..c").unwrap()["v"], 1);
        store.delete("a/b..c").unwrap();
        assert!(store.get("a/b..c").is_none());
    }

    #[test]
    fn test_audit_tombstone_keeps_file() {
        let dir = TempDir::new().unwrap();
        let mut store = FileStore::new(dir.path(), "t", true).unwrap();
        store.set("1", json!({"n": 1})).unwrap();
        store.update("1", json!({"n": 2})).unwrap();
        store.delete("1").unwrap();

        assert!(store.get("1").is_none());
        assert_eq!(store.len(), 0);
        let env = store.envelope("1").unwrap();
        assert!(env.is_deleted());
        assert_eq!(env.history.len(), 1);
    }

    #[test]
    fn test_blob_round_trip_reattaches_files() {
        let dir = TempDir::new().unwrap();
        let blob = {
            let mut store = FileStore::new(dir.path(), "t", false).unwrap();
            store.set("1", json!({"v": "one"})).unwrap();
            store.set("2", json!({"v": "two"})).unwrap();
            store.persist_blob().unwrap()
        };

        let mut reopened = FileStore::new(dir.path(), "t", false).unwrap();
        reopened.load_blob(blob).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.get("1").unwrap()["v"], "one");
        assert_eq!(reopened.counter(), 2);
    }
}
