//! Collection snapshot adapters
//!
//! Adapters persist and restore whole-collection snapshots. The file
//! variant writes `<root>/<collection>.json` for single-file lists and
//! `<root>/<collection>/metadata.json` for per-file stores; the memory
//! variant keeps snapshots in process memory for `":memory:"` databases
//! and tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{CollectionOptions, IndexDef, StorageKind};
use crate::error::{DbError, Result};
use crate::index::btree::PortableEntry;

/// Serializable snapshot of a collection: config, backend blob, portable
/// index dumps and the stored index definitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionSnapshot {
    pub config: CollectionOptions,
    pub list: Value,
    #[serde(default)]
    pub indexes: BTreeMap<String, Vec<PortableEntry>>,
    #[serde(default, rename = "indexDefs")]
    pub index_defs: BTreeMap<String, IndexDef>,
}

/// Persist/restore contract crossed by the collection
pub trait StorageAdapter: Send + Sync {
    /// Bind the adapter to a collection's identity and layout.
    fn init(&mut self, options: &CollectionOptions) -> Result<()>;

    /// Load the snapshot stored under `name` (the collection's own name
    /// when absent). `None` when nothing has been stored yet.
    fn restore(&self, name: Option<&str>) -> Result<Option<CollectionSnapshot>>;

    /// Store a snapshot under `name` (the collection's own name when
    /// absent — rotation archives pass an explicit dated name).
    fn store(&mut self, name: Option<&str>, snapshot: &CollectionSnapshot) -> Result<()>;

    fn clone_adapter(&self) -> Box<dyn StorageAdapter>;
}

/// No-I/O adapter holding snapshots in process memory
#[derive(Default, Clone)]
pub struct MemoryAdapter {
    collection: String,
    snapshots: AHashMap<String, CollectionSnapshot>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for MemoryAdapter {
    fn init(&mut self, options: &CollectionOptions) -> Result<()> {
        self.collection = options.name.clone();
        Ok(())
    }

    fn restore(&self, name: Option<&str>) -> Result<Option<CollectionSnapshot>> {
        let key = name.unwrap_or(&self.collection);
        Ok(self.snapshots.get(key).cloned())
    }

    fn store(&mut self, name: Option<&str>, snapshot: &CollectionSnapshot) -> Result<()> {
        let key = name.unwrap_or(&self.collection).to_string();
        self.snapshots.insert(key, snapshot.clone());
        Ok(())
    }

    fn clone_adapter(&self) -> Box<dyn StorageAdapter> {
        Box::new(self.clone())
    }
}

/// File-backed adapter
#[derive(Clone)]
pub struct FileAdapter {
    root: PathBuf,
    collection: String,
    kind: StorageKind,
}

impl FileAdapter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            collection: String::new(),
            kind: StorageKind::List,
        }
    }

    fn snapshot_path(&self, name: &str) -> PathBuf {
        match self.kind {
            StorageKind::List => self.root.join(format!("{}.json", name)),
            StorageKind::PerFile => self.root.join(name).join("metadata.json"),
        }
    }
}

impl StorageAdapter for FileAdapter {
    fn init(&mut self, options: &CollectionOptions) -> Result<()> {
        self.collection = options.name.clone();
        self.kind = options.storage;
        fs::create_dir_all(&self.root)?;
        if self.kind == StorageKind::PerFile {
            fs::create_dir_all(self.root.join(&self.collection))?;
        }
        Ok(())
    }

    fn restore(&self, name: Option<&str>) -> Result<Option<CollectionSnapshot>> {
        let name = name.unwrap_or(&self.collection);
        let path = self.snapshot_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        let snapshot: CollectionSnapshot = serde_json::from_slice(&bytes).map_err(|e| {
            DbError::Serialization(format!("snapshot '{}' unreadable: {}", path.display(), e))
        })?;
        debug!(collection = %name, path = %path.display(), "snapshot restored");
        Ok(Some(snapshot))
    }

    fn store(&mut self, name: Option<&str>, snapshot: &CollectionSnapshot) -> Result<()> {
        let name = name.unwrap_or(&self.collection);
        let path = self.snapshot_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(snapshot)?)?;
        debug!(collection = %name, path = %path.display(), "snapshot stored");
        Ok(())
    }

    fn clone_adapter(&self) -> Box<dyn StorageAdapter> {
        Box::new(self.clone())
    }
}
