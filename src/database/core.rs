//! Database core: registry, manifest, connect/close, recovery

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::collection::Collection;
use crate::config::{AdapterKind, CollectionOptions, DatabaseOptions, IndexDef};
use crate::error::{DbError, Result};
use crate::txn::manager::TransactionManager;
use crate::txn::transaction::TxId;
use crate::txn::wal::{WalEntry, WalManager};

use super::session::SessionId;

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub collections: usize,
    pub records: usize,
    pub active_transactions: usize,
}

/// Embedded database instance
pub struct Database {
    pub(crate) options: DatabaseOptions,
    pub(crate) collections: RwLock<AHashMap<String, Arc<Collection>>>,
    pub(crate) manager: Option<Arc<TransactionManager>>,
    pub(crate) sessions: RwLock<AHashMap<SessionId, Option<TxId>>>,
    pub(crate) session_seq: AtomicU64,
    connected: AtomicBool,
}

impl Database {
    /// Set up the database and its transaction stack. Call
    /// [`connect`](Database::connect) to load state from disk.
    pub fn new(options: DatabaseOptions) -> Result<Self> {
        let manager = if options.enable_transactions {
            let wal = if options.wal.enable_wal {
                let wal = if options.is_memory() {
                    WalManager::memory(&options.wal)
                } else {
                    let path = options
                        .wal
                        .wal_path
                        .clone()
                        .unwrap_or_else(|| options.root.join(format!("{}.wal", options.db_name)));
                    WalManager::file(path, &options.wal)?
                };
                Some(Arc::new(wal))
            } else {
                None
            };
            Some(Arc::new(TransactionManager::new(wal)))
        } else {
            None
        };

        let db = Self {
            options,
            collections: RwLock::new(AHashMap::new()),
            manager,
            sessions: RwLock::new(AHashMap::new()),
            session_seq: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        };
        db.sessions
            .write()
            .insert(SessionId::default_session(), None);
        Ok(db)
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn manager(&self) -> Result<&Arc<TransactionManager>> {
        self.manager.as_ref().ok_or_else(|| {
            DbError::TransactionState("transactions are not enabled for this database".into())
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.options
            .root
            .join(format!("{}.json", self.options.db_name))
    }

    fn collection_root(&self) -> PathBuf {
        self.options.root.join(&self.options.db_name)
    }

    /// Load the schema manifest, build every collection and replay the
    /// WAL when auto-recovery is configured.
    pub fn connect(&self) -> Result<()> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if !self.options.is_memory() {
            fs::create_dir_all(&self.options.root)?;
        }

        // schema manifest: collection name -> stored config
        let manifest = self.read_manifest()?;
        for (_, config) in manifest {
            self.install_collection(config)?;
        }

        if let Some(manager) = &self.manager {
            if let Some(wal) = manager.wal() {
                if self.options.wal.auto_recovery {
                    self.recover(wal.clone())?;
                }
            }
        }

        info!(db = %self.options.db_name, "database connected");
        Ok(())
    }

    fn read_manifest(&self) -> Result<BTreeMap<String, CollectionOptions>> {
        if self.options.is_memory() {
            return Ok(BTreeMap::new());
        }
        let path = self.manifest_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let bytes = fs::read(&path)?;
        let manifest: BTreeMap<String, CollectionOptions> = serde_json::from_slice(&bytes)
            .map_err(|e| {
                DbError::Serialization(format!("manifest '{}' unreadable: {}", path.display(), e))
            })?;
        Ok(manifest)
    }

    /// Rewrite the schema manifest (after every schema change).
    pub(crate) fn write_manifest(&self) -> Result<()> {
        if self.options.is_memory() {
            return Ok(());
        }
        fs::create_dir_all(&self.options.root)?;
        let collections = self.collections.read();
        let mut manifest: BTreeMap<String, Value> = BTreeMap::new();
        for (name, collection) in collections.iter() {
            manifest.insert(name.clone(), serde_json::to_value(collection.store()?.config)?);
        }
        fs::write(self.manifest_path(), serde_json::to_vec_pretty(&manifest)?)?;
        debug!(db = %self.options.db_name, "manifest written");
        Ok(())
    }

    fn recover(&self, wal: Arc<WalManager>) -> Result<()> {
        let outcome = wal.recover()?;
        if outcome.entries.is_empty() {
            return Ok(());
        }

        let mut by_collection: AHashMap<String, Vec<WalEntry>> = AHashMap::new();
        for entry in outcome.entries {
            by_collection
                .entry(entry.collection_name.clone())
                .or_default()
                .push(entry);
        }

        for (name, entries) in by_collection {
            match self.collections.read().get(&name) {
                Some(collection) => {
                    collection.apply_recovery(&entries)?;
                    collection.persist(None)?;
                }
                None => {
                    warn!(collection = %name, "WAL references unknown collection, entries dropped")
                }
            }
        }

        // recovered state is durable; the replayed log can go
        if let Some(manager) = &self.manager {
            manager.checkpoint()?;
        }
        info!(
            committed = outcome.report.committed_transactions,
            discarded = outcome.report.discarded_transactions,
            corrupt = outcome.report.corrupt_entries,
            "WAL recovery applied"
        );
        Ok(())
    }

    /// Build a collection, wire it to the manager, start rotation.
    fn install_collection(&self, mut config: CollectionOptions) -> Result<Arc<Collection>> {
        if config.root.is_none() {
            config.root = Some(self.collection_root());
        }
        if self.options.is_memory() {
            // ":memory:" databases force the memory adapter everywhere
            config.adapter = AdapterKind::Memory;
        }
        let collection = Collection::build(config)?;
        if let Some(manager) = &self.manager {
            collection.attach_manager(manager.clone());
            manager.register_resource(collection.clone());
        }
        collection.start_rotation()?;
        self.collections
            .write()
            .insert(collection.name().to_string(), collection.clone());
        Ok(collection)
    }

    /// Create a collection with default options.
    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.create_collection_with(CollectionOptions::new(name))
    }

    pub fn create_collection_with(&self, config: CollectionOptions) -> Result<Arc<Collection>> {
        if self.collections.read().contains_key(&config.name) {
            return Err(DbError::validation(
                &config.name,
                "collection already exists",
            ));
        }
        let collection = self.install_collection(config)?;
        self.write_manifest()?;
        Ok(collection)
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        let collection = self
            .collections
            .write()
            .remove(name)
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))?;
        collection.stop_rotation();
        if let Some(manager) = &self.manager {
            manager.unregister_resource(&format!("collection:{}", name));
        }
        self.write_manifest()?;
        debug!(collection = %name, "collection dropped");
        Ok(())
    }

    pub fn collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    pub fn list_collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_index(&self, collection: &str, index_name: &str, def: IndexDef) -> Result<()> {
        self.collection(collection)?.create_index(index_name, def)?;
        self.write_manifest()
    }

    pub fn drop_index(&self, collection: &str, index_name: &str) -> Result<()> {
        self.collection(collection)?.drop_index(index_name)?;
        self.write_manifest()
    }

    /// Persist every collection, the manifest and flush the WAL.
    pub fn persist(&self) -> Result<()> {
        for collection in self.collections.read().values() {
            collection.persist(None)?;
        }
        self.write_manifest()?;
        if let Some(manager) = &self.manager {
            if let Some(wal) = manager.wal() {
                wal.flush()?;
            }
        }
        Ok(())
    }

    /// Persist, stop background work and flush the WAL.
    pub fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // roll back anything still open
        if let Some(manager) = &self.manager {
            for tx in manager.active_ids() {
                warn!(tx = %tx, "open transaction rolled back on close");
                manager.rollback(&tx)?;
            }
        }
        self.persist()?;
        for collection in self.collections.read().values() {
            collection.stop_rotation();
        }
        info!(db = %self.options.db_name, "database closed");
        Ok(())
    }

    pub fn stats(&self) -> DatabaseStats {
        let collections = self.collections.read();
        DatabaseStats {
            collections: collections.len(),
            records: collections.values().map(|c| c.len()).sum(),
            active_transactions: self
                .manager
                .as_ref()
                .map(|m| m.stats().active_transactions)
                .unwrap_or(0),
        }
    }
}
