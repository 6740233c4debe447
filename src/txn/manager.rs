//! Transaction manager
//!
//! Owns the transaction lifecycle and coordinates two-phase commit across
//! participating resources. Resources enroll by id; the manager resolves
//! them through its registry at commit time, so nothing holds a reference
//! cycle back into the manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::now_ms;
use crate::config::TransactionOptions;
use crate::error::{DbError, Result};
use crate::txn::resource::TransactionalResource;
use crate::txn::transaction::{
    ChangeKind, ChangeRecord, Savepoint, Transaction, TransactionStatus, TxId,
};
use crate::txn::wal::{
    Checkpoint, WalEntry, WalEntryData, WalEntryType, WalManager, WalOperation,
};

pub type ChangeListener = Box<dyn Fn(&TxId, &[ChangeRecord]) + Send + Sync>;

/// Listener handle returned by
/// [`add_change_listener`](TransactionManager::add_change_listener)
pub type ListenerId = u64;

#[derive(Debug, Clone)]
pub struct SavepointInfo {
    pub id: String,
    pub name: String,
    pub created: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TransactionManagerStats {
    pub active_transactions: usize,
    pub total_committed: u64,
    pub total_aborted: u64,
}

/// Transaction lifecycle + 2PC coordination
pub struct TransactionManager {
    active: DashMap<TxId, Arc<RwLock<Transaction>>>,
    resources: RwLock<AHashMap<String, Arc<dyn TransactionalResource>>>,
    listeners: RwLock<Vec<(ListenerId, ChangeListener)>>,
    listener_seq: AtomicU64,
    tx_seq: AtomicU64,
    wal: Option<Arc<WalManager>>,
    committed: AtomicU64,
    aborted: AtomicU64,
}

impl TransactionManager {
    pub fn new(wal: Option<Arc<WalManager>>) -> Self {
        Self {
            active: DashMap::new(),
            resources: RwLock::new(AHashMap::new()),
            listeners: RwLock::new(Vec::new()),
            listener_seq: AtomicU64::new(1),
            tx_seq: AtomicU64::new(1),
            wal,
            committed: AtomicU64::new(0),
            aborted: AtomicU64::new(0),
        }
    }

    pub fn wal(&self) -> Option<&Arc<WalManager>> {
        self.wal.as_ref()
    }

    /// Enroll a resource for 2PC resolution by id.
    pub fn register_resource(&self, resource: Arc<dyn TransactionalResource>) {
        self.resources
            .write()
            .insert(resource.resource_id(), resource);
    }

    pub fn unregister_resource(&self, resource_id: &str) {
        self.resources.write().remove(resource_id);
    }

    fn resolve(&self, resource_id: &str) -> Result<Arc<dyn TransactionalResource>> {
        self.resources
            .read()
            .get(resource_id)
            .cloned()
            .ok_or_else(|| {
                DbError::TransactionState(format!("unknown resource '{}'", resource_id))
            })
    }

    /// Start a transaction. Defaults: 30 s timeout, snapshot isolation.
    pub fn begin(&self, options: TransactionOptions) -> Result<TxId> {
        let seq = self.tx_seq.fetch_add(1, Ordering::SeqCst);
        let id: TxId = format!("tx_{}_{}", seq, now_ms());
        if let Some(wal) = &self.wal {
            wal.write_entry(WalEntry::begin(&id))?;
        }
        let tx = Transaction::new(id.clone(), options);
        self.active.insert(id.clone(), Arc::new(RwLock::new(tx)));
        debug!(tx = %id, "transaction started");
        Ok(id)
    }

    pub fn get(&self, tx_id: &str) -> Result<Arc<RwLock<Transaction>>> {
        self.active
            .get(tx_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| {
                DbError::TransactionState(format!("no active transaction '{}'", tx_id))
            })
    }

    pub fn is_active(&self, tx_id: &str) -> bool {
        self.active.contains_key(tx_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<TxId> {
        self.active.iter().map(|e| e.key().clone()).collect()
    }

    /// Queue a record-level change and write its DATA entry.
    pub fn record_change(
        &self,
        tx_id: &str,
        resource_id: &str,
        change: ChangeRecord,
    ) -> Result<()> {
        let tx_arc = self.get(tx_id)?;
        {
            let mut tx = tx_arc.write();
            if !tx.is_active() {
                return Err(DbError::TransactionState(format!(
                    "transaction '{}' is not active",
                    tx_id
                )));
            }
            tx.touch_resource(resource_id);
            tx.add_change(change.clone());
        }
        if let Some(wal) = &self.wal {
            let operation = match change.kind {
                ChangeKind::Insert => WalOperation::Insert,
                ChangeKind::Update => WalOperation::Update,
                ChangeKind::Delete => WalOperation::Delete,
            };
            wal.write_entry(WalEntry::draft(
                tx_id,
                WalEntryType::Data,
                &change.collection,
                operation,
                WalEntryData {
                    key: change.key,
                    old_value: change.old_value,
                    new_value: change.new_value,
                    ..Default::default()
                },
            ))?;
        }
        Ok(())
    }

    /// Write an INDEX_CHANGE DATA entry (index mutations are rebuilt from
    /// records on replay, but the intent is logged).
    pub fn record_index_change(
        &self,
        tx_id: &str,
        collection: &str,
        index_name: &str,
        key: Value,
        old_value: Option<Value>,
        new_value: Option<Value>,
    ) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.write_entry(WalEntry::draft(
                tx_id,
                WalEntryType::Data,
                collection,
                WalOperation::IndexChange,
                WalEntryData {
                    key,
                    old_value,
                    new_value,
                    index_name: Some(index_name.to_string()),
                    ..Default::default()
                },
            ))?;
        }
        Ok(())
    }

    /// Two-phase commit: prepare every affected resource, then write
    /// COMMIT and finalize. Any prepare veto aborts the whole transaction
    /// with every participant rolled back.
    pub fn commit(&self, tx_id: &str) -> Result<()> {
        let tx_arc = self.get(tx_id)?;

        let resource_ids = {
            let mut tx = tx_arc.write();
            if !tx.is_active() {
                return Err(DbError::TransactionState(format!(
                    "cannot commit transaction '{}' in state {:?}",
                    tx_id, tx.status
                )));
            }
            if tx.is_expired(now_ms()) {
                drop(tx);
                self.rollback(tx_id)?;
                return Err(DbError::Timeout(tx_id.to_string()));
            }
            tx.status = TransactionStatus::Preparing;
            tx.affected_resources.clone()
        };

        let mut resources = Vec::with_capacity(resource_ids.len());
        for rid in &resource_ids {
            match self.resolve(rid) {
                Ok(r) => resources.push(r),
                Err(e) => {
                    self.abort_internal(tx_id, &tx_arc, &resources)?;
                    return Err(e);
                }
            }
        }

        // phase one
        for resource in &resources {
            if let Some(wal) = &self.wal {
                wal.write_entry(WalEntry::prepare(tx_id, &resource.resource_id()))?;
            }
            let prepared = resource.prepare(tx_id).unwrap_or(false);
            if !prepared {
                warn!(tx = %tx_id, resource = %resource.resource_id(), "prepare vetoed, aborting");
                self.abort_internal(tx_id, &tx_arc, &resources)?;
                return Err(DbError::TransactionState(format!(
                    "transaction '{}' aborted: prepare failed on '{}'",
                    tx_id,
                    resource.resource_id()
                )));
            }
        }
        tx_arc.write().status = TransactionStatus::Prepared;

        // the commit record is durable before any base store mutates
        if let Some(wal) = &self.wal {
            wal.write_entry(WalEntry::commit(tx_id))?;
            wal.flush()?;
        }

        // phase two
        for resource in &resources {
            if let Err(e) = resource.finalize(tx_id) {
                warn!(tx = %tx_id, error = %e, "finalize failed, aborting remaining participants");
                self.abort_internal(tx_id, &tx_arc, &resources)?;
                return Err(e);
            }
        }

        let changes = {
            let mut tx = tx_arc.write();
            tx.status = TransactionStatus::Committed;
            tx.changes.clone()
        };
        self.active.remove(tx_id);
        self.committed.fetch_add(1, Ordering::Relaxed);
        info!(tx = %tx_id, changes = changes.len(), "transaction committed");

        // listeners hear about committed transactions only
        let tx_owned = tx_id.to_string();
        for (_, listener) in self.listeners.read().iter() {
            listener(&tx_owned, &changes);
        }
        Ok(())
    }

    fn abort_internal(
        &self,
        tx_id: &str,
        tx_arc: &Arc<RwLock<Transaction>>,
        resources: &[Arc<dyn TransactionalResource>],
    ) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.write_entry(WalEntry::rollback(tx_id))?;
        }
        for resource in resources {
            if let Err(e) = resource.rollback(tx_id) {
                warn!(tx = %tx_id, error = %e, "resource rollback failed");
            }
        }
        tx_arc.write().status = TransactionStatus::Aborted;
        self.active.remove(tx_id);
        self.aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Roll back a transaction. Unknown ids are a no-op.
    pub fn rollback(&self, tx_id: &str) -> Result<()> {
        let tx_arc = match self.active.get(tx_id) {
            Some(e) => e.value().clone(),
            None => return Ok(()),
        };
        let resource_ids = tx_arc.read().affected_resources.clone();
        let mut resources = Vec::new();
        for rid in &resource_ids {
            if let Ok(r) = self.resolve(rid) {
                resources.push(r);
            }
        }
        self.abort_internal(tx_id, &tx_arc, &resources)?;
        debug!(tx = %tx_id, "transaction rolled back");
        Ok(())
    }

    // ---- savepoints ----

    /// Capture each affected resource's buffered state under a named
    /// marker.
    pub fn create_savepoint(&self, tx_id: &str, name: &str) -> Result<String> {
        let tx_arc = self.get(tx_id)?;
        let mut tx = tx_arc.write();
        if !tx.is_active() {
            return Err(DbError::TransactionState(format!(
                "transaction '{}' is not active",
                tx_id
            )));
        }
        let id = tx.next_savepoint_id(name);
        let mut resources = AHashMap::new();
        for rid in &tx.affected_resources {
            let resource = self.resolve(rid)?;
            resources.insert(rid.clone(), resource.savepoint_state(tx_id)?);
        }
        let savepoint = Savepoint {
            id: id.clone(),
            name: name.to_string(),
            created: now_ms(),
            changes_len: tx.changes.len(),
            resources,
        };
        tx.push_savepoint(savepoint);
        debug!(tx = %tx_id, savepoint = %id, "savepoint created");
        Ok(id)
    }

    /// Restore buffers to the savepoint and drop it plus everything after
    /// it. The transaction stays ACTIVE.
    pub fn rollback_to_savepoint(&self, tx_id: &str, savepoint_id: &str) -> Result<()> {
        let tx_arc = self.get(tx_id)?;
        let mut tx = tx_arc.write();
        let savepoint = tx.take_savepoint(savepoint_id).ok_or_else(|| {
            DbError::TransactionState(format!("unknown savepoint '{}'", savepoint_id))
        })?;

        for (rid, snapshot) in &savepoint.resources {
            let resource = self.resolve(rid)?;
            resource.restore_savepoint_state(tx_id, snapshot)?;
        }
        // resources enrolled after the savepoint had no buffer then:
        // clear them and drop the enrollment
        for rid in tx.resources_after(&savepoint) {
            if let Ok(resource) = self.resolve(&rid) {
                resource.rollback(tx_id)?;
            }
        }
        tx.affected_resources
            .retain(|r| savepoint.resources.contains_key(r));
        tx.changes.truncate(savepoint.changes_len);
        debug!(tx = %tx_id, savepoint = %savepoint_id, "rolled back to savepoint");
        Ok(())
    }

    /// Discard a savepoint without rolling back.
    pub fn release_savepoint(&self, tx_id: &str, savepoint_id: &str) -> Result<()> {
        let tx_arc = self.get(tx_id)?;
        let mut tx = tx_arc.write();
        if !tx.release_savepoint(savepoint_id) {
            return Err(DbError::TransactionState(format!(
                "unknown savepoint '{}'",
                savepoint_id
            )));
        }
        Ok(())
    }

    pub fn list_savepoints(&self, tx_id: &str) -> Result<Vec<SavepointInfo>> {
        let tx_arc = self.get(tx_id)?;
        let tx = tx_arc.read();
        Ok(tx
            .savepoints()
            .iter()
            .map(|s| SavepointInfo {
                id: s.id.clone(),
                name: s.name.clone(),
                created: s.created,
            })
            .collect())
    }

    // ---- maintenance ----

    /// Roll back every transaction past its timeout. Returns the number
    /// swept.
    pub fn cleanup(&self) -> Result<usize> {
        let now = now_ms();
        let expired: Vec<TxId> = self
            .active
            .iter()
            .filter(|e| e.value().read().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for tx_id in &expired {
            warn!(tx = %tx_id, "transaction timed out, rolling back");
            self.rollback(tx_id)?;
        }
        Ok(expired.len())
    }

    /// Checkpoint the WAL and truncate it when no transaction is active.
    pub fn checkpoint(&self) -> Result<Option<Checkpoint>> {
        let wal = match &self.wal {
            Some(wal) => wal,
            None => return Ok(None),
        };
        let active = self.active_ids();
        let checkpoint = wal.create_checkpoint(active.clone())?;
        if active.is_empty() {
            wal.truncate(checkpoint.sequence_number)?;
        }
        Ok(Some(checkpoint))
    }

    pub fn add_change_listener(&self, listener: ChangeListener) -> ListenerId {
        let id = self.listener_seq.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_change_listener(&self, id: ListenerId) {
        self.listeners.write().retain(|(lid, _)| *lid != id);
    }

    pub fn stats(&self) -> TransactionManagerStats {
        TransactionManagerStats {
            active_transactions: self.active.len(),
            total_committed: self.committed.load(Ordering::Relaxed),
            total_aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Scriptable participant for 2PC tests
    struct TestResource {
        id: String,
        prepare_ok: bool,
        prepared: Mutex<Vec<String>>,
        finalized: Mutex<Vec<String>>,
        rolled_back: Mutex<Vec<String>>,
        buffer: Mutex<Vec<String>>,
    }

    impl TestResource {
        fn new(id: &str, prepare_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                prepare_ok,
                prepared: Mutex::new(Vec::new()),
                finalized: Mutex::new(Vec::new()),
                rolled_back: Mutex::new(Vec::new()),
                buffer: Mutex::new(Vec::new()),
            })
        }
    }

    impl TransactionalResource for TestResource {
        fn resource_id(&self) -> String {
            self.id.clone()
        }

        fn prepare(&self, tx: &str) -> Result<bool> {
            self.prepared.lock().push(tx.to_string());
            Ok(self.prepare_ok)
        }

        fn finalize(&self, tx: &str) -> Result<()> {
            self.finalized.lock().push(tx.to_string());
            Ok(())
        }

        fn rollback(&self, tx: &str) -> Result<()> {
            self.rolled_back.lock().push(tx.to_string());
            Ok(())
        }

        fn savepoint_state(&self, _tx: &str) -> Result<Value> {
            Ok(serde_json::to_value(self.buffer.lock().clone()).unwrap())
        }

        fn restore_savepoint_state(&self, _tx: &str, snapshot: &Value) -> Result<()> {
            *self.buffer.lock() = serde_json::from_value(snapshot.clone()).unwrap();
            Ok(())
        }
    }

    fn manager_with(resources: &[Arc<TestResource>]) -> TransactionManager {
        let manager = TransactionManager::new(None);
        for r in resources {
            manager.register_resource(r.clone());
        }
        manager
    }

    fn touch(manager: &TransactionManager, tx: &str, resource: &str) {
        manager
            .record_change(
                tx,
                resource,
                ChangeRecord::insert("users", serde_json::json!(1), serde_json::json!({"id": 1})),
            )
            .unwrap();
    }

    #[test]
    fn test_commit_runs_prepare_then_finalize() {
        let r1 = TestResource::new("a", true);
        let r2 = TestResource::new("b", true);
        let manager = manager_with(&[r1.clone(), r2.clone()]);

        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        touch(&manager, &tx, "b");
        manager.commit(&tx).unwrap();

        assert_eq!(r1.prepared.lock().len(), 1);
        assert_eq!(r2.prepared.lock().len(), 1);
        assert_eq!(r1.finalized.lock().len(), 1);
        assert_eq!(r2.finalized.lock().len(), 1);
        assert!(r1.rolled_back.lock().is_empty());
        assert_eq!(manager.active_count(), 0);
        assert_eq!(manager.stats().total_committed, 1);
    }

    #[test]
    fn test_prepare_veto_aborts_everyone() {
        let r1 = TestResource::new("a", true);
        let r2 = TestResource::new("b", false); // vetoes
        let manager = manager_with(&[r1.clone(), r2.clone()]);

        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        touch(&manager, &tx, "b");

        assert!(manager.commit(&tx).is_err());
        // nobody finalized, everybody rolled back
        assert!(r1.finalized.lock().is_empty());
        assert!(r2.finalized.lock().is_empty());
        assert_eq!(r1.rolled_back.lock().len(), 1);
        assert_eq!(r2.rolled_back.lock().len(), 1);
        assert_eq!(manager.stats().total_aborted, 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_rollback_unknown_tx_is_noop() {
        let manager = manager_with(&[]);
        manager.rollback("tx_never_existed").unwrap();
    }

    #[test]
    fn test_listeners_fire_only_on_commit() {
        let r1 = TestResource::new("a", true);
        let manager = manager_with(&[r1]);

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        manager.add_change_listener(Box::new(move |_tx, changes| {
            seen_clone.lock().push(changes.len());
        }));

        // rolled-back transaction: no notification
        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        manager.rollback(&tx).unwrap();
        assert!(seen.lock().is_empty());

        // committed transaction: one notification with its changes
        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        touch(&manager, &tx, "a");
        manager.commit(&tx).unwrap();
        assert_eq!(*seen.lock(), vec![2]);
    }

    #[test]
    fn test_listener_removal() {
        let manager = manager_with(&[TestResource::new("a", true)]);
        let seen: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let seen_clone = seen.clone();
        let id = manager.add_change_listener(Box::new(move |_, _| {
            *seen_clone.lock() += 1;
        }));
        manager.remove_change_listener(id);

        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        manager.commit(&tx).unwrap();
        assert_eq!(*seen.lock(), 0);
    }

    #[test]
    fn test_cleanup_sweeps_expired() {
        let r1 = TestResource::new("a", true);
        let manager = manager_with(&[r1.clone()]);

        let tx = manager
            .begin(TransactionOptions {
                timeout: 0,
                ..Default::default()
            })
            .unwrap();
        touch(&manager, &tx, "a");

        // any elapsed time exceeds a zero timeout
        std::thread::sleep(std::time::Duration::from_millis(5));
        let swept = manager.cleanup().unwrap();
        assert_eq!(swept, 1);
        assert_eq!(manager.active_count(), 0);
        assert_eq!(r1.rolled_back.lock().len(), 1);
    }

    #[test]
    fn test_savepoint_lifecycle() {
        let r1 = TestResource::new("a", true);
        let manager = manager_with(&[r1.clone()]);

        let tx = manager.begin(TransactionOptions::default()).unwrap();
        touch(&manager, &tx, "a");
        r1.buffer.lock().push("change1".to_string());

        let sp_a = manager.create_savepoint(&tx, "A").unwrap();
        r1.buffer.lock().push("change2".to_string());
        let sp_b = manager.create_savepoint(&tx, "B").unwrap();
        r1.buffer.lock().push("change3".to_string());

        // rolling back to A restores the resource buffer and drops B
        manager.rollback_to_savepoint(&tx, &sp_a).unwrap();
        assert_eq!(*r1.buffer.lock(), vec!["change1".to_string()]);
        let remaining = manager.list_savepoints(&tx).unwrap();
        assert!(remaining.is_empty());
        assert!(manager.rollback_to_savepoint(&tx, &sp_b).is_err());

        // transaction is still usable
        assert!(manager.is_active(&tx));
        manager.commit(&tx).unwrap();
    }

    #[test]
    fn test_release_savepoint() {
        let manager = manager_with(&[TestResource::new("a", true)]);
        let tx = manager.begin(TransactionOptions::default()).unwrap();
        let sp = manager.create_savepoint(&tx, "s").unwrap();
        manager.release_savepoint(&tx, &sp).unwrap();
        assert!(manager.release_savepoint(&tx, &sp).is_err());
    }

    #[test]
    fn test_commit_after_timeout_reports_timeout() {
        let r1 = TestResource::new("a", true);
        let manager = manager_with(&[r1.clone()]);
        let tx = manager
            .begin(TransactionOptions {
                timeout: 0,
                ..Default::default()
            })
            .unwrap();
        touch(&manager, &tx, "a");
        std::thread::sleep(std::time::Duration::from_millis(5));

        assert!(matches!(
            manager.commit(&tx).unwrap_err(),
            DbError::Timeout(_)
        ));
        assert!(r1.finalized.lock().is_empty());
        assert_eq!(r1.rolled_back.lock().len(), 1);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_commit_requires_active_tx() {
        let manager = manager_with(&[]);
        assert!(matches!(
            manager.commit("tx_unknown").unwrap_err(),
            DbError::TransactionState(_)
        ));
    }
}
