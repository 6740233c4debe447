//! Transaction record and change bookkeeping

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::now_ms;
use crate::config::TransactionOptions;
use crate::txn::resource::BufferSnapshot;

pub type TxId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "PREPARING")]
    Preparing,
    #[serde(rename = "PREPARED")]
    Prepared,
    #[serde(rename = "COMMITTED")]
    Committed,
    #[serde(rename = "ABORTED")]
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One record-level change queued in a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub collection: String,
    pub key: Value,
    #[serde(rename = "oldValue", default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(rename = "newValue", default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub timestamp: i64,
}

impl ChangeRecord {
    pub fn insert(collection: &str, key: Value, new_value: Value) -> Self {
        Self {
            kind: ChangeKind::Insert,
            collection: collection.to_string(),
            key,
            old_value: None,
            new_value: Some(new_value),
            timestamp: now_ms(),
        }
    }

    pub fn update(collection: &str, key: Value, old_value: Value, new_value: Value) -> Self {
        Self {
            kind: ChangeKind::Update,
            collection: collection.to_string(),
            key,
            old_value: Some(old_value),
            new_value: Some(new_value),
            timestamp: now_ms(),
        }
    }

    pub fn delete(collection: &str, key: Value, old_value: Value) -> Self {
        Self {
            kind: ChangeKind::Delete,
            collection: collection.to_string(),
            key,
            old_value: Some(old_value),
            new_value: None,
            timestamp: now_ms(),
        }
    }
}

/// Named marker inside a transaction enabling partial rollback
#[derive(Debug, Clone)]
pub struct Savepoint {
    pub id: String,
    pub name: String,
    pub created: i64,
    /// Queued change count at creation time
    pub changes_len: usize,
    /// Per-resource buffer snapshots, keyed by resource id
    pub resources: AHashMap<String, BufferSnapshot>,
}

/// A transaction tracked by the manager
#[derive(Debug)]
pub struct Transaction {
    pub id: TxId,
    pub start_time: i64,
    pub options: TransactionOptions,
    pub status: TransactionStatus,
    pub changes: Vec<ChangeRecord>,
    /// Resource ids enrolled so far, in enrollment order
    pub affected_resources: Vec<String>,
    savepoints: Vec<Savepoint>,
    savepoint_seq: u64,
}

impl Transaction {
    pub fn new(id: TxId, options: TransactionOptions) -> Self {
        Self {
            id,
            start_time: now_ms(),
            options,
            status: TransactionStatus::Active,
            changes: Vec::new(),
            affected_resources: Vec::new(),
            savepoints: Vec::new(),
            savepoint_seq: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.start_time > self.options.timeout as i64
    }

    pub fn touch_resource(&mut self, resource_id: &str) {
        if !self.affected_resources.iter().any(|r| r == resource_id) {
            self.affected_resources.push(resource_id.to_string());
        }
    }

    pub fn add_change(&mut self, change: ChangeRecord) {
        self.changes.push(change);
    }

    pub fn next_savepoint_id(&mut self, name: &str) -> String {
        self.savepoint_seq += 1;
        format!("sp_{}_{}", self.savepoint_seq, name)
    }

    pub fn push_savepoint(&mut self, savepoint: Savepoint) {
        self.savepoints.push(savepoint);
    }

    pub fn savepoints(&self) -> &[Savepoint] {
        &self.savepoints
    }

    /// Drop `id` and every savepoint created after it, returning the
    /// dropped marker itself for restoration.
    pub fn take_savepoint(&mut self, id: &str) -> Option<Savepoint> {
        let pos = self.savepoints.iter().position(|s| s.id == id)?;
        let mut tail = self.savepoints.split_off(pos);
        Some(tail.remove(0))
    }

    /// Remove a single savepoint without rolling back.
    pub fn release_savepoint(&mut self, id: &str) -> bool {
        let before = self.savepoints.len();
        self.savepoints.retain(|s| s.id != id);
        self.savepoints.len() != before
    }

    /// Resource ids the savepoint did not capture (enrolled afterwards)
    pub fn resources_after(&self, savepoint: &Savepoint) -> Vec<String> {
        self.affected_resources
            .iter()
            .filter(|r| !savepoint.resources.contains_key(*r))
            .cloned()
            .collect()
    }
}
