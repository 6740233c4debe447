//! Common contract of the primary record stores

use serde_json::Value;

use crate::error::Result;
use crate::storage::audit::AuditEnvelope;

/// Keyed primary store of records.
///
/// Implementations keep records addressable by their canonical identity
/// token and expose ordered iteration: insertion order for the in-memory
/// list, identity order for the per-file store. Writes never validate —
/// the owning collection validates before calling in (validation context
/// travels with the call instead of living as a back-reference).
pub trait StorageBackend: Send + Sync {
    /// Fetch the record payload (audit envelopes are unwrapped; tombstoned
    /// records read as absent).
    fn get(&self, id: &str) -> Option<Value>;

    /// Insert or replace a record; bumps the monotonic counter for new ids.
    fn set(&mut self, id: &str, record: Value) -> Result<Value>;

    /// Replace an existing record. Errors when the id is unknown.
    fn update(&mut self, id: &str, record: Value) -> Result<Value>;

    /// Remove a record, returning its last payload. With audit enabled the
    /// envelope is tombstoned rather than dropped.
    fn delete(&mut self, id: &str) -> Result<Option<Value>>;

    /// Drop every record and reset counters.
    fn reset(&mut self) -> Result<()>;

    /// Forward cursor over `(id, payload)` in the backend's native order.
    fn forward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a>;

    /// Reverse cursor.
    fn backward<'a>(&'a self) -> Box<dyn Iterator<Item = (String, Value)> + 'a>;

    /// Number of live records
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic insertion counter (never reused, survives persist)
    fn counter(&self) -> u64;

    /// Audit envelope for a record, when audit is enabled
    fn envelope(&self, id: &str) -> Option<AuditEnvelope>;

    /// Serializable snapshot of the backend state
    fn persist_blob(&self) -> Result<Value>;

    /// Restore state from a snapshot produced by [`persist_blob`]
    ///
    /// [`persist_blob`]: StorageBackend::persist_blob
    fn load_blob(&mut self, blob: Value) -> Result<()>;
}
