//! Two-phase-commit participant contract

use serde_json::Value;

use crate::error::Result;

/// Opaque per-transaction buffer state captured for savepoints.
///
/// Resources serialize their own buffers; the transaction manager only
/// stores and hands the snapshot back.
pub type BufferSnapshot = Value;

/// A resource enrolled in two-phase commit.
///
/// Resources hold the transaction id only — never a reference back into
/// the transaction manager.
pub trait TransactionalResource: Send + Sync {
    /// Stable identifier used for enrollment and WAL attribution
    fn resource_id(&self) -> String;

    /// Revalidate buffered changes against the committed base. `false`
    /// vetoes the commit; the buffer is discarded either way the
    /// transaction ends.
    fn prepare(&self, tx: &str) -> Result<bool>;

    /// Apply the buffer to the base store. Only legal after a successful
    /// [`prepare`](TransactionalResource::prepare).
    fn finalize(&self, tx: &str) -> Result<()>;

    /// Discard the buffer. Unknown transaction ids are a no-op.
    fn rollback(&self, tx: &str) -> Result<()>;

    /// Capture the transaction's buffered state for a savepoint.
    fn savepoint_state(&self, tx: &str) -> Result<BufferSnapshot>;

    /// Restore buffered state captured by
    /// [`savepoint_state`](TransactionalResource::savepoint_state).
    fn restore_savepoint_state(&self, tx: &str, snapshot: &BufferSnapshot) -> Result<()>;
}
