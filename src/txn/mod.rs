//! Transaction layer
//!
//! Per-transaction change buffering, a checksummed write-ahead log and the
//! two-phase-commit coordinator that drives participating resources.

pub mod manager;
pub mod resource;
pub mod transaction;
pub mod wal;

pub use manager::{
    ChangeListener, ListenerId, SavepointInfo, TransactionManager, TransactionManagerStats,
};
pub use resource::{BufferSnapshot, TransactionalResource};
pub use transaction::{
    ChangeKind, ChangeRecord, Transaction, TransactionStatus, TxId,
};
pub use wal::{
    Checkpoint, RecoveryOutcome, RecoveryReport, WalEntry, WalEntryData, WalEntryType, WalManager,
    WalOperation, WalStats,
};
