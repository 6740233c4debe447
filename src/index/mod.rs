//! Index layer
//!
//! [`BPlusTree`] is the ordered multimap every index is built on;
//! [`TransactionalIndex`] decorates it with per-transaction buffers and the
//! two-phase-commit hooks the transaction manager drives.

pub mod btree;
pub mod manager;

pub use btree::{BPlusTree, Pointer, PortableEntry, DEFAULT_ORDER};
pub use manager::{IndexChange, IndexChangeKind, TransactionalIndex};
