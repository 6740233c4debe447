//! Collection engine
//!
//! End-to-end lifecycle of records and their indexes: CRUD with index
//! fan-out, identity generation, wildcard indexes, TTL sweeps, scheduled
//! rotation and audit envelopes.

pub mod core;
pub mod crud;
pub mod identity;
pub mod rotation;
pub mod transactional;
pub mod ttl;

pub use self::core::{Collection, IndexInfo, Validator};
pub use identity::{register_generator, resolve_generator, IdGenerator};
pub use ttl::TTL_FIELD;
