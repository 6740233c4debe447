//! Database: collection registry, schema manifest, sessions
//!
//! The database exclusively owns its collections, persists a schema
//! manifest after every schema change, and exposes the session-scoped
//! transaction API over the transaction manager.

pub mod core;
pub mod crud;
pub mod session;

pub use self::core::{Database, DatabaseStats};
pub use session::SessionId;
