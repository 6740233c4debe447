//! Error types for the nestdb storage engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Validation failed for collection '{collection}': {reason}")]
    Validation { collection: String, reason: String },

    #[error("Unique constraint violated on index '{index}' for key '{key}'")]
    UniqueConstraint { index: String, key: String },

    #[error("Required field '{field}' is null for index '{index}'")]
    RequiredField { index: String, field: String },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Transaction state error: {0}")]
    TransactionState(String),

    #[error("Resource '{resource}' finalized before prepare in transaction '{transaction}'")]
    NotPrepared { resource: String, transaction: String },

    #[error("WAL corruption at sequence {sequence}: {reason}")]
    WalCorruption { sequence: u64, reason: String },

    #[error("Transaction '{0}' exceeded its timeout")]
    Timeout(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

impl DbError {
    /// Validation error naming the collection it was raised for.
    pub fn validation(collection: impl Into<String>, reason: impl Into<String>) -> Self {
        DbError::Validation {
            collection: collection.into(),
            reason: reason.into(),
        }
    }

    pub fn unique(index: impl Into<String>, key: impl Into<String>) -> Self {
        DbError::UniqueConstraint {
            index: index.into(),
            key: key.into(),
        }
    }

    pub fn required(index: impl Into<String>, field: impl Into<String>) -> Self {
        DbError::RequiredField {
            index: index.into(),
            field: field.into(),
        }
    }
}
