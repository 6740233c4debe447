//! Key transform registry
//!
//! Index definitions persist transforms by registry name only; source text
//! is never serialized and unknown names are rejected on load.

use ahash::AHashMap;
use once_cell::sync::Lazy;

use crate::error::{DbError, Result};

/// A registered key transform applied to tokens before encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTransform {
    Identity,
    /// Case-insensitive indexes (`ignoreCase`) compile to this
    Lowercase,
}

static REGISTRY: Lazy<AHashMap<&'static str, KeyTransform>> = Lazy::new(|| {
    let mut m = AHashMap::new();
    m.insert("identity", KeyTransform::Identity);
    m.insert("lowercase", KeyTransform::Lowercase);
    m
});

impl KeyTransform {
    /// Resolve a persisted transform name. Unknown names are a validation
    /// failure, not a fallback.
    pub fn resolve(name: &str) -> Result<KeyTransform> {
        REGISTRY.get(name).copied().ok_or_else(|| {
            DbError::InvalidConfig(format!("unknown key transform '{}'", name))
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            KeyTransform::Identity => "identity",
            KeyTransform::Lowercase => "lowercase",
        }
    }

    pub fn apply(self, token: String) -> String {
        match self {
            KeyTransform::Identity => token,
            KeyTransform::Lowercase => token.to_lowercase(),
        }
    }
}
