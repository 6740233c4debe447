//! Index field normalization and value extraction

use serde_json::Value;

use crate::config::{IndexDef, SortOrder};

/// Normalized form of one index field: dotted path plus sort order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub path: String,
    pub order: SortOrder,
}

impl FieldSpec {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Turn an index definition's shorthand into `FieldSpec`s.
///
/// Single-field definitions yield one spec carrying the definition's
/// `order`; composite definitions take each key's own order, defaulting
/// to ascending.
pub fn normalize_fields(def: &IndexDef) -> Vec<FieldSpec> {
    if let Some(keys) = &def.keys {
        return keys
            .iter()
            .map(|k| FieldSpec {
                path: k.path().to_string(),
                order: k.order(),
            })
            .collect();
    }
    if let Some(key) = &def.key {
        return vec![FieldSpec {
            path: key.clone(),
            order: def.order,
        }];
    }
    Vec::new()
}

/// Dotted-path lookup into a record. Missing segments yield `None`.
pub fn extract_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Extract the tuple of field values for an index.
///
/// `None` marks a missing path (undefined); present-but-null fields come
/// back as `Some(Value::Null)` so sparse/required semantics can tell the
/// two apart downstream.
pub fn extract_values(record: &Value, fields: &[FieldSpec]) -> Vec<Option<Value>> {
    fields
        .iter()
        .map(|f| extract_path(record, &f.path).cloned())
        .collect()
}

/// Canonical index name: `field[:desc]` joined by commas, asc implicit.
pub fn index_name(fields: &[FieldSpec]) -> String {
    fields
        .iter()
        .map(|f| {
            if f.order.is_desc() {
                format!("{}:desc", f.path)
            } else {
                f.path.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}
