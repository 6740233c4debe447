//! Order-aware key comparison
//!
//! Comparators operate on encoded key strings: both sides are decoded back
//! to token tuples and compared field by field. Tokens that parse as
//! numbers compare numerically (dates travel as millisecond integers and
//! land here too); everything else compares as strings. Null sorts low
//! ascending and high descending.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::SortOrder;
use crate::keys::codec::deserialize;
use crate::keys::fields::FieldSpec;

/// Comparator over encoded key strings, injected into the B+Tree
pub type KeyComparator = Arc<dyn Fn(&str, &str) -> Ordering + Send + Sync>;

/// Compare two decoded tokens under one field's sort order.
pub fn compare_tokens(a: Option<&str>, b: Option<&str>, order: SortOrder) -> Ordering {
    let base = match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => compare_typed(a, b),
    };
    if order.is_desc() {
        base.reverse()
    } else {
        base
    }
}

fn compare_typed(a: &str, b: &str) -> Ordering {
    if let (Ok(na), Ok(nb)) = (a.parse::<f64>(), b.parse::<f64>()) {
        return na.partial_cmp(&nb).unwrap_or(Ordering::Equal);
    }
    a.cmp(b)
}

/// Build a comparator honoring each field's sort order.
///
/// Equal prefixes fall through to the next field; when one tuple is a
/// prefix of the other, the shorter tuple sorts first.
pub fn create_comparator(fields: &[FieldSpec], separator: char) -> KeyComparator {
    let orders: Vec<SortOrder> = fields.iter().map(|f| f.order).collect();
    Arc::new(move |a: &str, b: &str| {
        let ta = deserialize(a, separator);
        let tb = deserialize(b, separator);
        let len = ta.len().max(tb.len());
        for i in 0..len {
            let (va, vb) = (ta.get(i), tb.get(i));
            match (va, vb) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(va), Some(vb)) => {
                    let order = orders.get(i).copied().unwrap_or_default();
                    let cmp = compare_tokens(va.as_deref(), vb.as_deref(), order);
                    if cmp != Ordering::Equal {
                        return cmp;
                    }
                }
            }
        }
        Ordering::Equal
    })
}

/// Comparator for single-field ascending indexes and identity trees
pub fn default_comparator(separator: char) -> KeyComparator {
    create_comparator(&[FieldSpec::asc("")], separator)
}
