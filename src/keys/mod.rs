//! Composite-key layer
//!
//! Deterministic encoding of field tuples into a single comparable string,
//! plus the order-aware comparator the index layer is built on. Values are
//! string-coerced tokens joined by a separator (NUL by default); separator
//! and backslash occurrences inside a token are escaped with `\`.

pub mod codec;
pub mod compare;
pub mod fields;
pub mod process;

pub use codec::{
    create_partial_key, deserialize, is_null_key, key_token, serialize, DEFAULT_SEPARATOR,
    NULL_KEY,
};
pub use compare::{compare_tokens, create_comparator, KeyComparator};
pub use fields::{extract_path, extract_values, index_name, normalize_fields, FieldSpec};
pub use process::KeyTransform;
