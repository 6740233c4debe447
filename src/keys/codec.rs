//! Tuple serialization
//!
//! A key tuple is encoded as its string-coerced tokens joined by the
//! separator. Null and undefined both encode as the empty token and decode
//! back to null; `create_partial_key` is the one place the two differ.

use serde_json::Value;

/// Default composite-key separator
pub const DEFAULT_SEPARATOR: char = '\u{0000}';

/// Encoded form of a single-field null key.
///
/// A lone null cannot encode as the empty string: that would collapse it
/// into the empty tuple, and a comparator could no longer tell a null
/// key in a one-field index from an empty partial-key prefix (which
/// breaks the null-sorts-high rule on descending indexes). A single
/// escape char is free for the purpose — escaped characters always come
/// in pairs, so no legitimate encoding ever ends on a dangling escape.
pub const NULL_KEY: &str = "\\";

/// Whether an encoded key is a null key (empty token or the lone-null
/// sentinel). Unique indexes ignore these.
pub fn is_null_key(key: &str) -> bool {
    key.is_empty() || key == NULL_KEY
}

/// String-coerce one JSON value into its key token.
///
/// Numbers keep their decimal form, booleans become `true`/`false`,
/// null has no token. Arrays and objects fall back to their JSON text.
pub fn key_token(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn push_escaped(out: &mut String, token: &str, separator: char) {
    for c in token.chars() {
        if c == separator || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
}

fn encode_tokens(values: &[Option<Value>], separator: char) -> String {
    let mut out = String::new();
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push(separator);
        }
        let token = value.as_ref().and_then(key_token);
        if let Some(token) = token {
            push_escaped(&mut out, &token, separator);
        }
    }
    out
}

/// Join string-coerced values with `separator`.
///
/// `None` (undefined) and `Some(Null)` both produce an empty token.
/// An empty tuple produces an empty string; a one-element tuple whose
/// only token is empty produces [`NULL_KEY`] so it keeps its arity.
pub fn serialize(values: &[Option<Value>], separator: char) -> String {
    let out = encode_tokens(values, separator);
    if values.len() == 1 && out.is_empty() {
        return NULL_KEY.to_string();
    }
    out
}

/// Inverse of [`serialize`]: split on unescaped separators and unescape.
///
/// Empty tokens decode to `None` (null); undefined is folded into null on
/// the round trip. The empty string decodes to the empty tuple and the
/// lone-null sentinel to a one-element null tuple.
pub fn deserialize(encoded: &str, separator: char) -> Vec<Option<String>> {
    if encoded.is_empty() {
        return Vec::new();
    }
    if encoded == NULL_KEY {
        return vec![None];
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = encoded.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            // escaped char, take the next one verbatim
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == separator {
            tokens.push(finish_token(std::mem::take(&mut current)));
        } else {
            current.push(c);
        }
    }
    tokens.push(finish_token(current));
    tokens
}

fn finish_token(token: String) -> Option<String> {
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Encode a prefix of `values` for range scans.
///
/// Stops at the first `None` (undefined); explicit nulls are retained as
/// empty tokens so a null field can still anchor a prefix. Prefixes never
/// use the [`NULL_KEY`] sentinel — a one-null prefix must stay a string
/// prefix of its extensions.
pub fn create_partial_key(values: &[Option<Value>], separator: char) -> String {
    let prefix_len = values.iter().position(Option::is_none).unwrap_or(values.len());
    encode_tokens(&values[..prefix_len], separator)
}
