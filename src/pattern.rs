//! Structural subset matching of delivered frames against expected patterns.

use serde_json::Value;

/// Returns true when every key of `pattern` is present in `candidate` with a
/// matching value.
///
/// Objects are compared on the pattern's keys only, recursively. Arrays must
/// have the same length and match element by element, in order. Numbers are
/// compared numerically so `1` matches `1.0`.
pub fn matches(candidate: &Value, pattern: &Value) -> bool {
    match (candidate, pattern) {
        (Value::Object(candidate), Value::Object(pattern)) => pattern
            .iter()
            .all(|(key, expected)| match candidate.get(key) {
                Some(actual) => matches(actual, expected),
                None => false,
            }),
        (Value::Array(candidate), Value::Array(pattern)) => {
            candidate.len() == pattern.len()
                && candidate
                    .iter()
                    .zip(pattern.iter())
                    .all(|(actual, expected)| matches(actual, expected))
        }
        (Value::Number(actual), Value::Number(expected)) => {
            match (actual.as_i64(), expected.as_i64()) {
                (Some(a), Some(b)) => a == b,
                _ => match (actual.as_u64(), expected.as_u64()) {
                    (Some(a), Some(b)) => a == b,
                    _ => actual.as_f64() == expected.as_f64(),
                },
            }
        }
        (actual, expected) => actual == expected,
    }
}

/// True when the pattern itself expects an error frame.
pub fn expects_error(pattern: &Value) -> bool {
    match pattern.as_object() {
        Some(map) => map.contains_key("code") || map.contains_key("error"),
        None => false,
    }
}
