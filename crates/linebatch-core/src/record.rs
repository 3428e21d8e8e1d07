//! Records, identities and per-record outcomes.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::TaskError;

/// One input line: an ordered map of field name → JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Normalised identity of a record, used for deduplication across runs.
///
/// Numbers are kept in their canonical JSON text so `1` and `1.0` stay
/// distinct instead of being guessed equivalent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    Text(String),
    Number(String),
}

/// The JSON type an identity was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    Text,
    Number,
}

impl std::fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "string"),
            Self::Number => write!(f, "number"),
        }
    }
}

impl Identity {
    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Text(_) => IdentityKind::Text,
            Self::Number(_) => IdentityKind::Number,
        }
    }

    /// The identity as it should appear in JSON output.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => serde_json::from_str::<serde_json::Number>(n)
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(n.clone())),
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) | Self::Number(s) => f.write_str(s),
        }
    }
}

/// What a record holds under the identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityField {
    Present(Identity),
    /// Key absent or `null`.
    Missing,
    /// Key holds a bool, array or object.
    Invalid(String),
}

/// Extract and normalise the identity stored under `key`.
pub fn extract_identity(record: &Record, key: &str) -> IdentityField {
    match record.get(key) {
        None | Some(Value::Null) => IdentityField::Missing,
        Some(Value::String(s)) => IdentityField::Present(Identity::Text(s.clone())),
        Some(Value::Number(n)) => IdentityField::Present(Identity::Number(n.to_string())),
        Some(other) => IdentityField::Invalid(format!(
            "field '{key}' holds a {}, expected a string or number",
            json_type(other)
        )),
    }
}

/// JSON truthiness used for the rerun flag.
///
/// `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(true, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// What a transform decided to do with a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Write this record to the output.
    Emit(Record),
    /// Nothing to write and nothing went wrong.
    Skip,
}

/// A record that could not be processed.
#[derive(Debug, Clone)]
pub struct Failure {
    pub identity: Option<Identity>,
    /// The record exactly as it was read from the input.
    pub record: Record,
    pub error: TaskError,
    /// Transform invocations made, including retries. Zero when the record
    /// was rejected before launch.
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

impl Failure {
    pub fn new(identity: Option<Identity>, record: Record, error: TaskError, attempts: u32) -> Self {
        Self {
            identity,
            record,
            error,
            attempts,
            at: Utc::now(),
        }
    }
}

/// Final result of one record.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(Record),
    Skip,
    Failure(Failure),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn extracts_string_and_number_identities() {
        let r = rec(json!({"id": "user_1"}));
        assert_eq!(
            extract_identity(&r, "id"),
            IdentityField::Present(Identity::Text("user_1".into()))
        );
        let r = rec(json!({"id": 42}));
        assert_eq!(
            extract_identity(&r, "id"),
            IdentityField::Present(Identity::Number("42".into()))
        );
    }

    #[test]
    fn null_or_absent_identity_is_missing() {
        assert_eq!(extract_identity(&rec(json!({"x": 1})), "id"), IdentityField::Missing);
        assert_eq!(extract_identity(&rec(json!({"id": null})), "id"), IdentityField::Missing);
    }

    #[test]
    fn structured_identity_is_invalid() {
        for v in [json!({"id": true}), json!({"id": [1]}), json!({"id": {"a": 1}})] {
            assert!(matches!(
                extract_identity(&rec(v), "id"),
                IdentityField::Invalid(_)
            ));
        }
    }

    #[test]
    fn string_and_number_identities_differ() {
        let a = Identity::Text("1".into());
        let b = Identity::Number("1".into());
        assert_ne!(a, b);
        assert_ne!(a.kind(), b.kind());
        assert_eq!(b.to_value(), json!(1));
        assert_eq!(a.to_value(), json!("1"));
    }

    #[test]
    fn truthiness() {
        for v in [json!(null), json!(false), json!(0), json!(0.0), json!(""), json!([]), json!({})] {
            assert!(!is_truthy(&v), "{v} should be falsy");
        }
        for v in [json!(true), json!(1), json!("yes"), json!([0]), json!({"a": 0})] {
            assert!(is_truthy(&v), "{v} should be truthy");
        }
    }
}
