//! Job identifiers and canonical state point hashing.
//!
//! A job id is the MD5 checksum of the canonical JSON encoding of the job's
//! state point: object keys sorted recursively, compact separators, and
//! ECMA-style number formatting. Two state points that are deep-equal always
//! encode to the same byte string and therefore hash to the same id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Length of a job id in hexadecimal characters.
pub const JOB_ID_LENGTH: usize = 32;

/// Error returned when parsing a job id fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job id '{value}': expected {JOB_ID_LENGTH} lowercase hex characters")]
pub struct JobIdParseError {
    value: String,
}

/// A validated job identifier: 32 lowercase hexadecimal characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Parse and validate a job id.
    pub fn parse(value: &str) -> Result<Self, JobIdParseError> {
        if Self::is_valid(value) {
            Ok(Self(value.to_string()))
        } else {
            Err(JobIdParseError {
                value: value.to_string(),
            })
        }
    }

    /// Check whether a string is a well-formed job id.
    pub fn is_valid(value: &str) -> bool {
        value.len() == JOB_ID_LENGTH
            && value
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = JobIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Calculate the job id for a state point.
///
/// The state point is encoded with [`canonical_json`] and the MD5 digest of
/// the encoded bytes is rendered as lowercase hex.
pub fn calc_id(statepoint: &Map<String, Value>) -> JobId {
    let blob = canonical_json(&Value::Object(statepoint.clone()));
    JobId(format!("{:x}", md5::compute(blob.as_bytes())))
}

/// Compute the MD5 hex digest of an arbitrary byte blob.
///
/// Shared with the write-back buffer, which uses the same digest for its
/// content integrity checks.
pub fn content_hash(blob: &[u8]) -> String {
    format!("{:x}", md5::compute(blob))
}

/// Encode a JSON value canonically: object keys sorted recursively and
/// compact separators.
///
/// Number formatting matches standard ECMA JSON output. Non-finite floats
/// cannot occur in a `serde_json::Value`; [`fmt_f64`] covers them for
/// callers that format raw floats.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::with_capacity(64);
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(key, out);
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

fn write_escaped(s: &str, out: &mut String) {
    // serde_json's string escaping is the reference behavior.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

/// Format a raw float the way the canonical encoder would.
///
/// Finite values use the shortest round-trip representation; non-finite
/// values are emitted as the `NaN` / `Infinity` / `-Infinity` literals.
pub fn fmt_f64(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        serde_json::Number::from_f64(value)
            .expect("finite float")
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sp(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("state points are objects"),
        }
    }

    #[test]
    fn job_id_round_trip() {
        let id = JobId::parse("0123456789abcdef0123456789abcdef").unwrap();
        assert_eq!(id.as_str(), "0123456789abcdef0123456789abcdef");
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
    }

    #[test]
    fn job_id_rejects_malformed_input() {
        assert!(JobId::parse("").is_err());
        assert!(JobId::parse("0123456789abcdef").is_err());
        assert!(JobId::parse("0123456789ABCDEF0123456789ABCDEF").is_err());
        assert!(JobId::parse("0123456789abcdef0123456789abcdeg").is_err());
    }

    #[test]
    fn canonical_encoding_sorts_keys_and_is_compact() {
        let value = json!({"b": 2, "a": 1});
        assert_eq!(canonical_json(&value), r#"{"a":1,"b":2}"#);

        let nested = json!({"z": {"y": [1, 2, {"x": null}]}, "a": true});
        assert_eq!(
            canonical_json(&nested),
            r#"{"a":true,"z":{"y":[1,2,{"x":null}]}}"#
        );
    }

    #[test]
    fn calc_id_matches_reference_vector() {
        // md5 of the canonical encoding {"a":1,"b":2}.
        let id = calc_id(&sp(json!({"a": 1, "b": 2})));
        assert_eq!(id.as_str(), "608de49a4600dbb5b173492759792e4a");
        let reordered = calc_id(&sp(json!({"b": 2, "a": 1})));
        assert_eq!(id, reordered);
    }

    #[test]
    fn calc_id_distinguishes_values_and_types() {
        let a = calc_id(&sp(json!({"a": 1})));
        let b = calc_id(&sp(json!({"a": 2})));
        let c = calc_id(&sp(json!({"a": "1"})));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn float_formatting_is_shortest_round_trip() {
        assert_eq!(canonical_json(&json!({"x": 1.0})), r#"{"x":1.0}"#);
        assert_eq!(canonical_json(&json!({"x": 0.1})), r#"{"x":0.1}"#);
        assert_eq!(fmt_f64(2.5), "2.5");
    }

    #[test]
    fn non_finite_floats_use_literals() {
        assert_eq!(fmt_f64(f64::NAN), "NaN");
        assert_eq!(fmt_f64(f64::INFINITY), "Infinity");
        assert_eq!(fmt_f64(f64::NEG_INFINITY), "-Infinity");
    }
}
