//! Filter argument parsing and namespace routing.
//!
//! Filters arrive in three forms: a JSON object, a sequence of key/value
//! pairs, or a whitespace-separated token string. In the token form a
//! value of `!` (or a key with no value) means `$exists: true`, a `{…}`
//! literal is a JSON sub-filter, a `/…/` literal is a `$regex` pattern,
//! and bare words are cast to booleans, null, numbers, or strings.

use crate::{QueryError, Result};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

fn is_json_like(token: &str) -> bool {
    (token.starts_with('{') && token.ends_with('}'))
        || (token.starts_with('[') && token.ends_with(']'))
}

fn is_regex(token: &str) -> bool {
    token.len() >= 2 && token.starts_with('/') && token.ends_with('/')
}

fn parse_json(token: &str) -> Result<Value> {
    serde_json::from_str(token).map_err(|source| QueryError::Json {
        token: token.to_string(),
        source,
    })
}

/// Interpret a bare token as a boolean, null, integer, float, or string.
fn cast(token: &str) -> Value {
    match token {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        "null" => Value::Null,
        _ => {
            if let Ok(i) = token.parse::<i64>() {
                json!(i)
            } else if let Ok(f) = token.parse::<f64>() {
                json!(f)
            } else {
                Value::String(token.to_string())
            }
        }
    }
}

fn parse_single(key: &str, value: Option<&str>) -> Result<(String, Value)> {
    if is_json_like(key) {
        return Err(QueryError::InvalidFilter(format!(
            "using a JSON expression as a key is not allowed: '{key}'"
        )));
    }
    let value = match value {
        None | Some("!") => json!({"$exists": true}),
        Some(token) if is_json_like(token) => parse_json(token)?,
        Some(token) if is_regex(token) => json!({"$regex": token[1..token.len() - 1]}),
        Some(token) => cast(token),
    };
    Ok((key.to_string(), value))
}

/// Parse a whitespace-separated token string into a filter.
///
/// A single token that is itself a JSON object is parsed directly.
pub fn parse_str(input: &str) -> Result<Map<String, Value>> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.len() == 1 && is_json_like(tokens[0]) {
        return match parse_json(tokens[0])? {
            Value::Object(map) => Ok(map),
            other => Err(QueryError::InvalidFilter(other.to_string())),
        };
    }
    let mut filter = Map::new();
    let mut i = 0;
    while i < tokens.len() {
        let key = tokens[i];
        let value = tokens.get(i + 1).copied();
        let (key, value) = parse_single(key, value)?;
        filter.insert(key, value);
        i += 2;
    }
    Ok(filter)
}

/// Build a filter from key/value pairs.
pub fn parse_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Map<String, Value> {
    pairs.into_iter().collect()
}

/// Route unprefixed filter keys into the `sp.` namespace.
///
/// Logical operators are not prefixed, but their operands are. Keys
/// already rooted at `sp` or `doc` pass through unchanged.
pub fn add_prefix(filter: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                let items = value
                    .as_array()
                    .ok_or_else(|| QueryError::InvalidOperatorArgument {
                        op: if key == "$and" { "$and" } else { "$or" },
                        reason: "the argument must be a list".to_string(),
                    })?;
                let prefixed = items
                    .iter()
                    .map(|item| {
                        let map = item.as_object().ok_or_else(|| {
                            QueryError::InvalidFilter(format!("expected a filter object, got {item}"))
                        })?;
                        Ok(Value::Object(add_prefix(map)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                out.insert(key.clone(), Value::Array(prefixed));
            }
            "$not" => {
                let map = value.as_object().ok_or_else(|| {
                    QueryError::InvalidFilter(format!("expected a filter object, got {value}"))
                })?;
                out.insert(key.clone(), Value::Object(add_prefix(map)?));
            }
            "sp" | "doc" => {
                out.insert(key.clone(), value.clone());
            }
            _ if key.split('.').next() == Some("sp") || key.split('.').next() == Some("doc") => {
                out.insert(key.clone(), value.clone());
            }
            "_id" => {
                out.insert(key.clone(), value.clone());
            }
            _ => {
                // Unprefixed keys default to state point searches.
                out.insert(format!("sp.{key}"), value.clone());
            }
        }
    }
    Ok(out)
}

/// The root namespaces a filter touches (`sp`, `doc`, `_id`, …).
pub fn root_keys(filter: &Map<String, Value>) -> HashSet<String> {
    let mut roots = HashSet::new();
    for (key, value) in filter {
        match key.as_str() {
            "$and" | "$or" => {
                if let Some(items) = value.as_array() {
                    for item in items {
                        if let Some(map) = item.as_object() {
                            roots.extend(root_keys(map));
                        }
                    }
                }
            }
            "$not" => {
                if let Some(map) = value.as_object() {
                    roots.extend(root_keys(map));
                }
            }
            _ => {
                let root = key.split('.').next().unwrap_or(key);
                roots.insert(root.to_string());
            }
        }
    }
    roots
}
