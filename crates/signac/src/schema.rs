//! State point schema detection.

use crate::cursor::cmp_values;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A description of a project's state point schema.
///
/// Maps each dotted state point key to the value sets observed for it,
/// bucketed by JSON type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProjectSchema {
    schema: BTreeMap<String, BTreeMap<&'static str, Vec<Value>>>,
}

impl ProjectSchema {
    /// Detect the schema of a set of state points.
    ///
    /// With `exclude_const`, keys whose value is identical across every
    /// state point are dropped.
    pub fn detect(statepoints: &[Map<String, Value>], exclude_const: bool) -> Self {
        let mut observed: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut occurrences: BTreeMap<String, usize> = BTreeMap::new();
        for statepoint in statepoints {
            for (key, value) in flatten_statepoint(statepoint) {
                *occurrences.entry(key.clone()).or_default() += 1;
                let values = observed.entry(key).or_default();
                if !values.contains(&value) {
                    values.push(value);
                }
            }
        }

        let total = statepoints.len();
        let mut schema = BTreeMap::new();
        for (key, mut values) in observed {
            if exclude_const && values.len() == 1 && occurrences.get(&key) == Some(&total) {
                continue;
            }
            values.sort_by(cmp_values);
            let mut by_type: BTreeMap<&'static str, Vec<Value>> = BTreeMap::new();
            for value in values {
                by_type.entry(type_name(&value)).or_default().push(value);
            }
            schema.insert(key, by_type);
        }
        Self { schema }
    }

    pub fn len(&self) -> usize {
        self.schema.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schema.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.schema.keys().map(String::as_str)
    }

    /// The observed values for a key, bucketed by type name.
    pub fn get(&self, key: &str) -> Option<&BTreeMap<&'static str, Vec<Value>>> {
        self.schema.get(key)
    }

    /// Keys that are missing from `other`, or (unless `ignore_values`)
    /// present with a different value range.
    pub fn difference(&self, other: &ProjectSchema, ignore_values: bool) -> BTreeSet<String> {
        let mut diff: BTreeSet<String> = self
            .schema
            .keys()
            .filter(|key| !other.schema.contains_key(*key))
            .cloned()
            .collect();
        if !ignore_values {
            for (key, values) in &self.schema {
                if other.schema.get(key).is_some_and(|theirs| theirs != values) {
                    diff.insert(key.clone());
                }
            }
        }
        diff
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Flatten a state point into dotted keys and leaf values. Sequences are
/// leaves; nested mappings recurse.
fn flatten_statepoint(statepoint: &Map<String, Value>) -> Vec<(String, Value)> {
    fn walk(prefix: Option<&str>, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    let nested = match prefix {
                        Some(prefix) => format!("{prefix}.{key}"),
                        None => key.clone(),
                    };
                    walk(Some(&nested), child, out);
                }
            }
            Value::Object(_) => {}
            _ => {
                if let Some(prefix) = prefix {
                    out.push((prefix.to_string(), value.clone()));
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(None, &Value::Object(statepoint.clone()), &mut out);
    out
}

impl fmt::Display for ProjectSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MAX_NUM_RANGE: usize = 5;
        writeln!(f, "{{")?;
        for (key, by_type) in &self.schema {
            let ranges: Vec<String> = by_type
                .iter()
                .map(|(type_name, values)| {
                    let rendered: Vec<String> = if values.len() <= MAX_NUM_RANGE {
                        values.iter().map(render_value).collect()
                    } else {
                        let mut shown: Vec<String> = values[..MAX_NUM_RANGE - 2]
                            .iter()
                            .map(render_value)
                            .collect();
                        shown.push("...".to_string());
                        shown.extend(values[values.len() - 2..].iter().map(render_value));
                        shown
                    };
                    format!("{type_name}([{}], {})", rendered.join(", "), values.len())
                })
                .collect();
            writeln!(f, " '{key}': '{}',", ranges.join(", "))?;
        }
        write!(f, "}}")
    }
}

fn render_value(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sp(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn detects_nested_keys_and_types() {
        let statepoints = vec![
            sp(json!({"a": 0, "b": {"c": true}})),
            sp(json!({"a": 1.5, "b": {"c": false}})),
        ];
        let schema = ProjectSchema::detect(&statepoints, false);
        let a = schema.get("a").unwrap();
        assert_eq!(a.get("int").unwrap(), &vec![json!(0)]);
        assert_eq!(a.get("float").unwrap(), &vec![json!(1.5)]);
        assert!(schema.get("b.c").is_some());
        assert!(schema.get("b").is_none());
    }

    #[test]
    fn exclude_const_drops_shared_keys() {
        let statepoints = vec![
            sp(json!({"kind": "fluid", "t": 1})),
            sp(json!({"kind": "fluid", "t": 2})),
        ];
        let schema = ProjectSchema::detect(&statepoints, true);
        assert!(schema.get("kind").is_none());
        assert!(schema.get("t").is_some());

        // A key that is constant but not present everywhere is retained.
        let statepoints = vec![
            sp(json!({"kind": "fluid", "t": 1})),
            sp(json!({"t": 2})),
        ];
        let schema = ProjectSchema::detect(&statepoints, true);
        assert!(schema.get("kind").is_some());
    }

    #[test]
    fn difference_reports_missing_and_differing_keys() {
        let left = ProjectSchema::detect(&[sp(json!({"a": 1, "b": 2}))], false);
        let right = ProjectSchema::detect(&[sp(json!({"a": 1, "b": 3}))], false);
        assert_eq!(
            left.difference(&right, false),
            BTreeSet::from(["b".to_string()])
        );
        assert!(left.difference(&right, true).is_empty());

        let partial = ProjectSchema::detect(&[sp(json!({"a": 1}))], false);
        assert_eq!(
            left.difference(&partial, true),
            BTreeSet::from(["b".to_string()])
        );
    }

    #[test]
    fn display_renders_value_ranges() {
        let statepoints: Vec<_> = (0..10).map(|i| sp(json!({"foo": i}))).collect();
        let schema = ProjectSchema::detect(&statepoints, false);
        let rendered = schema.to_string();
        assert!(rendered.contains("'foo'"));
        assert!(rendered.contains("int(["));
        assert!(rendered.contains("...,"));
        assert!(rendered.contains("], 10)"));
    }
}
