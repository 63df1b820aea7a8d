//! The searchable document index.

use crate::{QueryError, Result};
use regex::Regex;
use serde_json::{Map, Number, Value};
use signac_ids::canonical_json;
use std::collections::{HashMap, HashSet};
use tracing::debug;

const PRIMARY_KEY: &str = "_id";

const INDEX_OPERATORS: &[&str] = &[
    "$eq", "$gt", "$gte", "$lt", "$lte", "$ne", "$in", "$nin", "$regex", "$type", "$where",
    "$near",
];

/// A predicate registered for use with the `$where` operator.
pub type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Typed index key.
///
/// Integers and floats occupy distinct variants so numerically equal values
/// of different types never collide in the index; equality lookups for
/// integer-valued numbers probe both variants instead.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    // Sequence leaves are keyed by their canonical JSON encoding.
    Seq(String),
    // Mapping leaves are collapsed into a single placeholder.
    Map,
}

impl IndexKey {
    fn from_leaf(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => Self::from_number(n),
            Value::String(s) => IndexKey::Str(s.clone()),
            Value::Array(_) => IndexKey::Seq(canonical_json(value)),
            Value::Object(_) => IndexKey::Map,
        }
    }

    fn from_number(n: &Number) -> Self {
        if let Some(i) = n.as_i64() {
            IndexKey::Int(i)
        } else if let Some(f) = n.as_f64() {
            IndexKey::Float(normalize_float(f).to_bits())
        } else {
            // Out-of-range u64; keep its f64 image.
            IndexKey::Float((n.as_u64().unwrap_or(u64::MAX) as f64).to_bits())
        }
    }

    /// Reconstruct the JSON value this key was derived from. The mapping
    /// placeholder has no value; operators never match it.
    fn to_value(&self) -> Option<Value> {
        match self {
            IndexKey::Null => Some(Value::Null),
            IndexKey::Bool(b) => Some(Value::Bool(*b)),
            IndexKey::Int(i) => Some(Value::Number((*i).into())),
            IndexKey::Float(bits) => Number::from_f64(f64::from_bits(*bits)).map(Value::Number),
            IndexKey::Str(s) => Some(Value::String(s.clone())),
            IndexKey::Seq(encoded) => serde_json::from_str(encoded).ok(),
            IndexKey::Map => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            IndexKey::Int(i) => Some(*i as f64),
            IndexKey::Float(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }
}

fn normalize_float(f: f64) -> f64 {
    // Collapse -0.0 onto 0.0 so both hash identically.
    if f == 0.0 {
        0.0
    } else {
        f
    }
}

type KeyIndex = HashMap<IndexKey, HashSet<String>>;

/// A searchable index of documents.
///
/// Maps ids to JSON objects. [`SearchIndex::find`] evaluates a filter and
/// returns the set of matching ids; per-key inverted indexes are built on
/// the fly for each key the filter touches.
#[derive(Default)]
pub struct SearchIndex {
    docs: HashMap<String, Value>,
    predicates: HashMap<String, Predicate>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document.
    pub fn insert(&mut self, id: impl Into<String>, doc: Value) {
        self.docs.insert(id.into(), doc);
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.docs.get(id)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// All document ids.
    pub fn ids(&self) -> HashSet<String> {
        self.docs.keys().cloned().collect()
    }

    /// Register a named predicate for the `$where` operator.
    ///
    /// `$where` never evaluates code from the filter itself; a filter may
    /// only name predicates registered here.
    pub fn register_predicate(
        &mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) {
        self.predicates.insert(name.into(), Box::new(predicate));
    }

    /// Find the ids of all documents matching the filter.
    ///
    /// An empty filter matches every document.
    pub fn find(&self, filter: &Value) -> Result<HashSet<String>> {
        if filter.is_null() {
            return Ok(self.ids());
        }
        let expr = filter
            .as_object()
            .ok_or_else(|| QueryError::InvalidFilter(filter.to_string()))?;
        self.find_result(expr)
    }

    fn find_result(&self, expr: &Map<String, Value>) -> Result<HashSet<String>> {
        if expr.is_empty() {
            return Ok(self.ids());
        }

        let mut result: Option<HashSet<String>> = None;

        // A primary-key constraint reduces the result immediately.
        if let Some(id_value) = expr.get(PRIMARY_KEY) {
            let id = id_value
                .as_str()
                .ok_or_else(|| QueryError::InvalidFilter(format!("_id must be a string: {id_value}")))?;
            let mut matched = HashSet::new();
            if self.docs.contains_key(id) {
                matched.insert(id.to_string());
            }
            reduce_results(&mut result, matched);
        }

        // Non-logical expressions reduce by intersection, failing fast on
        // an empty intermediate result.
        let mut plain = Map::new();
        for (key, value) in expr {
            if matches!(key.as_str(), PRIMARY_KEY | "$or" | "$and" | "$not") {
                continue;
            }
            plain.insert(key.clone(), value.clone());
        }
        for (key, value) in flatten_dotted(&plain) {
            reduce_results(&mut result, self.find_expression(&key, &value)?);
            if matches!(&result, Some(set) if set.is_empty()) {
                return Ok(HashSet::new());
            }
        }

        if let Some(sub) = expr.get("$not") {
            let sub = sub
                .as_object()
                .ok_or_else(|| QueryError::InvalidOperatorArgument {
                    op: "$not",
                    reason: "expected a filter object".to_string(),
                })?;
            let matched = self.find_result(sub)?;
            reduce_results(
                &mut result,
                self.ids().difference(&matched).cloned().collect(),
            );
            if matches!(&result, Some(set) if set.is_empty()) {
                return Ok(HashSet::new());
            }
        }

        if let Some(subs) = expr.get("$and") {
            for sub in logical_operands("$and", subs)? {
                reduce_results(&mut result, self.find_result(sub)?);
                if matches!(&result, Some(set) if set.is_empty()) {
                    return Ok(HashSet::new());
                }
            }
        }

        if let Some(subs) = expr.get("$or") {
            let mut union = HashSet::new();
            for sub in logical_operands("$or", subs)? {
                union.extend(self.find_result(sub)?);
            }
            reduce_results(&mut result, union);
        }

        Ok(result.unwrap_or_default())
    }

    fn find_expression(&self, key: &str, value: &Value) -> Result<HashSet<String>> {
        debug!(key, %value, "matching filter expression");
        if key.contains('$') {
            if key.matches('$').count() > 1 {
                return Err(QueryError::InvalidOperatorExpression(key.to_string()));
            }
            let (base, op) = match key.rsplit_once('.') {
                Some((base, op)) => (base.to_string(), op.to_string()),
                None => (String::new(), key.to_string()),
            };
            if !op.starts_with('$') {
                return Err(QueryError::InvalidOperatorPlacement(key.to_string()));
            }
            if op == "$exists" {
                let wanted = value.as_bool().ok_or_else(|| QueryError::InvalidOperatorArgument {
                    op: "$exists",
                    reason: "the value must be boolean".to_string(),
                })?;
                let index = self.build_index(&base)?;
                let present: HashSet<String> =
                    index.values().flatten().cloned().collect();
                return Ok(if wanted {
                    present
                } else {
                    self.ids().difference(&present).cloned().collect()
                });
            }
            if !INDEX_OPERATORS.contains(&op.as_str()) {
                return Err(QueryError::UnknownOperator(op));
            }
            let index = self.build_index(&base)?;
            self.apply_operator(&index, &op, value)
        } else {
            let index = self.build_index(key)?;
            Ok(lookup_eq(&index, value)?)
        }
    }

    /// Build the inverted index for one dotted key.
    ///
    /// Performance-critical: one linear pass over the documents.
    pub(crate) fn build_index(&self, key: &str) -> Result<KeyIndex> {
        debug!(key, "building index");
        let nodes: Vec<&str> = key.split('.').collect();
        let mut index: KeyIndex = HashMap::new();

        for (id, doc) in &self.docs {
            let mut value = Some(doc);
            for node in &nodes {
                value = value.and_then(|v| v.as_object()).and_then(|map| map.get(*node));
            }
            if let Some(leaf) = value {
                index
                    .entry(IndexKey::from_leaf(leaf))
                    .or_default()
                    .insert(id.clone());
            }

            // A literal dotted key in the document is ambiguous with the
            // nested path and therefore rejected.
            if nodes.len() > 1 {
                if let Some(map) = doc.as_object() {
                    if map.contains_key(key) {
                        return Err(QueryError::InvalidKey(key.to_string()));
                    }
                }
            }
        }
        Ok(index)
    }

    fn apply_operator(&self, index: &KeyIndex, op: &str, argument: &Value) -> Result<HashSet<String>> {
        let mut matches = HashSet::new();
        match op {
            "$eq" => return lookup_eq(index, argument),
            "$ne" => {
                for (key, ids) in index {
                    if !eq_key(key, argument) {
                        matches.extend(ids.iter().cloned());
                    }
                }
            }
            "$lt" | "$lte" | "$gt" | "$gte" => {
                for (key, ids) in index {
                    if compare_matches(key, op, argument) {
                        matches.extend(ids.iter().cloned());
                    }
                }
            }
            "$in" | "$nin" => {
                let candidates =
                    argument
                        .as_array()
                        .ok_or_else(|| QueryError::InvalidOperatorArgument {
                            op: if op == "$in" { "$in" } else { "$nin" },
                            reason: "expected an array of values".to_string(),
                        })?;
                for (key, ids) in index {
                    let member = candidates.iter().any(|c| eq_key(key, c));
                    if member == (op == "$in") {
                        matches.extend(ids.iter().cloned());
                    }
                }
            }
            "$regex" => {
                let pattern =
                    argument
                        .as_str()
                        .ok_or_else(|| QueryError::InvalidOperatorArgument {
                            op: "$regex",
                            reason: "expected a pattern string".to_string(),
                        })?;
                let regex = Regex::new(pattern)?;
                for (key, ids) in index {
                    if let IndexKey::Str(s) = key {
                        if regex.is_match(s) {
                            matches.extend(ids.iter().cloned());
                        }
                    }
                }
            }
            "$type" => {
                let wanted = argument
                    .as_str()
                    .ok_or_else(|| QueryError::InvalidOperatorArgument {
                        op: "$type",
                        reason: "expected a type name string".to_string(),
                    })?;
                for (key, ids) in index {
                    let is_match = match wanted {
                        "int" => matches!(key, IndexKey::Int(_)),
                        "float" => matches!(key, IndexKey::Float(_)),
                        "bool" => matches!(key, IndexKey::Bool(_)),
                        "str" => matches!(key, IndexKey::Str(_)),
                        "list" => matches!(key, IndexKey::Seq(_)),
                        "null" => matches!(key, IndexKey::Null),
                        other => {
                            return Err(QueryError::InvalidOperatorArgument {
                                op: "$type",
                                reason: format!("unknown type name '{other}'"),
                            })
                        }
                    };
                    if is_match {
                        matches.extend(ids.iter().cloned());
                    }
                }
            }
            "$near" => {
                let (target, rel_tol, abs_tol) = parse_near_argument(argument)?;
                for (key, ids) in index {
                    if let Some(v) = key.as_f64() {
                        if is_close(v, target, rel_tol, abs_tol) {
                            matches.extend(ids.iter().cloned());
                        }
                    }
                }
            }
            "$where" => {
                let name = argument
                    .as_str()
                    .ok_or_else(|| QueryError::InvalidOperatorArgument {
                        op: "$where",
                        reason: "expected a registered predicate name".to_string(),
                    })?;
                let predicate = self
                    .predicates
                    .get(name)
                    .ok_or_else(|| QueryError::UnknownPredicate(name.to_string()))?;
                for (key, ids) in index {
                    if let Some(value) = key.to_value() {
                        if predicate(&value) {
                            matches.extend(ids.iter().cloned());
                        }
                    }
                }
            }
            other => return Err(QueryError::UnknownOperator(other.to_string())),
        }
        Ok(matches)
    }
}

impl FromIterator<(String, Value)> for SearchIndex {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            docs: iter.into_iter().collect(),
            predicates: HashMap::new(),
        }
    }
}

fn reduce_results(result: &mut Option<HashSet<String>>, matched: HashSet<String>) {
    *result = Some(match result.take() {
        None => matched,
        Some(prev) => prev.intersection(&matched).cloned().collect(),
    });
}

/// Equality lookup with numeric int/float equivalence: a query for `4`
/// also probes the float key `4.0` and vice versa.
fn lookup_eq(index: &KeyIndex, value: &Value) -> Result<HashSet<String>> {
    if let Value::Object(map) = value {
        if !map.is_empty() {
            return Err(QueryError::InvalidFilter(format!(
                "cannot match against a mapping value: {value}"
            )));
        }
    }
    let mut matched = HashSet::new();
    if let Some(n) = value.as_f64().filter(|f| f.fract() == 0.0 && f.is_finite()) {
        if let Some(ids) = index.get(&IndexKey::Int(n as i64)) {
            matched.extend(ids.iter().cloned());
        }
        if let Some(ids) = index.get(&IndexKey::Float(normalize_float(n).to_bits())) {
            matched.extend(ids.iter().cloned());
        }
    } else if let Some(ids) = index.get(&IndexKey::from_leaf(value)) {
        matched.extend(ids.iter().cloned());
    }
    Ok(matched)
}

fn eq_key(key: &IndexKey, value: &Value) -> bool {
    match (key.as_f64(), value.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => match key.to_value() {
            Some(stored) => &stored == value,
            None => false,
        },
    }
}

fn compare_matches(key: &IndexKey, op: &str, argument: &Value) -> bool {
    let ordering = match (key, argument) {
        (IndexKey::Str(s), Value::String(arg)) => s.as_str().partial_cmp(arg.as_str()),
        _ => match (key.as_f64(), argument.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    match ordering {
        Some(ordering) => match op {
            "$lt" => ordering.is_lt(),
            "$lte" => ordering.is_le(),
            "$gt" => ordering.is_gt(),
            "$gte" => ordering.is_ge(),
            _ => false,
        },
        None => false,
    }
}

fn parse_near_argument(argument: &Value) -> Result<(f64, f64, f64)> {
    let invalid = |reason: String| QueryError::InvalidOperatorArgument {
        op: "$near",
        reason,
    };
    let scalar = |value: &Value| {
        value
            .as_f64()
            .ok_or_else(|| invalid(format!("expected a number, got {value}")))
    };
    match argument {
        Value::Array(items) => match items.as_slice() {
            [v] => Ok((scalar(v)?, 1e-9, 0.0)),
            [v, rel] => Ok((scalar(v)?, scalar(rel)?, 0.0)),
            [v, rel, abs] => Ok((scalar(v)?, scalar(rel)?, scalar(abs)?)),
            _ => Err(invalid(
                "expected a number or a list of 1 to 3 numbers".to_string(),
            )),
        },
        other => Ok((scalar(other)?, 1e-9, 0.0)),
    }
}

fn is_close(a: f64, b: f64, rel_tol: f64, abs_tol: f64) -> bool {
    (a - b).abs() <= f64::max(rel_tol * f64::max(a.abs(), b.abs()), abs_tol)
}

fn logical_operands<'a>(op: &'static str, value: &'a Value) -> Result<Vec<&'a Map<String, Value>>> {
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::InvalidOperatorArgument {
            op,
            reason: "the argument must be a list".to_string(),
        })?;
    if items.is_empty() {
        return Err(QueryError::InvalidOperatorArgument {
            op,
            reason: "the argument cannot be empty".to_string(),
        });
    }
    items
        .iter()
        .map(|item| {
            item.as_object().ok_or_else(|| QueryError::InvalidOperatorArgument {
                op,
                reason: format!("expected a filter object, got {item}"),
            })
        })
        .collect()
}

/// Flatten nested mapping values into dotted keys: `{"a": {"b": 1}}`
/// becomes `("a.b", 1)`. Operator expressions flatten the same way, so
/// `{"a": {"$lt": 3}}` becomes `("a.$lt", 3)`. Empty mappings are yielded
/// as-is.
pub(crate) fn flatten_dotted(expr: &Map<String, Value>) -> Vec<(String, Value)> {
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
            _ => {
                if let Some(prefix) = prefix {
                    out.push((prefix.to_string(), value.clone()));
                }
            }
        }
    }
    let mut out = Vec::new();
    walk(None, &Value::Object(expr.clone()), &mut out);
    out
}
