//! MongoDB-style queries over maps of id → JSON document.
//!
//! The [`SearchIndex`] holds documents keyed by id and answers filter
//! queries by building per-key inverted indexes on demand. Filters can be
//! provided as JSON objects, sequences of key/value pairs, or the compact
//! token syntax used on command lines (see [`filter`]).

mod filter;
mod index;

pub use filter::{add_prefix, parse_pairs, parse_str, root_keys};
pub use index::SearchIndex;

use thiserror::Error;

/// Errors raised while parsing or evaluating filters.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid operator expression '{0}'")]
    InvalidOperatorExpression(String),

    #[error("invalid operator placement '{0}'")]
    InvalidOperatorPlacement(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("invalid argument for operator '{op}': {reason}")]
    InvalidOperatorArgument { op: &'static str, reason: String },

    #[error("unknown $where predicate '{0}': predicates must be registered explicitly")]
    UnknownPredicate(String),

    /// A document contains a key with a dot, which collides with the
    /// nested-key addressing of filters.
    #[error("keys with dots ('.') are invalid: '{0}'")]
    InvalidKey(String),

    #[error("invalid regular expression: {0}")]
    Regex(#[from] regex::Error),

    #[error("failed to parse filter token '{token}' as JSON: {source}")]
    Json {
        token: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for query operations.
pub type Result<T> = std::result::Result<T, QueryError>;
