//! Validators applied to data before it enters a synced collection.

use crate::{Result, SyncedError};
use serde_json::Value;

/// A validator inspects candidate data and rejects invalid values.
///
/// Validators never modify data; they exist purely to refuse values that
/// the backend could not represent faithfully.
pub type Validator = fn(&Value) -> Result<()>;

/// Reject mapping keys containing dots anywhere in the value tree.
///
/// Dots are reserved for nested-key addressing in filters, so a key like
/// `"a.b"` would be indistinguishable from the nested path `a` → `b`.
pub fn no_dot_in_key(value: &Value) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.contains('.') {
                    return Err(SyncedError::InvalidKey { key: key.clone() });
                }
                no_dot_in_key(child)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                no_dot_in_key(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
