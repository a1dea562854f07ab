//! Dot-path lookups over decoded device responses, e.g. `"dps.1"`.

use crate::error::{Result, TuyaError};
use crate::session::CommandResponse;
use serde_json::Value;

/// Default filter: the primary relay state.
pub const DEFAULT_PATH: &str = "dps.1";

/// Extract the value at `path` from a response payload.
///
/// An empty path returns the whole payload.
pub fn extract(path: &str, response: &CommandResponse) -> Result<Value> {
    extract_value(path, &response.payload).cloned()
}

/// Walk `path` through `value`. Objects are indexed by key, arrays by
/// decimal position.
pub fn extract_value<'a>(path: &str, value: &'a Value) -> Result<&'a Value> {
    if path.is_empty() {
        return Ok(value);
    }

    path.split('.').try_fold(value, |current, segment| {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        next.ok_or_else(|| TuyaError::PathNotFound {
            path: path.to_string(),
            segment: segment.to_string(),
        })
    })
}

/// Truth value of a status field: `false`, `null`, zero, `""`, `[]` and `{}`
/// are false, everything else is true.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
