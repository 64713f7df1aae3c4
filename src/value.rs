//! Helpers for addressing and merging stored values.

use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey);
    }
    Ok(())
}

/// Look up a property of a mapping value. Non-mappings have no properties.
pub(crate) fn field<'a>(value: &'a Value, sub_key: &str) -> Option<&'a Value> {
    value.as_object()?.get(sub_key)
}

/// Shallow-merge `partial` onto `current`.
///
/// An absent or null current value merges as an empty mapping; any other
/// non-mapping is rejected, as is a non-mapping `partial`.
pub(crate) fn merge(key: &str, current: Option<&Value>, partial: Value) -> Result<Value> {
    let Value::Object(partial) = partial else {
        return Err(StoreError::NotAnObject(key.to_string()));
    };

    let mut merged = match current {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(existing)) => existing.clone(),
        Some(_) => return Err(StoreError::NotAnObject(key.to_string())),
    };
    merged.extend(partial);
    Ok(Value::Object(merged))
}
