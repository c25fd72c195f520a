/// Serializer for converting sandbox values to serde_json::Value
///
/// - nil -> null
/// - boolean -> boolean
/// - integer / float -> number (NaN and infinities are rejected)
/// - string -> string (invalid UTF-8 is replaced)
/// - table with keys exactly 1..n -> array, any other table -> object
/// - function -> error
use ahash::AHashSet;
use serde_json::{Map, Number, Value as JsonValue};

use crate::lua_value::Value;
use crate::lua_vm::lua_limits::MAX_SERIALIZE_DEPTH;
use crate::lua_vm::{LuaError, LuaResult, RefId, TableProxy};

/// Convert a sandbox value to a serde_json::Value
pub fn to_value(value: &Value) -> LuaResult<JsonValue> {
    let mut visited = AHashSet::new();
    to_value_internal(value, &mut visited, 0)
}

/// Convert a sandbox value to a JSON string
pub fn to_string(value: &Value, pretty: bool) -> LuaResult<String> {
    let json_value = to_value(value)?;
    let text = if pretty {
        serde_json::to_string_pretty(&json_value)
    } else {
        serde_json::to_string(&json_value)
    };
    text.map_err(|e| LuaError::UnsupportedValue(format!("failed to serialize to JSON: {e}")))
}

fn to_value_internal(
    value: &Value,
    visited: &mut AHashSet<RefId>,
    depth: usize,
) -> LuaResult<JsonValue> {
    match value {
        Value::Nil => Ok(JsonValue::Null),
        Value::Bool(b) => Ok(JsonValue::Bool(*b)),
        Value::Integer(i) => Ok(JsonValue::Number(Number::from(*i))),
        Value::Float(f) => Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| LuaError::UnsupportedValue(format!("invalid JSON number: {f}"))),
        Value::Text(bytes) => Ok(JsonValue::String(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        Value::TableRef(table) => {
            if depth >= MAX_SERIALIZE_DEPTH {
                return Err(LuaError::UnsupportedValue(format!(
                    "table nesting deeper than {MAX_SERIALIZE_DEPTH}"
                )));
            }
            // Check for circular reference
            if !visited.insert(table.handle()) {
                return Err(LuaError::UnsupportedValue(
                    "circular reference detected in table".to_string(),
                ));
            }
            let result = table_to_json(table, visited, depth + 1);
            visited.remove(&table.handle());
            result
        }
        Value::CallableRef(_) => Err(LuaError::MarshalError("function".to_string())),
    }
}

fn table_to_json(
    table: &TableProxy,
    visited: &mut AHashSet<RefId>,
    depth: usize,
) -> LuaResult<JsonValue> {
    let pairs = table.pairs()?;

    if is_array_like(&pairs) {
        let mut array = vec![JsonValue::Null; pairs.len()];
        for (key, value) in &pairs {
            if let Value::Integer(i) = key {
                array[(*i - 1) as usize] = to_value_internal(value, visited, depth)?;
            }
        }
        return Ok(JsonValue::Array(array));
    }

    let mut object = Map::new();
    for (key, value) in &pairs {
        let key = match key {
            Value::Text(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Value::Integer(_) | Value::Float(_) | Value::Bool(_) => key.to_string(),
            other => {
                return Err(LuaError::UnsupportedValue(format!(
                    "cannot use a {} as a JSON object key",
                    other.type_name()
                )));
            }
        };
        object.insert(key, to_value_internal(value, visited, depth)?);
    }
    Ok(JsonValue::Object(object))
}

/// Keys are exactly the integers 1..=n. The empty table counts as an array.
fn is_array_like(pairs: &[(Value, Value)]) -> bool {
    let n = pairs.len() as i64;
    let mut seen = vec![false; pairs.len()];
    for (key, _) in pairs {
        match key {
            Value::Integer(i) if (1..=n).contains(i) => {
                let slot = &mut seen[(*i - 1) as usize];
                if *slot {
                    return false;
                }
                *slot = true;
            }
            _ => return false,
        }
    }
    true
}
