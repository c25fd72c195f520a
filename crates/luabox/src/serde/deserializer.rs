/// Deserializer for converting serde_json::Value to sandbox values
///
/// - null -> nil
/// - boolean -> boolean
/// - number -> integer when it fits i64, float otherwise
/// - string -> string
/// - array -> new guest table with keys 1..n
/// - object -> new guest table keyed by strings
///
/// Nulls inside arrays and objects leave holes, as assigning nil would.
use serde_json::Value as JsonValue;

use crate::lua_value::Value;
use crate::lua_vm::{LuaError, LuaResult, Sandbox};

/// Convert a serde_json::Value to a sandbox value
pub fn from_value(json_value: &JsonValue, sandbox: &Sandbox) -> LuaResult<Value> {
    match json_value {
        JsonValue::Null => Ok(Value::Nil),
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(LuaError::UnsupportedValue(format!("invalid JSON number: {n}")))
            }
        }
        JsonValue::String(s) => Ok(Value::from(s.as_str())),
        JsonValue::Array(arr) => {
            let table = sandbox.create_table()?;
            for (i, item) in arr.iter().enumerate() {
                table.set((i + 1) as i64, from_value(item, sandbox)?)?;
            }
            Ok(Value::TableRef(table))
        }
        JsonValue::Object(obj) => {
            let table = sandbox.create_table()?;
            for (key, item) in obj {
                table.set(key.as_str(), from_value(item, sandbox)?)?;
            }
            Ok(Value::TableRef(table))
        }
    }
}

/// Convert a JSON string to a sandbox value
pub fn from_str(json_str: &str, sandbox: &Sandbox) -> LuaResult<Value> {
    let json_value: JsonValue = serde_json::from_str(json_str)
        .map_err(|e| LuaError::UnsupportedValue(format!("failed to parse JSON: {e}")))?;
    from_value(&json_value, sandbox)
}
