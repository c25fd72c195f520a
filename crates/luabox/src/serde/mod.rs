/// Serde serialization support for sandbox values
///
/// Converts host [`Value`]s (including tables reached through proxies) to
/// `serde_json::Value` and back. Conversions run no guest code.
mod deserializer;
mod serializer;

pub use deserializer::{from_str, from_value};
pub use serializer::{to_string, to_value};

use crate::lua_value::Value;
use crate::lua_vm::{LuaResult, Sandbox};

/// Convert a sandbox value to a serde_json::Value
pub fn lua_to_json(value: &Value) -> LuaResult<serde_json::Value> {
    to_value(value)
}

/// Convert a serde_json::Value to a sandbox value, creating guest tables
/// for arrays and objects
pub fn json_to_lua(json: &serde_json::Value, sandbox: &Sandbox) -> LuaResult<Value> {
    from_value(json, sandbox)
}
