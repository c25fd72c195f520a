// Values exchanged across the sandbox boundary
mod lua_convert;
mod lua_value;

pub(crate) use lua_convert::ValueBridge;
pub use lua_value::{TableKey, Value, float_to_integer};
