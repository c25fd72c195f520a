// Lua Sandbox
// Budgeted execution of untrusted Lua scripts with a typed host value bridge

#[cfg(test)]
mod test;

pub mod lua_value;
pub mod lua_vm;

#[cfg(feature = "serde")]
pub mod serde;

pub use lua_value::{TableKey, Value};
pub use lua_vm::{
    BudgetKind, BudgetSnapshot, Callable, CallableRef, CompiledChunk, Keys, LibSet, LuaError,
    LuaResult, RefId, ResultMode, Sandbox, SandboxOption, TableProxy,
};
