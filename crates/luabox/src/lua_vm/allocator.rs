use std::rc::Rc;

use mlua::Lua;

use crate::lua_vm::budget::ResourceBudget;
use crate::lua_vm::lua_error::LuaError;
use crate::lua_vm::LuaResult;

/// Memory governor of one sandbox.
///
/// Every guest heap request (allocate, grow, shrink, free) goes through the
/// interpreter's allocator, which carries the cap installed here. A request
/// that would push live usage past the cap is denied and surfaces inside the
/// interpreter as an ordinary out-of-memory error, never as a crash. Freed
/// memory is credited back because usage is always measured as live bytes.
#[derive(Debug, Clone)]
pub struct BoundedAllocator {
    budget: Rc<ResourceBudget>,
}

impl BoundedAllocator {
    pub fn new(budget: Rc<ResourceBudget>) -> Self {
        BoundedAllocator { budget }
    }

    /// Wires the budget's cap into a freshly bootstrapped interpreter.
    /// Fails if the bootstrap itself already needs more than the cap.
    pub(crate) fn install(&self, lua: &Lua) -> LuaResult<()> {
        let used = lua.used_memory();
        if let Some(limit) = self.budget.memory_limit()
            && used > limit
        {
            return Err(LuaError::InitError(format!(
                "not enough memory: bootstrap needs {used} bytes, limit is {limit}"
            )));
        }
        self.apply(lua, self.budget.memory_limit())
            .map_err(|e| LuaError::InitError(e.to_string()))?;
        self.sync(lua);
        Ok(())
    }

    /// Changes the cap of a live interpreter. Lowering it below current usage
    /// is allowed; further growth is then denied.
    pub(crate) fn set_limit(&self, lua: &Lua, limit: Option<usize>) -> LuaResult<()> {
        self.apply(lua, limit)?;
        self.budget.set_memory_limit(limit);
        self.sync(lua);
        tracing::debug!(memory_limit = ?limit, "memory limit changed");
        Ok(())
    }

    fn apply(&self, lua: &Lua, limit: Option<usize>) -> mlua::Result<()> {
        // the interpreter reads 0 as "no cap"; a zero cap denies everything
        let raw = match limit {
            None => 0,
            Some(0) => 1,
            Some(limit) => limit,
        };
        lua.set_memory_limit(raw)?;
        Ok(())
    }

    /// Pulls live usage from the interpreter into the budget.
    pub(crate) fn sync(&self, lua: &Lua) {
        self.budget.record_bytes_used(lua.used_memory());
    }

    /// Whether a net growth of `delta` bytes fits the remaining allowance.
    /// Used to refuse host-originated allocations before they reach the
    /// interpreter.
    pub fn admits(&self, delta: usize) -> bool {
        match self.budget.bytes_remaining() {
            None => true,
            Some(remaining) => delta <= remaining,
        }
    }
}
