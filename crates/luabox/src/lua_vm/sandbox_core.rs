// State shared by a sandbox and every handle it produced.
//
// A `Sandbox` and all of its `TableProxy` / `CallableRef` / `CompiledChunk`
// values hold an `Rc` to the same core, so the interpreter stays alive until
// the last of them is dropped. Field order matters: everything that refers
// to guest objects is declared before `lua` so it is dropped first.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{Lua, LuaOptions, MultiValue};

use crate::lua_value::{Value, ValueBridge};
use crate::lua_vm::allocator::BoundedAllocator;
use crate::lua_vm::budget::ResourceBudget;
use crate::lua_vm::lua_error::{BudgetKind, ERRERR_MESSAGE, LuaError, OUT_OF_MEMORY_MESSAGE};
use crate::lua_vm::lua_limits::REMOVED_BASE_FUNCTIONS;
use crate::lua_vm::lua_ref::{RefId, TableRegistry};
use crate::lua_vm::safe_option::SandboxOption;
use crate::lua_vm::step_limiter::StepLimiter;
use crate::lua_vm::{LuaResult, ResultMode};

pub(crate) struct SandboxCore {
    pub(crate) registry: RefCell<TableRegistry>,
    pub(crate) budget: Rc<ResourceBudget>,
    pub(crate) allocator: BoundedAllocator,
    pub(crate) limiter: StepLimiter,
    /// Pristine `next` and `xpcall`, captured before any script could
    /// replace them
    next: mlua::Function,
    xpcall: mlua::Function,
    pub(crate) option: SandboxOption,
    pub(crate) lua: Lua,
}

fn init_error(err: mlua::Error) -> LuaError {
    LuaError::InitError(err.to_string())
}

/// Lua's own type names: integers and floats are both "number".
fn guest_type_name(value: &mlua::Value) -> &'static str {
    match value {
        mlua::Value::Integer(_) | mlua::Value::Number(_) => "number",
        other => other.type_name(),
    }
}

/// Turns the error object left by a message handler into a host error.
fn handled_error(value: mlua::Value) -> LuaError {
    match value {
        mlua::Value::String(s) => {
            let message = s.to_string_lossy();
            if message.starts_with(ERRERR_MESSAGE) {
                LuaError::ErrorHandlerError(message)
            } else if message == OUT_OF_MEMORY_MESSAGE {
                LuaError::BudgetExceeded(BudgetKind::Memory)
            } else {
                LuaError::runtime(message)
            }
        }
        mlua::Value::Integer(i) => LuaError::runtime(i.to_string()),
        mlua::Value::Number(n) => LuaError::runtime(n.to_string()),
        mlua::Value::Error(err) => LuaError::from(mlua::Error::clone(&err)),
        other => LuaError::runtime(format!(
            "(error object is a {} value)",
            guest_type_name(&other)
        )),
    }
}

impl SandboxCore {
    pub(crate) fn new(option: SandboxOption) -> LuaResult<Rc<Self>> {
        if option.memory_limit == Some(0) {
            return Err(LuaError::InitError(
                "memory limit must be greater than zero".to_string(),
            ));
        }

        let lua = Lua::new_with(option.libs.std_libs(), LuaOptions::new()).map_err(init_error)?;

        let globals = lua.globals();
        let next = globals
            .raw_get::<mlua::Function>("next")
            .map_err(init_error)?;
        let xpcall = globals
            .raw_get::<mlua::Function>("xpcall")
            .map_err(init_error)?;
        for name in REMOVED_BASE_FUNCTIONS {
            globals.raw_set(*name, mlua::Value::Nil).map_err(init_error)?;
        }
        drop(globals);
        lua.gc_collect().map_err(init_error)?;

        let budget = Rc::new(ResourceBudget::new(option.step_limit, option.memory_limit));
        let allocator = BoundedAllocator::new(budget.clone());
        allocator.install(&lua)?;
        let limiter = StepLimiter::new(
            budget.clone(),
            allocator.clone(),
            option.effective_interval(),
        );
        limiter.install(&lua);

        tracing::debug!(
            memory_limit = ?option.memory_limit,
            step_limit = ?option.step_limit,
            checkpoint_interval = limiter.interval(),
            libs = ?option.libs,
            bootstrap_bytes = budget.bytes_used(),
            "sandbox created"
        );

        Ok(Rc::new(SandboxCore {
            registry: RefCell::new(TableRegistry::new()),
            budget,
            allocator,
            limiter,
            next,
            xpcall,
            option,
            lua,
        }))
    }

    // ==================== Guarded execution ====================

    /// Runs guest code. Fails fast when the budget is already spent and
    /// reports a spent step budget as a budget error, whatever the guest did
    /// with the error it caught.
    pub(crate) fn execute<T>(&self, run: impl FnOnce(&Lua) -> mlua::Result<T>) -> LuaResult<T> {
        if let Err(kind) = self.budget.ensure_available() {
            tracing::debug!(%kind, "refusing to run guest code: budget exhausted");
            return Err(LuaError::BudgetExceeded(kind));
        }
        let result = run(&self.lua);
        self.allocator.sync(&self.lua);
        // a trapped abort can still return normally (a tail call into
        // `pcall`), so a spent step budget overrides any outcome
        if self.budget.steps_exhausted() {
            tracing::debug!(ok = result.is_ok(), "guest call ended with the step budget spent");
            return Err(LuaError::BudgetExceeded(BudgetKind::Steps));
        }
        result.map_err(|err| {
            let err = LuaError::from(err);
            match &err {
                LuaError::BudgetExceeded(BudgetKind::Memory) => tracing::warn!(
                    bytes_used = self.budget.bytes_used(),
                    memory_limit = ?self.budget.memory_limit(),
                    "memory budget exhausted"
                ),
                _ => tracing::debug!(error = %err, "guest call failed"),
            }
            err
        })
    }

    /// Interpreter access that runs no guest code (raw table access, string
    /// creation, compilation). Only the memory cap applies.
    pub(crate) fn access<T>(&self, run: impl FnOnce(&Lua) -> mlua::Result<T>) -> LuaResult<T> {
        let result = run(&self.lua);
        self.allocator.sync(&self.lua);
        result.map_err(LuaError::from)
    }

    /// Calls a function, or a table with a `__call` metamethod.
    pub(crate) fn invoke(&self, callee: mlua::Value, mut args: MultiValue) -> LuaResult<MultiValue> {
        let function = match callee {
            mlua::Value::Function(f) => f,
            mlua::Value::Table(t) => {
                let handler = t
                    .metatable()
                    .map(|mt| mt.raw_get::<mlua::Value>("__call"))
                    .transpose()?;
                match handler {
                    Some(mlua::Value::Function(f)) => {
                        args.push_front(mlua::Value::Table(t));
                        f
                    }
                    _ => return Err(LuaError::runtime("attempt to call a table value")),
                }
            }
            other => {
                return Err(LuaError::runtime(format!(
                    "attempt to call a {} value",
                    guest_type_name(&other)
                )));
            }
        };
        self.execute(|_| function.call::<MultiValue>(args))
    }

    /// Calls `callee` under the guest's `xpcall`, with `handler` as message
    /// handler. The error returned carries whatever the handler produced.
    pub(crate) fn invoke_with_handler(
        &self,
        callee: mlua::Value,
        handler: mlua::Value,
        mut args: MultiValue,
    ) -> LuaResult<MultiValue> {
        args.push_front(handler);
        args.push_front(callee);
        let mut results = self.execute(|_| self.xpcall.call::<MultiValue>(args))?;
        match results.pop_front() {
            Some(mlua::Value::Boolean(true)) => Ok(results),
            _ => Err(handled_error(results.pop_front().unwrap_or(mlua::Value::Nil))),
        }
    }

    /// `invoke` with host values on both sides.
    pub(crate) fn call_values(
        self: &Rc<Self>,
        callee: mlua::Value,
        args: &[Value],
        mode: ResultMode,
    ) -> LuaResult<Vec<Value>> {
        mode.check(self.option.max_stack_size)?;
        let bridge = ValueBridge::new(self);
        let args = bridge.args_to_guest(args)?;
        let results = self.invoke(callee, args)?;
        let mut results = bridge.results_from_guest(results)?;
        mode.adjust(&mut results, Value::Nil);
        Ok(results)
    }

    /// One step of the guest's `next`. Runs no guest code.
    pub(crate) fn next_entry(
        &self,
        table: &mlua::Table,
        prev: mlua::Value,
    ) -> LuaResult<Option<(mlua::Value, mlua::Value)>> {
        let (key, value) = self.access(|_| {
            self.next
                .call::<(mlua::Value, mlua::Value)>((table.clone(), prev))
        })?;
        Ok(if key.is_nil() { None } else { Some((key, value)) })
    }

    // ==================== Registry ====================

    pub(crate) fn register(&self, value: &mlua::Value) -> LuaResult<RefId> {
        let result = self.registry.borrow_mut().register(&self.lua, value);
        self.allocator.sync(&self.lua);
        if let Ok(handle) = result {
            tracing::trace!(handle, kind = value.type_name(), "registered");
        }
        result
    }

    pub(crate) fn resolve(&self, handle: RefId) -> LuaResult<mlua::Value> {
        self.registry.borrow().resolve(&self.lua, handle)
    }

    pub(crate) fn resolve_table(&self, handle: RefId) -> LuaResult<mlua::Table> {
        match self.resolve(handle)? {
            mlua::Value::Table(t) => Ok(t),
            _ => Err(LuaError::InvalidHandle(handle)),
        }
    }

    /// Adds an owner to a handle held by a live proxy.
    pub(crate) fn retain(&self, handle: RefId) {
        if let Err(e) = self.registry.borrow_mut().retain(handle) {
            tracing::warn!(handle, error = %e, "retain on a released handle");
        }
    }

    /// Drops an owner. Called from proxy destructors, so it never fails.
    pub(crate) fn release(&self, handle: RefId) {
        match self.registry.try_borrow_mut() {
            Ok(mut registry) => {
                match registry.release(&self.lua, handle) {
                    Ok(()) => tracing::trace!(handle, "released"),
                    Err(e) => tracing::trace!(handle, error = %e, "release of a released handle"),
                }
            }
            Err(_) => tracing::warn!(handle, "registry busy, leaking handle"),
        }
    }
}
