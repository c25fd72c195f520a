// Lua Sandbox
// Runs untrusted scripts inside an embedded interpreter under a CPU-step and
// memory budget, exchanging values with the host through a stack protocol.
pub(crate) mod allocator;
pub(crate) mod budget;
pub(crate) mod lua_error;
pub mod lua_limits;
pub(crate) mod lua_ref;
pub(crate) mod safe_option;
pub(crate) mod sandbox_core;
pub(crate) mod step_limiter;

use std::fmt;
use std::path::Path;
use std::rc::Rc;

use mlua::{ChunkMode, MultiValue};

use crate::lua_value::{Value, ValueBridge};
pub use crate::lua_vm::allocator::BoundedAllocator;
pub use crate::lua_vm::budget::{BudgetSnapshot, ResourceBudget};
pub use crate::lua_vm::lua_error::{BudgetKind, LuaError};
pub use crate::lua_vm::lua_ref::{CallableRef, Keys, RefId, RefKind, TableProxy, TableRegistry};
pub use crate::lua_vm::safe_option::{LibSet, SandboxOption};
use crate::lua_vm::sandbox_core::SandboxCore;
pub use crate::lua_vm::step_limiter::StepLimiter;

pub type LuaResult<T> = Result<T, LuaError>;

/// How many results a protected call leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResultMode {
    /// Every value the callee returned.
    #[default]
    All,
    /// Exactly `n`: extra results are dropped, missing ones filled with nil.
    Exactly(usize),
}

impl ResultMode {
    /// Number of results left behind when the callee returned `returned`.
    pub(crate) fn count(self, returned: usize) -> usize {
        match self {
            ResultMode::All => returned,
            ResultMode::Exactly(n) => n,
        }
    }

    /// Rejects a fixed result count no stack of `limit` slots could hold.
    pub(crate) fn check(self, limit: usize) -> LuaResult<()> {
        match self {
            ResultMode::Exactly(n) if n > limit => Err(LuaError::StackOverflow(limit)),
            _ => Ok(()),
        }
    }

    pub(crate) fn adjust<T: Clone>(self, results: &mut Vec<T>, fill: T) {
        if let ResultMode::Exactly(n) = self {
            results.resize(n, fill);
        }
    }
}

// ============================================================================
// CompiledChunk
// ============================================================================

/// A compiled, not yet executed, top-level chunk.
#[derive(Clone)]
pub struct CompiledChunk {
    function: mlua::Function,
    name: String,
    core: Rc<SandboxCore>,
}

impl CompiledChunk {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CompiledChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CompiledChunk({})", self.name)
    }
}

mod private {
    pub trait Sealed {}
    impl Sealed for super::CompiledChunk {}
    impl Sealed for super::CallableRef {}
    impl Sealed for super::TableProxy {}
    impl Sealed for super::Value {}
}

/// Anything [`Sandbox::call`] can invoke: compiled chunks, guest functions,
/// tables with a `__call` metamethod, or a [`Value`] holding one of those.
pub trait Callable: private::Sealed {
    /// Pushes the callee onto the exchange stack of `sandbox`.
    #[doc(hidden)]
    fn push_onto(&self, sandbox: &mut Sandbox) -> LuaResult<()>;
}

impl Callable for CompiledChunk {
    fn push_onto(&self, sandbox: &mut Sandbox) -> LuaResult<()> {
        sandbox.push_chunk(self)
    }
}

impl Callable for CallableRef {
    fn push_onto(&self, sandbox: &mut Sandbox) -> LuaResult<()> {
        sandbox.push(self.clone())
    }
}

impl Callable for TableProxy {
    fn push_onto(&self, sandbox: &mut Sandbox) -> LuaResult<()> {
        sandbox.push(self.clone())
    }
}

impl Callable for Value {
    fn push_onto(&self, sandbox: &mut Sandbox) -> LuaResult<()> {
        sandbox.push(self.clone())
    }
}

// ============================================================================
// Sandbox
// ============================================================================

/// An isolated Lua interpreter with its own budget, registry and exchange
/// stack.
///
/// Single-threaded: a sandbox and all handles it hands out are `!Send`.
/// Independent sandboxes on different threads share nothing.
///
/// # Example
///
/// ```ignore
/// let mut sandbox = Sandbox::with_limits(Some(1 << 20), Some(100_000))?;
/// let chunk = sandbox.load("return 1 + 1")?;
/// let results = sandbox.call(&chunk, &[], ResultMode::All)?;
/// assert_eq!(results, vec![Value::Integer(2)]);
/// ```
pub struct Sandbox {
    /// Exchange stack between host and guest; dropped before the core
    stack: Vec<mlua::Value>,
    core: Rc<SandboxCore>,
}

impl Sandbox {
    pub fn new(option: SandboxOption) -> LuaResult<Self> {
        let core = SandboxCore::new(option)?;
        Ok(Sandbox {
            stack: Vec::new(),
            core,
        })
    }

    /// Sandbox with the given caps and default settings otherwise.
    pub fn with_limits(memory_limit: Option<usize>, step_limit: Option<u64>) -> LuaResult<Self> {
        Self::new(
            SandboxOption::default()
                .with_memory_limit(memory_limit)
                .with_step_limit(step_limit),
        )
    }

    fn bridge(&self) -> ValueBridge<'_> {
        ValueBridge::new(&self.core)
    }

    // ==================== Loading ====================

    /// Compiles Lua source text without running it. Precompiled bytecode is
    /// rejected.
    pub fn load(&self, source: impl AsRef<[u8]>) -> LuaResult<CompiledChunk> {
        let name = self.core.option.chunk_name.clone();
        self.load_named(source, &name)
    }

    /// Like [`Sandbox::load`], reporting `name` in error messages.
    pub fn load_named(&self, source: impl AsRef<[u8]>, name: &str) -> LuaResult<CompiledChunk> {
        let name = sanitize_chunk_name(name);
        let source = source.as_ref();
        let function = self
            .core
            .access(|lua| {
                lua.load(source)
                    .set_name(format!("={name}"))
                    .set_mode(ChunkMode::Text)
                    .into_function()
            })
            .inspect_err(|e| tracing::debug!(chunk = %name, error = %e, "compile failed"))?;
        tracing::trace!(chunk = %name, bytes = source.len(), "chunk compiled");
        Ok(CompiledChunk {
            function,
            name,
            core: self.core.clone(),
        })
    }

    /// Reads and compiles a script file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> LuaResult<CompiledChunk> {
        let path = path.as_ref();
        let source = std::fs::read(path).map_err(|e| LuaError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.load_named(source, &name)
    }

    // ==================== Stack protocol ====================

    fn ensure_capacity(&self, extra: usize) -> LuaResult<()> {
        let limit = self.core.option.max_stack_size;
        if self.stack.len().saturating_add(extra) > limit {
            return Err(LuaError::StackOverflow(limit));
        }
        Ok(())
    }

    fn push_raw(&mut self, value: mlua::Value) -> LuaResult<()> {
        self.ensure_capacity(1)?;
        self.stack.push(value);
        Ok(())
    }

    /// Pushes a host value.
    pub fn push(&mut self, value: impl Into<Value>) -> LuaResult<()> {
        let value = self.bridge().to_guest(&value.into())?;
        self.push_raw(value)
    }

    /// Pushes a compiled chunk so it can be called with [`Sandbox::pcall`].
    pub fn push_chunk(&mut self, chunk: &CompiledChunk) -> LuaResult<()> {
        if !Rc::ptr_eq(&chunk.core, &self.core) {
            return Err(LuaError::UnsupportedValue(
                "chunk belongs to another sandbox".to_string(),
            ));
        }
        self.push_raw(mlua::Value::Function(chunk.function.clone()))
    }

    /// Pops the top value. If it cannot be converted the value stays on the
    /// stack and the error is returned.
    pub fn pop(&mut self) -> LuaResult<Value> {
        let top = self.stack.last().cloned().ok_or(LuaError::StackUnderflow)?;
        let value = self.bridge().from_guest(top)?;
        self.stack.pop();
        Ok(value)
    }

    /// Converts the top value without removing it.
    pub fn peek(&self) -> LuaResult<Value> {
        let top = self.stack.last().cloned().ok_or(LuaError::StackUnderflow)?;
        self.bridge().from_guest(top)
    }

    /// Number of values on the exchange stack.
    pub fn top_count(&self) -> usize {
        self.stack.len()
    }

    /// Alias of [`Sandbox::top_count`].
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Discards everything on the stack without converting it.
    pub fn clear_stack(&mut self) {
        self.stack.clear();
    }

    /// Pops everything, bottom value first.
    pub fn drain_stack(&mut self) -> LuaResult<Vec<Value>> {
        self.drain_from(0)
    }

    /// Pops every value above `base` and returns them bottom first. On a
    /// conversion failure those values are discarded.
    fn drain_from(&mut self, base: usize) -> LuaResult<Vec<Value>> {
        let mut values = Vec::with_capacity(self.stack.len().saturating_sub(base));
        while self.stack.len() > base {
            match self.pop() {
                Ok(value) => values.push(value),
                Err(e) => {
                    self.stack.truncate(base);
                    return Err(e);
                }
            }
        }
        values.reverse();
        Ok(values)
    }

    /// Protected call. The callee sits below its `nargs` arguments; both are
    /// consumed. On success the results are pushed (adjusted by `mode`); on
    /// failure nothing is pushed and the sandbox stays usable.
    pub fn pcall(&mut self, nargs: usize, mode: ResultMode) -> LuaResult<()> {
        let (callee, args) = self.take_call_frame(nargs, mode)?;
        let results = self.core.invoke(callee, args)?;
        self.push_results(results, mode)
    }

    /// [`Sandbox::pcall`] with a message handler, like `lua_pcall`'s
    /// `errfunc`. On failure the returned error carries the handler's result
    /// as its message; a handler that fails itself yields
    /// [`LuaError::ErrorHandlerError`].
    pub fn pcall_with_handler(
        &mut self,
        nargs: usize,
        mode: ResultMode,
        handler: &CallableRef,
    ) -> LuaResult<()> {
        if !Rc::ptr_eq(handler.core(), &self.core) {
            return Err(LuaError::UnsupportedValue(
                "handler belongs to another sandbox".to_string(),
            ));
        }
        let handler = self.core.resolve(handler.handle())?;
        let (callee, args) = self.take_call_frame(nargs, mode)?;
        let results = self.core.invoke_with_handler(callee, handler, args)?;
        self.push_results(results, mode)
    }

    /// Removes the callee and its `nargs` arguments from the stack.
    fn take_call_frame(
        &mut self,
        nargs: usize,
        mode: ResultMode,
    ) -> LuaResult<(mlua::Value, MultiValue)> {
        if nargs >= self.stack.len() {
            return Err(LuaError::StackUnderflow);
        }
        let base = self.stack.len() - nargs - 1;
        mode.check(self.core.option.max_stack_size.saturating_sub(base))?;
        let mut frame = self.stack.split_off(base);
        let callee = frame.remove(0);
        Ok((callee, MultiValue::from_vec(frame)))
    }

    fn push_results(&mut self, results: MultiValue, mode: ResultMode) -> LuaResult<()> {
        self.ensure_capacity(mode.count(results.len()))?;
        let mut results = results.into_vec();
        mode.adjust(&mut results, mlua::Value::Nil);
        self.stack.extend(results);
        Ok(())
    }

    /// Calls `callee` with `args` through the stack protocol and returns its
    /// results. The stack is left as it was found, success or not.
    pub fn call<C: Callable + ?Sized>(
        &mut self,
        callee: &C,
        args: &[Value],
        mode: ResultMode,
    ) -> LuaResult<Vec<Value>> {
        let base = self.stack.len();
        let pushed = self.push_call_frame(callee, args);
        if let Err(e) = pushed {
            self.stack.truncate(base);
            return Err(e);
        }
        if let Err(e) = self.pcall(args.len(), mode) {
            self.stack.truncate(base);
            return Err(e);
        }
        self.drain_from(base)
    }

    fn push_call_frame<C: Callable + ?Sized>(&mut self, callee: &C, args: &[Value]) -> LuaResult<()> {
        callee.push_onto(self)?;
        for arg in args {
            let value = self.bridge().to_guest(arg)?;
            self.push_raw(value)?;
        }
        Ok(())
    }

    /// Compiles and runs `source`, returning all of its results.
    pub fn exec(&mut self, source: impl AsRef<[u8]>) -> LuaResult<Vec<Value>> {
        let chunk = self.load(source)?;
        self.call(&chunk, &[], ResultMode::All)
    }

    // ==================== Globals and tables ====================

    /// Raw read of a global.
    pub fn get_global(&self, name: &str) -> LuaResult<Value> {
        self.globals()?.get(name)
    }

    /// Raw write of a global.
    pub fn set_global(&self, name: &str, value: impl Into<Value>) -> LuaResult<()> {
        self.globals()?.set(name, value)
    }

    /// Proxy to the global environment table.
    pub fn globals(&self) -> LuaResult<TableProxy> {
        let globals = mlua::Value::Table(self.core.lua.globals());
        self.table_value(globals)
    }

    /// Creates an empty guest table.
    pub fn create_table(&self) -> LuaResult<TableProxy> {
        let table = self.core.access(|lua| lua.create_table())?;
        self.table_value(mlua::Value::Table(table))
    }

    fn table_value(&self, table: mlua::Value) -> LuaResult<TableProxy> {
        let handle = self.core.register(&table)?;
        Ok(TableProxy::from_raw(self.core.clone(), handle))
    }

    /// Re-materializes a proxy from a raw handle (for example one that was
    /// passed through an external boundary as an integer). Fails with
    /// [`LuaError::InvalidHandle`] once every owner has released it.
    pub fn table_from_handle(&self, handle: RefId) -> LuaResult<TableProxy> {
        let mut registry = self.core.registry.borrow_mut();
        match registry.kind(handle) {
            Some(RefKind::Table) => {
                registry.retain(handle)?;
                Ok(TableProxy::from_raw(self.core.clone(), handle))
            }
            _ => Err(LuaError::InvalidHandle(handle)),
        }
    }

    /// Function counterpart of [`Sandbox::table_from_handle`].
    pub fn callable_from_handle(&self, handle: RefId) -> LuaResult<CallableRef> {
        let mut registry = self.core.registry.borrow_mut();
        match registry.kind(handle) {
            Some(RefKind::Function) => {
                registry.retain(handle)?;
                Ok(CallableRef::from_raw(self.core.clone(), handle))
            }
            _ => Err(LuaError::InvalidHandle(handle)),
        }
    }

    /// Number of live registry entries.
    pub fn registry_len(&self) -> usize {
        self.core.registry.borrow().len()
    }

    /// Current refcount of a handle, `None` once released.
    pub fn refcount(&self, handle: RefId) -> Option<usize> {
        self.core.registry.borrow().refcount(handle)
    }

    // ==================== Budget ====================

    /// Snapshot of the budget with up-to-date memory usage.
    pub fn budget(&self) -> BudgetSnapshot {
        self.core.allocator.sync(&self.core.lua);
        self.core.budget.snapshot()
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.core.budget.memory_limit()
    }

    /// Changes the memory cap. `Some(0)` denies every further allocation.
    pub fn set_memory_limit(&self, limit: Option<usize>) -> LuaResult<()> {
        self.core.allocator.set_limit(&self.core.lua, limit)
    }

    pub fn step_limit(&self) -> Option<u64> {
        self.core.budget.step_limit()
    }

    pub fn checkpoint_interval(&self) -> u32 {
        self.core.limiter.interval()
    }

    /// Runs a full garbage collection cycle, returning freed memory to the
    /// budget.
    pub fn collect_garbage(&self) -> LuaResult<()> {
        self.core.access(|lua| lua.gc_collect())
    }

    #[cfg(test)]
    pub(crate) fn lua(&self) -> &mlua::Lua {
        &self.core.lua
    }

    /// Releases the sandbox. The interpreter itself is torn down once the
    /// last proxy created by it is dropped as well.
    pub fn close(self) {
        tracing::debug!(
            live_handles = self.registry_len(),
            steps_used = self.core.budget.steps_used(),
            "sandbox closed"
        );
    }
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("stack", &self.stack.len())
            .field("budget", &self.core.budget.snapshot())
            .finish()
    }
}

/// Chunk names end up in `name:line:` error prefixes, so ':' must not appear.
fn sanitize_chunk_name(name: &str) -> String {
    let name: String = name
        .chars()
        .map(|c| if c == ':' || c.is_control() { '_' } else { c })
        .collect();
    if name.is_empty() {
        lua_limits::DEFAULT_CHUNK_NAME.to_string()
    } else {
        name
    }
}
