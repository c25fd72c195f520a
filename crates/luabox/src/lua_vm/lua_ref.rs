/// Lua reference mechanism (similar to luaL_ref/luaL_unref in C API)
///
/// Guest tables and functions handed to the host are pinned in the registry
/// of the interpreter and addressed by a [`RefId`]. The same guest object
/// always maps to the same handle while it is registered; every promotion
/// bumps a refcount and the entry goes away once the count drops to zero.
use std::fmt;
use std::rc::Rc;

use ahash::AHashMap;
use mlua::{Lua, RegistryKey};

use crate::lua_value::{TableKey, Value, ValueBridge};
use crate::lua_vm::lua_error::LuaError;
use crate::lua_vm::sandbox_core::SandboxCore;
use crate::lua_vm::{LuaResult, ResultMode};

/// A handle into the sandbox registry.
///
/// Handles are never reused within one sandbox, so a stale handle is always
/// reported as [`LuaError::InvalidHandle`] instead of aliasing a newer entry.
pub type RefId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Table,
    Function,
}

struct RegistryEntry {
    key: RegistryKey,
    kind: RefKind,
    /// Address of the guest object, stable while the entry pins it
    identity: usize,
    refcount: usize,
}

/// Refcounted, identity-deduplicated map from handles to pinned guest objects.
pub struct TableRegistry {
    entries: AHashMap<RefId, RegistryEntry>,
    by_identity: AHashMap<usize, RefId>,
    next_ref_id: RefId,
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TableRegistry {
    pub fn new() -> Self {
        TableRegistry {
            entries: AHashMap::new(),
            by_identity: AHashMap::new(),
            // 0 is never handed out
            next_ref_id: 1,
        }
    }

    /// Pins `value` (a table or function) and returns its handle. Registering
    /// an object that is already pinned returns the existing handle and
    /// increments its refcount.
    pub fn register(&mut self, lua: &Lua, value: &mlua::Value) -> LuaResult<RefId> {
        let (identity, kind) = match value {
            mlua::Value::Table(t) => (t.to_pointer() as usize, RefKind::Table),
            mlua::Value::Function(f) => (f.to_pointer() as usize, RefKind::Function),
            other => return Err(LuaError::MarshalError(other.type_name().to_string())),
        };

        if let Some(&ref_id) = self.by_identity.get(&identity)
            && let Some(entry) = self.entries.get_mut(&ref_id)
        {
            entry.refcount += 1;
            return Ok(ref_id);
        }

        let key = lua.create_registry_value(value.clone())?;
        let ref_id = self.next_ref_id;
        self.next_ref_id += 1;
        self.entries.insert(
            ref_id,
            RegistryEntry {
                key,
                kind,
                identity,
                refcount: 1,
            },
        );
        self.by_identity.insert(identity, ref_id);
        Ok(ref_id)
    }

    /// Adds one owner to an existing entry.
    pub fn retain(&mut self, ref_id: RefId) -> LuaResult<()> {
        let entry = self
            .entries
            .get_mut(&ref_id)
            .ok_or(LuaError::InvalidHandle(ref_id))?;
        entry.refcount += 1;
        Ok(())
    }

    /// Drops one owner; unpins the guest object when none are left.
    pub fn release(&mut self, lua: &Lua, ref_id: RefId) -> LuaResult<()> {
        let entry = self
            .entries
            .get_mut(&ref_id)
            .ok_or(LuaError::InvalidHandle(ref_id))?;
        entry.refcount -= 1;
        if entry.refcount > 0 {
            return Ok(());
        }
        if let Some(entry) = self.entries.remove(&ref_id) {
            self.by_identity.remove(&entry.identity);
            lua.remove_registry_value(entry.key)?;
        }
        Ok(())
    }

    /// The pinned guest object behind `ref_id`.
    pub fn resolve(&self, lua: &Lua, ref_id: RefId) -> LuaResult<mlua::Value> {
        let entry = self
            .entries
            .get(&ref_id)
            .ok_or(LuaError::InvalidHandle(ref_id))?;
        Ok(lua.registry_value::<mlua::Value>(&entry.key)?)
    }

    pub fn kind(&self, ref_id: RefId) -> Option<RefKind> {
        self.entries.get(&ref_id).map(|e| e.kind)
    }

    pub fn refcount(&self, ref_id: RefId) -> Option<usize> {
        self.entries.get(&ref_id).map(|e| e.refcount)
    }

    pub fn contains(&self, ref_id: RefId) -> bool {
        self.entries.contains_key(&ref_id)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for TableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableRegistry")
            .field("entries", &self.entries.len())
            .field("next_ref_id", &self.next_ref_id)
            .finish()
    }
}

// ============================================================================
// TableProxy
// ============================================================================

/// A host handle to a guest table.
///
/// Holds one registry reference: cloning adds an owner, dropping releases
/// one. All access is raw (no metamethods), so it never runs guest code and
/// keeps working after the step budget is spent. Writes still allocate and
/// are subject to the memory cap.
///
/// `!Send + !Sync`: a proxy belongs to the thread of its sandbox.
pub struct TableProxy {
    handle: RefId,
    core: Rc<SandboxCore>,
}

impl TableProxy {
    /// Wraps an already-registered handle; takes over one owner.
    pub(crate) fn from_raw(core: Rc<SandboxCore>, handle: RefId) -> Self {
        TableProxy { handle, core }
    }

    pub(crate) fn core(&self) -> &Rc<SandboxCore> {
        &self.core
    }

    fn table(&self) -> LuaResult<mlua::Table> {
        self.core.resolve_table(self.handle)
    }

    fn bridge(&self) -> ValueBridge<'_> {
        ValueBridge::new(&self.core)
    }

    // ==================== Read ====================

    /// Raw read; absent keys yield `Nil`.
    pub fn get(&self, key: impl Into<TableKey>) -> LuaResult<Value> {
        let table = self.table()?;
        let bridge = self.bridge();
        let key = bridge.key_to_guest(key.into(), false)?;
        let value = self
            .core
            .access(|_| table.raw_get::<mlua::Value>(key))?;
        bridge.from_guest(value)
    }

    /// Whether `key` maps to a non-nil value.
    pub fn contains_key(&self, key: impl Into<TableKey>) -> LuaResult<bool> {
        Ok(!self.get(key)?.is_nil())
    }

    /// Raw border of the sequence part, like `rawlen`. Any border may be
    /// reported when the table has holes.
    pub fn len(&self) -> LuaResult<usize> {
        Ok(self.table()?.raw_len())
    }

    pub fn is_empty(&self) -> LuaResult<bool> {
        Ok(self.keys()?.next().is_none())
    }

    // ==================== Write ====================

    /// Raw write. Setting `Nil` deletes the key. NaN keys are rejected.
    pub fn set(&self, key: impl Into<TableKey>, value: impl Into<Value>) -> LuaResult<()> {
        let table = self.table()?;
        let bridge = self.bridge();
        let key = bridge.key_to_guest(key.into(), true)?;
        let value = bridge.to_guest(&value.into())?;
        self.core.access(|_| table.raw_set(key, value))
    }

    /// Appends after the current border (like `table.insert(t, v)`).
    pub fn push(&self, value: impl Into<Value>) -> LuaResult<()> {
        let border = self.len()?;
        let next = i64::try_from(border + 1)
            .map_err(|_| LuaError::UnsupportedValue("table length overflow".to_string()))?;
        self.set(next, value)
    }

    // ==================== Iteration ====================

    /// Lazy iterator over the keys, in the guest's `next` order. Each item
    /// is fetched on demand, so keys that are themselves tables are only
    /// promoted to handles as they are reached.
    pub fn keys(&self) -> LuaResult<Keys> {
        Ok(Keys {
            core: self.core.clone(),
            table: self.table()?,
            cursor: Cursor::Start,
        })
    }

    /// Snapshot of all key/value pairs.
    pub fn pairs(&self) -> LuaResult<Vec<(Value, Value)>> {
        let table = self.table()?;
        let bridge = self.bridge();
        let mut pairs = Vec::new();
        let mut prev = mlua::Value::Nil;
        while let Some((key, value)) = self.core.next_entry(&table, prev)? {
            prev = key.clone();
            pairs.push((bridge.from_guest(key)?, bridge.from_guest(value)?));
        }
        Ok(pairs)
    }

    // ==================== Handle ====================

    pub fn handle(&self) -> RefId {
        self.handle
    }

    /// Whether the registry entry behind this proxy is still live.
    pub fn is_valid(&self) -> bool {
        self.core
            .registry
            .try_borrow()
            .map(|registry| registry.contains(self.handle))
            .unwrap_or(false)
    }

    /// Calls the table through its `__call` metamethod.
    pub fn call(&self, args: &[Value], mode: ResultMode) -> LuaResult<Vec<Value>> {
        let callee = self.core.resolve(self.handle)?;
        self.core.call_values(callee, args, mode)
    }
}

impl Clone for TableProxy {
    fn clone(&self) -> Self {
        self.core.retain(self.handle);
        TableProxy {
            handle: self.handle,
            core: self.core.clone(),
        }
    }
}

impl Drop for TableProxy {
    fn drop(&mut self) {
        self.core.release(self.handle);
    }
}

/// Identity equality: same sandbox, same guest table.
impl PartialEq for TableProxy {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core) && self.handle == other.handle
    }
}

impl fmt::Debug for TableProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TableProxy(ref_id={})", self.handle)
    }
}

impl fmt::Display for TableProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<LuaTableRef ref:{}>", self.handle)
    }
}

// ============================================================================
// CallableRef
// ============================================================================

/// A host handle to a guest function. Same ownership rules as [`TableProxy`].
pub struct CallableRef {
    handle: RefId,
    core: Rc<SandboxCore>,
}

impl CallableRef {
    pub(crate) fn from_raw(core: Rc<SandboxCore>, handle: RefId) -> Self {
        CallableRef { handle, core }
    }

    pub(crate) fn core(&self) -> &Rc<SandboxCore> {
        &self.core
    }

    /// Calls the function with the sandbox budget in force.
    pub fn call(&self, args: &[Value], mode: ResultMode) -> LuaResult<Vec<Value>> {
        let callee = self.core.resolve(self.handle)?;
        self.core.call_values(callee, args, mode)
    }

    /// First result of the call, or `Nil` if it returned nothing.
    pub fn call1(&self, args: &[Value]) -> LuaResult<Value> {
        let mut results = self.call(args, ResultMode::Exactly(1))?;
        Ok(results.pop().unwrap_or_default())
    }

    pub fn handle(&self) -> RefId {
        self.handle
    }

    pub fn is_valid(&self) -> bool {
        self.core
            .registry
            .try_borrow()
            .map(|registry| registry.contains(self.handle))
            .unwrap_or(false)
    }
}

impl Clone for CallableRef {
    fn clone(&self) -> Self {
        self.core.retain(self.handle);
        CallableRef {
            handle: self.handle,
            core: self.core.clone(),
        }
    }
}

impl Drop for CallableRef {
    fn drop(&mut self) {
        self.core.release(self.handle);
    }
}

impl PartialEq for CallableRef {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.core, &other.core) && self.handle == other.handle
    }
}

impl fmt::Debug for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallableRef(ref_id={})", self.handle)
    }
}

impl fmt::Display for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<LuaFunctionRef ref:{}>", self.handle)
    }
}

// ============================================================================
// Keys
// ============================================================================

enum Cursor {
    Start,
    After(mlua::Value),
    Done,
}

/// Lazy key iterator of a [`TableProxy`]. Restartable via [`Keys::rewind`].
///
/// Assigning to existing keys while iterating is fine; adding new keys is not
/// (same rule as Lua's `next`) and may end the iteration with an error item.
pub struct Keys {
    core: Rc<SandboxCore>,
    table: mlua::Table,
    cursor: Cursor,
}

impl Keys {
    /// Starts over from the first key.
    pub fn rewind(&mut self) {
        self.cursor = Cursor::Start;
    }
}

impl Iterator for Keys {
    type Item = LuaResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        let prev = match std::mem::replace(&mut self.cursor, Cursor::Done) {
            Cursor::Start => mlua::Value::Nil,
            Cursor::After(key) => key,
            Cursor::Done => return None,
        };
        match self.core.next_entry(&self.table, prev) {
            Ok(Some((key, _))) => {
                self.cursor = Cursor::After(key.clone());
                Some(ValueBridge::new(&self.core).from_guest(key))
            }
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("done", &matches!(self.cursor, Cursor::Done))
            .finish()
    }
}
