//! `ValueBridge`: conversion between host [`Value`]s and guest values.
//!
//! # Host to guest
//! - scalars are copied; text becomes a guest byte string
//! - `TableRef` / `CallableRef` resolve to the pinned guest object, and must
//!   belong to the same sandbox
//!
//! # Guest to host
//! - integral floats inside the i64 range read back as `Integer`
//! - tables and functions are promoted to handles (registry refcount + 1)
//! - userdata, threads and light userdata are rejected with `MarshalError`
//!
//! No operation here runs guest code.

use std::rc::Rc;

use mlua::MultiValue;

use crate::lua_value::lua_value::{TableKey, Value, float_to_integer};
use crate::lua_vm::lua_error::{BudgetKind, LuaError};
use crate::lua_vm::lua_ref::{CallableRef, TableProxy};
use crate::lua_vm::sandbox_core::SandboxCore;
use crate::lua_vm::LuaResult;

/// Converter bound to one sandbox.
pub(crate) struct ValueBridge<'a> {
    core: &'a Rc<SandboxCore>,
}

impl<'a> ValueBridge<'a> {
    pub(crate) fn new(core: &'a Rc<SandboxCore>) -> Self {
        ValueBridge { core }
    }

    pub(crate) fn to_guest(&self, value: &Value) -> LuaResult<mlua::Value> {
        match value {
            Value::Nil => Ok(mlua::Value::Nil),
            Value::Bool(b) => Ok(mlua::Value::Boolean(*b)),
            Value::Integer(i) => Ok(mlua::Value::Integer(*i)),
            Value::Float(f) => Ok(mlua::Value::Number(*f)),
            Value::Text(bytes) => self.text_to_guest(bytes),
            Value::TableRef(proxy) => {
                self.check_owner(proxy.core(), "table")?;
                self.core.resolve(proxy.handle())
            }
            Value::CallableRef(callable) => {
                self.check_owner(callable.core(), "function")?;
                self.core.resolve(callable.handle())
            }
        }
    }

    pub(crate) fn from_guest(&self, value: mlua::Value) -> LuaResult<Value> {
        match value {
            mlua::Value::Nil => Ok(Value::Nil),
            mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
            mlua::Value::Integer(i) => Ok(Value::Integer(i)),
            mlua::Value::Number(f) => Ok(number_from_guest(f)),
            mlua::Value::String(s) => Ok(Value::Text(s.as_bytes().to_vec())),
            mlua::Value::Table(_) => {
                let handle = self.core.register(&value)?;
                Ok(Value::TableRef(TableProxy::from_raw(self.core.clone(), handle)))
            }
            mlua::Value::Function(_) => {
                let handle = self.core.register(&value)?;
                Ok(Value::CallableRef(CallableRef::from_raw(
                    self.core.clone(),
                    handle,
                )))
            }
            other => Err(LuaError::MarshalError(other.type_name().to_string())),
        }
    }

    /// Normalizes and converts a table key. NaN can be read (always absent)
    /// but never written.
    pub(crate) fn key_to_guest(&self, key: TableKey, for_write: bool) -> LuaResult<mlua::Value> {
        match key.normalize() {
            TableKey::Integer(i) => Ok(mlua::Value::Integer(i)),
            TableKey::Float(f) if f.is_nan() && for_write => Err(LuaError::UnsupportedValue(
                "table index is NaN".to_string(),
            )),
            TableKey::Float(f) => Ok(mlua::Value::Number(f)),
            TableKey::Text(bytes) => self.text_to_guest(&bytes),
        }
    }

    pub(crate) fn args_to_guest(&self, args: &[Value]) -> LuaResult<MultiValue> {
        let values = args
            .iter()
            .map(|arg| self.to_guest(arg))
            .collect::<LuaResult<Vec<_>>>()?;
        Ok(MultiValue::from_vec(values))
    }

    pub(crate) fn results_from_guest(&self, results: MultiValue) -> LuaResult<Vec<Value>> {
        results
            .into_iter()
            .map(|value| self.from_guest(value))
            .collect()
    }

    fn text_to_guest(&self, bytes: &[u8]) -> LuaResult<mlua::Value> {
        if !self.core.allocator.admits(bytes.len()) {
            return Err(LuaError::BudgetExceeded(BudgetKind::Memory));
        }
        let s = self.core.access(|lua| lua.create_string(bytes))?;
        Ok(mlua::Value::String(s))
    }

    fn check_owner(&self, owner: &Rc<SandboxCore>, what: &str) -> LuaResult<()> {
        if Rc::ptr_eq(owner, self.core) {
            Ok(())
        } else {
            Err(LuaError::UnsupportedValue(format!(
                "{what} belongs to another sandbox"
            )))
        }
    }
}

/// Applies the integer-float rule to a guest float.
#[inline]
pub(crate) fn number_from_guest(f: f64) -> Value {
    match float_to_integer(f) {
        Some(i) => Value::Integer(i),
        None => Value::Float(f),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_from_guest() {
        assert_eq!(number_from_guest(3.0), Value::Integer(3));
        assert_eq!(number_from_guest(-0.0), Value::Integer(0));
        assert_eq!(number_from_guest(0.25), Value::Float(0.25));
        assert_eq!(number_from_guest(1e300), Value::Float(1e300));
        assert!(matches!(number_from_guest(f64::NAN), Value::Float(f) if f.is_nan()));
    }
}
