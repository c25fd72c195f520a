// Host-side value model of the sandbox boundary.
//
// Scalars are plain data, copied across the boundary. Tables and functions
// never cross: the host only ever sees handles to them (`TableProxy`,
// `CallableRef`) that keep the guest object alive in the sandbox registry.
//
// Numbers follow the Lua 5.4 integer/float split. A float with zero
// fraction that fits i64 is reported as an integer when read back from the
// guest, so `2.0` written by a script shows up as `Integer(2)`.

use std::fmt;

use crate::lua_vm::lua_error::LuaError;
use crate::lua_vm::lua_ref::{CallableRef, TableProxy};

/// A value that crossed (or is about to cross) the sandbox boundary.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Integer(i64),
    Float(f64),
    /// Lua strings are byte strings; no encoding is assumed.
    Text(Vec<u8>),
    TableRef(TableProxy),
    CallableRef(CallableRef),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Integer(_) | Value::Float(_) => "number",
            Value::Text(_) => "string",
            Value::TableRef(_) => "table",
            Value::CallableRef(_) => "function",
        }
    }

    #[inline]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Lua truthiness: only `nil` and `false` are falsy.
    #[inline]
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view. Floats with an exact integer representation qualify.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) => float_to_integer(*f),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Text(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Text as UTF-8, `None` for binary strings and non-strings.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_table(&self) -> Option<&TableProxy> {
        match self {
            Value::TableRef(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&CallableRef> {
        match self {
            Value::CallableRef(c) => Some(c),
            _ => None,
        }
    }

    pub fn into_table(self) -> Option<TableProxy> {
        match self {
            Value::TableRef(t) => Some(t),
            _ => None,
        }
    }

    pub fn into_callable(self) -> Option<CallableRef> {
        match self {
            Value::CallableRef(c) => Some(c),
            _ => None,
        }
    }
}

/// Lua 5.4 float-to-integer rule: exact integral value inside the i64 range.
///
/// `i64::MAX as f64` rounds up to 2^63, which is not representable, hence the
/// half-open upper bound.
#[inline]
pub fn float_to_integer(f: f64) -> Option<i64> {
    if f >= (i64::MIN as f64) && f < -(i64::MIN as f64) && f == (f as i64 as f64) {
        Some(f as i64)
    } else {
        None
    }
}

/// Formats a float the way Lua's `%.14g` does for the common cases.
pub(crate) fn fmt_float(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.is_nan() {
        return write!(f, "{}", if n.is_sign_negative() { "-nan" } else { "nan" });
    }
    if n.is_infinite() {
        return write!(f, "{}", if n > 0.0 { "inf" } else { "-inf" });
    }
    let abs = n.abs();
    if abs != 0.0 && !(1e-4..1e15).contains(&abs) {
        return write!(f, "{n:e}");
    }
    if n.fract() == 0.0 {
        // keep the float marker so 2.0 never prints like the integer 2
        write!(f, "{n:.1}")
    } else {
        write!(f, "{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => {
                let mut buffer = itoa::Buffer::new();
                f.write_str(buffer.format(*i))
            }
            Value::Float(n) => fmt_float(f, *n),
            Value::Text(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Value::TableRef(t) => write!(f, "{t}"),
            Value::CallableRef(c) => write!(f, "{c}"),
        }
    }
}

// ==================== From impls ====================

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                #[inline]
                fn from(i: $t) -> Self {
                    Value::Integer(i64::from(i))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::Float(f64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.as_bytes().to_vec())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s.into_bytes())
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Text(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Text(b)
    }
}

impl From<TableProxy> for Value {
    fn from(t: TableProxy) -> Self {
        Value::TableRef(t)
    }
}

impl From<CallableRef> for Value {
    fn from(c: CallableRef) -> Self {
        Value::CallableRef(c)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Nil, Into::into)
    }
}

/// Values beyond `i64::MAX` have no guest representation.
impl TryFrom<u64> for Value {
    type Error = LuaError;

    fn try_from(n: u64) -> Result<Self, Self::Error> {
        i64::try_from(n).map(Value::Integer).map_err(|_| {
            LuaError::UnsupportedValue(format!("integer {n} does not fit a lua integer"))
        })
    }
}

impl TryFrom<usize> for Value {
    type Error = LuaError;

    fn try_from(n: usize) -> Result<Self, Self::Error> {
        Value::try_from(n as u64)
    }
}

// ==================== TableKey ====================

/// Scalar key for table proxy access.
///
/// Keys are normalized before they reach the guest: a float with an exact
/// integer value addresses the same slot as that integer, while text never
/// aliases a number (`"2"` and `2` are different keys).
#[derive(Debug, Clone, PartialEq)]
pub enum TableKey {
    Integer(i64),
    Float(f64),
    Text(Vec<u8>),
}

impl TableKey {
    /// Collapses integral floats to integers. `-0.0` becomes `0`.
    pub fn normalize(self) -> TableKey {
        match self {
            TableKey::Float(f) => match float_to_integer(f) {
                Some(i) => TableKey::Integer(i),
                None => TableKey::Float(f),
            },
            other => other,
        }
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKey::Integer(i) => {
                let mut buffer = itoa::Buffer::new();
                f.write_str(buffer.format(*i))
            }
            TableKey::Float(n) => fmt_float(f, *n),
            TableKey::Text(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
        }
    }
}

macro_rules! impl_key_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for TableKey {
                #[inline]
                fn from(i: $t) -> Self {
                    TableKey::Integer(i64::from(i))
                }
            }
        )*
    };
}

impl_key_from_int!(i32, i64, u8, u16, u32);

impl From<f64> for TableKey {
    fn from(f: f64) -> Self {
        TableKey::Float(f)
    }
}

impl From<&str> for TableKey {
    fn from(s: &str) -> Self {
        TableKey::Text(s.as_bytes().to_vec())
    }
}

impl From<String> for TableKey {
    fn from(s: String) -> Self {
        TableKey::Text(s.into_bytes())
    }
}

impl From<&[u8]> for TableKey {
    fn from(b: &[u8]) -> Self {
        TableKey::Text(b.to_vec())
    }
}

impl From<Vec<u8>> for TableKey {
    fn from(b: Vec<u8>) -> Self {
        TableKey::Text(b)
    }
}

/// Scalar values that can address a table slot. Used to feed keys returned
/// by iteration back into `get`/`set`.
impl TryFrom<Value> for TableKey {
    type Error = LuaError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Integer(i) => Ok(TableKey::Integer(i)),
            Value::Float(f) => Ok(TableKey::Float(f)),
            Value::Text(b) => Ok(TableKey::Text(b)),
            other => Err(LuaError::UnsupportedValue(format!(
                "{} is not a scalar table key",
                other.type_name()
            ))),
        }
    }
}

impl From<TableKey> for Value {
    fn from(key: TableKey) -> Self {
        match key {
            TableKey::Integer(i) => Value::Integer(i),
            TableKey::Float(f) => Value::Float(f),
            TableKey::Text(b) => Value::Text(b),
        }
    }
}
