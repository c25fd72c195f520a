use std::fmt;

use thiserror::Error;

use crate::lua_vm::lua_ref::RefId;

/// Which half of the budget ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetKind {
    Steps,
    Memory,
}

impl fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetKind::Steps => write!(f, "step"),
            BudgetKind::Memory => write!(f, "memory"),
        }
    }
}

/// Every failure a sandbox operation can report.
///
/// All variants except [`LuaError::InitError`] are scoped to the failing
/// operation: the sandbox stays usable afterwards.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LuaError {
    /// The interpreter could not be constructed.
    #[error("cannot create lua state: {0}")]
    InitError(String),

    /// Source text failed to compile. Lua reports a line but no column.
    #[error("syntax error: {message}")]
    CompileError { message: String, line: Option<u32> },

    /// CPU-step or memory cap hit.
    #[error("{0} budget exceeded")]
    BudgetExceeded(BudgetKind),

    /// Error raised by guest code.
    #[error("{message}")]
    RuntimeError {
        message: String,
        traceback: Option<String>,
    },

    /// Error raised while running an error handler.
    #[error("{0}")]
    ErrorHandlerError(String),

    /// A host value cannot be represented on the guest side.
    #[error("unsupported value: {0}")]
    UnsupportedValue(String),

    /// A guest value cannot be represented on the host side.
    #[error("cannot convert lua type '{0}' to a host value")]
    MarshalError(String),

    /// The registry entry behind a handle was released (or never existed).
    #[error("invalid handle {0}")]
    InvalidHandle(RefId),

    #[error("lua stack is empty")]
    StackUnderflow,

    #[error("lua stack overflow (limit {0})")]
    StackOverflow(usize),

    #[error("cannot read {path}: {message}")]
    Io { path: String, message: String },
}

impl LuaError {
    /// Only a failed bootstrap poisons the sandbox.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LuaError::InitError(_))
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, LuaError::BudgetExceeded(_))
    }

    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        split_traceback(message.into())
    }
}

/// Separates the guest-provided message from the traceback the interpreter
/// appends to it.
fn split_traceback(text: String) -> LuaError {
    const MARKER: &str = "\nstack traceback:";
    match text.find(MARKER) {
        Some(pos) => LuaError::RuntimeError {
            message: text[..pos].to_string(),
            traceback: Some(text[pos + 1..].to_string()),
        },
        None => LuaError::RuntimeError {
            message: text,
            traceback: None,
        },
    }
}

/// What Lua reports when the message handler itself fails.
pub(crate) const ERRERR_MESSAGE: &str = "error in error handling";

/// Error object of an allocation the memory cap denied.
pub(crate) const OUT_OF_MEMORY_MESSAGE: &str = "not enough memory";

/// Extracts the line number from a `chunkname:line: message` string.
pub(crate) fn parse_error_line(message: &str) -> Option<u32> {
    // chunk names produced by the sandbox never contain ':'
    let mut parts = message.splitn(3, ':');
    parts.next()?;
    parts.next()?.trim().parse().ok()
}

impl From<mlua::Error> for LuaError {
    fn from(err: mlua::Error) -> Self {
        match err {
            mlua::Error::SyntaxError { message, .. } => {
                let line = parse_error_line(&message);
                LuaError::CompileError { message, line }
            }
            mlua::Error::MemoryError(_) => LuaError::BudgetExceeded(BudgetKind::Memory),
            mlua::Error::RuntimeError(message) if message.starts_with(ERRERR_MESSAGE) => {
                LuaError::ErrorHandlerError(message)
            }
            mlua::Error::RuntimeError(message) => LuaError::runtime(message),
            mlua::Error::CallbackError { cause, .. } => LuaError::from((*cause).clone()),
            mlua::Error::WithContext { cause, .. } => LuaError::from((*cause).clone()),
            other => LuaError::runtime(other.to_string()),
        }
    }
}
