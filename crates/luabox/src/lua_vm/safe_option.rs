use crate::lua_vm::lua_limits::{
    DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_CHUNK_NAME, LUAI_MAXSTACK, RESTRICTED_MEMORY_LIMIT,
    RESTRICTED_STEP_LIMIT,
};

/// Guest libraries loaded on top of the base library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LibSet {
    /// Base library only.
    Minimal,
    /// `string`, `table`, `math` and `utf8`.
    #[default]
    Safe,
}

impl LibSet {
    pub(crate) fn std_libs(self) -> mlua::StdLib {
        match self {
            LibSet::Minimal => mlua::StdLib::NONE,
            LibSet::Safe => {
                mlua::StdLib::STRING | mlua::StdLib::TABLE | mlua::StdLib::MATH | mlua::StdLib::UTF8
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxOption {
    /// Maximum live guest heap in bytes, `None` for no cap
    pub memory_limit: Option<usize>,
    /// Maximum VM instructions over the sandbox lifetime, `None` for no cap
    pub step_limit: Option<u64>,
    /// Instructions between two step checkpoints
    pub checkpoint_interval: u32,
    /// Capacity of the host exchange stack
    pub max_stack_size: usize,
    pub libs: LibSet,
    pub chunk_name: String,
}

impl Default for SandboxOption {
    fn default() -> Self {
        Self {
            memory_limit: None,
            step_limit: None,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            max_stack_size: LUAI_MAXSTACK,
            libs: LibSet::Safe,
            chunk_name: DEFAULT_CHUNK_NAME.to_string(),
        }
    }
}

impl SandboxOption {
    /// A restrictive sandbox suitable for untrusted scripts.
    pub fn restricted() -> Self {
        Self {
            memory_limit: Some(RESTRICTED_MEMORY_LIMIT),
            step_limit: Some(RESTRICTED_STEP_LIMIT),
            ..Self::default()
        }
    }

    /// No caps at all (use with caution).
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn with_memory_limit(mut self, limit: Option<usize>) -> Self {
        self.memory_limit = limit;
        self
    }

    pub fn with_step_limit(mut self, limit: Option<u64>) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u32) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    pub fn with_libs(mut self, libs: LibSet) -> Self {
        self.libs = libs;
        self
    }

    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Interval actually used by the step hook.
    pub(crate) fn effective_interval(&self) -> u32 {
        self.checkpoint_interval.max(1)
    }
}
