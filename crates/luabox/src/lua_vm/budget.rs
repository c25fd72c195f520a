use std::cell::Cell;

use crate::lua_vm::lua_error::BudgetKind;

/// CPU-step and memory-byte allowance of one sandbox.
///
/// Pure accounting, shared between the sandbox, its [`StepLimiter`] and its
/// [`BoundedAllocator`]. The step counter only ever grows; the byte counter
/// tracks live guest heap, so freed memory is credited back.
///
/// [`StepLimiter`]: super::StepLimiter
/// [`BoundedAllocator`]: super::BoundedAllocator
#[derive(Debug)]
pub struct ResourceBudget {
    step_limit: Option<u64>,
    steps_used: Cell<u64>,
    memory_limit: Cell<Option<usize>>,
    bytes_used: Cell<usize>,
}

/// Point-in-time view of a [`ResourceBudget`]. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub struct BudgetSnapshot {
    pub steps_used: u64,
    pub steps_remaining: Option<u64>,
    pub bytes_used: usize,
    pub bytes_remaining: Option<usize>,
}

impl ResourceBudget {
    pub fn new(step_limit: Option<u64>, memory_limit: Option<usize>) -> Self {
        ResourceBudget {
            step_limit,
            steps_used: Cell::new(0),
            memory_limit: Cell::new(memory_limit),
            bytes_used: Cell::new(0),
        }
    }

    pub fn step_limit(&self) -> Option<u64> {
        self.step_limit
    }

    pub fn steps_used(&self) -> u64 {
        self.steps_used.get()
    }

    pub fn steps_remaining(&self) -> Option<u64> {
        self.step_limit
            .map(|limit| limit.saturating_sub(self.steps_used.get()))
    }

    /// Debits `steps`. Fails once the counter reaches zero; the counter never
    /// goes below zero.
    pub(crate) fn charge_steps(&self, steps: u64) -> Result<(), BudgetKind> {
        let used = self.steps_used.get().saturating_add(steps);
        match self.step_limit {
            Some(limit) if used >= limit => {
                self.steps_used.set(limit);
                Err(BudgetKind::Steps)
            }
            _ => {
                self.steps_used.set(used);
                Ok(())
            }
        }
    }

    pub fn steps_exhausted(&self) -> bool {
        self.steps_remaining() == Some(0)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.memory_limit.get()
    }

    pub(crate) fn set_memory_limit(&self, limit: Option<usize>) {
        self.memory_limit.set(limit);
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used.get()
    }

    pub fn bytes_remaining(&self) -> Option<usize> {
        self.memory_limit
            .get()
            .map(|limit| limit.saturating_sub(self.bytes_used.get()))
    }

    /// Records the current live heap size reported by the allocator.
    pub(crate) fn record_bytes_used(&self, used: usize) {
        self.bytes_used.set(used);
    }

    pub fn memory_exhausted(&self) -> bool {
        self.bytes_remaining() == Some(0)
    }

    /// Fail-fast check performed before any guest execution.
    pub fn ensure_available(&self) -> Result<(), BudgetKind> {
        if self.steps_exhausted() {
            return Err(BudgetKind::Steps);
        }
        if self.memory_exhausted() {
            return Err(BudgetKind::Memory);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            steps_used: self.steps_used(),
            steps_remaining: self.steps_remaining(),
            bytes_used: self.bytes_used(),
            bytes_remaining: self.bytes_remaining(),
        }
    }
}
