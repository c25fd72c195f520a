use std::rc::Rc;

use mlua::{HookTriggers, Lua, VmState};

use crate::lua_vm::allocator::BoundedAllocator;
use crate::lua_vm::budget::ResourceBudget;

/// Message carried by the error raised inside the guest when steps run out.
pub(crate) const STEP_BUDGET_MESSAGE: &str = "step budget exceeded";

/// CPU governor of one sandbox.
///
/// Installs an instruction-count hook that fires every `interval` VM
/// instructions and debits that many steps. Once the budget hits zero the
/// hook raises an error inside the guest and re-arms itself to fire on every
/// instruction, so a script that traps the error with `pcall` is stopped
/// again by its very next instruction.
///
/// The limit is cooperative: a single C primitive (pattern matching,
/// `table.concat`, `string.rep`, ...) counts as one instruction and runs to
/// completion between two checkpoints.
#[derive(Debug, Clone)]
pub struct StepLimiter {
    budget: Rc<ResourceBudget>,
    allocator: BoundedAllocator,
    interval: u32,
}

impl StepLimiter {
    pub fn new(budget: Rc<ResourceBudget>, allocator: BoundedAllocator, interval: u32) -> Self {
        StepLimiter {
            budget,
            allocator,
            interval: interval.max(1),
        }
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Arms the hook. Unbounded budgets install nothing.
    pub(crate) fn install(&self, lua: &Lua) {
        if self.budget.step_limit().is_none() {
            return;
        }
        arm(lua, self.clone(), self.interval);
    }

    /// Debits `steps` and reports whether execution may continue.
    pub(crate) fn checkpoint(&self, steps: u64) -> bool {
        self.budget.charge_steps(steps).is_ok()
    }
}

fn arm(lua: &Lua, limiter: StepLimiter, every: u32) {
    let triggers = HookTriggers::new().every_nth_instruction(every);
    lua.set_hook(triggers, move |lua, _debug| {
        limiter.allocator.sync(lua);
        if limiter.checkpoint(u64::from(every)) {
            return Ok(VmState::Continue);
        }
        if every > 1 {
            tracing::warn!(
                steps_used = limiter.budget.steps_used(),
                "step budget exhausted"
            );
            arm(lua, limiter.clone(), 1);
        }
        Err(mlua::Error::RuntimeError(STEP_BUDGET_MESSAGE.to_string()))
    });
}
