use crate::virtual_machine::errors::VMError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Sizing of a [`Machine`](super::Machine).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Total registers, globals included.
    pub stack_size: usize,
    /// Maximum call depth, also the maximum number of open collector frames.
    pub frame_limit: usize,
    /// Registers reserved for globals at the bottom of the stack.
    pub global_count: usize,
    /// Maximum number of live heap allocations.
    pub heap_limit: usize,
    /// Released allocations kept for reuse.
    pub free_pool_limit: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stack_size: 4096,
            frame_limit: 256,
            global_count: 64,
            heap_limit: 1 << 20,
            free_pool_limit: 256,
        }
    }
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), VMError> {
        let reason = if self.stack_size == 0 {
            "stack size must be positive"
        } else if self.global_count >= self.stack_size {
            "globals must leave room for locals"
        } else if self.frame_limit == 0 {
            "frame limit must be positive"
        } else if self.heap_limit == 0 {
            "heap limit must be positive"
        } else {
            return Ok(());
        };
        Err(VMError::InvalidConfig { reason })
    }
}

/// Cross-thread cancellation flag checked before every instruction fetch.
#[derive(Clone, Debug, Default)]
pub struct HaltHandle(Arc<AtomicBool>);

impl HaltHandle {
    /// Asks the machine to stop with `CANCELLED` at the next fetch.
    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Return address saved by `CALL`.
#[derive(Clone, Copy, Debug)]
pub(super) struct CallFrame {
    pub(super) return_ip: usize,
}
