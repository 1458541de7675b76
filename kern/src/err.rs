//! Common error-handling support.
//!
//! The error taxonomy itself lives in `abi` so task code can speak it; this
//! module carries the runtime-side record of a fatal failure.

use abi::{Error, TaskId};

/// Record of the failure that brought the system down.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Fatal {
    /// Task whose invocation failed, or `TaskId::SCHEDULER` for failures in
    /// the runtime itself.
    pub task: TaskId,
    /// `Initializing` for bring-up failures, `RunningTask` for failures in
    /// the run phase.
    pub error: Error,
}

impl core::fmt::Display for Fatal {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "task {} fatal: {}", self.task.0, self.error)
    }
}
