//! Internal representation of a task.

use std::sync::atomic::{
    AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering,
};
use std::sync::Mutex;

use abi::{Error, Message, Priority, TaskId, TaskState, SYSTEM_TASK_PREFIX};

use crate::context::TaskContext;
use crate::ring::Ring;
use crate::time::Timestamp;

/// Value of the running-core field when no core is executing the task.
pub const CORE_NONE: u8 = 255;

/// A task's entry point: invoked with a view of the task's own metadata,
/// returns a status. Any non-OK status during the run phase is fatal to the
/// whole system, so entry points are expected to deal with their own
/// recoverable trouble.
pub type TaskFn = Box<dyn FnMut(&TaskContext<'_>) -> Result<(), Error> + Send>;

/// One slot of the task table.
///
/// Fields that are hot on the scheduler path (state, priority, sleep flag,
/// wake deadline, running core) are atomics: TaskManager mutates them while
/// the schedulers read without locks. A reader may observe a value one
/// iteration stale; the per-iteration filter re-evaluates, so this cannot
/// violate correctness.
pub struct Task {
    id: TaskId,
    name: String,
    /// `None` only for the reserved slot 0, the scheduler itself.
    ///
    /// The mutex realizes the serialization the scheduler already
    /// guarantees through the running-core claim: only the claiming core
    /// ever takes it, so a task closure may carry `FnMut` state without
    /// further ceremony.
    entry: Option<Mutex<TaskFn>>,
    state: AtomicU8,
    priority: AtomicU32,
    sleeping: AtomicBool,
    wake_deadline: AtomicU64,
    debug_level: AtomicU8,
    running_core: AtomicU8,
    outbound_core: AtomicU8,
    inbox: Ring<Message>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        name: String,
        priority: Priority,
        entry: Option<TaskFn>,
        mailbox_capacity: usize,
        sleeping: bool,
        debug_level: u8,
    ) -> Self {
        Task {
            id,
            name,
            entry: entry.map(Mutex::new),
            state: AtomicU8::new(TaskState::INIT.0),
            priority: AtomicU32::new(priority.0.max(1)),
            sleeping: AtomicBool::new(sleeping),
            wake_deadline: AtomicU64::new(0),
            debug_level: AtomicU8::new(debug_level),
            running_core: AtomicU8::new(CORE_NONE),
            outbound_core: AtomicU8::new(0),
            inbox: Ring::with_capacity(mailbox_capacity),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for tasks registered by the runtime itself, by the reserved
    /// name prefix.
    pub fn is_system(&self) -> bool {
        self.name.starts_with(SYSTEM_TASK_PREFIX)
    }

    pub fn state(&self) -> TaskState {
        TaskState(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, s: TaskState) {
        self.state.store(s.0, Ordering::Relaxed);
    }

    pub fn priority(&self) -> Priority {
        Priority(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, p: Priority) {
        self.priority.store(p.0.max(1), Ordering::Relaxed);
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::Relaxed)
    }

    pub fn set_sleeping(&self, asleep: bool) {
        self.sleeping.store(asleep, Ordering::Relaxed);
    }

    pub fn wake_deadline(&self) -> Timestamp {
        Timestamp::from(self.wake_deadline.load(Ordering::Relaxed))
    }

    pub fn set_wake_deadline(&self, t: Timestamp) {
        self.wake_deadline.store(t.as_micros(), Ordering::Relaxed);
    }

    pub fn debug_level(&self) -> u8 {
        self.debug_level.load(Ordering::Relaxed)
    }

    pub fn set_debug_level(&self, level: u8) {
        self.debug_level.store(level, Ordering::Relaxed);
    }

    /// The core whose outbound queue this task's sends currently go to.
    /// Assigned by the scheduler immediately before each invocation.
    pub fn outbound_core(&self) -> usize {
        usize::from(self.outbound_core.load(Ordering::Relaxed))
    }

    pub(crate) fn set_outbound_core(&self, core: usize) {
        self.outbound_core.store(core as u8, Ordering::Relaxed);
    }

    pub fn inbox(&self) -> &Ring<Message> {
        &self.inbox
    }

    /// Attempts to make `core` the task's executor. This compare-and-swap
    /// is the guarantee behind "at most one core runs a task at any
    /// moment"; the scheduler's run-pointer comparison is only the cheap
    /// first-level check.
    pub(crate) fn try_claim(&self, core: usize) -> bool {
        self.running_core
            .compare_exchange(
                CORE_NONE,
                core as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub(crate) fn release(&self, core: usize) {
        let _ = self.running_core.compare_exchange(
            core as u8,
            CORE_NONE,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Core currently executing this task, if any.
    pub fn running_core(&self) -> Option<usize> {
        match self.running_core.load(Ordering::Relaxed) {
            CORE_NONE => None,
            c => Some(usize::from(c)),
        }
    }

    /// Runs the entry point once. The caller must hold the running-core
    /// claim. Slot 0 has no entry point and trivially succeeds.
    pub(crate) fn invoke(&self, cx: &TaskContext<'_>) -> Result<(), Error> {
        match &self.entry {
            None => Ok(()),
            Some(entry) => {
                let mut f = match entry.lock() {
                    Ok(f) => f,
                    // A poisoned entry means a previous invocation
                    // panicked; the task cannot be trusted to run again.
                    Err(_) => return Err(Error::RunningTask),
                };
                f(cx)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_task() -> Task {
        Task::new(
            TaskId(3),
            "widget".to_string(),
            Priority::NORMAL,
            None,
            8,
            false,
            0,
        )
    }

    #[test]
    fn claim_is_exclusive() {
        let t = bare_task();
        assert!(t.try_claim(0));
        assert!(!t.try_claim(1));
        assert_eq!(t.running_core(), Some(0));
        t.release(0);
        assert!(t.try_claim(1));
    }

    #[test]
    fn release_by_non_owner_is_ignored() {
        let t = bare_task();
        assert!(t.try_claim(0));
        t.release(1);
        assert_eq!(t.running_core(), Some(0));
    }

    #[test]
    fn system_prefix_detection() {
        let t = Task::new(
            TaskId(1),
            format!("{}postman", SYSTEM_TASK_PREFIX),
            Priority::HIGH,
            None,
            8,
            true,
            0,
        );
        assert!(t.is_system());
        assert!(!bare_task().is_system());
    }
}
