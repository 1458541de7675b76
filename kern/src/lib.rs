//! Cooperative dual-core micro-runtime.
//!
//! User work is expressed as short-running tasks that two scheduler
//! instances — one per core — invoke in turn. Tasks never block, never
//! preempt each other, and talk to each other exclusively through bounded
//! message queues: each task owns an inbound mailbox, each core owns an
//! outbound staging queue, and a Postman task moves records from the
//! latter to the former. Around that spine sit a priority-weighted pass
//! scheduler, an interrupt demultiplexer, a software-timer service, a
//! watchdog, and an event log.
//!
//! On hardware the two schedulers would own the two cores outright; on a
//! hosted build each one gets an OS thread, which keeps the whole system
//! runnable (and testable) on a workstation. The synchronization story is
//! identical either way: ring-buffer index handoffs, a handful of atomic
//! per-task fields, and one compare-and-swap that keeps the cores from
//! running the same task at once.
//!
//! # Deliberately simple
//!
//! The algorithms here are naive on purpose. The task table is small and
//! fixed after bring-up, traversals are linear, and timer and
//! subscription collections are flat vectors scanned whole. None of this
//! is worth optimizing until a real workload says so.

pub mod board;
pub mod context;
pub mod err;
pub mod eventlog;
pub mod ring;
pub mod startup;
pub mod system;
pub mod task;
pub mod time;

mod irq;
mod payload;
mod postman;
mod sched;
mod taskmgr;
mod timer;
mod watchdog;

// Re-export the shared ABI wholesale; task code should not need to name
// two crates for one system.
pub use abi::*;

pub use crate::board::{Board, NullBoard};
pub use crate::context::TaskContext;
pub use crate::err::Fatal;
pub use crate::eventlog::{LogSink, MemorySink, StdSink};
pub use crate::startup::{IrqSender, Runtime, SystemHandle};
pub use crate::system::{Config, SysTasks, System};
pub use crate::time::{Clock, ManualClock, Timestamp};
