//! System bring-up.
//!
//! A `Runtime` is the system under construction: registration is open,
//! nothing runs. `start` freezes the task table, constructs the shared
//! `System`, and spawns one scheduler thread per enabled core. The move
//! semantics are the registration rule of the lifecycle — once `start`
//! has consumed the builder there is no way left to register anything.

use std::sync::Arc;
use std::thread;

use abi::{Error, EventMask, Priority, TaskId, SYSTEM_TASK_PREFIX};

use crate::board::{Board, NullBoard};
use crate::context::TaskContext;
use crate::err::Fatal;
use crate::eventlog::{self, LogSink, StdSink};
use crate::sched::Scheduler;
use crate::system::{Config, SysTasks, System, NUM_CORES};
use crate::task::{Task, TaskFn};
use crate::time::Clock;
use crate::{irq, postman, taskmgr, timer, watchdog};

struct Registration {
    name: String,
    priority: Priority,
    entry: Option<TaskFn>,
    mailbox_capacity: usize,
    sleeping: bool,
}

pub struct Runtime {
    cfg: Config,
    clock: Clock,
    board: Box<dyn Board>,
    sink: Box<dyn LogSink>,
    regs: Vec<Registration>,
    sys_tasks: SysTasks,
}

impl Runtime {
    /// Builds a runtime with the system task set already registered.
    /// Registration order is the id order: slot 0 is the scheduler
    /// itself, the runtime's tasks follow, and application tasks take the
    /// ids after that.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        cfg.validate()?;
        let mailbox = cfg.mailbox_capacity;
        let high = Priority(cfg.priority_high_us);
        let normal = Priority(cfg.priority_normal_us);
        let low = Priority(cfg.priority_low_us);
        // TaskManager's mailbox also absorbs Postman's wake-up bursts, so
        // it is sized like a staging queue, not like a mailbox.
        let taskmgr_mailbox = cfg.core_queue_capacity;
        let event_log_mailbox = cfg.event_log_capacity;
        let disable_scheduler = cfg.disable_scheduler;
        let disable_watchdog = cfg.disable_watchdog;

        let mut rt = Runtime {
            cfg,
            clock: Clock::monotonic(),
            board: Box::new(NullBoard),
            sink: Box::new(StdSink),
            regs: Vec::new(),
            sys_tasks: SysTasks {
                task_manager: TaskId::SCHEDULER,
                postman: TaskId::SCHEDULER,
                irq_demux: TaskId::SCHEDULER,
                event_log: TaskId::SCHEDULER,
                timer: None,
                watchdog: None,
            },
        };

        // Slot 0: the scheduler, which has no function of its own.
        rt.add("sys.sched", high, None, mailbox, true)?;

        let task_manager =
            rt.add_system("taskmgr", high, taskmgr::step, taskmgr_mailbox, false)?;
        let postman_id =
            rt.add_system("postman", high, postman::step, mailbox, true)?;
        let irq_demux =
            rt.add_system("irqdemux", high, irq::step, mailbox, false)?;
        let timer_id = if disable_scheduler {
            None
        } else {
            Some(rt.add_system("timer", high, timer::step, mailbox, true)?)
        };
        let watchdog_id = if disable_watchdog {
            None
        } else {
            Some(rt.add_system("watchdog", low, watchdog::step, mailbox, false)?)
        };
        let event_log = rt.add_system(
            "eventlog",
            normal,
            eventlog::step,
            event_log_mailbox,
            false,
        )?;

        rt.sys_tasks = SysTasks {
            task_manager,
            postman: postman_id,
            irq_demux,
            event_log,
            timer: timer_id,
            watchdog: watchdog_id,
        };
        Ok(rt)
    }

    /// Registers an application task. The reserved name prefix is refused;
    /// over-long names are truncated.
    pub fn register<F>(
        &mut self,
        name: &str,
        priority: Priority,
        entry: F,
    ) -> Result<TaskId, Error>
    where
        F: FnMut(&TaskContext<'_>) -> Result<(), Error> + Send + 'static,
    {
        if name.starts_with(SYSTEM_TASK_PREFIX) {
            return Err(Error::InvalidOperation);
        }
        self.add(
            name,
            priority,
            Some(Box::new(entry)),
            self.cfg.mailbox_capacity,
            false,
        )
    }

    /// Finds an already registered task by name.
    pub fn lookup(&self, name: &str) -> Option<TaskId> {
        self.regs
            .iter()
            .position(|r| r.name == name)
            .map(|i| TaskId(i as u8))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Replaces the default monotonic clock (tests and simulators).
    pub fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    pub fn set_board(&mut self, board: Box<dyn Board>) {
        self.board = board;
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.sink = sink;
    }

    fn add_system(
        &mut self,
        name: &str,
        priority: Priority,
        entry: fn(&TaskContext<'_>) -> Result<(), Error>,
        mailbox_capacity: usize,
        sleeping: bool,
    ) -> Result<TaskId, Error> {
        let name = format!("{}{}", SYSTEM_TASK_PREFIX, name);
        self.add(
            &name,
            priority,
            Some(Box::new(entry)),
            mailbox_capacity,
            sleeping,
        )
    }

    fn add(
        &mut self,
        name: &str,
        priority: Priority,
        entry: Option<TaskFn>,
        mailbox_capacity: usize,
        sleeping: bool,
    ) -> Result<TaskId, Error> {
        if self.regs.len() >= self.cfg.max_tasks {
            return Err(Error::TooManyTasks);
        }
        let mut name = name.to_string();
        if name.len() > self.cfg.max_task_name_len {
            let mut end = self.cfg.max_task_name_len;
            while !name.is_char_boundary(end) {
                end -= 1;
            }
            name.truncate(end);
        }
        let id = TaskId(self.regs.len() as u8);
        self.regs.push(Registration {
            name,
            priority,
            entry,
            mailbox_capacity,
            sleeping,
        });
        Ok(id)
    }

    /// Freezes the table and brings the cores up. From here on the system
    /// owns itself; the returned handle is for watching and stopping it.
    pub fn start(self) -> Result<SystemHandle, Error> {
        let Runtime {
            cfg,
            clock,
            board,
            sink,
            regs,
            sys_tasks,
        } = self;
        let debug_level = cfg.debug_level;
        let tasks: Vec<Task> = regs
            .into_iter()
            .enumerate()
            .map(|(index, r)| {
                Task::new(
                    TaskId(index as u8),
                    r.name,
                    r.priority,
                    r.entry,
                    r.mailbox_capacity,
                    r.sleeping,
                    debug_level,
                )
            })
            .collect();

        let single_core = cfg.disable_second_core || cfg.disable_scheduler;
        let system = Arc::new(System::new(
            cfg,
            tasks.into_boxed_slice(),
            sys_tasks,
            clock,
            board,
            sink,
        ));

        let cores = if single_core { 1 } else { NUM_CORES };
        let mut joins = Vec::with_capacity(cores);
        for core in 0..cores {
            let sys = Arc::clone(&system);
            let handle = thread::Builder::new()
                .name(format!("core{}", core))
                .spawn(move || Scheduler::new(sys, core).run())
                .map_err(|_| Error::Initializing)?;
            joins.push(handle);
        }
        Ok(SystemHandle {
            sys: system,
            joins,
        })
    }
}

/// A running system, as seen from outside.
pub struct SystemHandle {
    sys: Arc<System>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl SystemHandle {
    pub fn system(&self) -> &Arc<System> {
        &self.sys
    }

    /// Handle for injecting hardware interrupts; cheap to clone and hand
    /// to capture shims.
    pub fn irq(&self) -> IrqSender {
        IrqSender {
            sys: Arc::clone(&self.sys),
        }
    }

    /// External shutdown request.
    pub fn stop(&self) {
        self.sys.request_stop();
    }

    /// Waits for both cores to park. A clean shutdown returns `Ok`; a
    /// fatal task failure (or a panicked core) is reported here.
    pub fn join(self) -> Result<(), Fatal> {
        let mut panicked = false;
        for handle in self.joins {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        if let Some(fatal) = self.sys.fatal() {
            return Err(fatal);
        }
        if panicked {
            return Err(Fatal {
                task: TaskId::SCHEDULER,
                error: Error::RunningTask,
            });
        }
        Ok(())
    }
}

/// Entry point for hardware (or simulated) interrupt capture. `raise` is
/// non-blocking and safe from any thread.
#[derive(Clone)]
pub struct IrqSender {
    sys: Arc<System>,
}

impl IrqSender {
    pub fn raise(&self, gpio: u8, events: EventMask) {
        self.sys.raise_irq(gpio, events);
    }
}
