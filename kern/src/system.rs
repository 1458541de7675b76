//! The system record: configuration, the task table, the queue fabric, and
//! everything both scheduler instances share.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use abi::{
    EventMask, Message, SysState, TaskId, MAX_TASKS_LIMIT,
};

use crate::board::Board;
use crate::err::Fatal;
use crate::eventlog::LogSink;
use crate::irq::{IrqEvent, IrqTable};
use crate::payload::PayloadStore;
use crate::ring::Ring;
use crate::task::Task;
use crate::time::{Clock, Timestamp};
use crate::timer::TimerQueue;
use crate::watchdog::WatchdogState;

/// Number of hardware cores the runtime plans for.
pub const NUM_CORES: usize = 2;

/// Runtime configuration. All keys are init-time; the `Default` values are
/// the canonical ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Task-table capacity, including the reserved slot 0. At most 250.
    pub max_tasks: usize,
    /// Names longer than this are truncated at registration.
    pub max_task_name_len: usize,
    /// Priority ceiling of the "high" pass, in microseconds.
    pub priority_high_us: u32,
    /// Priority ceiling of the "normal" pass, in microseconds.
    pub priority_normal_us: u32,
    /// Priority ceiling of the "low" pass, in microseconds.
    pub priority_low_us: u32,
    /// Pause before the Init pass begins (console attach time on real
    /// boards).
    pub startup_delay_ms: u64,
    /// Slot count of each task's inbound mailbox.
    pub mailbox_capacity: usize,
    /// Slot count of each core's outbound staging queue.
    pub core_queue_capacity: usize,
    /// Slot count of the interrupt inbound queue.
    pub interrupt_queue_capacity: usize,
    /// Slot count of the event log's enlarged mailbox.
    pub event_log_capacity: usize,
    /// Stored log text is truncated to this many bytes.
    pub event_log_entry_max_bytes: usize,
    /// Interval between watchdog liveness sweeps.
    pub watchdog_check_interval_us: u64,
    /// An echo later than this after its ping is reported.
    pub watchdog_timeout_us: u64,
    /// Default per-task debug verbosity.
    pub debug_level: u8,
    /// Base duration of the collision back-off busy wait.
    pub collision_spin_us: u64,
    /// Mailbox reads a single task invocation may perform.
    pub max_recv_per_run: u32,
    /// Records Postman moves per invocation.
    pub postman_batch: usize,
    /// Captured interrupts the demultiplexer drains per invocation.
    pub irq_batch: usize,
    /// Requests TaskManager (and the other mailbox-driven services) handle
    /// per invocation.
    pub taskmgr_batch: usize,
    /// Treat every priority as equal: plain round-robin passes.
    pub disable_priorities: bool,
    /// Run each task once per cycle with no planning at all, on one core,
    /// without the software timer.
    pub disable_scheduler: bool,
    /// Do not bring up core 1.
    pub disable_second_core: bool,
    /// Do not register the watchdog.
    pub disable_watchdog: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_tasks: 32,
            max_task_name_len: 24,
            priority_high_us: 2_500,
            priority_normal_us: 5_000,
            priority_low_us: 10_000,
            startup_delay_ms: 0,
            mailbox_capacity: 32,
            core_queue_capacity: 256,
            interrupt_queue_capacity: 64,
            event_log_capacity: 128,
            event_log_entry_max_bytes: 256,
            watchdog_check_interval_us: 30_000_000,
            watchdog_timeout_us: 5_000_000,
            debug_level: 0,
            collision_spin_us: 4,
            max_recv_per_run: 16,
            postman_batch: 64,
            irq_batch: 32,
            taskmgr_batch: 64,
            disable_priorities: false,
            disable_scheduler: false,
            disable_second_core: false,
            disable_watchdog: false,
        }
    }
}

impl Config {
    /// Rejects configurations the runtime cannot honor.
    pub fn validate(&self) -> Result<(), abi::Error> {
        let ok = self.max_tasks >= 2
            && self.max_tasks <= MAX_TASKS_LIMIT
            && self.mailbox_capacity >= 2
            && self.core_queue_capacity >= 2
            && self.interrupt_queue_capacity >= 2
            && self.event_log_capacity >= 2
            && self.priority_high_us > 0
            && self.priority_normal_us >= self.priority_high_us
            && self.priority_low_us >= self.priority_normal_us
            && self.max_recv_per_run >= 1
            && self.postman_batch >= 1
            && self.irq_batch >= 1
            && self.taskmgr_batch >= 1;
        if ok {
            Ok(())
        } else {
            Err(abi::Error::Initializing)
        }
    }
}

/// Per-core shared state.
pub struct CoreState {
    /// Staging queue for messages sent by whatever task is running on this
    /// core. Drained by Postman.
    pub(crate) outbound: Ring<Message>,
    /// Task id this core's scheduler is currently considering. 0 (the
    /// scheduler's own id) doubles as "parked".
    pub(crate) run_pointer: AtomicUsize,
}

impl CoreState {
    fn new(queue_capacity: usize) -> Self {
        CoreState {
            outbound: Ring::with_capacity(queue_capacity),
            run_pointer: AtomicUsize::new(0),
        }
    }

    pub fn outbound(&self) -> &Ring<Message> {
        &self.outbound
    }

    pub fn run_pointer(&self) -> usize {
        self.run_pointer.load(Ordering::Relaxed)
    }
}

/// Well-known identifiers of the runtime's own tasks.
#[derive(Copy, Clone, Debug)]
pub struct SysTasks {
    pub task_manager: TaskId,
    pub postman: TaskId,
    pub irq_demux: TaskId,
    pub event_log: TaskId,
    /// Absent when `disable_scheduler` turned the timer off.
    pub timer: Option<TaskId>,
    /// Absent when `disable_watchdog` is set.
    pub watchdog: Option<TaskId>,
}

/// Mutable state of the mailbox-driven services. Each is touched by exactly
/// one task, which the scheduler runs on one core at a time; the mutexes
/// are uncontended and exist to say so.
pub(crate) struct Services {
    pub irq: Mutex<IrqTable>,
    pub timer: Mutex<TimerQueue>,
    pub watchdog: Mutex<WatchdogState>,
    pub sink: Mutex<Box<dyn LogSink>>,
}

/// The process-wide system record. Constructed once by `Runtime::start` and
/// handed to both scheduler instances behind an `Arc`.
pub struct System {
    pub(crate) cfg: Config,
    state: AtomicU8,
    pub(crate) tasks: Box<[Task]>,
    pub(crate) cores: [CoreState; NUM_CORES],
    pub(crate) sys_tasks: SysTasks,
    pub(crate) services: Services,
    pub(crate) payloads: PayloadStore,
    pub(crate) clock: Clock,
    pub(crate) board: Box<dyn Board>,
    pub(crate) irq_queue: Ring<IrqEvent>,
    /// Serializes interrupt-queue producers; the ring itself stays strictly
    /// single-producer.
    irq_latch: AtomicBool,
    /// Captures lost to a full interrupt queue.
    irq_dropped: AtomicU32,
    pub(crate) timer_seq: AtomicU32,
    fatal: Mutex<Option<Fatal>>,
}

impl System {
    pub(crate) fn new(
        cfg: Config,
        tasks: Box<[Task]>,
        sys_tasks: SysTasks,
        clock: Clock,
        board: Box<dyn Board>,
        sink: Box<dyn LogSink>,
    ) -> Self {
        let interrupt_queue_capacity = cfg.interrupt_queue_capacity;
        let core_queue_capacity = cfg.core_queue_capacity;
        System {
            cfg,
            state: AtomicU8::new(SysState::Init as u8),
            tasks,
            cores: [
                CoreState::new(core_queue_capacity),
                CoreState::new(core_queue_capacity),
            ],
            sys_tasks,
            services: Services {
                irq: Mutex::new(IrqTable::new()),
                timer: Mutex::new(TimerQueue::new()),
                watchdog: Mutex::new(WatchdogState::new()),
                sink: Mutex::new(sink),
            },
            payloads: PayloadStore::new(),
            clock,
            board,
            irq_queue: Ring::with_capacity(interrupt_queue_capacity),
            irq_latch: AtomicBool::new(false),
            irq_dropped: AtomicU32::new(0),
            timer_seq: AtomicU32::new(0),
            fatal: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn state(&self) -> SysState {
        // The stored byte only ever comes from a SysState.
        SysState::from_u8(self.state.load(Ordering::Acquire))
            .unwrap_or(SysState::Down)
    }

    pub(crate) fn set_state(&self, s: SysState) {
        self.state.store(s as u8, Ordering::Release);
    }

    /// External shutdown request: the same transition
    /// `SetSystemState(Stop)` performs from inside.
    pub fn request_stop(&self) {
        match self.state() {
            SysState::Init | SysState::Run => self.set_state(SysState::Stop),
            _ => {}
        }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        if self.is_valid(id) {
            Some(&self.tasks[id.index()])
        } else {
            None
        }
    }

    /// A valid id names an allocated, deliverable task slot: in range, not
    /// the reserved scheduler slot, not the "unspecified" value.
    pub fn is_valid(&self, id: TaskId) -> bool {
        id != TaskId::SCHEDULER
            && id != TaskId::UNSPECIFIED
            && id.index() < self.tasks.len()
    }

    pub fn is_awake(&self, id: TaskId) -> bool {
        self.task(id).map_or(false, |t| !t.is_sleeping())
    }

    pub fn is_system_task(&self, id: TaskId) -> bool {
        self.task(id).map_or(false, Task::is_system)
    }

    /// Finds a task by exact name. Registration order decides which of two
    /// same-named tasks wins.
    pub fn lookup_by_name(&self, name: &str) -> Option<TaskId> {
        self.tasks
            .iter()
            .find(|t| t.name() == name)
            .map(Task::id)
    }

    pub fn core(&self, core: usize) -> &CoreState {
        &self.cores[core]
    }

    pub fn sys_tasks(&self) -> SysTasks {
        self.sys_tasks
    }

    /// Live out-of-band payload count; zero once every log entry has been
    /// delivered or dropped.
    pub fn payloads_live(&self) -> usize {
        self.payloads.live()
    }

    /// Captures a hardware interrupt edge. Callable from any context;
    /// non-blocking apart from a bounded producer latch. A full queue drops
    /// the capture and counts it.
    pub fn raise_irq(&self, gpio: u8, events: EventMask) {
        let record = IrqEvent {
            gpio,
            events: events.bits(),
            timestamp: self.clock.now().as_micros(),
        };
        while self
            .irq_latch
            .compare_exchange_weak(
                false,
                true,
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_err()
        {
            std::hint::spin_loop();
        }
        let result = self.irq_queue.write(record);
        self.irq_latch.store(false, Ordering::Release);
        if result.is_err() {
            self.irq_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Interrupt captures lost to a full queue so far.
    pub fn irq_dropped(&self) -> u32 {
        self.irq_dropped.load(Ordering::Relaxed)
    }

    /// Records the first fatal failure and forces the shutdown transition.
    pub(crate) fn record_fatal(&self, fatal: Fatal) {
        let mut slot = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(fatal);
        }
        drop(slot);
        log::error!("{}", fatal);
        self.request_stop();
    }

    pub fn fatal(&self) -> Option<Fatal> {
        *self.fatal.lock().unwrap_or_else(|e| e.into_inner())
    }
}
