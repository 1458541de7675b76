//! Per-core cooperative scheduler.
//!
//! Each hardware core runs one instance of this loop; the two instances
//! cooperate only through the shared `System`. Within a core, scheduling
//! is strictly cooperative: a task runs to completion before the next one
//! is considered, and nothing is ever preempted.
//!
//! Priorities are weighted by pass cycling rather than timeslices: every
//! traversal of the task table carries a ceiling that cycles high → normal
//! → low, so a high-priority task is considered three times per cycle, a
//! normal one twice, a low one once. Core 0 walks the table bottom-up and
//! core 1 top-down, which keeps the cores naturally apart; where they do
//! converge, a compare-and-swap on the task's running-core field decides
//! who runs it and the loser backs off for a bounded, jittered busy wait.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use abi::{Error, Priority, SysState, TaskId, TaskState};

use crate::context::TaskContext;
use crate::err::Fatal;
use crate::system::System;
use crate::task::Task;

/// Cycles the pass ceilings. With priorities disabled every pass admits
/// everything, which degrades the scheduler to plain round-robin.
struct PassCycle {
    ceilings: [Priority; 3],
    index: usize,
    flat: bool,
}

impl PassCycle {
    fn new(sys: &System) -> Self {
        PassCycle {
            ceilings: [
                Priority(sys.cfg.priority_high_us),
                Priority(sys.cfg.priority_normal_us),
                Priority(sys.cfg.priority_low_us),
            ],
            index: 0,
            flat: sys.cfg.disable_priorities,
        }
    }

    fn next(&mut self) -> Priority {
        if self.flat {
            return Priority(u32::max_value());
        }
        let ceiling = self.ceilings[self.index];
        self.index = (self.index + 1) % self.ceilings.len();
        ceiling
    }
}

/// Small deterministic jitter source for the collision back-off. One per
/// core, seeded differently, so the two cores never fall into lockstep.
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        XorShift(seed | 1)
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

pub(crate) struct Scheduler {
    sys: Arc<System>,
    core: usize,
    passes: PassCycle,
    rng: XorShift,
}

impl Scheduler {
    pub fn new(sys: Arc<System>, core: usize) -> Self {
        let passes = PassCycle::new(&sys);
        Scheduler {
            core,
            passes,
            rng: XorShift::new(0x9E37_79B9_7F4A_7C15 ^ ((core as u64) << 32)),
            sys,
        }
    }

    /// Drives the core until the system reaches `Down`.
    pub fn run(mut self) {
        loop {
            match self.sys.state() {
                SysState::Init => {
                    if self.core == 0 {
                        self.init_phase();
                    } else {
                        // Core 1 waits out bring-up.
                        std::thread::yield_now();
                    }
                }
                SysState::Run => {
                    if self.sys.cfg.disable_scheduler {
                        self.flat_pass();
                    } else {
                        self.run_pass();
                    }
                }
                SysState::Stop | SysState::Reboot => {
                    if self.core == 0 {
                        self.stop_phase();
                    } else {
                        std::thread::yield_now();
                    }
                }
                SysState::Down => return,
            }
        }
    }

    // --- Init ---------------------------------------------------------

    /// Core 0 only: one unconditional `Init` invocation per task, in id
    /// order. Any failure stops the system before it ever ran.
    fn init_phase(&mut self) {
        let sys = Arc::clone(&self.sys);
        if sys.cfg.startup_delay_ms > 0 {
            std::thread::sleep(std::time::Duration::from_millis(
                sys.cfg.startup_delay_ms,
            ));
        }
        for task in sys.tasks.iter().skip(1) {
            task.set_state(TaskState::INIT);
            if let Err(error) = self.execute_insistent(task) {
                log::error!(
                    "task {} ({}) failed bring-up: {}",
                    task.id().0,
                    task.name(),
                    error
                );
                sys.record_fatal(Fatal {
                    task: task.id(),
                    error: Error::Initializing,
                });
                return;
            }
            task.set_state(TaskState::RUN);
            // Init invocations may already stage traffic (subscriptions,
            // timers); deliver as we go so nothing overflows.
            if !sys.cores[self.core].outbound.is_empty() {
                self.deliver();
            }
        }
        stagger_deadlines(&sys.tasks, sys.now().as_micros());
        sys.set_state(SysState::Run);
        sys.board.set_ready(true);
    }

    // --- Run ----------------------------------------------------------

    /// One traversal of the task table under the next pass ceiling.
    fn run_pass(&mut self) {
        let sys = Arc::clone(&self.sys);
        let ceiling = self.passes.next();
        let count = sys.tasks.len();
        let forward = self.core == 0;
        let mut executed = false;

        for offset in 0..count.saturating_sub(1) {
            if sys.state() != SysState::Run {
                break;
            }
            self.service_queues();

            // The walk ignores id 0, the scheduler itself.
            let index = if forward { 1 + offset } else { count - 1 - offset };
            sys.cores[self.core]
                .run_pointer
                .store(index, Ordering::Relaxed);

            // Cheap collision check against the other core's pointer; the
            // claim below is the actual guarantee.
            if sys.cores[1 - self.core].run_pointer.load(Ordering::Relaxed)
                == index
            {
                self.backoff();
                if sys.cores[1 - self.core]
                    .run_pointer
                    .load(Ordering::Relaxed)
                    == index
                {
                    // Still contended: the other core takes this one.
                    continue;
                }
            }

            let task = &sys.tasks[index];
            if !task.priority().fits_ceiling(ceiling) {
                continue;
            }
            if task.is_sleeping() {
                continue;
            }
            if task.wake_deadline() > sys.now() {
                continue;
            }

            match self.execute_claimed(task) {
                None => {
                    // Lost the claim race after all.
                    self.backoff();
                    continue;
                }
                Some(Ok(())) => executed = true,
                Some(Err(error)) => {
                    log::error!(
                        "task {} ({}) failed: {}",
                        task.id().0,
                        task.name(),
                        error
                    );
                    sys.record_fatal(Fatal {
                        task: task.id(),
                        error: Error::RunningTask,
                    });
                    break;
                }
            }

            if !sys.cores[self.core].outbound.is_empty() {
                self.deliver();
            }
        }

        // Park the pointer where it can never collide.
        sys.cores[self.core]
            .run_pointer
            .store(TaskId::SCHEDULER.index(), Ordering::Relaxed);
        if !executed {
            std::thread::yield_now();
        }
    }

    /// Degraded mode: each task once per cycle, in order, no planning.
    fn flat_pass(&mut self) {
        let sys = Arc::clone(&self.sys);
        let mut executed = false;
        for index in 1..sys.tasks.len() {
            if sys.state() != SysState::Run {
                break;
            }
            self.service_queues();
            let task = &sys.tasks[index];
            if task.is_sleeping() {
                continue;
            }
            match self.execute_claimed(task) {
                None => continue,
                Some(Ok(())) => executed = true,
                Some(Err(error)) => {
                    log::error!(
                        "task {} ({}) failed: {}",
                        task.id().0,
                        task.name(),
                        error
                    );
                    sys.record_fatal(Fatal {
                        task: task.id(),
                        error: Error::RunningTask,
                    });
                    break;
                }
            }
            if !sys.cores[self.core].outbound.is_empty() {
                self.deliver();
            }
        }
        if !executed {
            std::thread::yield_now();
        }
    }

    // --- Stop ---------------------------------------------------------

    /// Core 0 only: the cooperative shutdown sequence.
    fn stop_phase(&mut self) {
        let sys = Arc::clone(&self.sys);
        if sys.state() == SysState::Reboot {
            log::warn!("reboot requested; not implemented, stopping instead");
            sys.set_state(SysState::Stop);
        }
        sys.board.set_ready(false);

        // Every task gets one final invocation in its Stop state, highest
        // id first. Failures here are logged and otherwise ignored; the
        // system is going down regardless.
        for task in sys.tasks.iter().skip(1).rev() {
            task.set_state(TaskState::STOP);
            if let Err(error) = self.execute_insistent(task) {
                log::warn!(
                    "task {} ({}) failed during stop: {}",
                    task.id().0,
                    task.name(),
                    error
                );
            }
        }

        // One more Postman run delivers whatever the stop invocations
        // staged, and one more Event Log run writes it out. These two are
        // owed unconditionally, so wait out any claim the other core
        // still holds.
        for id in &[sys.sys_tasks.postman, sys.sys_tasks.event_log] {
            let task = &sys.tasks[id.index()];
            if let Err(error) = self.execute_insistent(task) {
                log::warn!(
                    "task {} ({}) failed during final drain: {}",
                    task.id().0,
                    task.name(),
                    error
                );
            }
        }

        for task in sys.tasks.iter().skip(1) {
            task.set_state(TaskState::DOWN);
        }
        sys.set_state(SysState::Down);
    }

    // --- Execution plumbing ------------------------------------------

    /// Drains the interrupt queue (and any leftover outbound staging)
    /// before the next task is dispatched.
    fn service_queues(&mut self) {
        let sys = Arc::clone(&self.sys);
        if !sys.irq_queue.is_empty() {
            self.bypass(sys.sys_tasks.irq_demux);
            self.deliver();
        } else if !sys.cores[self.core].outbound.is_empty() {
            // A capped Postman run can leave staging behind; keep it
            // moving even while every task is idle.
            self.deliver();
        }
    }

    /// Postman, then TaskManager, filter bypassed.
    fn deliver(&mut self) {
        let postman = self.sys.sys_tasks.postman;
        let task_manager = self.sys.sys_tasks.task_manager;
        self.bypass(postman);
        self.bypass(task_manager);
    }

    /// Invokes a runtime task immediately, ignoring the scheduling filter.
    /// The previously computed run pointer is restored afterwards so the
    /// interrupted walk continues where it was.
    fn bypass(&mut self, id: TaskId) {
        let sys = Arc::clone(&self.sys);
        let pointer = &sys.cores[self.core].run_pointer;
        let saved = pointer.load(Ordering::Relaxed);
        pointer.store(id.index(), Ordering::Relaxed);
        let task = &sys.tasks[id.index()];
        match self.execute_claimed(task) {
            // The other core is already in this service; it will do the
            // same work we wanted done.
            None => {}
            Some(Ok(())) => {}
            Some(Err(error)) => {
                log::error!(
                    "service task {} ({}) failed: {}",
                    task.id().0,
                    task.name(),
                    error
                );
                sys.record_fatal(Fatal {
                    task: task.id(),
                    error: Error::RunningTask,
                });
            }
        }
        pointer.store(saved, Ordering::Relaxed);
    }

    /// Claims, executes, releases. `None` means the other core holds the
    /// task right now.
    fn execute_claimed(&mut self, task: &Task) -> Option<Result<(), Error>> {
        if !task.try_claim(self.core) {
            return None;
        }
        let result = self.execute(task);
        task.release(self.core);
        Some(result)
    }

    /// Keeps trying until the claim succeeds; for the init and stop
    /// phases, where an invocation is owed unconditionally.
    fn execute_insistent(&mut self, task: &Task) -> Result<(), Error> {
        loop {
            match self.execute_claimed(task) {
                Some(result) => return result,
                None => self.backoff(),
            }
        }
    }

    /// Runs a claimed task and applies the post-run deadline advance.
    fn execute(&mut self, task: &Task) -> Result<(), Error> {
        task.set_outbound_core(self.core);
        let cx = TaskContext::new(&self.sys, task, self.core);
        let result = task.invoke(&cx);
        if result.is_ok() && self.sys.state() == SysState::Run {
            // Advance the deadline in priority-sized steps until it is
            // strictly in the future: missed slots are absorbed without
            // drifting the grid. A deadline the task itself moved into
            // the future is left exactly where the task put it.
            let now = self.sys.now().as_micros();
            let mut deadline = task.wake_deadline().as_micros();
            if deadline <= now {
                let step = task.priority().as_micros().max(1);
                while deadline <= now {
                    deadline += step;
                }
                task.set_wake_deadline(deadline.into());
            }
        }
        result
    }

    /// Bounded, jittered busy wait, biased by core id to break symmetry.
    /// Also bounded in iterations so a standing-still manual clock cannot
    /// pin the core here.
    fn backoff(&mut self) {
        let spin = self.sys.cfg.collision_spin_us;
        let jitter = self.rng.next() % (spin + 1);
        let until = self
            .sys
            .now()
            .as_micros()
            .saturating_add(spin + jitter + self.core as u64);
        let mut spins = 0u32;
        while self.sys.now().as_micros() < until && spins < 10_000 {
            std::hint::spin_loop();
            spins += 1;
        }
    }
}

/// Computes the start-up stagger: within each priority bucket, first
/// deadlines are spread `priority / bucket size` apart, and each bucket
/// after the most important one is additionally shifted by half its own
/// offset so the buckets' first instants never line up.
pub(crate) fn stagger_deadlines(tasks: &[Task], start_us: u64) {
    use std::collections::BTreeSet;

    let priorities: BTreeSet<u32> = tasks
        .iter()
        .skip(1)
        .map(|t| t.priority().0)
        .collect();

    let mut base = start_us;
    let mut first_bucket = true;
    for priority in priorities {
        let members: Vec<&Task> = tasks
            .iter()
            .skip(1)
            .filter(|t| t.priority().0 == priority)
            .collect();
        let offset = u64::from(priority) / members.len() as u64;
        if !first_bucket {
            base += offset / 2;
        }
        first_bucket = false;
        for (position, task) in members.iter().enumerate() {
            task.set_wake_deadline(
                (base + position as u64 * offset).into(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pass_ceilings_cycle_high_normal_low() {
        let mut cycle = PassCycle {
            ceilings: [Priority::HIGH, Priority::NORMAL, Priority::LOW],
            index: 0,
            flat: false,
        };
        let seen: Vec<Priority> = (0..6).map(|_| cycle.next()).collect();
        assert_eq!(
            seen,
            vec![
                Priority::HIGH,
                Priority::NORMAL,
                Priority::LOW,
                Priority::HIGH,
                Priority::NORMAL,
                Priority::LOW,
            ]
        );
    }

    #[test]
    fn consideration_counts_match_the_weighting() {
        let mut cycle = PassCycle {
            ceilings: [Priority::HIGH, Priority::NORMAL, Priority::LOW],
            index: 0,
            flat: false,
        };
        let cycles = 4;
        let mut considered = [0u32; 3];
        for _ in 0..cycles * 3 {
            let ceiling = cycle.next();
            for (slot, priority) in
                [Priority::HIGH, Priority::NORMAL, Priority::LOW]
                    .iter()
                    .enumerate()
            {
                if priority.fits_ceiling(ceiling) {
                    considered[slot] += 1;
                }
            }
        }
        assert_eq!(considered, [3 * cycles, 2 * cycles, cycles]);
    }

    #[test]
    fn flat_cycle_admits_everything() {
        let mut cycle = PassCycle {
            ceilings: [Priority::HIGH, Priority::NORMAL, Priority::LOW],
            index: 0,
            flat: true,
        };
        assert!(Priority::LOW.fits_ceiling(cycle.next()));
        assert!(Priority(1_000_000).fits_ceiling(cycle.next()));
    }

    fn plain_task(id: u8, priority: Priority) -> Task {
        Task::new(
            abi::TaskId(id),
            format!("t{}", id),
            priority,
            None,
            4,
            false,
            0,
        )
    }

    #[test]
    fn stagger_spreads_a_bucket_across_its_period() {
        // Slot 0 stands in for the scheduler and is ignored.
        let tasks = vec![
            plain_task(0, Priority::LOW),
            plain_task(1, Priority::HIGH),
            plain_task(2, Priority::HIGH),
            plain_task(3, Priority::HIGH),
        ];
        stagger_deadlines(&tasks, 1_000);
        assert_eq!(tasks[1].wake_deadline().as_micros(), 1_000);
        assert_eq!(tasks[2].wake_deadline().as_micros(), 1_833);
        assert_eq!(tasks[3].wake_deadline().as_micros(), 2_666);
    }

    #[test]
    fn stagger_offsets_buckets_against_each_other() {
        let tasks = vec![
            plain_task(0, Priority::LOW),
            plain_task(1, Priority::HIGH),
            plain_task(2, Priority::NORMAL),
            plain_task(3, Priority::LOW),
        ];
        stagger_deadlines(&tasks, 0);
        // One task per bucket: offsets are the full periods, bases shift
        // by half of each bucket's own offset, cumulatively.
        assert_eq!(tasks[1].wake_deadline().as_micros(), 0);
        assert_eq!(tasks[2].wake_deadline().as_micros(), 2_500);
        assert_eq!(tasks[3].wake_deadline().as_micros(), 7_500);
    }

    #[test]
    fn jitter_streams_differ_by_seed() {
        let mut a = XorShift::new(1);
        let mut b = XorShift::new(2);
        let sa: Vec<u64> = (0..8).map(|_| a.next()).collect();
        let sb: Vec<u64> = (0..8).map(|_| b.next()).collect();
        assert_ne!(sa, sb);
    }
}
