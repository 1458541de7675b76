//! The view of the system a task gets while it runs.
//!
//! A `TaskContext` is constructed by the scheduler for each invocation and
//! handed to the task's entry point. It carries no interior mutability of
//! task state: everything a task wants to change about itself or others is
//! expressed as a message to TaskManager, and the context's helpers build
//! those messages (rejecting the ones the caller isn't allowed to send
//! before they ever reach a mailbox).

use std::cell::Cell;

use abi::{
    pack_subscription, pack_timer_set, Error, EventMask, Message, MsgKind,
    Priority, SysState, TaskId, TaskState,
};

use crate::system::System;
use crate::task::Task;
use crate::time::Timestamp;

pub struct TaskContext<'a> {
    pub(crate) sys: &'a System,
    pub(crate) task: &'a Task,
    pub(crate) core: usize,
    recv_left: Cell<u32>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(sys: &'a System, task: &'a Task, core: usize) -> Self {
        TaskContext {
            sys,
            task,
            core,
            recv_left: Cell::new(sys.cfg.max_recv_per_run),
        }
    }

    // --- Metadata snapshot -------------------------------------------

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn name(&self) -> &str {
        self.task.name()
    }

    pub fn priority(&self) -> Priority {
        self.task.priority()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn sys_state(&self) -> SysState {
        self.sys.state()
    }

    pub fn debug_level(&self) -> u8 {
        self.task.debug_level()
    }

    /// The core this invocation is running on.
    pub fn core(&self) -> usize {
        self.core
    }

    pub fn now(&self) -> Timestamp {
        self.sys.now()
    }

    // --- Mailbox ------------------------------------------------------

    /// Reads the next message from the inbound mailbox. Returns `None`
    /// when the mailbox is empty or the per-run read budget is spent; a
    /// task that wants the rest will see it on its next invocation.
    pub fn recv(&self) -> Option<Message> {
        let left = self.recv_left.get();
        if left == 0 {
            return None;
        }
        let msg = self.task.inbox().pop()?;
        self.recv_left.set(left - 1);
        Some(msg)
    }

    /// Messages currently waiting, read budget notwithstanding.
    pub fn messages_waiting(&self) -> usize {
        self.task.inbox().messages_waiting()
    }

    /// Stages a message into this core's outbound queue. Delivery happens
    /// after the current run, when Postman drains the queue; a full queue
    /// is reported here, synchronously, and is the sender's problem.
    ///
    /// The recipient is *not* validated here: undeliverable messages are
    /// Postman's to drop and log.
    pub fn send(
        &self,
        recipient: TaskId,
        kind: MsgKind,
        primary: u32,
        secondary: u32,
    ) -> Result<(), Error> {
        let msg = Message::local(
            self.task.id(),
            recipient,
            kind,
            primary,
            secondary,
            self.now().as_micros(),
        );
        self.sys.cores[self.task.outbound_core()].outbound.write(msg)
    }

    /// Answers a `Ping` with an `Echo` carrying the same payload. Returns
    /// `Ok(false)` when the message wasn't a ping at all.
    pub fn answer_ping(&self, msg: &Message) -> Result<bool, Error> {
        if msg.kind != MsgKind::PING {
            return Ok(false);
        }
        self.send(msg.sender, MsgKind::ECHO, msg.primary, 0)?;
        Ok(true)
    }

    // --- TaskManager requests ----------------------------------------

    pub fn set_system_state(&self, s: SysState) -> Result<(), Error> {
        self.to_task_manager(MsgKind::SET_SYSTEM_STATE, s as u32, 0)
    }

    pub fn set_task_state(
        &self,
        target: TaskId,
        s: TaskState,
    ) -> Result<(), Error> {
        self.check_valid(target)?;
        self.to_task_manager(
            MsgKind::SET_TASK_STATE,
            u32::from(target.0),
            u32::from(s.0),
        )
    }

    pub fn set_task_priority(
        &self,
        target: TaskId,
        p: Priority,
    ) -> Result<(), Error> {
        self.check_conditional(target)?;
        self.to_task_manager(
            MsgKind::SET_TASK_PRIORITY,
            u32::from(target.0),
            p.0,
        )
    }

    pub fn set_task_sleep(
        &self,
        target: TaskId,
        asleep: bool,
    ) -> Result<(), Error> {
        self.check_conditional(target)?;
        self.to_task_manager(
            MsgKind::SET_TASK_SLEEP,
            u32::from(target.0),
            asleep as u32,
        )
    }

    /// Convenience: request sleep for the calling task itself.
    pub fn sleep(&self) -> Result<(), Error> {
        self.set_task_sleep(self.task.id(), true)
    }

    pub fn set_task_wake_up(
        &self,
        target: TaskId,
        delay_us: u32,
    ) -> Result<(), Error> {
        self.check_conditional(target)?;
        self.to_task_manager(
            MsgKind::SET_TASK_WAKE_UP,
            u32::from(target.0),
            delay_us,
        )
    }

    pub fn set_task_debug(
        &self,
        target: TaskId,
        level: u8,
    ) -> Result<(), Error> {
        self.check_valid(target)?;
        self.to_task_manager(
            MsgKind::SET_TASK_DEBUG,
            u32::from(target.0),
            u32::from(level),
        )
    }

    pub fn wake_all(&self) -> Result<(), Error> {
        self.to_task_manager(MsgKind::WAKE_ALL, 0, 0)
    }

    /// Puts every non-system task except `target` to sleep. The target may
    /// not be a system task; whether it is awake is checked by TaskManager
    /// at processing time.
    pub fn dedicate_to(&self, target: TaskId) -> Result<(), Error> {
        self.check_valid(target)?;
        if self.sys.is_system_task(target) {
            return Err(Error::InvalidOperation);
        }
        self.to_task_manager(
            MsgKind::DEDICATE_TO_TASK,
            u32::from(target.0),
            0,
        )
    }

    // --- Software timers ---------------------------------------------

    /// Arms (or re-arms) timer `timer_id` of the calling task. Returns the
    /// sequence number the notification messages will carry.
    pub fn set_timer(
        &self,
        timer_id: u8,
        repeating: bool,
        interval_ms: u32,
    ) -> Result<u32, Error> {
        if timer_id > MsgKind::USER_MAX {
            return Err(Error::InvalidOperation);
        }
        let timer = self.timer_task()?;
        let seq = self
            .sys
            .timer_seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
            .wrapping_add(1);
        self.send(
            timer,
            MsgKind::SET_TIMER,
            pack_timer_set(timer_id, repeating, interval_ms),
            seq,
        )?;
        Ok(seq)
    }

    /// Cancels the calling task's timer `timer_id`.
    pub fn cancel_timer(&self, timer_id: u8) -> Result<(), Error> {
        let timer = self.timer_task()?;
        self.send(timer, MsgKind::CANCEL_TIMER, u32::from(timer_id), 0)
    }

    /// Cancels whichever timer entry carries sequence number `seq`.
    pub fn cancel_timer_by_sequence(&self, seq: u32) -> Result<(), Error> {
        let timer = self.timer_task()?;
        self.send(timer, MsgKind::CANCEL_TIMER_BY_SEQUENCE, seq, 0)
    }

    /// Local deadline helper: `now + delay`, no service involved.
    pub fn virtual_set(&self, delay_us: u64) -> Timestamp {
        self.now().saturating_add_micros(delay_us)
    }

    /// Checks a deadline produced by `virtual_set`.
    pub fn virtual_expired(&self, deadline: Timestamp) -> bool {
        self.now() >= deadline
    }

    // --- Interrupt subscriptions -------------------------------------

    /// Subscribes the calling task to events on `gpio`. A repeated
    /// subscription updates the mask and anti-bounce window in place.
    pub fn subscribe_gpio(
        &self,
        gpio: u8,
        events: EventMask,
        pull_down: bool,
        anti_bounce_us: u32,
    ) -> Result<(), Error> {
        if gpio > MsgKind::GPIO_MAX || events.is_empty() {
            return Err(Error::InvalidOperation);
        }
        self.send(
            self.sys.sys_tasks.irq_demux,
            MsgKind(gpio),
            events.bits(),
            pack_subscription(pull_down, anti_bounce_us),
        )
    }

    /// Removes the calling task's subscription on `gpio`. An empty event
    /// mask is the unsubscription on the wire.
    pub fn unsubscribe_gpio(&self, gpio: u8) -> Result<(), Error> {
        if gpio > MsgKind::GPIO_MAX {
            return Err(Error::InvalidOperation);
        }
        self.send(self.sys.sys_tasks.irq_demux, MsgKind(gpio), 0, 0)
    }

    // --- Event log ----------------------------------------------------

    /// Submits a line to the normal log sink.
    pub fn log_notify(&self, text: impl Into<String>) -> Result<(), Error> {
        self.submit_log(MsgKind::LOG_NOTIFY, 0, text.into())
    }

    /// Submits a line to the error log sink.
    pub fn log_error(&self, text: impl Into<String>) -> Result<(), Error> {
        self.submit_log(MsgKind::LOG_ERROR, 0, text.into())
    }

    /// Submits a line to the normal sink only when the calling task's
    /// debug verbosity admits `level`.
    pub fn log_debug(
        &self,
        level: u8,
        text: impl Into<String>,
    ) -> Result<(), Error> {
        if level > self.task.debug_level() {
            return Ok(());
        }
        self.submit_log(MsgKind::LOG_NOTIFY, u32::from(level), text.into())
    }

    fn submit_log(
        &self,
        kind: MsgKind,
        level: u32,
        mut text: String,
    ) -> Result<(), Error> {
        let cap = self.sys.cfg.event_log_entry_max_bytes;
        if text.len() > cap {
            // Truncate on a character boundary.
            let mut end = cap;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            text.truncate(end);
        }
        let key = self.sys.payloads.insert(text.into_boxed_str());
        match self.send(self.sys.sys_tasks.event_log, kind, key, level) {
            Ok(()) => Ok(()),
            Err(e) => {
                // The message never made it onto a queue, so ownership of
                // the payload never left the sender.
                self.sys.payloads.take(key);
                Err(e)
            }
        }
    }

    // --- Request plumbing --------------------------------------------

    fn to_task_manager(
        &self,
        kind: MsgKind,
        primary: u32,
        secondary: u32,
    ) -> Result<(), Error> {
        self.send(self.sys.sys_tasks.task_manager, kind, primary, secondary)
    }

    fn timer_task(&self) -> Result<TaskId, Error> {
        self.sys.sys_tasks.timer.ok_or(Error::TaskNotFound)
    }

    fn check_valid(&self, target: TaskId) -> Result<(), Error> {
        if self.sys.is_valid(target) {
            Ok(())
        } else {
            Err(Error::RecipientInvalid)
        }
    }

    /// Permission gate for the conditional operations: a request aimed at
    /// a system task is only legal from another system task (or from the
    /// target itself, which covers a task adjusting its own sleep).
    fn check_conditional(&self, target: TaskId) -> Result<(), Error> {
        self.check_valid(target)?;
        if self.sys.is_system_task(target)
            && !self.task.is_system()
            && target != self.task.id()
        {
            return Err(Error::InvalidOperation);
        }
        Ok(())
    }
}
