//! TaskManager: the serialized mutator of task and system state.
//!
//! Every state change a task wants — its own or anybody else's — arrives
//! here as a message, which makes mutation single-file: the scheduler runs
//! at most one TaskManager invocation at a time, like any other task.
//! Permission questions were already settled at the call site; requests
//! that still turn out to be unserviceable are reported through the event
//! log, never back to the sender.

use abi::{Error, MsgKind, Priority, SysState, TaskId, TaskState};

use crate::context::TaskContext;

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), Error> {
    let sys = cx.sys;
    for _ in 0..sys.cfg.taskmgr_batch {
        let msg = match cx.task.inbox().pop() {
            Some(m) => m,
            None => break,
        };
        if cx.answer_ping(&msg)? {
            continue;
        }
        // Copies out of the packed record before anything borrows them.
        let primary = msg.primary;
        let target = TaskId(primary as u8);
        match msg.kind {
            MsgKind::SET_SYSTEM_STATE => {
                match SysState::from_u8(primary as u8) {
                    Some(s) => sys.set_state(s),
                    None => report(
                        cx,
                        format!(
                            "taskmgr: bogus system state {} from task {}",
                            primary, msg.sender.0
                        ),
                    ),
                }
            }
            MsgKind::SET_TASK_STATE => match sys.task(target) {
                Some(t) => t.set_state(TaskState(msg.secondary as u8)),
                None => bad_target(cx, &msg),
            },
            MsgKind::SET_TASK_PRIORITY => match sys.task(target) {
                Some(t) => t.set_priority(Priority(msg.secondary)),
                None => bad_target(cx, &msg),
            },
            MsgKind::SET_TASK_SLEEP => match sys.task(target) {
                Some(t) => {
                    let asleep = msg.secondary != 0;
                    t.set_sleeping(asleep);
                    if !asleep {
                        // A freshly woken task is due immediately.
                        t.set_wake_deadline(cx.now());
                    }
                }
                None => bad_target(cx, &msg),
            },
            MsgKind::SET_TASK_WAKE_UP => match sys.task(target) {
                Some(t) => t.set_wake_deadline(
                    cx.now().saturating_add_micros(u64::from(msg.secondary)),
                ),
                None => bad_target(cx, &msg),
            },
            MsgKind::SET_TASK_DEBUG => match sys.task(target) {
                Some(t) => t.set_debug_level(msg.secondary as u8),
                None => bad_target(cx, &msg),
            },
            MsgKind::WAKE_ALL => {
                let now = cx.now();
                for t in sys.tasks.iter().skip(1) {
                    if t.is_sleeping() {
                        t.set_sleeping(false);
                        t.set_wake_deadline(now);
                    }
                }
            }
            MsgKind::DEDICATE_TO_TASK => dedicate(cx, &msg),
            _ => report(
                cx,
                format!(
                    "taskmgr: unexpected request {} from task {}",
                    msg.kind.0, msg.sender.0
                ),
            ),
        }
    }
    Ok(())
}

/// Dedicate-to is spelled as plain state transitions on every other task,
/// so the scheduler's invariants keep holding without a special branch.
fn dedicate(cx: &TaskContext<'_>, msg: &abi::Message) {
    let sys = cx.sys;
    let target = TaskId(msg.primary as u8);
    let target_task = match sys.task(target) {
        Some(t) => t,
        None => return bad_target(cx, msg),
    };
    if target_task.is_system() {
        // The call site rejects these; arriving here means someone forged
        // a request, which deserves a trace.
        return report(
            cx,
            format!(
                "taskmgr: dedicate-to aimed at system task {} (from {}): {}",
                target.0,
                msg.sender.0,
                Error::InvalidOperation
            ),
        );
    }
    if target_task.is_sleeping() {
        return report(
            cx,
            format!(
                "taskmgr: dedicate-to task {} (from {}): {}",
                target.0,
                msg.sender.0,
                Error::TaskSleeping
            ),
        );
    }
    for t in sys.tasks.iter().skip(1) {
        if !t.is_system() && t.id() != target {
            t.set_sleeping(true);
        }
    }
}

fn bad_target(cx: &TaskContext<'_>, msg: &abi::Message) {
    let primary = msg.primary;
    report(
        cx,
        format!(
            "taskmgr: request {} from task {} names task {}: {}",
            msg.kind.0,
            msg.sender.0,
            primary,
            Error::RecipientInvalid
        ),
    );
}

fn report(cx: &TaskContext<'_>, text: String) {
    log::warn!("{}", text);
    let _ = cx.log_error(text);
}
