//! Watchdog: periodic liveness checks over the task population.
//!
//! Every check interval the watchdog pings each valid, non-sleeping task
//! (itself excepted) and remembers the ping. Echoes are matched back by
//! payload; an echo arriving later than the task timeout is reported as an
//! error, and a ping still unanswered at the next sweep is reported as a
//! warning. The watchdog never terminates anything — it only reports.

use abi::{Error, MsgKind, TaskId};

use crate::context::TaskContext;

#[derive(Clone, Debug)]
struct Pending {
    counter: u32,
    task: TaskId,
    sent_at_us: u64,
}

#[derive(Debug)]
pub(crate) struct WatchdogState {
    /// Instant of the next sweep; primed on the first run.
    next_check_us: Option<u64>,
    counter: u32,
    pending: Vec<Pending>,
}

/// What an incoming echo turned out to be.
#[derive(Debug, Eq, PartialEq)]
enum EchoVerdict {
    OnTime(TaskId),
    Late(TaskId, u64),
    Unmatched,
}

impl WatchdogState {
    pub fn new() -> Self {
        WatchdogState {
            next_check_us: None,
            counter: 0,
            pending: Vec::new(),
        }
    }

    fn note_echo(&mut self, payload: u32, now_us: u64, timeout_us: u64) -> EchoVerdict {
        match self.pending.iter().position(|p| p.counter == payload) {
            Some(index) => {
                let entry = self.pending.swap_remove(index);
                let elapsed = now_us.saturating_sub(entry.sent_at_us);
                if elapsed > timeout_us {
                    EchoVerdict::Late(entry.task, elapsed)
                } else {
                    EchoVerdict::OnTime(entry.task)
                }
            }
            None => EchoVerdict::Unmatched,
        }
    }

    /// Drops and returns the ping entry for `task`, if one is still
    /// outstanding from the previous sweep.
    fn take_unanswered(&mut self, task: TaskId) -> Option<Pending> {
        let index = self.pending.iter().position(|p| p.task == task)?;
        Some(self.pending.swap_remove(index))
    }

    fn next_counter(&mut self) -> u32 {
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }
}

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), Error> {
    let sys = cx.sys;
    let timeout_us = sys.cfg.watchdog_timeout_us;
    let mut state = sys
        .services
        .watchdog
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    for _ in 0..sys.cfg.taskmgr_batch {
        let msg = match cx.task.inbox().pop() {
            Some(m) => m,
            None => break,
        };
        if cx.answer_ping(&msg)? {
            continue;
        }
        if msg.kind != MsgKind::ECHO {
            log::warn!(
                "watchdog: unexpected message {} from task {}",
                msg.kind.0,
                msg.sender.0
            );
            continue;
        }
        match state.note_echo(msg.primary, cx.now().as_micros(), timeout_us) {
            EchoVerdict::OnTime(_) => {}
            EchoVerdict::Late(task, elapsed) => {
                let _ = cx.log_error(format!(
                    "watchdog: task {} echoed after {} us",
                    task.0, elapsed
                ));
            }
            EchoVerdict::Unmatched => {
                // Either a stray echo or one whose warning already fired.
            }
        }
    }

    let now = cx.now().as_micros();
    let due = match state.next_check_us {
        None => {
            // First invocation primes the schedule; no pings yet.
            state.next_check_us =
                Some(now + sys.cfg.watchdog_check_interval_us);
            false
        }
        Some(at) => now >= at,
    };
    if !due {
        return Ok(());
    }

    for task in sys.tasks.iter().skip(1) {
        if task.id() == cx.id() || task.is_sleeping() {
            continue;
        }
        if let Some(stale) = state.take_unanswered(task.id()) {
            let _ = cx.log_notify(format!(
                "watchdog: warning: task {} has not echoed ping {}",
                task.id().0,
                stale.counter
            ));
        }
        let counter = state.next_counter();
        match cx.send(task.id(), MsgKind::PING, counter, 0) {
            Ok(()) => state.pending.push(Pending {
                counter,
                task: task.id(),
                sent_at_us: now,
            }),
            Err(_) => log::warn!(
                "watchdog: ping for task {} lost to a full queue",
                task.id().0
            ),
        }
    }
    state.next_check_us = Some(now + sys.cfg.watchdog_check_interval_us);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn echoes_match_by_payload() {
        let mut state = WatchdogState::new();
        state.pending.push(Pending {
            counter: 5,
            task: TaskId(7),
            sent_at_us: 1_000,
        });
        assert_eq!(
            state.note_echo(5, 2_000, 5_000_000),
            EchoVerdict::OnTime(TaskId(7))
        );
        assert_eq!(state.note_echo(5, 2_000, 5_000_000), EchoVerdict::Unmatched);
    }

    #[test]
    fn late_echo_is_flagged_with_its_delay() {
        let mut state = WatchdogState::new();
        state.pending.push(Pending {
            counter: 9,
            task: TaskId(3),
            sent_at_us: 0,
        });
        assert_eq!(
            state.note_echo(9, 6_000_000, 5_000_000),
            EchoVerdict::Late(TaskId(3), 6_000_000)
        );
    }

    #[test]
    fn unanswered_pings_surface_at_the_next_sweep() {
        let mut state = WatchdogState::new();
        state.pending.push(Pending {
            counter: 1,
            task: TaskId(4),
            sent_at_us: 0,
        });
        let stale = state.take_unanswered(TaskId(4));
        assert_eq!(stale.map(|p| p.counter), Some(1));
        assert!(state.take_unanswered(TaskId(4)).is_none());
    }
}
