//! Software timer service.
//!
//! One task owns an unordered collection of timer entries and turns their
//! expiries into messages. The collection is scanned in full on every run;
//! entries are plain records in a flat vector, removed by swap (order does
//! not matter, the scan visits everything).
//!
//! A repeating timer's fire sequence begins at the instant it was set:
//! `start, start + I, start + 2I, …`. A one-shot fires once, `interval`
//! after it was set, and its entry is then removed. Resolution is bounded
//! below by the scheduler's high-priority period; milliseconds are the
//! promised unit, not the guaranteed accuracy.

use abi::{unpack_timer_set, Error, MsgKind, TaskId};

use crate::context::TaskContext;

#[derive(Clone, Debug)]
struct TimerEntry {
    task: TaskId,
    timer_id: u8,
    repeating: bool,
    interval_us: u64,
    next_fire_us: u64,
    seq: u32,
}

pub(crate) struct TimerQueue {
    entries: Vec<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue {
            entries: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Arms `(task, timer_id)`, replacing any previous entry for the same
    /// pair.
    pub fn set(
        &mut self,
        task: TaskId,
        timer_id: u8,
        repeating: bool,
        interval_ms: u32,
        seq: u32,
        now_us: u64,
    ) {
        let interval_us = u64::from(interval_ms) * 1_000;
        let next_fire_us = if repeating {
            now_us
        } else {
            now_us + interval_us
        };
        let entry = TimerEntry {
            task,
            timer_id,
            repeating,
            interval_us,
            next_fire_us,
            seq,
        };
        match self
            .entries
            .iter_mut()
            .find(|e| e.task == task && e.timer_id == timer_id)
        {
            Some(slot) => *slot = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn cancel_by(&mut self, task: TaskId, timer_id: u8) {
        self.entries
            .retain(|e| !(e.task == task && e.timer_id == timer_id));
    }

    pub fn cancel_by_sequence(&mut self, seq: u32) {
        self.entries.retain(|e| e.seq != seq);
    }

    /// Scans the whole collection against `now_us`, calling `emit` with
    /// `(task, timer_id, seq)` for every expiry. Returns the earliest
    /// next-fire instant among the entries that remain.
    ///
    /// A repeating entry that fell several intervals behind fires once per
    /// scan until it catches up; the rescheduling is a single `+= interval`
    /// so the fire sequence never drifts off its grid.
    pub fn scan(
        &mut self,
        now_us: u64,
        mut emit: impl FnMut(TaskId, u8, u32),
    ) -> Option<u64> {
        let mut index = 0;
        while index < self.entries.len() {
            let entry = &mut self.entries[index];
            if entry.next_fire_us <= now_us {
                emit(entry.task, entry.timer_id, entry.seq);
                if entry.repeating {
                    entry.next_fire_us += entry.interval_us.max(1);
                    index += 1;
                } else {
                    self.entries.swap_remove(index);
                    continue;
                }
            } else {
                index += 1;
            }
        }
        self.entries.iter().map(|e| e.next_fire_us).min()
    }
}

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), Error> {
    let sys = cx.sys;
    let mut queue = sys
        .services
        .timer
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
        match msg.kind {
            MsgKind::SET_TIMER => {
                let (timer_id, repeating, interval_ms) =
                    unpack_timer_set(msg.primary);
                queue.set(
                    msg.sender,
                    timer_id,
                    repeating,
                    interval_ms,
                    msg.secondary,
                    msg.timestamp,
                );
            }
            MsgKind::CANCEL_TIMER => {
                queue.cancel_by(msg.sender, msg.primary as u8);
            }
            MsgKind::CANCEL_TIMER_BY_SEQUENCE => {
                queue.cancel_by_sequence(msg.primary);
            }
            _ => log::warn!(
                "timer: unexpected request {} from task {}",
                msg.kind.0,
                msg.sender.0
            ),
        }
    }

    let now = cx.now();
    let earliest = queue.scan(now.as_micros(), |task, timer_id, seq| {
        // The notification rides the timer id as its tag.
        if cx.send(task, MsgKind(timer_id), seq, 0).is_err() {
            log::warn!(
                "timer: notification {} for task {} lost to a full queue",
                timer_id,
                task.0
            );
        }
    });

    match earliest {
        // The scheduler will re-enter this task exactly when the next
        // entry is due; a deadline the scheduler's post-run advance treats
        // as "already in the future" is the mechanism.
        Some(next) => cx.task.set_wake_deadline(next.max(now.as_micros()).into()),
        // Nothing armed: stay out of the way until mail arrives.
        None => cx.task.set_sleeping(true),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fired(queue: &mut TimerQueue, now_us: u64) -> Vec<(TaskId, u8, u32)> {
        let mut out = Vec::new();
        queue.scan(now_us, |task, id, seq| out.push((task, id, seq)));
        out
    }

    #[test]
    fn repeating_timer_fires_on_its_grid() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 3, true, 100, 1, 1_000_000);
        // First fire is at the set instant.
        assert_eq!(fired(&mut queue, 1_000_000).len(), 1);
        // Not due again until start + I.
        assert_eq!(fired(&mut queue, 1_050_000).len(), 0);
        assert_eq!(fired(&mut queue, 1_100_000).len(), 1);
        assert_eq!(fired(&mut queue, 1_200_000).len(), 1);
    }

    #[test]
    fn one_shot_fires_once_then_disappears() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 3, false, 50, 9, 0);
        assert_eq!(fired(&mut queue, 10_000), vec![]);
        assert_eq!(fired(&mut queue, 50_000), vec![(TaskId(7), 3, 9)]);
        assert!(queue.is_empty());
        assert_eq!(fired(&mut queue, 100_000), vec![]);
    }

    #[test]
    fn rearming_replaces_the_entry() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 3, false, 100, 1, 0);
        queue.set(TaskId(7), 3, false, 200, 2, 0);
        assert_eq!(fired(&mut queue, 100_000), vec![]);
        assert_eq!(fired(&mut queue, 200_000), vec![(TaskId(7), 3, 2)]);
    }

    #[test]
    fn cancel_by_sequence_removes_exactly_one_entry() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 3, true, 100, 1, 0);
        queue.set(TaskId(7), 4, true, 100, 2, 0);
        queue.cancel_by_sequence(1);
        let hits = fired(&mut queue, 0);
        assert_eq!(hits, vec![(TaskId(7), 4, 2)]);
    }

    #[test]
    fn scan_reports_the_earliest_remaining_deadline() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 1, false, 300, 1, 0);
        queue.set(TaskId(8), 2, false, 100, 2, 0);
        let earliest = queue.scan(0, |_, _, _| {});
        assert_eq!(earliest, Some(100_000));
    }

    #[test]
    fn lagging_repeater_catches_up_without_drifting() {
        let mut queue = TimerQueue::new();
        queue.set(TaskId(7), 3, true, 100, 1, 0);
        assert_eq!(fired(&mut queue, 0).len(), 1);
        // 350 ms late: one fire per scan, grid preserved.
        assert_eq!(fired(&mut queue, 350_000).len(), 1);
        assert_eq!(fired(&mut queue, 350_000).len(), 1);
        assert_eq!(fired(&mut queue, 350_000).len(), 1);
        assert_eq!(fired(&mut queue, 350_000).len(), 0);
        let earliest = queue.scan(350_000, |_, _, _| {});
        assert_eq!(earliest, Some(400_000));
    }
}
