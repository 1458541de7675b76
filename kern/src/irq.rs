//! Interrupt demultiplexer.
//!
//! Hardware edges are captured — fast and allocation-free — into the
//! dedicated interrupt ring buffer by `System::raise_irq`. The demux task
//! drains that buffer when the scheduler notices it is non-empty, and fans
//! each capture out to the tasks subscribed to the pin, subject to each
//! subscription's event mask and anti-bounce window. From the rest of the
//! system's point of view the demux is just another task producing
//! outbound messages.
//!
//! Subscription changes arrive as ordinary mailbox traffic and are applied
//! only inside the demux's own invocation, which is what makes the
//! single-consumer assumption on this table explicit.

use abi::{unpack_subscription, Error, EventMask, MsgKind, TaskId};

use crate::context::TaskContext;

/// One captured hardware edge, exactly as the capture context wrote it.
#[derive(Copy, Clone, Debug)]
pub struct IrqEvent {
    pub gpio: u8,
    /// Raw `EventMask` bits.
    pub events: u32,
    /// Microseconds at capture time.
    pub timestamp: u64,
}

#[derive(Clone, Debug)]
struct Subscription {
    task: TaskId,
    events: EventMask,
    anti_bounce_us: u32,
    /// Capture timestamp of the last interrupt forwarded to this
    /// subscriber. `None` until the first forward.
    last_forwarded: Option<u64>,
}

#[derive(Clone, Debug, Default)]
struct GpioState {
    initialized: bool,
    pull_down: bool,
    /// Union of all subscriber masks, kept current so dispatch can reject
    /// uninteresting captures without walking the list.
    union: EventMask,
    subs: Vec<Subscription>,
}

/// Subscription table for all dispatchable pins.
pub(crate) struct IrqTable {
    gpios: Vec<GpioState>,
}

/// What `IrqTable::apply_subscription` decided, so the caller can do the
/// pin bring-up (the table itself never touches hardware).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PinAction {
    None,
    /// First subscriber on the pin: configure it as an input with the
    /// given pull direction.
    Configure { pull_down: bool },
}

impl IrqTable {
    pub fn new() -> Self {
        let mut gpios = Vec::new();
        gpios.resize_with(usize::from(MsgKind::GPIO_MAX) + 1, GpioState::default);
        IrqTable { gpios }
    }

    /// Applies a subscription message: a non-empty mask subscribes or
    /// updates in place, an empty mask unsubscribes. Idempotent in both
    /// directions.
    pub fn apply_subscription(
        &mut self,
        gpio: u8,
        task: TaskId,
        events: EventMask,
        pull_down: bool,
        anti_bounce_us: u32,
    ) -> PinAction {
        let state = &mut self.gpios[usize::from(gpio)];
        let mut action = PinAction::None;
        if events.is_empty() {
            state.subs.retain(|s| s.task != task);
            // An empty list leaves the pin configured but unwired.
        } else {
            match state.subs.iter_mut().find(|s| s.task == task) {
                Some(sub) => {
                    sub.events = events;
                    sub.anti_bounce_us = anti_bounce_us;
                }
                None => {
                    if !state.initialized {
                        state.initialized = true;
                        state.pull_down = pull_down;
                        action = PinAction::Configure { pull_down };
                    }
                    state.subs.push(Subscription {
                        task,
                        events,
                        anti_bounce_us,
                        last_forwarded: None,
                    });
                }
            }
        }
        state.union = state
            .subs
            .iter()
            .fold(EventMask::empty(), |acc, s| acc | s.events);
        action
    }

    pub fn subscriber_count(&self, gpio: u8) -> usize {
        self.gpios[usize::from(gpio)].subs.len()
    }

    /// Fans one capture out. `emit` is called once per subscription whose
    /// mask intersects the capture and whose anti-bounce window has
    /// elapsed; arguments are (task, gpio, event bits, pull direction).
    pub fn dispatch(
        &mut self,
        event: IrqEvent,
        mut emit: impl FnMut(TaskId, u8, u32, bool),
    ) {
        let index = usize::from(event.gpio);
        if index >= self.gpios.len() {
            return;
        }
        let state = &mut self.gpios[index];
        let captured = EventMask::from_bits_truncate(event.events);
        if (state.union & captured).is_empty() {
            return;
        }
        for sub in &mut state.subs {
            if (sub.events & captured).is_empty() {
                continue;
            }
            // The window is measured capture-to-capture: a burst inside
            // the window forwards its first edge only. The 64-bit
            // microsecond counter does not wrap; saturation keeps the
            // comparison harmless if it somehow did.
            if let Some(last) = sub.last_forwarded {
                if event.timestamp
                    < last.saturating_add(u64::from(sub.anti_bounce_us))
                {
                    continue;
                }
            }
            sub.last_forwarded = Some(event.timestamp);
            emit(sub.task, event.gpio, captured.bits(), state.pull_down);
        }
    }
}

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), Error> {
    let sys = cx.sys;
    let mut table = sys
        .services
        .irq
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    // Subscription changes first, so a capture already waiting in the
    // queue sees the freshest table.
    for _ in 0..sys.cfg.taskmgr_batch {
        let msg = match cx.task.inbox().pop() {
            Some(m) => m,
            None => break,
        };
        if cx.answer_ping(&msg)? {
            continue;
        }
        let gpio = match msg.kind.as_gpio() {
            Some(g) => g,
            None => {
                log::warn!(
                    "irq demux: unexpected request {} from task {}",
                    msg.kind.0,
                    msg.sender.0
                );
                continue;
            }
        };
        let events = EventMask::from_bits_truncate(msg.primary);
        let (pull_down, anti_bounce_us) = unpack_subscription(msg.secondary);
        let action = table.apply_subscription(
            gpio,
            msg.sender,
            events,
            pull_down,
            anti_bounce_us,
        );
        if let PinAction::Configure { pull_down } = action {
            sys.board.configure_input(gpio, pull_down);
        }
    }

    // Then the captures themselves, bounded per invocation.
    for _ in 0..sys.cfg.irq_batch {
        let event = match sys.irq_queue.pop() {
            Some(e) => e,
            None => break,
        };
        let mut failed = 0usize;
        table.dispatch(event, |task, gpio, bits, pull_down| {
            if cx.send(task, MsgKind(gpio), bits, pull_down as u32).is_err() {
                failed += 1;
            }
        });
        if failed > 0 {
            log::warn!(
                "irq demux: {} forward(s) for gpio {} lost to a full queue",
                failed,
                event.gpio
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn capture(gpio: u8, events: EventMask, at: u64) -> IrqEvent {
        IrqEvent {
            gpio,
            events: events.bits(),
            timestamp: at,
        }
    }

    fn forwarded(
        table: &mut IrqTable,
        event: IrqEvent,
    ) -> Vec<(TaskId, u8, u32)> {
        let mut out = Vec::new();
        table.dispatch(event, |task, gpio, bits, _pull| {
            out.push((task, gpio, bits));
        });
        out
    }

    #[test]
    fn first_subscription_configures_the_pin() {
        let mut table = IrqTable::new();
        let action = table.apply_subscription(
            5,
            TaskId(7),
            EventMask::EDGE_RISE,
            true,
            0,
        );
        assert_eq!(action, PinAction::Configure { pull_down: true });
        // Second subscriber on the same pin: no reconfiguration.
        let action = table.apply_subscription(
            5,
            TaskId(8),
            EventMask::EDGE_FALL,
            false,
            0,
        );
        assert_eq!(action, PinAction::None);
        assert_eq!(table.subscriber_count(5), 2);
    }

    #[test]
    fn resubscription_updates_in_place() {
        let mut table = IrqTable::new();
        table.apply_subscription(3, TaskId(7), EventMask::EDGE_RISE, false, 0);
        table.apply_subscription(
            3,
            TaskId(7),
            EventMask::EDGE_FALL | EventMask::LEVEL_HIGH,
            false,
            500,
        );
        assert_eq!(table.subscriber_count(3), 1);
        let hits =
            forwarded(&mut table, capture(3, EventMask::EDGE_FALL, 1_000));
        assert_eq!(hits, vec![(TaskId(7), 3, EventMask::EDGE_FALL.bits())]);
        // The old mask no longer matches.
        let hits =
            forwarded(&mut table, capture(3, EventMask::EDGE_RISE, 2_000));
        assert_eq!(hits, vec![]);
    }

    #[test]
    fn unsubscription_silences_but_keeps_the_pin() {
        let mut table = IrqTable::new();
        table.apply_subscription(2, TaskId(9), EventMask::EDGE_RISE, false, 0);
        table.apply_subscription(2, TaskId(9), EventMask::empty(), false, 0);
        assert_eq!(table.subscriber_count(2), 0);
        let hits =
            forwarded(&mut table, capture(2, EventMask::EDGE_RISE, 100));
        assert_eq!(hits, vec![]);
        // A new subscriber does not re-trigger pin bring-up.
        let action = table.apply_subscription(
            2,
            TaskId(9),
            EventMask::EDGE_RISE,
            false,
            0,
        );
        assert_eq!(action, PinAction::None);
    }

    #[test]
    fn anti_bounce_forwards_the_first_edge_only() {
        let mut table = IrqTable::new();
        table.apply_subscription(
            4,
            TaskId(7),
            EventMask::EDGE_FALL,
            false,
            1_000,
        );
        let first =
            forwarded(&mut table, capture(4, EventMask::EDGE_FALL, 10_000));
        assert_eq!(first.len(), 1);
        // Within the window: swallowed.
        let second =
            forwarded(&mut table, capture(4, EventMask::EDGE_FALL, 10_400));
        assert_eq!(second, vec![]);
        // Window elapsed, measured from the forwarded capture.
        let third =
            forwarded(&mut table, capture(4, EventMask::EDGE_FALL, 11_000));
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn dispatch_honors_each_subscribers_mask() {
        let mut table = IrqTable::new();
        table.apply_subscription(6, TaskId(7), EventMask::EDGE_RISE, false, 0);
        table.apply_subscription(6, TaskId(8), EventMask::EDGE_FALL, false, 0);
        let hits = forwarded(
            &mut table,
            capture(6, EventMask::EDGE_RISE | EventMask::EDGE_FALL, 50),
        );
        assert_eq!(hits.len(), 2);
        let hits = forwarded(&mut table, capture(6, EventMask::EDGE_RISE, 60));
        assert_eq!(hits, vec![(
            TaskId(7),
            6,
            (EventMask::EDGE_RISE).bits()
        )]);
    }
}
