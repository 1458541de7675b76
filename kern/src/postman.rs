//! Postman: moves staged messages into inbound mailboxes.
//!
//! Postman is an ordinary (if privileged) task. The scheduler invokes it,
//! filter bypassed, whenever a core's outbound queue is non-empty; it
//! drains both cores' queues, routes each record to its recipient's
//! mailbox, remembers who got mail, and finishes by asking TaskManager to
//! wake those recipients. Delivery failure is lossy by contract: the
//! record is dropped and the failure reported, never retried.

use abi::{Message, MsgKind, TaskId};

use crate::context::TaskContext;
use crate::eventlog;
use crate::system::{System, NUM_CORES};

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), abi::Error> {
    let sys = cx.sys;
    let mut marked = vec![false; sys.tasks.len()];

    // Postman's own mailbox sees little traffic (the watchdog skips
    // sleeping tasks), but whatever lands there gets the ping treatment.
    while let Some(msg) = cx.recv() {
        cx.answer_ping(&msg)?;
    }

    let mut budget = sys.cfg.postman_batch;
    for core in 0..NUM_CORES {
        let queue = &sys.cores[core].outbound;
        while budget > 0 {
            let msg = match queue.pop() {
                Some(m) => m,
                None => break,
            };
            budget -= 1;
            deliver(sys, cx, msg, &mut marked);
        }
    }

    // Wake-ups go out strictly after every delivery of this run.
    // TaskManager and the interrupt demultiplexer never sleep, so they are
    // not worth a request.
    let task_manager = sys.sys_tasks.task_manager;
    for (index, hit) in marked.iter().enumerate() {
        let id = TaskId(index as u8);
        if !hit || id == task_manager || id == sys.sys_tasks.irq_demux {
            continue;
        }
        let wake = Message::local(
            cx.id(),
            task_manager,
            MsgKind::SET_TASK_SLEEP,
            index as u32,
            0,
            cx.now().as_micros(),
        );
        if sys.tasks[task_manager.index()].inbox().write(wake).is_err() {
            log::warn!("postman: wake request for task {} lost", index);
        }
    }

    // Nothing to do until the scheduler has queues for us again.
    cx.task.set_sleeping(true);
    Ok(())
}

fn deliver(
    sys: &System,
    cx: &TaskContext<'_>,
    msg: Message,
    marked: &mut [bool],
) {
    let recipient = msg.recipient;
    if !msg.recipient_host.is_local() {
        drop_undeliverable(
            sys,
            cx,
            &msg,
            marked,
            format!(
                "postman: no transport to host {} (from task {})",
                msg.recipient_host.0, msg.sender.0
            ),
        );
        return;
    }
    if recipient == TaskId::UNSPECIFIED {
        drop_undeliverable(
            sys,
            cx,
            &msg,
            marked,
            format!(
                "postman: unspecified recipient (from task {})",
                msg.sender.0
            ),
        );
        return;
    }
    if !sys.is_valid(recipient) {
        drop_undeliverable(
            sys,
            cx,
            &msg,
            marked,
            format!(
                "postman: invalid recipient {} (from task {})",
                recipient.0, msg.sender.0
            ),
        );
        return;
    }

    match sys.tasks[recipient.index()].inbox().write(msg) {
        Ok(()) => marked[recipient.index()] = true,
        Err(_) => drop_undeliverable(
            sys,
            cx,
            &msg,
            marked,
            format!(
                "postman: mailbox full, task {} loses message from task {}",
                recipient.0, msg.sender.0
            ),
        ),
    }
}

/// Drops `msg`, releasing any out-of-band payload it owned, and reports
/// the loss both to the host-side diagnostic log and to the event log.
fn drop_undeliverable(
    sys: &System,
    cx: &TaskContext<'_>,
    msg: &Message,
    marked: &mut [bool],
    text: String,
) {
    if msg.kind.carries_payload() {
        sys.payloads.take(msg.primary);
    }
    log::warn!("{}", text);
    if eventlog::report_direct(sys, cx.id(), MsgKind::LOG_ERROR, text) {
        marked[sys.sys_tasks.event_log.index()] = true;
    }
}
