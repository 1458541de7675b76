//! Event log: the system's log transport.
//!
//! A task with an enlarged mailbox and exclusive ownership of the output
//! sink. Other tasks submit pre-formatted lines as messages whose primary
//! word is a `PayloadStore` key; the log takes the key, writes the text to
//! the normal or error side of the sink, and thereby releases the payload.
//! Rendering of a line is the sender's business; the sink gets exactly
//! what was submitted.
//!
//! Payload keys only mean anything inside this process, so entries
//! claiming to come from another host are rejected rather than
//! dereferenced. (The key is still released — it is local memory either
//! way.)

use std::io::Write;

use abi::{Error, Message, MsgKind, TaskId};

use crate::context::TaskContext;
use crate::system::System;

/// Where log lines end up. The event log task holds the only reference,
/// which is the exclusivity the sink contract asks for.
pub trait LogSink: Send {
    fn normal(&mut self, line: &str);
    fn error(&mut self, line: &str);
}

/// Default sink: stdout for the normal side, stderr for the error side.
/// Write failures are swallowed; there is nowhere left to report them.
pub struct StdSink;

impl LogSink for StdSink {
    fn normal(&mut self, line: &str) {
        let stdout = std::io::stdout();
        let _ = writeln!(stdout.lock(), "{}", line);
    }

    fn error(&mut self, line: &str) {
        let stderr = std::io::stderr();
        let _ = writeln!(stderr.lock(), "{}", line);
    }
}

pub(crate) fn step(cx: &TaskContext<'_>) -> Result<(), Error> {
    let sys = cx.sys;
    let mut sink = sys
        .services
        .sink
        .lock()
        .unwrap_or_else(|e| e.into_inner());

    // The enlarged mailbox is drained completely every run; the sizing,
    // not a batch cap, is what keeps verbose phases from dropping entries.
    while let Some(msg) = cx.task.inbox().pop() {
        if cx.answer_ping(&msg)? {
            continue;
        }
        if !msg.kind.carries_payload() {
            log::warn!(
                "event log: unexpected message {} from task {}",
                msg.kind.0,
                msg.sender.0
            );
            continue;
        }
        let text = sys.payloads.take(msg.primary);
        if !msg.sender_host.is_local() {
            log::warn!(
                "event log: rejecting entry from host {} (payload keys are \
                 not portable)",
                msg.sender_host.0
            );
            continue;
        }
        match text {
            Some(line) => {
                if msg.kind == MsgKind::LOG_ERROR {
                    sink.error(&line);
                } else {
                    sink.normal(&line);
                }
            }
            None => log::warn!(
                "event log: task {} submitted a stale payload key",
                msg.sender.0
            ),
        }
    }
    Ok(())
}

/// Files a log entry straight into the event log's mailbox, for the
/// runtime's own components (Postman reports drops this way — its sends
/// cannot go through an outbound queue it is itself draining). Returns
/// whether the entry was accepted; on refusal the payload is released and
/// the line falls back to the host-side diagnostic log.
pub(crate) fn report_direct(
    sys: &System,
    sender: TaskId,
    kind: MsgKind,
    mut text: String,
) -> bool {
    let cap = sys.cfg.event_log_entry_max_bytes;
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    let key = sys.payloads.insert(text.into_boxed_str());
    let event_log = sys.sys_tasks.event_log;
    let msg = Message::local(
        sender,
        event_log,
        kind,
        key,
        0,
        sys.now().as_micros(),
    );
    match sys.tasks[event_log.index()].inbox().write(msg) {
        Ok(()) => true,
        Err(_) => {
            if let Some(line) = sys.payloads.take(key) {
                log::warn!("event log full, dropping: {}", line);
            }
            false
        }
    }
}

/// Sink that keeps everything in memory; used by tests and simulators.
/// Clones share the same storage, so a caller can keep one handle and give
/// the other to the runtime.
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: std::sync::Arc<std::sync::Mutex<(Vec<String>, Vec<String>)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normal_lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).0.clone()
    }

    pub fn error_lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).1.clone()
    }
}

impl LogSink for MemorySink {
    fn normal(&mut self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .0
            .push(line.to_string());
    }

    fn error(&mut self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .1
            .push(line.to_string());
    }
}
