//! Ownership transfer for out-of-band message payloads.
//!
//! A payload word in a message is 32 bits, which is not a pointer on a
//! hosted build. Text handed through the event log therefore travels as a
//! key into this store: the sender inserts and owns the entry until the
//! recipient (or whoever drops the message) takes it back out. Exactly one
//! party releases each key, and the population is observable so tests can
//! assert nothing leaked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

pub struct PayloadStore {
    next_key: AtomicU32,
    entries: Mutex<HashMap<u32, Box<str>>>,
}

impl PayloadStore {
    pub fn new() -> Self {
        PayloadStore {
            // Key 0 is reserved so a zeroed payload word never aliases a
            // live entry.
            next_key: AtomicU32::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Stores `text` and returns the key that now owns it.
    pub fn insert(&self, text: Box<str>) -> u32 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.guard().insert(key, text);
        key
    }

    /// Releases `key`, transferring the text to the caller. Returns `None`
    /// for unknown (already released) keys.
    pub fn take(&self, key: u32) -> Option<Box<str>> {
        self.guard().remove(&key)
    }

    /// Number of live entries. Zero after a clean run.
    pub fn live(&self) -> usize {
        self.guard().len()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Box<str>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for PayloadStore {
    fn default() -> Self {
        Self::new()
    }
}
