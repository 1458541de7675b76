//! Bounded single-producer/single-consumer ring buffers.
//!
//! Every mailbox and staging queue in the system is one of these: a fixed
//! array of record slots plus a head index owned by the producer and a tail
//! index owned by the consumer. Head and tail are the only mutable fields,
//! and the release/acquire pairing on them is the primary cross-core
//! synchronization primitive of the whole runtime.
//!
//! "Empty" is `head == tail`; "full" is `(head + 1) % capacity == tail`.
//! One slot is sacrificed to distinguish the two, so a ring constructed with
//! capacity `C` holds at most `C - 1` unread records and never overwrites.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use abi::Error;

pub struct Ring<T> {
    /// Next slot the producer will fill. Written by the producer only.
    head: AtomicUsize,
    /// Next slot the consumer will read. Written by the consumer only.
    tail: AtomicUsize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: a slot is touched by at most one side at a time. The producer
// writes slot `head` strictly before publishing it with a release store of
// `head`; the consumer reads a slot only after an acquire load of `head`
// proves it published. Records are `Copy`, so slots need no drop handling.
unsafe impl<T: Copy + Send> Send for Ring<T> {}
unsafe impl<T: Copy + Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Creates a ring with `capacity` slots, of which `capacity - 1` are
    /// usable. Capacities below 2 are bumped to 2 (a zero-record ring is
    /// not a thing).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(MaybeUninit::uninit()));
        }
        Ring {
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of records waiting to be read.
    pub fn messages_waiting(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (head + self.slots.len() - tail) % self.slots.len()
    }

    /// Number of records that can still be written before `write` reports
    /// `Full`.
    pub fn slots_available(&self) -> usize {
        self.slots.len() - 1 - self.messages_waiting()
    }

    pub fn is_empty(&self) -> bool {
        self.messages_waiting() == 0
    }

    /// Usable capacity: one less than the slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Appends a record. Producer side only.
    ///
    /// Fails with `MailboxFull` when no slot is available; a full ring is
    /// never overwritten and the indices are left untouched.
    pub fn write(&self, record: T) -> Result<(), Error> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) % self.slots.len();
        if next == self.tail.load(Ordering::Acquire) {
            return Err(Error::MailboxFull);
        }
        // Safety: `head` is not visible to the consumer until the store
        // below, and no other producer exists.
        unsafe {
            (*self.slots[head].get()).as_mut_ptr().write(record);
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Non-destructive read of the oldest record. Consumer side only.
    pub fn peek(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // Safety: the acquire load above proved the producer published this
        // slot, and the producer cannot reuse it until `tail` advances.
        Some(unsafe { (*self.slots[tail].get()).as_ptr().read() })
    }

    /// Reads and consumes the oldest record. Consumer side only.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        // Safety: as in `peek`.
        let record = unsafe { (*self.slots[tail].get()).as_ptr().read() };
        self.tail
            .store((tail + 1) % self.slots.len(), Ordering::Release);
        Some(record)
    }

    /// Discards everything currently waiting (tail catches up to head).
    /// Consumer side only.
    pub fn clear(&self) {
        let head = self.head.load(Ordering::Acquire);
        self.tail.store(head, Ordering::Release);
    }
}
