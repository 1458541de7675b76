//! Implementation of runtime time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// In-runtime timestamp representation.
///
/// Measured in microseconds since the clock's epoch, which for the monotonic
/// source is system start. The counter is 64 bits wide and never wraps in
/// any realistic deployment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Default)]
#[repr(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn as_micros(self) -> u64 {
        self.0
    }

    pub fn saturating_add_micros(self, us: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(us))
    }
}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp(v)
    }
}

impl From<Timestamp> for u64 {
    fn from(v: Timestamp) -> Self {
        v.0
    }
}

/// Source of runtime time.
///
/// On hardware this would be the architecture layer's job; on a hosted build
/// the "architecture" is a pair of threads, so the source is chosen at
/// construction instead. The manual source exists for simulators and tests
/// that need to own the flow of time.
#[derive(Clone)]
pub struct Clock(Source);

#[derive(Clone)]
enum Source {
    Monotonic(Instant),
    Manual(Arc<AtomicU64>),
}

impl Clock {
    /// A clock backed by the host's monotonic timer, with its epoch at the
    /// moment of this call.
    pub fn monotonic() -> Self {
        Clock(Source::Monotonic(Instant::now()))
    }

    /// A clock that only moves when its `ManualClock` handle is advanced.
    pub fn manual() -> (Self, ManualClock) {
        let cell = Arc::new(AtomicU64::new(0));
        (Clock(Source::Manual(cell.clone())), ManualClock(cell))
    }

    pub fn now(&self) -> Timestamp {
        match &self.0 {
            Source::Monotonic(epoch) => {
                Timestamp(epoch.elapsed().as_micros() as u64)
            }
            Source::Manual(cell) => Timestamp(cell.load(Ordering::Acquire)),
        }
    }
}

impl Default for Clock {
    fn default() -> Self {
        Clock::monotonic()
    }
}

/// Handle for driving a manual `Clock` from outside the system.
#[derive(Clone)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn advance_micros(&self, us: u64) {
        self.0.fetch_add(us, Ordering::AcqRel);
    }

    pub fn set_micros(&self, us: u64) {
        self.0.store(us, Ordering::Release);
    }
}
