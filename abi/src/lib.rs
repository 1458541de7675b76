//! Runtime ABI definitions, shared between the kernel core and task code.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Name prefix reserved for tasks registered by the runtime itself. The
/// registry's `is_system_task` check is a prefix match against this.
pub const SYSTEM_TASK_PREFIX: &str = "sys.";

/// Hard ceiling on the number of task slots an application may configure.
pub const MAX_TASKS_LIMIT: usize = 250;

/// Names a task slot in the task table.
///
/// Identifiers are dense, assigned in registration order starting at 0. Id 0
/// is reserved for the scheduler itself and has no entry function; id 255 is
/// the "unspecified" value and never names a real task.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, FromBytes, AsBytes, Unaligned,
    Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct TaskId(pub u8);

impl TaskId {
    /// Reserved slot 0: the scheduler itself.
    pub const SCHEDULER: Self = TaskId(0);
    /// Reserved "no particular task" value; a message carrying this as its
    /// recipient is undeliverable by definition.
    pub const UNSPECIFIED: Self = TaskId(255);

    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

/// Names a host. A multi-host deployment is not implemented; the field
/// exists so the message record doesn't change shape if one ever is.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned,
    Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct HostId(pub u8);

impl HostId {
    /// The host this process runs on.
    pub const LOCAL: Self = HostId(0);
    /// Reserved broadcast value, "all hosts."
    pub const ALL: Self = HostId(255);

    /// Checks whether a message addressed to this host id should be handled
    /// locally.
    pub fn is_local(self) -> bool {
        self == Self::LOCAL || self == Self::ALL
    }
}

/// Indicates priority of a task.
///
/// A priority is the minimum number of microseconds between two successive
/// considerations of the task by the scheduler. Numerically smaller values
/// are more important: they shorten the interval *and* place the task in a
/// pass bucket that is cycled more often.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes,
    Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Priority(pub u32);

impl Priority {
    pub const HIGH: Self = Priority(2_500);
    pub const NORMAL: Self = Priority(5_000);
    pub const LOW: Self = Priority(10_000);

    /// Checks if `self` is strictly more important than `other`.
    ///
    /// This is easier to read than comparing the numeric values, since lower
    /// numbers are more important.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Checks whether a task of this priority may run during a pass with the
    /// given ceiling.
    pub fn fits_ceiling(self, ceiling: Priority) -> bool {
        self.0 <= ceiling.0
    }

    pub fn as_micros(self) -> u64 {
        u64::from(self.0)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

/// Global lifecycle state of the whole system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SysState {
    /// Bring-up: registration is open, no task has run.
    Init = 0,
    /// Normal operation.
    Run = 1,
    /// Shutdown requested; tasks get one final invocation.
    Stop = 2,
    /// Terminal state.
    Down = 3,
    /// Reserved. The scheduler currently degrades this to `Stop`.
    Reboot = 4,
}

impl SysState {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SysState::Init),
            1 => Some(SysState::Run),
            2 => Some(SysState::Stop),
            3 => Some(SysState::Down),
            4 => Some(SysState::Reboot),
            _ => None,
        }
    }
}

/// Per-task state.
///
/// The first four values mirror the system lifecycle; applications may
/// define their own states at `TaskState::FIRST_USER` and above and drive
/// them through TaskManager.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned,
    Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct TaskState(pub u8);

impl TaskState {
    pub const INIT: Self = TaskState(0);
    pub const RUN: Self = TaskState(1);
    pub const STOP: Self = TaskState(2);
    pub const DOWN: Self = TaskState(3);
    /// First value available for application-defined states.
    pub const FIRST_USER: u8 = 4;

    pub fn is_user_defined(self) -> bool {
        self.0 >= Self::FIRST_USER
    }
}

/// Semantic tag of a message.
///
/// The tag space is partitioned: 0–49 belong to applications, 50–99 to the
/// runtime. Tags 0–28 double as GPIO numbers when the recipient is the
/// interrupt demultiplexer, and as timer ids in timer notifications.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned,
    Serialize, Deserialize, Default,
)]
#[repr(transparent)]
pub struct MsgKind(pub u8);

impl MsgKind {
    /// Highest application-owned tag.
    pub const USER_MAX: u8 = 49;
    /// Highest tag that doubles as a GPIO number / timer id.
    pub const GPIO_MAX: u8 = 28;
    /// First runtime-owned tag.
    pub const SYSTEM_BASE: u8 = 50;
    /// Highest runtime-owned tag.
    pub const SYSTEM_MAX: u8 = 99;

    pub const TEST: Self = MsgKind(50);
    pub const PING: Self = MsgKind(51);
    pub const ECHO: Self = MsgKind(52);
    pub const LOG_NOTIFY: Self = MsgKind(53);
    pub const LOG_ERROR: Self = MsgKind(54);
    pub const SET_SYSTEM_STATE: Self = MsgKind(55);
    pub const SET_TASK_STATE: Self = MsgKind(56);
    pub const SET_TASK_PRIORITY: Self = MsgKind(57);
    pub const SET_TASK_SLEEP: Self = MsgKind(58);
    pub const SET_TASK_WAKE_UP: Self = MsgKind(59);
    pub const SET_TASK_DEBUG: Self = MsgKind(60);
    pub const WAKE_ALL: Self = MsgKind(61);
    pub const DEDICATE_TO_TASK: Self = MsgKind(62);
    /// Reserved; GPIO subscription rides on the GPIO-number tags instead.
    pub const SUBSCRIBE: Self = MsgKind(63);
    /// Reserved, see `SUBSCRIBE`.
    pub const UNSUBSCRIBE: Self = MsgKind(64);
    pub const SET_TIMER: Self = MsgKind(65);
    pub const CANCEL_TIMER: Self = MsgKind(66);
    pub const CANCEL_TIMER_BY_SEQUENCE: Self = MsgKind(67);

    pub fn is_system(self) -> bool {
        self.0 >= Self::SYSTEM_BASE && self.0 <= Self::SYSTEM_MAX
    }

    pub fn is_user(self) -> bool {
        self.0 <= Self::USER_MAX
    }

    /// Reinterprets this tag as a GPIO number, when in range.
    pub fn as_gpio(self) -> Option<u8> {
        if self.0 <= Self::GPIO_MAX {
            Some(self.0)
        } else {
            None
        }
    }

    /// True for tags whose primary payload word carries a `PayloadStore`
    /// key that must be released by whoever consumes (or drops) the message.
    pub fn carries_payload(self) -> bool {
        self == Self::LOG_NOTIFY || self == Self::LOG_ERROR
    }
}

/// The message record, exactly as it sits in a mailbox slot.
///
/// Field order is the wire contract; the struct is packed so the in-memory
/// layout *is* the documented layout (21 bytes).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, AsBytes, Unaligned,
)]
#[repr(C, packed)]
pub struct Message {
    pub sender_host: HostId,
    pub sender: TaskId,
    pub recipient_host: HostId,
    pub recipient: TaskId,
    pub kind: MsgKind,
    pub primary: u32,
    pub secondary: u32,
    /// Microseconds since boot at the moment the sender staged the message.
    pub timestamp: u64,
}

impl Message {
    /// Builds a local (same-host) message.
    pub fn local(
        sender: TaskId,
        recipient: TaskId,
        kind: MsgKind,
        primary: u32,
        secondary: u32,
        timestamp: u64,
    ) -> Self {
        Message {
            sender_host: HostId::LOCAL,
            sender,
            recipient_host: HostId::LOCAL,
            recipient,
            kind,
            primary,
            secondary,
            timestamp,
        }
    }
}

bitflags::bitflags! {
    /// GPIO events a subscriber can ask to be told about.
    #[derive(Serialize, Deserialize, Default)]
    pub struct EventMask: u32 {
        const LEVEL_LOW = 1 << 0;
        const LEVEL_HIGH = 1 << 1;
        const EDGE_FALL = 1 << 2;
        const EDGE_RISE = 1 << 3;
    }
}

/// Anti-bounce windows are carried in the low 24 bits of the subscription
/// secondary word, capping them at about 16.7 seconds.
pub const ANTI_BOUNCE_MAX_US: u32 = 0x00FF_FFFF;

/// Packs the secondary payload word of a GPIO subscription message:
/// bit 24 selects the pull direction (1 = pull-down), the low 24 bits carry
/// the anti-bounce window in microseconds.
pub fn pack_subscription(pull_down: bool, anti_bounce_us: u32) -> u32 {
    let window = anti_bounce_us.min(ANTI_BOUNCE_MAX_US);
    ((pull_down as u32) << 24) | window
}

/// Inverse of `pack_subscription`.
pub fn unpack_subscription(secondary: u32) -> (bool, u32) {
    (secondary & (1 << 24) != 0, secondary & ANTI_BOUNCE_MAX_US)
}

/// Timer intervals ride in the low 24 bits of the set-timer primary word,
/// capping a single interval at about 4.6 hours.
pub const TIMER_INTERVAL_MAX_MS: u32 = 0x00FF_FFFF;

/// Packs the primary payload word of a set-timer request: bits 31:25 carry
/// the timer id, bit 24 the repeating flag, the low 24 bits the interval in
/// milliseconds. The sequence number travels in the secondary word,
/// unpacked.
pub fn pack_timer_set(timer_id: u8, repeating: bool, interval_ms: u32) -> u32 {
    let interval = interval_ms.min(TIMER_INTERVAL_MAX_MS);
    (u32::from(timer_id) << 25) | ((repeating as u32) << 24) | interval
}

/// Inverse of `pack_timer_set`.
pub fn unpack_timer_set(primary: u32) -> (u8, bool, u32) {
    (
        (primary >> 25) as u8,
        primary & (1 << 24) != 0,
        primary & TIMER_INTERVAL_MAX_MS,
    )
}

/// The error taxonomy. Success is `Ok(())`; everything a runtime operation
/// can report lands in one of these kinds.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Registration attempted past the configured task-slot capacity.
    TooManyTasks,
    /// A task's `Init` invocation failed, or a subsystem failed bring-up.
    Initializing,
    /// A write to a full mailbox or queue, reported synchronously to the
    /// writer.
    MailboxFull,
    /// Recipient id out of range, unallocated, or the reserved slot 0.
    RecipientInvalid,
    /// Lookup by name found nothing.
    TaskNotFound,
    /// The operation requires the target task to be awake.
    TaskSleeping,
    /// A task function returned non-OK during the run phase. Fatal.
    RunningTask,
    /// The caller is not allowed to request this operation.
    InvalidOperation,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Error::TooManyTasks => "too many tasks",
            Error::Initializing => "initialization failed",
            Error::MailboxFull => "mailbox full",
            Error::RecipientInvalid => "recipient invalid",
            Error::TaskNotFound => "task not found",
            Error::TaskSleeping => "task sleeping",
            Error::RunningTask => "task failed while running",
            Error::InvalidOperation => "invalid operation",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout_is_the_wire_layout() {
        assert_eq!(core::mem::size_of::<Message>(), 21);
    }

    #[test]
    fn tag_partitions() {
        assert!(MsgKind::PING.is_system());
        assert!(!MsgKind::PING.is_user());
        assert!(MsgKind(0).is_user());
        assert!(MsgKind(49).is_user());
        assert!(!MsgKind(49).is_system());
        assert_eq!(MsgKind(28).as_gpio(), Some(28));
        assert_eq!(MsgKind(29).as_gpio(), None);
        assert!(MsgKind::LOG_ERROR.carries_payload());
        assert!(!MsgKind::ECHO.carries_payload());
    }

    #[test]
    fn subscription_packing_round_trips() {
        let word = pack_subscription(true, 1_500);
        assert_eq!(unpack_subscription(word), (true, 1_500));
        let word = pack_subscription(false, 0);
        assert_eq!(unpack_subscription(word), (false, 0));
        // Windows past the cap saturate rather than bleeding into the pull
        // bit.
        let word = pack_subscription(false, u32::max_value());
        assert_eq!(unpack_subscription(word), (false, ANTI_BOUNCE_MAX_US));
    }

    #[test]
    fn timer_packing_round_trips() {
        let word = pack_timer_set(7, true, 100);
        assert_eq!(unpack_timer_set(word), (7, true, 100));
        let word = pack_timer_set(49, false, TIMER_INTERVAL_MAX_MS);
        assert_eq!(unpack_timer_set(word), (49, false, TIMER_INTERVAL_MAX_MS));
    }

    #[test]
    fn priority_ordering_reads_correctly() {
        assert!(Priority::HIGH.is_more_important_than(Priority::NORMAL));
        assert!(Priority::HIGH.fits_ceiling(Priority::HIGH));
        assert!(Priority::HIGH.fits_ceiling(Priority::LOW));
        assert!(!Priority::LOW.fits_ceiling(Priority::NORMAL));
    }
}
