//! Layout and scaling constants shared by the monitor and its clients.

use std::time::Duration;

/// Size of one producer counter slot. One slot per cache line so
/// concurrent producers never share a line.
pub const CACHE_LINE_BYTES: usize = 64;

/// Size of the measures-and-goal region.
pub const PAGE_SIZE: usize = 4096;

/// Capacity of the window table in the goal structure.
pub const MAX_WINDOWS: usize = 32;

/// Fixed-point scale applied to rates on the monitor side and to the
/// stored goal bounds. A scaled rate of 1_000_000 is 1000.0 beats/s.
pub const MEASURE_SCALE: u64 = 1000;

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Default number of counter slots per group (one 4 KiB counters page).
pub const DEFAULT_SLOT_CAPACITY: usize = 64;

/// Default history ring length, in ticks. Must be a power of two; this
/// is also the longest configurable window.
pub const DEFAULT_RING_LEN: usize = 64;

/// Default snapshot period.
pub const DEFAULT_TICK_PERIOD: Duration = Duration::from_millis(100);
