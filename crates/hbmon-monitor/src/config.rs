//! Monitor configuration.

use std::time::Duration;

use hbmon_core::constants::{DEFAULT_RING_LEN, DEFAULT_SLOT_CAPACITY, DEFAULT_TICK_PERIOD};

/// Configuration for a [`HeartRateMonitor`](crate::HeartRateMonitor).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Counter slots per group. Bounds how many producers can be
    /// attached to one group at once.
    pub capacity: usize,

    /// Snapshot period for every group's tick.
    pub tick_period: Duration,

    /// History ring length in ticks; also the longest configurable
    /// window. Must be a power of two >= 2.
    pub ring_len: usize,

    /// Start a timer thread per group when its first producer attaches.
    /// Tests turn this off and drive [`Group::tick`](crate::Group::tick)
    /// by hand.
    pub start_timers: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_SLOT_CAPACITY,
            tick_period: DEFAULT_TICK_PERIOD,
            ring_len: DEFAULT_RING_LEN,
            start_timers: true,
        }
    }
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set counter slots per group.
    pub fn capacity(mut self, n: usize) -> Self {
        self.capacity = n;
        self
    }

    /// Set the snapshot period.
    pub fn tick_period(mut self, d: Duration) -> Self {
        self.tick_period = d;
        self
    }

    /// Set the history ring length (power of two).
    pub fn ring_len(mut self, n: usize) -> Self {
        self.ring_len = n;
        self
    }

    /// Enable or disable per-group timer threads.
    pub fn start_timers(mut self, enable: bool) -> Self {
        self.start_timers = enable;
        self
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.capacity > 0
            && self.ring_len >= 2
            && self.ring_len.is_power_of_two()
            && !self.tick_period.is_zero()
    }
}
