//! A monitored group: regions, members, history, clock.
//!
//! A group exists in the registry iff it has at least one producer or
//! consumer, and is destroyed exactly when both lists empty. The group
//! owns its two shared regions, its slot bitmap, its history ring, and
//! (once the first producer arrives) its periodic snapshot timer.

use std::sync::atomic::Ordering;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use hbmon_core::constants::{CACHE_LINE_BYTES, PAGE_SIZE};
use hbmon_core::error::MonitorResult;
use hbmon_core::id::{Caller, TaskId};
use hbmon_core::layout::{CountersView, MeasuresGoalView};
use hbmon_core::spinlock::{SpinLock, SpinLockGuard};

use crate::alloc::SlotBitmap;
use crate::config::MonitorConfig;
use crate::region::SharedRegion;
use crate::snapshot::TimerHandle;

/// One producer membership within a group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ProducerMember {
    pub caller: Caller,
    pub slot: usize,
}

/// One consumer membership within a group.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumerMember {
    pub caller: Caller,
}

#[derive(Default)]
pub(crate) struct Members {
    pub producers: Vec<ProducerMember>,
    pub consumers: Vec<ConsumerMember>,
}

impl Members {
    pub fn is_empty(&self) -> bool {
        self.producers.is_empty() && self.consumers.is_empty()
    }
}

/// One history ring entry: cumulative totals at a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct HistoryEntry {
    pub count: u64,
    pub elapsed_ns: u64,
}

/// Circular buffer of per-tick cumulative totals.
///
/// `total` absorbs the final counter value of every detached producer,
/// so aggregate counts survive slot reuse.
pub(crate) struct HistoryRing {
    pub entries: Box<[HistoryEntry]>,
    pub cursor: usize,
    pub filled: usize,
    pub total: u64,
}

impl HistoryRing {
    fn new(len: usize) -> Self {
        HistoryRing {
            entries: vec![HistoryEntry::default(); len].into_boxed_slice(),
            cursor: 0,
            filled: 0,
            total: 0,
        }
    }

    /// Record the implicit "zero heartbeats at the time origin" tick in
    /// entry 0 and move the write position past it. Entry 0 is already
    /// zeroed, so the first real tick can compute a size-1 window
    /// against the origin.
    pub fn prime(&mut self) {
        self.cursor = 1;
        self.filled = 1;
    }
}

/// A live monitored group.
pub struct Group {
    gid: i32,
    capacity: usize,
    ring_len: usize,
    tick_period: Duration,

    counters: SharedRegion,
    measures_goal: SharedRegion,

    pub(crate) slots: SlotBitmap,
    pub(crate) history: SpinLock<HistoryRing>,
    pub(crate) members: RwLock<Members>,

    origin: SpinLock<Option<Instant>>,
    timer: SpinLock<Option<TimerHandle>>,
}

impl Group {
    /// Allocate a fresh group with both regions zeroed. A failure at
    /// the second allocation unwinds the first before returning.
    pub(crate) fn new(gid: i32, config: &MonitorConfig) -> MonitorResult<Group> {
        let counters = SharedRegion::allocate(config.capacity * CACHE_LINE_BYTES)?;
        let measures_goal = SharedRegion::allocate(PAGE_SIZE)?;
        Ok(Group {
            gid,
            capacity: config.capacity,
            ring_len: config.ring_len,
            tick_period: config.tick_period,
            counters,
            measures_goal,
            slots: SlotBitmap::new(config.capacity),
            history: SpinLock::new(HistoryRing::new(config.ring_len)),
            members: RwLock::new(Members::default()),
            origin: SpinLock::new(None),
            timer: SpinLock::new(None),
        })
    }

    #[inline]
    pub fn gid(&self) -> i32 {
        self.gid
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// History ring length; also the longest configurable window.
    #[inline]
    pub fn ring_len(&self) -> usize {
        self.ring_len
    }

    #[inline]
    pub fn tick_period(&self) -> Duration {
        self.tick_period
    }

    pub(crate) fn counters_region(&self) -> &SharedRegion {
        &self.counters
    }

    pub(crate) fn measures_goal_region(&self) -> &SharedRegion {
        &self.measures_goal
    }

    /// Typed view of the counters region at its service-side address.
    pub fn counters_view(&self) -> CountersView {
        // Safety: the region is zero-initialized, sized for `capacity`
        // slots, and outlives `self`; views are only handed to code
        // that holds the group alive.
        unsafe { CountersView::new(self.counters.base(), self.capacity) }
    }

    /// Typed view of the measures-and-goal page at its service-side
    /// address.
    pub fn measures_goal_view(&self) -> MeasuresGoalView {
        // Safety: as for `counters_view`.
        unsafe { MeasuresGoalView::new(self.measures_goal.base()) }
    }

    /// The group's time origin: set when the first producer attached.
    pub fn time_origin(&self) -> Option<Instant> {
        *self.origin.lock()
    }

    /// Record the time origin and prime the history ring. Called once,
    /// under the registry lock, when the first producer attaches.
    pub(crate) fn start_clock(&self, now: Instant) {
        *self.origin.lock() = Some(now);
        self.history.lock().prime();
    }

    /// Forget the time origin so the next producer attach starts the
    /// clock (and the timer) again. For unwinding a failed first
    /// attach; no heartbeats have landed yet on that path, and the
    /// primed ring re-primes to the same state.
    pub(crate) fn reset_clock(&self) {
        *self.origin.lock() = None;
    }

    pub(crate) fn history(&self) -> SpinLockGuard<'_, HistoryRing> {
        self.history.lock()
    }

    pub(crate) fn read_members(&self) -> RwLockReadGuard<'_, Members> {
        self.members
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn write_members(&self) -> RwLockWriteGuard<'_, Members> {
        self.members
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn has_producer(&self, task: TaskId) -> bool {
        self.read_members()
            .producers
            .iter()
            .any(|p| p.caller.task == task)
    }

    pub(crate) fn has_consumer(&self, task: TaskId) -> bool {
        self.read_members()
            .consumers
            .iter()
            .any(|c| c.caller.task == task)
    }

    pub(crate) fn producer_slot(&self, task: TaskId) -> Option<usize> {
        self.read_members()
            .producers
            .iter()
            .find(|p| p.caller.task == task)
            .map(|p| p.slot)
    }

    pub(crate) fn set_timer(&self, handle: TimerHandle) {
        *self.timer.lock() = Some(handle);
    }

    /// Cancel the periodic timer and wait for any in-flight tick to
    /// finish. Must not be called while holding the membership lock.
    pub(crate) fn stop_timer(&self) {
        let handle = self.timer.lock().take();
        if let Some(handle) = handle {
            handle.stop();
        }
    }

    /// Tids of all currently used counter slots, in slot order.
    pub fn used_tids(&self) -> Vec<i32> {
        let view = self.counters_view();
        let mut tids = Vec::new();
        for i in 0..self.capacity {
            let slot = view.slot(i);
            if slot.is_used() {
                tids.push(slot.tid.load(Ordering::Relaxed));
            }
        }
        tids
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("gid", &self.gid)
            .field("capacity", &self.capacity)
            .field("ring_len", &self.ring_len)
            .finish_non_exhaustive()
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        // Regions are freed by their own Drop; the timer must already
        // be stopped by the destruction path, but a group dropped
        // without ever being registered has none.
        self.stop_timer();
    }
}
