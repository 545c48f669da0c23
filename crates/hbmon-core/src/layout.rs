//! Shared memory layout.
//!
//! A group owns two regions, shared across all of its members' address
//! spaces:
//!
//! - **Counters**: an array of cache-line-sized [`CounterSlot`]s, one
//!   per attached producer. Slot `i` lives at `base + i * 64`.
//! - **Measures and goal**: one page. [`Measures`] sits at the mapped
//!   base; [`Goal`] sits at the page tail (`PAGE_SIZE - size_of::<Goal>`)
//!   so the measures can grow without moving the goal.
//!
//! All fields are atomics: counters are single-writer (the owning
//! producer), measures are single-writer (the snapshot engine) and read
//! unlocked by consumers, and the goal fields are serialized by the
//! embedded [`RawSpinLock`]. Core logic refers to slots by index; a raw
//! address only appears at the mapping-service boundary, wrapped in the
//! typed views below.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::constants::{CACHE_LINE_BYTES, MAX_WINDOWS, PAGE_SIZE};
use crate::spinlock::RawSpinLock;

/// One producer's counter, alone on its cache line.
#[repr(C, align(64))]
pub struct CounterSlot {
    /// Identity of the owning producer; valid while `used != 0`.
    pub tid: AtomicI32,
    /// Nonzero while the slot is allocated to a producer.
    pub used: AtomicU32,
    /// Monotonically increasing event count. Written only by the
    /// owning producer, via atomic add.
    pub counter: AtomicU64,
}

impl CounterSlot {
    /// Claim the slot for a newly attached producer.
    pub fn occupy(&self, tid: i32) {
        self.tid.store(tid, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
        self.used.store(1, Ordering::Release);
    }

    /// Mark the slot free and return the final counter value, which the
    /// caller folds into the group history so the total survives reuse.
    pub fn vacate(&self) -> u64 {
        self.used.store(0, Ordering::Release);
        self.counter.load(Ordering::Relaxed)
    }

    /// Record `n` heartbeats. The hot path: one atomic add, no lock.
    #[inline]
    pub fn beat(&self, n: u64) {
        self.counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.counter.load(Ordering::Relaxed)
    }
}

/// One {event count, elapsed time} pair.
///
/// Readers see the two halves tear-free individually but not as a pair;
/// rates are approximate by design and the snapshot engine is the only
/// writer.
#[repr(C)]
pub struct Measure {
    count: AtomicU64,
    time_ns: AtomicU64,
}

impl Measure {
    #[inline]
    pub fn store(&self, count: u64, time_ns: u64) {
        self.count.store(count, Ordering::Relaxed);
        self.time_ns.store(time_ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> (u64, u64) {
        (
            self.count.load(Ordering::Relaxed),
            self.time_ns.load(Ordering::Relaxed),
        )
    }
}

/// The derived statistics block, written once per tick.
#[repr(C)]
pub struct Measures {
    pub global: Measure,
    pub window: [Measure; MAX_WINDOWS],
}

/// The tunable goal block, protected by its embedded spin lock.
///
/// `window_size[i]` is the configured length (in ticks) of window key
/// `i + 1`, or 0 for an unused table slot. `scope` is the window length
/// the min/max bounds currently target (0 = global). Bounds are stored
/// scaled by [`crate::constants::MEASURE_SCALE`].
#[repr(C)]
pub struct Goal {
    pub lock: RawSpinLock,
    pub min_heart_rate: AtomicU64,
    pub max_heart_rate: AtomicU64,
    pub scope: AtomicU64,
    pub window_size: [AtomicU64; MAX_WINDOWS],
}

/// Byte offset of [`Measures`] within its region.
pub const MEASURES_OFFSET: usize = 0;

/// Byte offset of [`Goal`]: at the page tail.
pub const GOAL_OFFSET: usize = PAGE_SIZE - core::mem::size_of::<Goal>();

// Layout invariants the rest of the crate relies on.
const _: () = {
    assert!(core::mem::size_of::<CounterSlot>() == CACHE_LINE_BYTES);
    assert!(core::mem::size_of::<Measures>() <= GOAL_OFFSET);
    assert!(GOAL_OFFSET % core::mem::align_of::<Goal>() == 0);
};

/// Typed view over a mapped counters region.
#[derive(Clone, Copy)]
pub struct CountersView {
    base: NonNull<u8>,
    capacity: usize,
}

// Safety: every field behind the view is an atomic; the creator of the
// view vouches for the mapping's lifetime (see `new`).
unsafe impl Send for CountersView {}
unsafe impl Sync for CountersView {}

impl CountersView {
    /// Wrap a mapped counters region.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable, zero-initialized region of at
    /// least `capacity * CACHE_LINE_BYTES` bytes that stays mapped for
    /// as long as the view (or any copy of it) is used.
    pub unsafe fn new(base: *mut u8, capacity: usize) -> Self {
        CountersView {
            base: NonNull::new(base).expect("counters region base is null"),
            capacity,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The slot at `index`.
    #[inline]
    pub fn slot(&self, index: usize) -> &CounterSlot {
        assert!(index < self.capacity, "slot index out of range");
        // Safety: in range per the assert, alignment per slot size.
        unsafe { &*(self.base.as_ptr().add(index * CACHE_LINE_BYTES) as *const CounterSlot) }
    }
}

/// Typed view over a mapped measures-and-goal page.
#[derive(Clone, Copy)]
pub struct MeasuresGoalView {
    base: NonNull<u8>,
}

// Safety: as for CountersView.
unsafe impl Send for MeasuresGoalView {}
unsafe impl Sync for MeasuresGoalView {}

impl MeasuresGoalView {
    /// Wrap a mapped measures-and-goal page.
    ///
    /// # Safety
    ///
    /// `base` must point to a readable+writable, zero-initialized page
    /// of `PAGE_SIZE` bytes that stays mapped for as long as the view
    /// (or any copy of it) is used.
    pub unsafe fn new(base: *mut u8) -> Self {
        MeasuresGoalView {
            base: NonNull::new(base).expect("measures region base is null"),
        }
    }

    #[inline]
    pub fn measures(&self) -> &Measures {
        // Safety: offset is in bounds and aligned per the const asserts.
        unsafe { &*(self.base.as_ptr().add(MEASURES_OFFSET) as *const Measures) }
    }

    #[inline]
    pub fn goal(&self) -> &Goal {
        // Safety: offset is in bounds and aligned per the const asserts.
        unsafe { &*(self.base.as_ptr().add(GOAL_OFFSET) as *const Goal) }
    }
}
