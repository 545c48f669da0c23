//! Spin locks for short critical sections.
//!
//! Two flavors live here. `SpinLock<T>` owns its data and protects the
//! per-group history ring. `RawSpinLock` wraps a bare lock word that
//! lives *inside* a shared memory page (the goal structure), so every
//! process mapping the page contends on the same word. Both hand out
//! guards, so the lock is released on every exit path including early
//! `?` returns.
//!
//! Hold times are a handful of field accesses; neither lock is meant
//! for anything that can block.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A data-owning spin lock.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// Safety: the lock serializes all access to `data`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is available.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinLockGuard { lock: self }
    }

    /// Acquire the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        SpinLock::new(T::default())
    }
}

/// Guard that releases the spin lock when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // Safety: we hold the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A test-and-set lock over a bare word in shared memory.
///
/// The word is part of the shared layout: 0 = free, 1 = held. The lock
/// protects the fields *around* it by convention; it owns no data.
#[repr(transparent)]
pub struct RawSpinLock(AtomicU32);

impl RawSpinLock {
    #[inline]
    pub const fn new() -> Self {
        RawSpinLock(AtomicU32::new(0))
    }

    /// Busy-wait until the word is ours.
    #[inline]
    pub fn lock(&self) -> RawSpinGuard<'_> {
        while self.0.swap(1, Ordering::Acquire) != 0 {
            while self.0.load(Ordering::Relaxed) != 0 {
                hint::spin_loop();
            }
        }
        RawSpinGuard { word: &self.0 }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<RawSpinGuard<'_>> {
        if self.0.swap(1, Ordering::Acquire) == 0 {
            Some(RawSpinGuard { word: &self.0 })
        } else {
            None
        }
    }
}

impl Default for RawSpinLock {
    fn default() -> Self {
        RawSpinLock::new()
    }
}

/// Guard for a `RawSpinLock`; the release is a plain store.
pub struct RawSpinGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for RawSpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}
