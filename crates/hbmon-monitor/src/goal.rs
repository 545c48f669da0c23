//! Goal and window management, plus the rate queries.
//!
//! All of this state lives in the shared measures-and-goal page, so
//! both the service and mapped clients run the same logic over the same
//! bytes. The window table is keyed 1..=[`MAX_WINDOWS`]; key 0 always
//! means the global measure. Mutations and queries both serialize on
//! the goal's embedded spin lock, so a reader never pairs a bound from
//! one goal with the scope of another.

use std::sync::atomic::Ordering;

use hbmon_core::constants::MAX_WINDOWS;
use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::layout::{Goal, MeasuresGoalView};
use hbmon_core::rate::{scale_bound, scaled_rate};

use crate::group::Group;

impl Group {
    /// Register a window of `size` ticks and return its key.
    ///
    /// Idempotent: an already-registered size returns its existing key,
    /// so the whole table is scanned before any free entry is taken.
    pub fn add_window(&self, size: usize) -> MonitorResult<usize> {
        if size == 0 || size > self.ring_len() {
            return Err(MonitorError::InvalidArgument);
        }
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        claim_window(goal, size)
    }

    /// Unregister the window of `size` ticks and clear its measure.
    ///
    /// The window the goal currently targets cannot be removed.
    pub fn del_window(&self, size: usize) -> MonitorResult<()> {
        if size == 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        if goal.scope.load(Ordering::Relaxed) as usize == size {
            return Err(MonitorError::InvalidArgument);
        }
        for (i, slot) in goal.window_size.iter().enumerate() {
            if slot.load(Ordering::Relaxed) as usize == size {
                slot.store(0, Ordering::Relaxed);
                mg.measures().window[i].store(0, 0);
                return Ok(());
            }
        }
        Err(MonitorError::NotFound)
    }

    /// Set the rate goal: `min..=max` heartbeats per second over the
    /// window of `window_size` ticks, or over the whole run when
    /// `window_size` is 0. Registers the window as a side effect and
    /// returns its key (0 for global).
    pub fn set_goal(&self, window_size: usize, min: f64, max: f64) -> MonitorResult<usize> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < min {
            return Err(MonitorError::InvalidArgument);
        }
        if window_size > self.ring_len() {
            return Err(MonitorError::InvalidArgument);
        }
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        let key = if window_size > 0 {
            claim_window(goal, window_size)?
        } else {
            0
        };
        goal.min_heart_rate.store(scale_bound(min), Ordering::Relaxed);
        goal.max_heart_rate.store(scale_bound(max), Ordering::Relaxed);
        goal.scope.store(window_size as u64, Ordering::Relaxed);
        Ok(key)
    }

    /// Clear the rate goal. The goal's window stays registered.
    pub fn unset_goal(&self) {
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        goal.min_heart_rate.store(0, Ordering::Relaxed);
        goal.max_heart_rate.store(0, Ordering::Relaxed);
        goal.scope.store(0, Ordering::Relaxed);
    }

    /// Number of registered windows.
    pub fn windows_number(&self) -> usize {
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        goal.window_size
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Length in ticks of the window behind `key`.
    pub fn window_size(&self, key: usize) -> MonitorResult<usize> {
        if key == 0 || key > MAX_WINDOWS {
            return Err(MonitorError::InvalidArgument);
        }
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        match goal.window_size[key - 1].load(Ordering::Relaxed) as usize {
            0 => Err(MonitorError::NotFound),
            n => Ok(n),
        }
    }

    /// Scaled heart rate for `key` (0 = global), with the window length
    /// it was measured over (0 for global).
    ///
    /// Fails with [`MonitorError::ResourceUnavailable`] until the
    /// snapshot engine has published a measure with nonzero elapsed
    /// time; for a window that means enough ticks to cover its length.
    pub fn heart_rate(&self, key: usize) -> MonitorResult<(u64, usize)> {
        if key > MAX_WINDOWS {
            return Err(MonitorError::InvalidArgument);
        }
        let mg = self.measures_goal_view();
        let _guard = mg.goal().lock.lock();
        rate_for_key(&mg, key)
    }

    /// Scaled heart rate over the window of `size` ticks (0 = global),
    /// with the key it resolved to.
    pub fn seek_heart_rate(&self, size: usize) -> MonitorResult<(u64, usize)> {
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        if size == 0 {
            let (rate, _) = rate_for_key(&mg, 0)?;
            return Ok((rate, 0));
        }
        let key = goal
            .window_size
            .iter()
            .position(|slot| slot.load(Ordering::Relaxed) as usize == size)
            .map(|i| i + 1)
            .ok_or(MonitorError::NotFound)?;
        let (rate, _) = rate_for_key(&mg, key)?;
        Ok((rate, key))
    }

    /// The goal's scaled lower bound and its window length scope, read
    /// as one consistent pair.
    pub fn min_heart_rate(&self) -> (u64, usize) {
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        (
            goal.min_heart_rate.load(Ordering::Relaxed),
            goal.scope.load(Ordering::Relaxed) as usize,
        )
    }

    /// The goal's scaled upper bound and its window length scope, read
    /// as one consistent pair.
    pub fn max_heart_rate(&self) -> (u64, usize) {
        let mg = self.measures_goal_view();
        let goal = mg.goal();
        let _guard = goal.lock.lock();
        (
            goal.max_heart_rate.load(Ordering::Relaxed),
            goal.scope.load(Ordering::Relaxed) as usize,
        )
    }
}

/// Find or claim a window table entry for `size`. The goal lock must be
/// held. Scans the whole table first so a hole left by a deleted window
/// can never shadow an existing registration.
fn claim_window(goal: &Goal, size: usize) -> MonitorResult<usize> {
    let mut free = None;
    for (i, slot) in goal.window_size.iter().enumerate() {
        match slot.load(Ordering::Relaxed) as usize {
            n if n == size => return Ok(i + 1),
            0 if free.is_none() => free = Some(i),
            _ => {}
        }
    }
    match free {
        Some(i) => {
            goal.window_size[i].store(size as u64, Ordering::Relaxed);
            Ok(i + 1)
        }
        None => Err(MonitorError::CapacityExhausted),
    }
}

/// Rate read for one key. The goal lock must be held.
fn rate_for_key(mg: &MeasuresGoalView, key: usize) -> MonitorResult<(u64, usize)> {
    if key == 0 {
        let (count, time_ns) = mg.measures().global.load();
        if time_ns == 0 {
            return Err(MonitorError::ResourceUnavailable);
        }
        return Ok((scaled_rate(count, time_ns), 0));
    }
    let ws = mg.goal().window_size[key - 1].load(Ordering::Relaxed) as usize;
    if ws == 0 {
        return Err(MonitorError::NotFound);
    }
    let (count, time_ns) = mg.measures().window[key - 1].load();
    if time_ns == 0 {
        return Err(MonitorError::ResourceUnavailable);
    }
    Ok((scaled_rate(count, time_ns), ws))
}
