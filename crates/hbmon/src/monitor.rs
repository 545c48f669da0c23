//! The attached-client handle.
//!
//! [`Monitor`] goes through the service's command channel for attach
//! and detach, then works on the mapped shared layout for everything
//! else. Goal mutations and reads serialize on the spin lock embedded
//! in the shared page, so they compose with the service and with
//! clients in other processes operating on the same bytes.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use hbmon_core::constants::{CACHE_LINE_BYTES, MAX_WINDOWS, PAGE_SIZE};
use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::id::Caller;
use hbmon_core::layout::{CountersView, Goal, MeasuresGoalView};
use hbmon_core::rate::{rate_hz, scale_bound, unscale_bound};
use hbmon_monitor::channel;
use hbmon_monitor::{Group, HeartRateMonitor, RegionKind, Role};

/// A client attached to one group.
///
/// Producers emit heartbeats and manage the goal; observers read rates
/// and member tids. Dropping the handle detaches.
pub struct Monitor {
    service: Arc<HeartRateMonitor>,
    caller: Caller,
    gid: i32,
    role: Role,
    slot: usize,
    capacity: usize,
    ring_len: usize,
    counters: CountersView,
    measures_goal: MeasuresGoalView,
    // Pins the regions: the views stay valid even if the group is
    // retired underneath us by another member detaching.
    _group: Arc<Group>,
    detached: bool,
}

impl Monitor {
    /// Attach the current thread to group `gid` as a producer.
    pub fn attach(service: Arc<HeartRateMonitor>, gid: i32) -> MonitorResult<Monitor> {
        Self::attach_as(service, Caller::current(), gid, Role::Producer)
    }

    /// Attach the current thread to group `gid` as an observer.
    pub fn observe(service: Arc<HeartRateMonitor>, gid: i32) -> MonitorResult<Monitor> {
        Self::attach_as(service, Caller::current(), gid, Role::Consumer)
    }

    /// Attach an explicit caller identity, for embedders that manage
    /// identities themselves.
    pub fn attach_as(
        service: Arc<HeartRateMonitor>,
        caller: Caller,
        gid: i32,
        role: Role,
    ) -> MonitorResult<Monitor> {
        channel::write(&service, caller, role, &gid.to_string())?;
        match Self::map_and_wrap(&service, caller, gid, role) {
            Ok(monitor) => Ok(monitor),
            Err(e) => {
                // Undo the attach; the handle was never handed out.
                let _ = channel::write(&service, caller, role, &format!("-{gid}"));
                Err(e)
            }
        }
    }

    fn map_and_wrap(
        service: &Arc<HeartRateMonitor>,
        caller: Caller,
        gid: i32,
        role: Role,
    ) -> MonitorResult<Monitor> {
        let capacity = service.config().capacity;
        let ring_len = service.config().ring_len;
        let group = service.group(gid)?;

        let counters_size = capacity * CACHE_LINE_BYTES;
        let counters_addr =
            service.map_region(caller, gid, RegionKind::Counters, counters_size)?;
        let mg_addr = service.map_region(caller, gid, RegionKind::MeasuresGoal, PAGE_SIZE)?;
        let slot = match role {
            Role::Producer => service.producer_slot(caller, gid)?,
            Role::Consumer => 0,
        };

        // Safety: the service vouches for the mapped sizes, and `group`
        // keeps the backing regions alive for the handle's lifetime.
        let counters = unsafe { CountersView::new(counters_addr as *mut u8, capacity) };
        let measures_goal = unsafe { MeasuresGoalView::new(mg_addr as *mut u8) };

        Ok(Monitor {
            service: Arc::clone(service),
            caller,
            gid,
            role,
            slot,
            capacity,
            ring_len,
            counters,
            measures_goal,
            _group: group,
            detached: false,
        })
    }

    pub fn gid(&self) -> i32 {
        self.gid
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn require_producer(&self) -> MonitorResult<()> {
        match self.role {
            Role::Producer => Ok(()),
            Role::Consumer => Err(MonitorError::PermissionDenied),
        }
    }

    /// Emit `n` heartbeats. One atomic add on the caller's own cache
    /// line; observers cannot beat.
    #[inline]
    pub fn heartbeat(&self, n: u64) -> MonitorResult<()> {
        self.require_producer()?;
        self.counters.slot(self.slot).beat(n);
        Ok(())
    }

    /// Register a window of `size` ticks and return its key. An
    /// already-registered size returns its existing key.
    pub fn add_window(&self, size: usize) -> MonitorResult<usize> {
        self.require_producer()?;
        if size == 0 || size > self.ring_len {
            return Err(MonitorError::InvalidArgument);
        }
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        claim_window(goal, size)
    }

    /// Unregister the window of `size` ticks. The goal's current scope
    /// cannot be removed.
    pub fn del_window(&self, size: usize) -> MonitorResult<()> {
        self.require_producer()?;
        if size == 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        if goal.scope.load(Ordering::Relaxed) as usize == size {
            return Err(MonitorError::InvalidArgument);
        }
        for (i, slot) in goal.window_size.iter().enumerate() {
            if slot.load(Ordering::Relaxed) as usize == size {
                slot.store(0, Ordering::Relaxed);
                self.measures_goal.measures().window[i].store(0, 0);
                return Ok(());
            }
        }
        Err(MonitorError::NotFound)
    }

    /// Set the goal: `min..=max` heartbeats per second over a window of
    /// `window_size` ticks (0 targets the whole run). Returns the key
    /// of the goal's window, 0 for global.
    pub fn set_goal(&self, window_size: usize, min: f64, max: f64) -> MonitorResult<usize> {
        self.require_producer()?;
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < min {
            return Err(MonitorError::InvalidArgument);
        }
        if window_size > self.ring_len {
            return Err(MonitorError::InvalidArgument);
        }
        let goal = self.measures_goal.goal();
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

    /// Clear the goal. Its window stays registered.
    pub fn unset_goal(&self) -> MonitorResult<()> {
        self.require_producer()?;
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        goal.min_heart_rate.store(0, Ordering::Relaxed);
        goal.max_heart_rate.store(0, Ordering::Relaxed);
        goal.scope.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Number of registered windows.
    pub fn get_windows_number(&self) -> usize {
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        goal.window_size
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }

    /// Window length in ticks behind `key` (key 0 is the global scope
    /// and has length 0).
    pub fn get_window_size(&self, key: usize) -> MonitorResult<usize> {
        if key > MAX_WINDOWS {
            return Err(MonitorError::InvalidArgument);
        }
        if key == 0 {
            return Ok(0);
        }
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        match goal.window_size[key - 1].load(Ordering::Relaxed) as usize {
            0 => Err(MonitorError::NotFound),
            n => Ok(n),
        }
    }

    /// Heart rate in beats per second for `key` (0 = global), with the
    /// window length it covers.
    ///
    /// Unavailable until the snapshot engine has published a measure
    /// with nonzero elapsed time.
    pub fn get_heart_rate(&self, key: usize) -> MonitorResult<(f64, usize)> {
        if key > MAX_WINDOWS {
            return Err(MonitorError::InvalidArgument);
        }
        let _guard = self.measures_goal.goal().lock.lock();
        rate_for_key(&self.measures_goal, key)
    }

    /// Heart rate over the window of `size` ticks (0 = global), with
    /// the key it resolved to.
    pub fn seek_heart_rate(&self, size: usize) -> MonitorResult<(f64, usize)> {
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        if size == 0 {
            let (hr, _) = rate_for_key(&self.measures_goal, 0)?;
            return Ok((hr, 0));
        }
        let key = goal
            .window_size
            .iter()
            .position(|slot| slot.load(Ordering::Relaxed) as usize == size)
            .map(|i| i + 1)
            .ok_or(MonitorError::NotFound)?;
        let (hr, _) = rate_for_key(&self.measures_goal, key)?;
        Ok((hr, key))
    }

    /// The goal's lower bound in beats per second, with its scope,
    /// read as one consistent pair.
    pub fn get_min_heart_rate(&self) -> (f64, usize) {
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        (
            unscale_bound(goal.min_heart_rate.load(Ordering::Relaxed)),
            goal.scope.load(Ordering::Relaxed) as usize,
        )
    }

    /// The goal's upper bound in beats per second, with its scope,
    /// read as one consistent pair.
    pub fn get_max_heart_rate(&self) -> (f64, usize) {
        let goal = self.measures_goal.goal();
        let _guard = goal.lock.lock();
        (
            unscale_bound(goal.max_heart_rate.load(Ordering::Relaxed)),
            goal.scope.load(Ordering::Relaxed) as usize,
        )
    }

    /// Fill `tids` with the group's live producer tids, in slot order,
    /// stopping at the buffer's end. Returns how many were written.
    /// An observer-side operation.
    pub fn get_tids(&self, tids: &mut [i32]) -> MonitorResult<usize> {
        if self.role != Role::Consumer {
            return Err(MonitorError::PermissionDenied);
        }
        let mut written = 0;
        for i in 0..self.capacity {
            if written == tids.len() {
                break;
            }
            let slot = self.counters.slot(i);
            if slot.is_used() {
                tids[written] = slot.tid.load(Ordering::Relaxed);
                written += 1;
            }
        }
        Ok(written)
    }

    /// Detach from the group. Consumes the handle; a producer's final
    /// count is folded into the group history.
    pub fn detach(mut self) -> MonitorResult<()> {
        self.detached = true;
        channel::write(
            &self.service,
            self.caller,
            self.role,
            &format!("-{}", self.gid),
        )
    }
}

impl std::fmt::Debug for Monitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("gid", &self.gid)
            .field("role", &self.role)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if !self.detached {
            let _ = channel::write(
                &self.service,
                self.caller,
                self.role,
                &format!("-{}", self.gid),
            );
        }
    }
}

/// Find or claim a window table entry for `size`. The goal lock must
/// be held. Scans the whole table first so a hole left by a deleted
/// window can never shadow an existing registration.
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
fn rate_for_key(mg: &MeasuresGoalView, key: usize) -> MonitorResult<(f64, usize)> {
    if key == 0 {
        let (count, time_ns) = mg.measures().global.load();
        if time_ns == 0 {
            return Err(MonitorError::ResourceUnavailable);
        }
        return Ok((rate_hz(count, time_ns), 0));
    }
    let ws = mg.goal().window_size[key - 1].load(Ordering::Relaxed) as usize;
    if ws == 0 {
        return Err(MonitorError::NotFound);
    }
    let (count, time_ns) = mg.measures().window[key - 1].load();
    if time_ns == 0 {
        return Err(MonitorError::ResourceUnavailable);
    }
    Ok((rate_hz(count, time_ns), ws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmon_monitor::MonitorConfig;
    use std::time::{Duration, Instant};

    fn service() -> Arc<HeartRateMonitor> {
        Arc::new(
            HeartRateMonitor::new(
                MonitorConfig::default()
                    .capacity(4)
                    .ring_len(8)
                    .start_timers(false),
            )
            .unwrap(),
        )
    }

    fn producer(service: &Arc<HeartRateMonitor>, tid: i32, gid: i32) -> Monitor {
        Monitor::attach_as(
            Arc::clone(service),
            Caller::new(tid, 1000),
            gid,
            Role::Producer,
        )
        .unwrap()
    }

    fn observer(service: &Arc<HeartRateMonitor>, tid: i32, gid: i32) -> Monitor {
        Monitor::attach_as(
            Arc::clone(service),
            Caller::new(tid, 1000),
            gid,
            Role::Consumer,
        )
        .unwrap()
    }

    fn tick_times(service: &Arc<HeartRateMonitor>, gid: i32, count: u64, period: Duration) {
        let group = service.group(gid).unwrap();
        let origin = group.time_origin().unwrap();
        for k in 1..=count {
            group.tick(origin + period * k as u32);
        }
    }

    #[test]
    fn test_thousand_beats_over_a_second() {
        let s = service();
        let m = producer(&s, 1, 7);
        m.heartbeat(1000).unwrap();
        tick_times(&s, 7, 1, Duration::from_secs(1));

        let (hr, ws) = m.get_heart_rate(0).unwrap();
        assert!((hr - 1000.0).abs() < 1e-6, "hr = {hr}");
        assert_eq!(ws, 0);
        m.detach().unwrap();
    }

    #[test]
    fn test_window_rate_via_client_registration() {
        let s = service();
        let m = producer(&s, 1, 7);
        let key = m.add_window(2).unwrap();
        let group = s.group(7).unwrap();
        let origin = group.time_origin().unwrap();

        // 50 beats per 100ms tick.
        for k in 1..=4u64 {
            m.heartbeat(50).unwrap();
            group.tick(origin + Duration::from_millis(k * 100));
        }
        let (hr, ws) = m.get_heart_rate(key).unwrap();
        assert!((hr - 500.0).abs() < 1e-6, "hr = {hr}");
        assert_eq!(ws, 2);
        assert_eq!(m.seek_heart_rate(2).unwrap().1, key);
        // Registration went through the shared page.
        assert_eq!(group.window_size(key).unwrap(), 2);
    }

    #[test]
    fn test_goal_round_trips_through_shared_page() {
        let s = service();
        let m = producer(&s, 1, 7);
        let key = m.set_goal(4, 2.0, 5.0).unwrap();
        assert!(key >= 1);
        assert_eq!(m.get_min_heart_rate(), (2.0, 4));
        assert_eq!(m.get_max_heart_rate(), (5.0, 4));
        assert_eq!(m.get_window_size(key).unwrap(), 4);

        // The service sees the same goal.
        assert_eq!(s.group(7).unwrap().min_heart_rate(), (2000, 4));

        assert_eq!(
            m.del_window(4).unwrap_err(),
            MonitorError::InvalidArgument
        );
        m.unset_goal().unwrap();
        assert_eq!(m.get_min_heart_rate(), (0.0, 0));
        m.del_window(4).unwrap();
        assert_eq!(m.get_windows_number(), 0);
    }

    #[test]
    fn test_goal_reads_consistent_across_handles() {
        let s = service();
        let writer = producer(&s, 1, 7);
        let reader = producer(&s, 2, 7);
        writer.set_goal(2, 1.0, 2.0).unwrap();

        let flipper = std::thread::spawn(move || {
            for k in 0..2000 {
                if k % 2 == 0 {
                    writer.set_goal(2, 1.0, 2.0).unwrap();
                } else {
                    writer.set_goal(4, 10.0, 20.0).unwrap();
                }
            }
            writer
        });
        for _ in 0..10_000 {
            let min = reader.get_min_heart_rate();
            assert!(
                min == (1.0, 2) || min == (10.0, 4),
                "torn goal read: {min:?}"
            );
            let max = reader.get_max_heart_rate();
            assert!(
                max == (2.0, 2) || max == (20.0, 4),
                "torn goal read: {max:?}"
            );
        }
        let _writer = flipper.join().unwrap();
    }

    #[test]
    fn test_observer_permissions() {
        let s = service();
        let p = producer(&s, 1, 7);
        let o = observer(&s, 2, 7);

        assert_eq!(o.heartbeat(1).unwrap_err(), MonitorError::PermissionDenied);
        assert_eq!(
            o.set_goal(2, 1.0, 2.0).unwrap_err(),
            MonitorError::PermissionDenied
        );
        assert_eq!(o.unset_goal().unwrap_err(), MonitorError::PermissionDenied);
        assert_eq!(
            p.get_tids(&mut [0; 4]).unwrap_err(),
            MonitorError::PermissionDenied
        );
    }

    #[test]
    fn test_get_tids_is_bounded_by_buffer() {
        let s = service();
        let _p1 = producer(&s, 11, 7);
        let _p2 = producer(&s, 12, 7);
        let _p3 = producer(&s, 13, 7);
        let o = observer(&s, 99, 7);

        let mut tids = [0i32; 8];
        assert_eq!(o.get_tids(&mut tids).unwrap(), 3);
        assert_eq!(&tids[..3], &[11, 12, 13]);

        let mut small = [0i32; 2];
        assert_eq!(o.get_tids(&mut small).unwrap(), 2);
        assert_eq!(small, [11, 12]);
    }

    #[test]
    fn test_drop_detaches() {
        let s = service();
        {
            let _m = producer(&s, 1, 7);
            assert!(s.group(7).is_ok());
        }
        assert_eq!(s.group(7).unwrap_err(), MonitorError::NotFound);
    }

    #[test]
    fn test_attach_to_invalid_gid_fails() {
        let s = service();
        let err = Monitor::attach_as(
            Arc::clone(&s),
            Caller::new(1, 1000),
            0,
            Role::Producer,
        )
        .unwrap_err();
        assert_eq!(err, MonitorError::InvalidArgument);
    }

    #[test]
    fn test_rates_unavailable_before_first_tick() {
        let s = service();
        let m = producer(&s, 1, 7);
        assert_eq!(
            m.get_heart_rate(0).unwrap_err(),
            MonitorError::ResourceUnavailable
        );
        assert_eq!(m.get_heart_rate(1).unwrap_err(), MonitorError::NotFound);
        assert_eq!(
            m.get_heart_rate(MAX_WINDOWS + 1).unwrap_err(),
            MonitorError::InvalidArgument
        );
    }

    #[test]
    fn test_live_timer_publishes_rates() {
        let s = Arc::new(
            HeartRateMonitor::new(
                MonitorConfig::default()
                    .capacity(4)
                    .tick_period(Duration::from_millis(5)),
            )
            .unwrap(),
        );
        let m = producer(&s, 1, 7);
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut available = false;
        while Instant::now() < deadline {
            m.heartbeat(10).unwrap();
            if m.get_heart_rate(0).is_ok() {
                available = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(available, "timer never published the global rate");
    }
}
