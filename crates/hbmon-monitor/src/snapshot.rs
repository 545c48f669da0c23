//! The periodic snapshot engine.
//!
//! Once per tick period, per group, the engine folds the live counter
//! slots with the detach history, publishes the global measure, appends
//! to the history ring, and recomputes every configured window measure.
//! The tick runs under the group's membership *read* lock: it blocks
//! attach/detach on this group, never heartbeats, never other groups.
//!
//! Each group drives its own ticks from a dedicated thread. The next
//! deadline is taken at tick start, before the measures are computed,
//! so the period runs schedule-to-schedule; and one group's ticks are
//! never concurrent with each other, since the next sleep only begins
//! after the current tick returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use hbmon_core::constants::MAX_WINDOWS;
use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::kerror;

use crate::group::{Group, HistoryEntry};

impl Group {
    /// Run one snapshot tick with `now` as the current time.
    ///
    /// A no-op before the group's clock started. The view of the
    /// counters is not atomic across slots; concurrent heartbeats land
    /// in this tick or the next, but the published global count never
    /// decreases.
    pub fn tick(&self, now: Instant) {
        let origin = match self.time_origin() {
            Some(origin) => origin,
            None => return,
        };
        let members = self.read_members();

        let elapsed_ns = now.saturating_duration_since(origin).as_nanos() as u64;
        let view = self.counters_view();
        let mg = self.measures_goal_view();
        let measures = mg.measures();
        let goal = mg.goal();

        let mut hist = self.history();

        let mut total = hist.total;
        for producer in &members.producers {
            total += view.slot(producer.slot).count();
        }
        measures.global.store(total, elapsed_ns);

        let cursor = hist.cursor;
        hist.entries[cursor] = HistoryEntry {
            count: total,
            elapsed_ns,
        };

        if hist.filled != 0 {
            let mask = self.ring_len() - 1;
            for i in 0..MAX_WINDOWS {
                let ws = goal.window_size[i].load(Ordering::Relaxed) as usize;
                // Unconfigured, or not enough history yet: leave the
                // prior measure alone so readers see "unavailable"
                // rather than a rate over insufficient history.
                if ws == 0 || ws > hist.filled {
                    continue;
                }
                let first = cursor.wrapping_sub(ws) & mask;
                let entry = hist.entries[first];
                measures.window[i].store(
                    total.saturating_sub(entry.count),
                    elapsed_ns.saturating_sub(entry.elapsed_ns),
                );
            }
        }

        if hist.filled < self.ring_len() {
            hist.filled += 1;
        }
        hist.cursor = (cursor + 1) & (self.ring_len() - 1);
    }
}

/// Handle to a group's running timer thread.
pub(crate) struct TimerHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl TimerHandle {
    /// Spawn the tick thread for `group`.
    pub fn start(group: &Arc<Group>) -> MonitorResult<TimerHandle> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let weak = Arc::downgrade(group);
        let flag = Arc::clone(&shutdown);
        let period = group.tick_period();
        let thread = thread::Builder::new()
            .name(format!("hbmon-tick-{}", group.gid()))
            .spawn(move || tick_loop(weak, flag, period))
            .map_err(|_| {
                kerror!("group {}: timer thread spawn failed", group.gid());
                MonitorError::ResourceUnavailable
            })?;
        Ok(TimerHandle {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Cancel the timer and wait for any in-flight tick to finish, so
    /// no tick can observe a freed region.
    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            thread.thread().unpark();
            let _ = thread.join();
        }
    }
}

fn tick_loop(group: Weak<Group>, shutdown: Arc<AtomicBool>, period: Duration) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        // Schedule the next tick first, then compute: the period runs
        // from one schedule point to the next.
        let deadline = Instant::now() + period;
        match group.upgrade() {
            Some(group) => group.tick(Instant::now()),
            None => break,
        }
        loop {
            if shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::group::ProducerMember;
    use hbmon_core::id::Caller;

    fn test_config() -> MonitorConfig {
        MonitorConfig::default()
            .capacity(8)
            .ring_len(8)
            .start_timers(false)
    }

    /// Group with its clock started and one producer in slot 0.
    fn group_with_producer(tid: i32) -> (Arc<Group>, Instant) {
        let group = Arc::new(Group::new(1, &test_config()).unwrap());
        group.start_clock(Instant::now());
        let origin = group.time_origin().unwrap();
        let slot = group.slots.allocate().unwrap();
        group.counters_view().slot(slot).occupy(tid);
        group.write_members().producers.push(ProducerMember {
            caller: Caller::new(tid, 1),
            slot,
        });
        (group, origin)
    }

    #[test]
    fn test_tick_before_clock_is_noop() {
        let group = Group::new(1, &test_config()).unwrap();
        group.tick(Instant::now());
        assert_eq!(group.measures_goal_view().measures().global.load(), (0, 0));
    }

    #[test]
    fn test_global_count_equals_heartbeats() {
        let (group, origin) = group_with_producer(100);
        group.counters_view().slot(0).beat(1000);
        group.tick(origin + Duration::from_secs(1));
        let (count, time) = group.measures_goal_view().measures().global.load();
        assert_eq!(count, 1000);
        assert_eq!(time, 1_000_000_000);
    }

    #[test]
    fn test_global_count_is_monotonic() {
        let (group, origin) = group_with_producer(100);
        let view = group.counters_view();
        let mut last = 0;
        for k in 1..=20u32 {
            view.slot(0).beat(u64::from(k % 3));
            group.tick(origin + Duration::from_millis(u64::from(k) * 100));
            let (count, _) = group.measures_goal_view().measures().global.load();
            assert!(count >= last);
            last = count;
        }
    }

    #[test]
    fn test_window_measure_over_sliding_window() {
        let (group, origin) = group_with_producer(100);
        let key = group.add_window(2).unwrap();
        let view = group.counters_view();

        // 10 beats per 100ms tick, 5 ticks.
        for k in 1..=5u64 {
            view.slot(0).beat(10);
            group.tick(origin + Duration::from_millis(k * 100));
        }
        let (count, time) =
            group.measures_goal_view().measures().window[key - 1].load();
        // The last two ticks contributed 20 beats over 200ms.
        assert_eq!(count, 20);
        assert_eq!(time, 200_000_000);
    }

    #[test]
    fn test_window_longer_than_history_stays_unset() {
        let (group, origin) = group_with_producer(100);
        let key = group.add_window(4).unwrap();
        let view = group.counters_view();

        // Only two ticks: a 4-tick window has insufficient history.
        for k in 1..=2u64 {
            view.slot(0).beat(10);
            group.tick(origin + Duration::from_millis(k * 100));
        }
        assert_eq!(
            group.measures_goal_view().measures().window[key - 1].load(),
            (0, 0)
        );

        // Two more ticks and it becomes available.
        for k in 3..=4u64 {
            view.slot(0).beat(10);
            group.tick(origin + Duration::from_millis(k * 100));
        }
        let (count, time) =
            group.measures_goal_view().measures().window[key - 1].load();
        assert_eq!(count, 40);
        assert_eq!(time, 400_000_000);
    }

    #[test]
    fn test_detached_history_is_summed() {
        let (group, origin) = group_with_producer(100);
        let view = group.counters_view();
        view.slot(0).beat(500);

        // Fold the producer away the same way detach does.
        let last = view.slot(0).vacate();
        group.history().total += last;
        group.write_members().producers.clear();
        group.slots.release(0);

        group.tick(origin + Duration::from_millis(100));
        let (count, _) = group.measures_goal_view().measures().global.load();
        assert_eq!(count, 500);
    }

    #[test]
    fn test_timer_thread_publishes_measures() {
        let config = test_config().tick_period(Duration::from_millis(5));
        let group = Arc::new(Group::new(1, &config).unwrap());
        group.start_clock(Instant::now());
        let handle = TimerHandle::start(&group).unwrap();

        let published = (0..200).any(|_| {
            thread::sleep(Duration::from_millis(5));
            let (_, time) = group.measures_goal_view().measures().global.load();
            time > 0
        });
        handle.stop();
        assert!(published, "timer never published a measure");
    }
}
