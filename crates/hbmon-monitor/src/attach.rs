//! The monitor service: attach, detach, and region mapping.
//!
//! [`HeartRateMonitor`] owns the group registry and the mapping
//! service. Attach and detach run under the registry lock end to end,
//! so group creation, teardown, and membership changes are serialized
//! with each other; heartbeats never take it.

use std::sync::Arc;
use std::time::Instant;

use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::id::Caller;
use hbmon_core::{kinfo, kwarn};

use crate::config::MonitorConfig;
use crate::group::{ConsumerMember, Group, ProducerMember};
use crate::mapping::{MappingService, SameAddressSpace};
use crate::region::SharedRegion;
use crate::registry::GroupRegistry;
use crate::snapshot::TimerHandle;

/// Which of a group's two shared regions to map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Counters,
    MeasuresGoal,
}

/// The heart rate monitor service.
pub struct HeartRateMonitor {
    config: MonitorConfig,
    registry: GroupRegistry,
    mapping: Box<dyn MappingService>,
}

impl HeartRateMonitor {
    /// Build a monitor that hands out in-process addresses.
    pub fn new(config: MonitorConfig) -> MonitorResult<Self> {
        Self::with_mapping_service(config, Box::new(SameAddressSpace))
    }

    /// Build a monitor with a custom [`MappingService`], for embedders
    /// whose clients live in other address spaces.
    pub fn with_mapping_service(
        config: MonitorConfig,
        mapping: Box<dyn MappingService>,
    ) -> MonitorResult<Self> {
        if !config.is_valid() {
            kwarn!(
                "rejecting config: capacity {}, ring {}, tick {:?}",
                config.capacity,
                config.ring_len,
                config.tick_period
            );
            return Err(MonitorError::InvalidArgument);
        }
        kinfo!(
            "monitor up: {} slots, ring {}, tick {:?}",
            config.capacity,
            config.ring_len,
            config.tick_period
        );
        Ok(HeartRateMonitor {
            config,
            registry: GroupRegistry::new(),
            mapping,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    /// Look up a live group by id.
    pub fn group(&self, gid: i32) -> MonitorResult<Arc<Group>> {
        if gid <= 0 {
            return Err(MonitorError::InvalidArgument);
        }
        self.registry.find(gid).ok_or(MonitorError::NotFound)
    }

    /// Attach `caller` to group `gid` as a producer, creating the group
    /// on first attach. The group's clock and timer start with its
    /// first producer.
    pub fn attach_producer(&self, caller: Caller, gid: i32) -> MonitorResult<()> {
        if gid <= 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let mut groups = self.registry.lock();
        if let Some(group) = GroupRegistry::find_in(&groups, gid) {
            if group.has_producer(caller.task) {
                kwarn!("tid {} already produces for group {}", caller.task.0, gid);
                return Err(MonitorError::AlreadyAttached);
            }
            return self.join_as_producer(&group, caller);
        }
        let group = Arc::new(Group::new(gid, &self.config)?);
        self.join_as_producer(&group, caller)?;
        kinfo!("group {} created by tid {}", gid, caller.task.0);
        groups.push(group);
        Ok(())
    }

    /// Attach `caller` to group `gid` as a consumer (observer only).
    pub fn attach_consumer(&self, caller: Caller, gid: i32) -> MonitorResult<()> {
        if gid <= 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let mut groups = self.registry.lock();
        if let Some(group) = GroupRegistry::find_in(&groups, gid) {
            if group.has_consumer(caller.task) {
                kwarn!("tid {} already observes group {}", caller.task.0, gid);
                return Err(MonitorError::AlreadyAttached);
            }
            group.write_members().consumers.push(ConsumerMember { caller });
            return Ok(());
        }
        // A consumer can create the group; its clock stays stopped
        // until a producer arrives.
        let group = Arc::new(Group::new(gid, &self.config)?);
        group.write_members().consumers.push(ConsumerMember { caller });
        kinfo!("group {} created by observer tid {}", gid, caller.task.0);
        groups.push(group);
        Ok(())
    }

    fn join_as_producer(&self, group: &Arc<Group>, caller: Caller) -> MonitorResult<()> {
        let slot = group.slots.allocate().map_err(|e| {
            kwarn!(
                "group {}: no free slot for tid {}",
                group.gid(),
                caller.task.0
            );
            e
        })?;
        group.counters_view().slot(slot).occupy(caller.task.0);
        group.write_members().producers.push(ProducerMember { caller, slot });

        if group.time_origin().is_none() {
            group.start_clock(Instant::now());
            if self.config.start_timers {
                match TimerHandle::start(group) {
                    Ok(handle) => group.set_timer(handle),
                    Err(e) => {
                        let mut members = group.write_members();
                        members.producers.retain(|p| p.caller.task != caller.task);
                        drop(members);
                        group.counters_view().slot(slot).vacate();
                        group.slots.release(slot);
                        // A consumer-created group survives this
                        // failure; without the reset the next producer
                        // would find the clock running and never start
                        // a timer.
                        group.reset_clock();
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    /// Detach a producer. Its final count folds into the group history,
    /// so the global total survives slot reuse.
    pub fn detach_producer(&self, caller: Caller, gid: i32) -> MonitorResult<()> {
        if gid <= 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let mut groups = self.registry.lock();
        let group = GroupRegistry::find_in(&groups, gid).ok_or(MonitorError::NotAttached)?;
        self.leave_as_producer(&mut groups, &group, caller)
    }

    /// Detach a consumer.
    pub fn detach_consumer(&self, caller: Caller, gid: i32) -> MonitorResult<()> {
        if gid <= 0 {
            return Err(MonitorError::InvalidArgument);
        }
        let mut groups = self.registry.lock();
        let group = GroupRegistry::find_in(&groups, gid).ok_or(MonitorError::NotAttached)?;
        self.leave_as_consumer(&mut groups, &group, caller)
    }

    /// Detach `caller` from every group it belongs to, in either role.
    /// For exit paths; never fails.
    pub fn detach_all(&self, caller: Caller) {
        let mut groups = self.registry.lock();
        for group in groups.clone() {
            let _ = self.leave_as_producer(&mut groups, &group, caller);
            let _ = self.leave_as_consumer(&mut groups, &group, caller);
        }
    }

    fn leave_as_producer(
        &self,
        groups: &mut Vec<Arc<Group>>,
        group: &Arc<Group>,
        caller: Caller,
    ) -> MonitorResult<()> {
        let slot = group
            .producer_slot(caller.task)
            .ok_or(MonitorError::NotAttached)?;
        let now_empty = {
            // Removal, fold, and slot release must all happen under the
            // membership write lock: a tick holding the read lock would
            // otherwise see the folded total while the producer is
            // still listed and count it twice.
            let mut members = group.write_members();
            members.producers.retain(|p| p.caller.task != caller.task);
            let last = group.counters_view().slot(slot).vacate();
            group.history().total += last;
            group.slots.release(slot);
            self.release_maps(group, caller);
            members.is_empty()
        };
        if now_empty {
            self.retire(groups, group);
        }
        Ok(())
    }

    fn leave_as_consumer(
        &self,
        groups: &mut Vec<Arc<Group>>,
        group: &Arc<Group>,
        caller: Caller,
    ) -> MonitorResult<()> {
        if !group.has_consumer(caller.task) {
            return Err(MonitorError::NotAttached);
        }
        let now_empty = {
            let mut members = group.write_members();
            members.consumers.retain(|c| c.caller.task != caller.task);
            self.release_maps(group, caller);
            members.is_empty()
        };
        if now_empty {
            self.retire(groups, group);
        }
        Ok(())
    }

    /// Drop the detaching task's mapping reference on both regions,
    /// tearing the mapping down when it was the process's last one.
    /// A no-op for a task that never requested an address.
    fn release_maps(&self, group: &Group, caller: Caller) {
        for region in [group.counters_region(), group.measures_goal_region()] {
            if region.release_map(caller.process) {
                self.mapping.unmap(region);
            }
        }
    }

    fn retire(&self, groups: &mut Vec<Arc<Group>>, group: &Arc<Group>) {
        GroupRegistry::remove_in(groups, group.gid());
        // The registry lock is still held; the tick thread only takes
        // the membership lock, so joining it here cannot deadlock.
        group.stop_timer();
        kinfo!("group {} retired", group.gid());
    }

    /// Slot index of `caller`'s counter in group `gid`.
    pub fn producer_slot(&self, caller: Caller, gid: i32) -> MonitorResult<usize> {
        let group = self
            .registry
            .find(gid)
            .ok_or(MonitorError::NotAttached)?;
        group
            .producer_slot(caller.task)
            .ok_or(MonitorError::NotAttached)
    }

    /// Map one of group `gid`'s shared regions into `caller`'s address
    /// space and return the address there. Repeat mappings by the same
    /// process share one mapping and bump its reference count.
    ///
    /// `requested_size` is the size the client computed from its own
    /// idea of the layout; a disagreement is a version skew and fails
    /// with [`MonitorError::SizeMismatch`].
    pub fn map_region(
        &self,
        caller: Caller,
        gid: i32,
        kind: RegionKind,
        requested_size: usize,
    ) -> MonitorResult<usize> {
        let group = self
            .registry
            .find(gid)
            .ok_or(MonitorError::NotAttached)?;
        if !group.has_producer(caller.task) && !group.has_consumer(caller.task) {
            return Err(MonitorError::NotAttached);
        }
        // The membership write lock doubles as the mapping-cache lock
        // against a concurrent detach of the same process.
        let guard = group.write_members();
        let region: &SharedRegion = match kind {
            RegionKind::Counters => group.counters_region(),
            RegionKind::MeasuresGoal => group.measures_goal_region(),
        };
        let address = match region.lookup_map(caller.process) {
            Some(address) => address,
            None => self.mapping.map(region, requested_size)?,
        };
        region.acquire_map(caller.process, address);
        drop(guard);
        Ok(address)
    }
}

impl std::fmt::Debug for HeartRateMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartRateMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Drop for HeartRateMonitor {
    fn drop(&mut self) {
        for group in self.registry.lock().iter() {
            group.stop_timer();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmon_core::constants::{CACHE_LINE_BYTES, PAGE_SIZE};
    use std::time::Duration;

    fn monitor() -> HeartRateMonitor {
        HeartRateMonitor::new(
            MonitorConfig::default()
                .capacity(4)
                .ring_len(8)
                .start_timers(false),
        )
        .unwrap()
    }

    fn caller(tid: i32) -> Caller {
        Caller::new(tid, 1000)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = HeartRateMonitor::new(MonitorConfig::default().capacity(0)).unwrap_err();
        assert_eq!(err, MonitorError::InvalidArgument);
    }

    #[test]
    fn test_attach_creates_group_and_detach_retires_it() {
        let m = monitor();
        m.attach_producer(caller(1), 7).unwrap();
        assert_eq!(m.group(7).unwrap().gid(), 7);

        m.detach_producer(caller(1), 7).unwrap();
        assert_eq!(m.group(7).unwrap_err(), MonitorError::NotFound);
    }

    #[test]
    fn test_nonpositive_gid_rejected() {
        let m = monitor();
        assert_eq!(
            m.attach_producer(caller(1), 0).unwrap_err(),
            MonitorError::InvalidArgument
        );
        assert_eq!(
            m.attach_producer(caller(1), -3).unwrap_err(),
            MonitorError::InvalidArgument
        );
        assert_eq!(m.group(0).unwrap_err(), MonitorError::InvalidArgument);
    }

    #[test]
    fn test_duplicate_attach_rejected() {
        let m = monitor();
        m.attach_producer(caller(1), 7).unwrap();
        assert_eq!(
            m.attach_producer(caller(1), 7).unwrap_err(),
            MonitorError::AlreadyAttached
        );
        // The same tid can still observe.
        m.attach_consumer(caller(1), 7).unwrap();
        assert_eq!(
            m.attach_consumer(caller(1), 7).unwrap_err(),
            MonitorError::AlreadyAttached
        );
    }

    #[test]
    fn test_capacity_exhaustion_leaves_group_intact() {
        let m = monitor();
        for tid in 1..=4 {
            m.attach_producer(caller(tid), 7).unwrap();
        }
        assert_eq!(
            m.attach_producer(caller(5), 7).unwrap_err(),
            MonitorError::CapacityExhausted
        );
        // Existing members are untouched.
        let group = m.group(7).unwrap();
        assert_eq!(group.read_members().producers.len(), 4);

        // Freeing one slot admits the latecomer.
        m.detach_producer(caller(2), 7).unwrap();
        m.attach_producer(caller(5), 7).unwrap();
    }

    #[test]
    fn test_detach_from_unknown_group() {
        let m = monitor();
        assert_eq!(
            m.detach_producer(caller(1), 9).unwrap_err(),
            MonitorError::NotAttached
        );
        m.attach_consumer(caller(1), 9).unwrap();
        assert_eq!(
            m.detach_producer(caller(1), 9).unwrap_err(),
            MonitorError::NotAttached
        );
    }

    #[test]
    fn test_consumer_does_not_start_clock() {
        let m = monitor();
        m.attach_consumer(caller(1), 7).unwrap();
        let group = m.group(7).unwrap();
        assert!(group.time_origin().is_none());

        m.attach_producer(caller(2), 7).unwrap();
        assert!(group.time_origin().is_some());
    }

    #[test]
    fn test_history_survives_detach_and_reattach() {
        let m = monitor();
        // The consumer keeps the group alive across producer churn.
        m.attach_consumer(caller(9), 7).unwrap();
        m.attach_producer(caller(1), 7).unwrap();

        let group = m.group(7).unwrap();
        let slot = m.producer_slot(caller(1), 7).unwrap();
        group.counters_view().slot(slot).beat(300);
        m.detach_producer(caller(1), 7).unwrap();

        m.attach_producer(caller(2), 7).unwrap();
        let slot = m.producer_slot(caller(2), 7).unwrap();
        group.counters_view().slot(slot).beat(200);

        let origin = group.time_origin().unwrap();
        group.tick(origin + Duration::from_millis(100));
        let (count, _) = group.measures_goal_view().measures().global.load();
        assert_eq!(count, 500);
    }

    #[test]
    fn test_global_count_monotonic_across_concurrent_detach() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let m = Arc::new(monitor());
        m.attach_consumer(caller(99), 7).unwrap();
        m.attach_producer(caller(1), 7).unwrap();
        let group = m.group(7).unwrap();
        group.add_window(1).unwrap();
        let origin = group.time_origin().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let ticker_group = Arc::clone(&group);
        let ticker_stop = Arc::clone(&stop);
        let ticker = std::thread::spawn(move || {
            let mut last = 0u64;
            let mut k = 1u64;
            while !ticker_stop.load(Ordering::Acquire) {
                ticker_group.tick(origin + Duration::from_millis(k));
                let (count, _) =
                    ticker_group.measures_goal_view().measures().global.load();
                assert!(count >= last, "global count fell: {last} -> {count}");
                last = count;
                k += 1;
            }
        });

        for round in 0..200 {
            let tid = 100 + round;
            m.attach_producer(caller(tid), 7).unwrap();
            let slot = m.producer_slot(caller(tid), 7).unwrap();
            group.counters_view().slot(slot).beat(50);
            m.detach_producer(caller(tid), 7).unwrap();
        }
        stop.store(true, Ordering::Release);
        ticker.join().unwrap();
    }

    #[test]
    fn test_detach_all_clears_both_roles() {
        let m = monitor();
        m.attach_producer(caller(1), 7).unwrap();
        m.attach_producer(caller(1), 8).unwrap();
        m.attach_consumer(caller(1), 9).unwrap();
        m.attach_producer(caller(2), 8).unwrap();

        m.detach_all(caller(1));
        assert_eq!(m.group(7).unwrap_err(), MonitorError::NotFound);
        assert_eq!(m.group(9).unwrap_err(), MonitorError::NotFound);
        // Group 8 survives with its other producer.
        assert_eq!(m.group(8).unwrap().read_members().producers.len(), 1);
    }

    #[test]
    fn test_map_region_returns_shared_addresses() {
        let m = monitor();
        m.attach_producer(caller(1), 7).unwrap();
        let group = m.group(7).unwrap();

        let counters_size = m.config().capacity * CACHE_LINE_BYTES;
        let addr = m
            .map_region(caller(1), 7, RegionKind::Counters, counters_size)
            .unwrap();
        assert_eq!(addr, group.counters_region().base() as usize);

        let mg = m
            .map_region(caller(1), 7, RegionKind::MeasuresGoal, PAGE_SIZE)
            .unwrap();
        assert_eq!(mg, group.measures_goal_region().base() as usize);
    }

    #[test]
    fn test_map_region_is_per_process_refcounted() {
        let m = monitor();
        let a = Caller::new(1, 1000);
        let b = Caller::new(2, 1000);
        m.attach_producer(a, 7).unwrap();
        m.attach_producer(b, 7).unwrap();
        let group = m.group(7).unwrap();

        let size = m.config().capacity * CACHE_LINE_BYTES;
        let addr_a = m.map_region(a, 7, RegionKind::Counters, size).unwrap();
        let addr_b = m.map_region(b, 7, RegionKind::Counters, size).unwrap();
        assert_eq!(addr_a, addr_b);

        // First detach leaves the process mapping for the other member.
        m.detach_producer(a, 7).unwrap();
        assert!(group
            .counters_region()
            .lookup_map(a.process)
            .is_some());
        m.detach_producer(b, 7).unwrap();
    }

    #[test]
    fn test_map_region_requires_membership_and_size() {
        let m = monitor();
        m.attach_producer(caller(1), 7).unwrap();
        assert_eq!(
            m.map_region(caller(2), 7, RegionKind::MeasuresGoal, PAGE_SIZE)
                .unwrap_err(),
            MonitorError::NotAttached
        );
        assert_eq!(
            m.map_region(caller(1), 7, RegionKind::MeasuresGoal, PAGE_SIZE + 1)
                .unwrap_err(),
            MonitorError::SizeMismatch
        );
    }

    #[test]
    fn test_timer_starts_with_first_producer() {
        let m = HeartRateMonitor::new(
            MonitorConfig::default()
                .capacity(4)
                .tick_period(Duration::from_millis(5)),
        )
        .unwrap();
        m.attach_producer(caller(1), 7).unwrap();
        let group = m.group(7).unwrap();

        let published = (0..200).any(|_| {
            std::thread::sleep(Duration::from_millis(5));
            group.measures_goal_view().measures().global.load().1 > 0
        });
        assert!(published, "timer never ran");
        m.detach_producer(caller(1), 7).unwrap();
    }
}
