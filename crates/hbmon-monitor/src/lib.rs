//! # hbmon-monitor: the heartbeat rate monitor service
//!
//! The service side of the monitor: it owns the group registry, the
//! shared memory regions, the slot allocator, and the per-group
//! snapshot engine. Producers and consumers attach through the command
//! channel (or the typed API), obtain mapped addresses through the
//! mapping service, and from then on touch the shared layout directly:
//! a heartbeat is one lock-free atomic add.
//!
//! ## Locking discipline
//!
//! Three primitives, acquired strictly in this order when nested:
//!
//! 1. the registry mutex (group creation/destruction/lookup),
//! 2. a group's membership `RwLock` (attach/detach write, snapshot
//!    ticks read),
//! 3. the goal spin lock embedded in the shared page.
//!
//! Heartbeat emission takes no lock at all.

pub mod alloc;
pub mod attach;
pub mod channel;
pub mod config;
pub mod goal;
pub mod group;
pub mod mapping;
pub mod region;
pub mod registry;
pub mod report;
pub mod snapshot;

pub use attach::{HeartRateMonitor, RegionKind};
pub use channel::{Command, Role};
pub use config::MonitorConfig;
pub use group::Group;
pub use mapping::{MappingService, SameAddressSpace};
