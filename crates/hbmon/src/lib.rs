//! # hbmon: heartbeat rate monitor client SDK
//!
//! The application-facing half of the monitor. A producer attaches to a
//! group, emits heartbeats, and anyone attached (producer or observer)
//! reads heart rates and manages the group's goal. All per-beat and
//! per-query work happens on memory mapped from the service; after
//! attach, only attach-like operations go back through it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use hbmon::{Monitor, HeartRateMonitor, MonitorConfig};
//!
//! # fn main() -> hbmon::MonitorResult<()> {
//! let service = Arc::new(HeartRateMonitor::new(MonitorConfig::default())?);
//! let monitor = Monitor::attach(Arc::clone(&service), 1)?;
//! monitor.set_goal(10, 100.0, 200.0)?;
//! loop {
//!     // ... one unit of work ...
//!     monitor.heartbeat(1)?;
//! #   break;
//! }
//! # Ok(())
//! # }
//! ```

mod monitor;

pub use monitor::Monitor;

pub use hbmon_core::error::{MonitorError, MonitorResult};
pub use hbmon_core::id::Caller;
pub use hbmon_monitor::{HeartRateMonitor, MonitorConfig, Role};
