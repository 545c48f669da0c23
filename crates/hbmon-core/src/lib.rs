//! # hbmon-core: shared types for the heartbeat rate monitor
//!
//! This crate holds everything that both sides of the monitor agree on:
//! the shared-memory layout (counter slots, measures, goal), the error
//! taxonomy, the spin-lock primitives, fixed-point rate math, and the
//! caller identity types.
//!
//! The monitor service (`hbmon-monitor`) writes the layout; client
//! handles (`hbmon`) read and, for the goal table, mutate it through the
//! exact same typed views. Neither side depends on the other's concrete
//! types, only on this crate.

pub mod constants;
pub mod error;
pub mod id;
pub mod klog;
pub mod layout;
pub mod rate;
pub mod spinlock;

pub use error::{MonitorError, MonitorResult};
pub use id::{Caller, ProcessId, TaskId};
