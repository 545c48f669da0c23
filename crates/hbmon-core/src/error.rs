//! Error types for the heartbeat rate monitor.

use std::fmt;

/// Result type for monitor operations
pub type MonitorResult<T> = Result<T, MonitorError>;

/// Errors that can occur in monitor operations.
///
/// All operations are synchronous and surface the specific kind
/// immediately; there is no retry policy anywhere in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorError {
    /// Zero/negative group id, malformed window size, or max < min.
    InvalidArgument,

    /// Consumer attempting a producer-only mutation, or the caller is
    /// not the owning identity.
    PermissionDenied,

    /// The caller already holds a membership of this role in the group.
    AlreadyAttached,

    /// No membership of this role exists for the caller in the group.
    NotAttached,

    /// Slot allocator full, or window table full.
    CapacityExhausted,

    /// Allocation failed for a region, membership record, or timer.
    ResourceUnavailable,

    /// Group or window lookup miss.
    NotFound,

    /// Mapping request size disagrees with the region size.
    SizeMismatch,
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::AlreadyAttached => write!(f, "already attached"),
            Self::NotAttached => write!(f, "not attached"),
            Self::CapacityExhausted => write!(f, "capacity exhausted"),
            Self::ResourceUnavailable => write!(f, "resource unavailable"),
            Self::NotFound => write!(f, "not found"),
            Self::SizeMismatch => write!(f, "mapping size mismatch"),
        }
    }
}

impl std::error::Error for MonitorError {}
