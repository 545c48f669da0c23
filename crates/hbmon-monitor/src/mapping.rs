//! The memory mapping service boundary.
//!
//! Establishing a mapping of a region's backing storage into a caller's
//! address space is not the monitor's business; it delegates to this
//! trait. The default implementation covers the common embedding where
//! every member runs in the monitor's own address space and the
//! region's base *is* the mapped address.

use hbmon_core::error::{MonitorError, MonitorResult};

use crate::region::SharedRegion;

/// Maps a region's backing storage into the calling process.
pub trait MappingService: Send + Sync {
    /// Map `region` and return the process-local base address.
    /// `requested_size` must equal the region's size.
    fn map(&self, region: &SharedRegion, requested_size: usize) -> MonitorResult<usize>;

    /// Tear down this process's mapping of `region`.
    fn unmap(&self, region: &SharedRegion);
}

/// Mapping service for members sharing the monitor's address space.
pub struct SameAddressSpace;

impl MappingService for SameAddressSpace {
    fn map(&self, region: &SharedRegion, requested_size: usize) -> MonitorResult<usize> {
        if requested_size != region.size() {
            return Err(MonitorError::SizeMismatch);
        }
        Ok(region.base() as usize)
    }

    fn unmap(&self, _region: &SharedRegion) {
        // The region base stays valid for the region's lifetime;
        // nothing to tear down within one address space.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hbmon_core::constants::PAGE_SIZE;

    #[test]
    fn test_map_checks_size() {
        let region = SharedRegion::allocate(PAGE_SIZE).unwrap();
        let svc = SameAddressSpace;
        assert_eq!(
            svc.map(&region, PAGE_SIZE / 2),
            Err(MonitorError::SizeMismatch)
        );
        let addr = svc.map(&region, PAGE_SIZE).unwrap();
        assert_eq!(addr, region.base() as usize);
    }
}
