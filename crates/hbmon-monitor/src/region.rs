//! Shared memory regions and the per-region mapping cache.
//!
//! A region is a page-aligned, zero-initialized allocation that backs
//! either a group's counters or its measures-and-goal page. On unix it
//! is an anonymous `MAP_SHARED` mapping so the same physical pages can
//! be exposed to every member's address space by the mapping service.
//!
//! The mapping cache remembers, per owning process, the address the
//! mapping service handed out and how many threads of that process
//! requested it. Only the first request physically establishes the
//! mapping; the last release tears it down.

use core::ptr::NonNull;

use hbmon_core::error::{MonitorError, MonitorResult};
use hbmon_core::id::ProcessId;
use hbmon_core::kerror;
use hbmon_core::spinlock::SpinLock;

/// One process's cached mapping of a region.
#[derive(Debug, Clone, Copy)]
struct MapEntry {
    process: ProcessId,
    address: usize,
    references: u32,
}

/// A shared, fixed-size, zeroed memory region owned by a group.
pub struct SharedRegion {
    base: NonNull<u8>,
    size: usize,
    maps: SpinLock<Vec<MapEntry>>,
}

// Safety: the raw base is only dereferenced through the typed atomic
// views in hbmon-core; the cache is behind its own lock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Allocate a zeroed region of `size` bytes.
    pub fn allocate(size: usize) -> MonitorResult<Self> {
        let base = alloc_pages(size)?;
        Ok(SharedRegion {
            base,
            size,
            maps: SpinLock::new(Vec::new()),
        })
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Address this process already mapped the region at, if any.
    pub fn lookup_map(&self, process: ProcessId) -> Option<usize> {
        let maps = self.maps.lock();
        maps.iter()
            .find(|e| e.process == process)
            .map(|e| e.address)
    }

    /// Record one more reference from `process`. Inserts with count 1
    /// if absent; otherwise increments and ignores `address` (threads
    /// of one process share one address space).
    pub fn acquire_map(&self, process: ProcessId, address: usize) {
        let mut maps = self.maps.lock();
        match maps.iter_mut().find(|e| e.process == process) {
            Some(entry) => entry.references += 1,
            None => maps.push(MapEntry {
                process,
                address,
                references: 1,
            }),
        }
    }

    /// Drop one reference from `process`. Returns true when that was
    /// the last one and the entry was removed; the caller must then
    /// tell the mapping service to unmap. Returns false if no entry
    /// exists (the process never mapped this region).
    pub fn release_map(&self, process: ProcessId) -> bool {
        let mut maps = self.maps.lock();
        if let Some(pos) = maps.iter().position(|e| e.process == process) {
            maps[pos].references -= 1;
            if maps[pos].references == 0 {
                maps.swap_remove(pos);
                return true;
            }
        }
        false
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        free_pages(self.base, self.size);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn alloc_pages(size: usize) -> MonitorResult<NonNull<u8>> {
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                kerror!("region mmap of {} bytes failed", size);
                return Err(MonitorError::ResourceUnavailable);
            }
            // mmap never returns null on success.
            NonNull::new(ptr as *mut u8).ok_or(MonitorError::ResourceUnavailable)
        }

        fn free_pages(base: NonNull<u8>, size: usize) {
            let rc = unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, size) };
            if rc != 0 {
                kerror!("region munmap of {} bytes failed", size);
            }
        }
    } else {
        use std::alloc::{alloc_zeroed, dealloc, Layout};
        use hbmon_core::constants::PAGE_SIZE;

        fn region_layout(size: usize) -> Layout {
            Layout::from_size_align(size, PAGE_SIZE).expect("region layout")
        }

        fn alloc_pages(size: usize) -> MonitorResult<NonNull<u8>> {
            let ptr = unsafe { alloc_zeroed(region_layout(size)) };
            NonNull::new(ptr).ok_or_else(|| {
                kerror!("region allocation of {} bytes failed", size);
                MonitorError::ResourceUnavailable
            })
        }

        fn free_pages(base: NonNull<u8>, size: usize) {
            unsafe { dealloc(base.as_ptr(), region_layout(size)) };
        }
    }
}
