//! Caller identity types.
//!
//! A producer or consumer membership is keyed by the execution unit
//! (`TaskId`); the mapping cache is keyed by the address space
//! (`ProcessId`) because all threads of one process share a mapping.

/// Identity of one execution unit (an OS thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub i32);

/// Identity of one address space (an OS process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub i32);

/// The pair of identities every attach/detach/map operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub task: TaskId,
    pub process: ProcessId,
}

impl Caller {
    /// Identity of the calling thread and its process.
    pub fn current() -> Self {
        Caller {
            task: current_task_id(),
            process: ProcessId(std::process::id() as i32),
        }
    }

    /// Build an explicit identity. Intended for embedders that multiplex
    /// logical producers over fewer OS threads, and for tests.
    pub fn new(task: i32, process: i32) -> Self {
        Caller {
            task: TaskId(task),
            process: ProcessId(process),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Kernel thread id of the calling thread.
        pub fn current_task_id() -> TaskId {
            // gettid(2) has no glibc wrapper on older toolchains.
            let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
            TaskId(tid)
        }
    } else {
        /// Process-unique thread id, assigned on first use per thread.
        pub fn current_task_id() -> TaskId {
            use core::sync::atomic::{AtomicI32, Ordering};

            static NEXT: AtomicI32 = AtomicI32::new(1);
            thread_local! {
                static TID: i32 = NEXT.fetch_add(1, Ordering::Relaxed);
            }
            TaskId(TID.with(|t| *t))
        }
    }
}
