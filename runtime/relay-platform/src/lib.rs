//! # Relay Platform Layer
//!
//! Kernel collaborators consumed by the Relay IPC core. The core never touches
//! page tables, descriptor tables, the scheduler's task bookkeeping or the
//! user/kernel copy helpers directly; it goes through the traits defined here.
//!
//! ## Collaborators
//!
//! - [`PageMapper`]: backing pages for a pool and user mappings of them
//! - [`DescriptorTable`]: duplicate and close file descriptors across processes
//! - [`TaskDirectory`]: task to process lookup, liveness, credentials
//! - [`UserMemory`]: validated copy from a process' user address space
//! - [`Clock`]: monotonic nanoseconds used for correlation ids and freshness
//!
//! [`Platform`] bundles one implementation of each so the core can be handed a
//! single value.
//!
//! ## Build Modes
//!
//! ```bash
//! # Mock backend (default, hosted tests)
//! cargo build
//!
//! # Kernel integration supplies its own implementations
//! cargo build --no-default-features
//! ```

use core::fmt;
use std::sync::Arc;

use thiserror::Error;

pub mod clock;
pub mod region;

#[cfg(feature = "mock")]
pub mod mock;

pub use clock::MonotonicClock;
pub use region::{KernelRegion, PhysFrame};

/// Task (thread) identifier as assigned by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}", self.0)
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process {}", self.0)
    }
}

/// User and group identity of a process, stamped into every message it sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

/// Errors reported by platform collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// No physical frames left to back a region
    #[error("Out of physical frames (requested: {requested} pages)")]
    OutOfFrames { requested: usize },

    /// A user page could not be mapped
    #[error("Failed to map user page at {addr:#x}")]
    MapFailed { addr: usize },

    /// Address not backed by the process' user memory
    #[error("Bad user address {addr:#x} (length: {len})")]
    BadAddress { addr: usize, len: usize },

    /// Descriptor not open in the source process
    #[error("Bad file descriptor {0}")]
    BadDescriptor(i32),

    /// Destination descriptor table has no free slot
    #[error("Descriptor table full")]
    DescriptorTableFull,

    /// Task unknown to the directory
    #[error("No such task: {0}")]
    NoSuchTask(u32),

    /// Process unknown to the directory
    #[error("No such process: {0}")]
    NoSuchProcess(u32),
}

/// Result type for platform operations
pub type Result<T> = core::result::Result<T, PlatformError>;

/// Physical pages and user page tables
///
/// A pool is one [`KernelRegion`] whose frames are mapped page by page into
/// the owning process. Mapping is not transactional: the caller undoes partial
/// progress with [`PageMapper::unmap_user_page`] and [`PageMapper::free_region`].
pub trait PageMapper: Send + Sync {
    /// Allocate `pages` zeroed pages of `page_size` bytes, kernel-visible
    fn alloc_region(&self, pages: usize, page_size: usize) -> Result<KernelRegion>;

    /// Map one frame read-only and private at `uva` in `pid`
    fn map_user_page(&self, pid: ProcessId, uva: usize, frame: PhysFrame) -> Result<()>;

    /// Remove the mapping at `uva` in `pid`; unmapping a hole is a no-op
    fn unmap_user_page(&self, pid: ProcessId, uva: usize);

    /// Return the region's frames to the allocator
    fn free_region(&self, region: KernelRegion);
}

/// Per-process file descriptor tables
pub trait DescriptorTable: Send + Sync {
    /// Duplicate `fd` of `from` into the lowest free slot of `to`
    fn dup_into(&self, from: ProcessId, fd: i32, to: ProcessId) -> Result<i32>;

    /// Close `fd` in `pid`
    fn close(&self, pid: ProcessId, fd: i32) -> Result<()>;
}

/// Scheduler-side task bookkeeping
pub trait TaskDirectory: Send + Sync {
    /// Owning process of a task, including tasks that already exited
    fn process_of(&self, task: TaskId) -> Option<ProcessId>;

    /// Whether the task exists, has not exited and runs in user mode
    fn is_alive(&self, task: TaskId) -> bool;

    /// Credentials of a process
    fn credentials(&self, pid: ProcessId) -> Option<Credentials>;
}

/// Validated access to user address spaces
pub trait UserMemory: Send + Sync {
    /// Copy `len` bytes at `addr` out of `pid`'s user memory
    ///
    /// # Errors
    ///
    /// [`PlatformError::BadAddress`] unless the whole range is user memory of
    /// `pid`.
    fn copy_from_user(&self, pid: ProcessId, addr: usize, len: usize) -> Result<Vec<u8>>;
}

/// Monotonic time source
pub trait Clock: Send + Sync {
    fn now_nanos(&self) -> u64;
}

/// One implementation of every collaborator
#[derive(Clone)]
pub struct Platform {
    pub pages: Arc<dyn PageMapper>,
    pub descriptors: Arc<dyn DescriptorTable>,
    pub tasks: Arc<dyn TaskDirectory>,
    pub user: Arc<dyn UserMemory>,
    pub clock: Arc<dyn Clock>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Detect which backend is compiled in
pub const fn is_mock() -> bool {
    cfg!(feature = "mock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display() {
        assert_eq!(TaskId(7).to_string(), "task 7");
        assert_eq!(ProcessId(3).to_string(), "process 3");
    }

    #[test]
    fn test_error_messages() {
        let err = PlatformError::BadAddress { addr: 0x1000, len: 16 };
        assert_eq!(err.to_string(), "Bad user address 0x1000 (length: 16)");
        assert_eq!(PlatformError::BadDescriptor(4).to_string(), "Bad file descriptor 4");
    }

    #[test]
    #[cfg(feature = "mock")]
    fn test_mock_detection() {
        assert!(is_mock());
    }
}
