//! Per-process shared pool
//!
//! # Purpose
//!
//! Each process that talks IPC owns one pool: a kernel region whose pages are
//! also mapped read-only into the process. The kernel writes messages into the
//! pool once; the receiver reads them in place through its user mapping.
//!
//! ## Design
//!
//! - [`PoolState`] is either `Unmapped` or `Mapped`, never in between
//! - Allocation is first-fit over a `linked_list_allocator::Heap` placed on
//!   the kernel region
//! - Outstanding allocations are tracked in a side table so a bad offset is an
//!   error rather than a corrupted free list
//! - Offsets are handed out instead of pointers; translation to user
//!   addresses is pure arithmetic on the bound base
//!
//! ## Usage
//!
//! ```rust,ignore
//! pool.bind(pid, RegionRequest::read_only(base, 64 * 1024), &*platform.pages, max)?;
//! let node = pool.allocate(128)?;
//! pool.write(node, b"hello")?;
//! let user = pool.user_address_of(node)?;
//! pool.free(node)?;
//! ```

use core::alloc::Layout;
use core::ptr::NonNull;
use std::collections::BTreeMap;

use bitflags::bitflags;
use linked_list_allocator::Heap;
use relay_platform::{KernelRegion, PageMapper, ProcessId};
use spin::Mutex;

use crate::address::{PoolOffset, UserAddr};
use crate::error::{IpcError, Result};

/// Alignment of every pool allocation
pub const POOL_ALIGN: usize = 8;

bitflags! {
    /// Protection requested for a user mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
    }
}

/// A process' request to map its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionRequest {
    pub user_base: usize,
    pub size: usize,
    pub prot: Protection,
    pub private: bool,
}

impl RegionRequest {
    /// Private, user-readable mapping: the only shape a pool accepts
    pub fn read_only(user_base: usize, size: usize) -> Self {
        Self {
            user_base,
            size,
            prot: Protection::READ | Protection::USER,
            private: true,
        }
    }

    fn is_user_read_only(&self) -> bool {
        self.private
            && self.prot.contains(Protection::USER)
            && !self.prot.intersects(Protection::WRITE | Protection::EXEC)
    }
}

/// Occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub size: usize,
    pub used: usize,
    pub free: usize,
    pub outstanding: usize,
}

struct MappedPool {
    user_base: usize,
    page_size: usize,
    region: KernelRegion,
    heap: Heap,
    outstanding: BTreeMap<usize, Layout>,
}

// SAFETY: the heap's free list points into `region`, which this struct owns
// and which moves with it; all access is serialised by the pool mutex.
unsafe impl Send for MappedPool {}

impl MappedPool {
    fn check_range(&self, offset: PoolOffset, len: usize) -> Result<()> {
        match offset.0.checked_add(len) {
            Some(end) if end <= self.region.size() => Ok(()),
            _ => Err(IpcError::OutOfRange {
                addr: self.user_base.saturating_add(offset.0),
            }),
        }
    }
}

enum PoolState {
    Unmapped,
    Mapped(MappedPool),
}

/// A process' shared pool
pub struct Pool {
    state: Mutex<PoolState>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    /// Unmapped pool with no allocations
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(PoolState::Unmapped),
        }
    }

    /// Back the pool with fresh pages and map them into `pid`
    ///
    /// # Arguments
    ///
    /// * `pid` - Owning process
    /// * `request` - User placement and size; must be private and read-only
    /// * `mapper` - Page provider
    /// * `max_size` - Largest pool the subsystem allows
    ///
    /// # Errors
    ///
    /// - [`IpcError::AlreadyBound`] if the pool is mapped
    /// - [`IpcError::InvalidArgument`] for a writable, executable, shared,
    ///   empty or unaligned request, or one running past the top of the
    ///   address space
    /// - [`IpcError::SizeExceeded`] above `max_size`
    /// - [`IpcError::Platform`] if pages cannot be allocated or mapped; pages
    ///   mapped before the failure are unmapped and the region is returned
    pub fn bind(
        &self,
        pid: ProcessId,
        request: RegionRequest,
        mapper: &dyn PageMapper,
        page_size: usize,
        max_size: usize,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let PoolState::Mapped(_) = *state {
            return Err(IpcError::AlreadyBound);
        }
        if !request.is_user_read_only() {
            return Err(IpcError::InvalidArgument("pool mapping must be private and read-only"));
        }
        if request.size == 0 || request.size % page_size != 0 || request.user_base % page_size != 0 {
            return Err(IpcError::InvalidArgument("pool mapping must be page aligned"));
        }
        if request.size > max_size {
            return Err(IpcError::SizeExceeded {
                requested: request.size,
                limit: max_size,
            });
        }
        if request.user_base.checked_add(request.size).is_none() {
            return Err(IpcError::InvalidArgument("pool mapping wraps the address space"));
        }

        let pages = request.size / page_size;
        let region = mapper.alloc_region(pages, page_size)?;
        let frames = region.frames().to_vec();

        for (index, frame) in frames.into_iter().enumerate() {
            let uva = request.user_base + index * page_size;
            if let Err(err) = mapper.map_user_page(pid, uva, frame) {
                log::error!("{}: mapping pool page {} at {:#x} failed: {}", pid, index, uva, err);
                for undo in (0..index).rev() {
                    mapper.unmap_user_page(pid, request.user_base + undo * page_size);
                }
                mapper.free_region(region);
                return Err(err.into());
            }
        }

        let mut heap = Heap::empty();
        // SAFETY: the region is exclusively owned by the pool from here on and
        // outlives the heap, which is dropped with it.
        unsafe { heap.init(region.as_mut_ptr(), region.size()) };

        log::debug!(
            "{}: pool mapped at {:#x} ({} pages)",
            pid,
            request.user_base,
            pages
        );
        *state = PoolState::Mapped(MappedPool {
            user_base: request.user_base,
            page_size,
            region,
            heap,
            outstanding: BTreeMap::new(),
        });
        Ok(())
    }

    /// Unmap and release the pool, invalidating every outstanding allocation
    ///
    /// Returns the number of allocations that were still outstanding. A no-op
    /// on an unmapped pool.
    pub fn unbind(&self, pid: ProcessId, mapper: &dyn PageMapper) -> usize {
        let previous = core::mem::replace(&mut *self.state.lock(), PoolState::Unmapped);
        let PoolState::Mapped(mapped) = previous else {
            return 0;
        };

        let MappedPool {
            user_base,
            page_size,
            region,
            heap,
            outstanding,
        } = mapped;
        drop(heap);

        for index in 0..region.page_count() {
            mapper.unmap_user_page(pid, user_base + index * page_size);
        }
        mapper.free_region(region);

        log::debug!(
            "{}: pool at {:#x} unmapped ({} allocations dropped)",
            pid,
            user_base,
            outstanding.len()
        );
        outstanding.len()
    }

    pub fn is_mapped(&self) -> bool {
        matches!(*self.state.lock(), PoolState::Mapped(_))
    }

    pub fn user_base(&self) -> Option<usize> {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => Some(mapped.user_base),
            PoolState::Unmapped => None,
        }
    }

    /// Pool size in bytes, zero when unmapped
    pub fn size(&self) -> usize {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => mapped.region.size(),
            PoolState::Unmapped => 0,
        }
    }

    /// Allocate `size` bytes
    ///
    /// # Errors
    ///
    /// [`IpcError::OutOfMemory`] when no hole fits or the pool is unmapped.
    pub fn allocate(&self, size: usize) -> Result<PoolOffset> {
        let mut state = self.state.lock();
        let PoolState::Mapped(mapped) = &mut *state else {
            return Err(IpcError::OutOfMemory { requested: size });
        };

        let layout = Layout::from_size_align(size.max(1), POOL_ALIGN)
            .map_err(|_| IpcError::OutOfMemory { requested: size })?;
        let ptr = mapped
            .heap
            .allocate_first_fit(layout)
            .map_err(|_| IpcError::OutOfMemory { requested: size })?;

        let offset = ptr.as_ptr() as usize - mapped.region.as_mut_ptr() as usize;
        mapped.outstanding.insert(offset, layout);
        log::trace!("pool: allocated {} bytes at +{:#x}", size, offset);
        Ok(PoolOffset(offset))
    }

    /// Return an allocation
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidArgument`] if `offset` is not an outstanding
    /// allocation (including every offset of an unmapped pool).
    pub fn free(&self, offset: PoolOffset) -> Result<()> {
        let mut state = self.state.lock();
        let PoolState::Mapped(mapped) = &mut *state else {
            return Err(IpcError::InvalidArgument("pool is not mapped"));
        };

        let layout = mapped
            .outstanding
            .remove(&offset.0)
            .ok_or(IpcError::InvalidArgument("not an outstanding pool allocation"))?;
        // Offsets in the side table always came from the heap, so the pointer
        // is in bounds and non-null.
        let ptr = NonNull::new(mapped.region.as_mut_ptr().wrapping_add(offset.0))
            .ok_or(IpcError::InvalidArgument("not an outstanding pool allocation"))?;
        // SAFETY: `ptr` and `layout` are exactly what `allocate_first_fit`
        // returned for this allocation, which has not been freed since.
        unsafe { mapped.heap.deallocate(ptr, layout) };
        log::trace!("pool: freed +{:#x}", offset.0);
        Ok(())
    }

    /// Requested length of an outstanding allocation
    pub fn allocation_len(&self, offset: PoolOffset) -> Option<usize> {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => mapped.outstanding.get(&offset.0).map(Layout::size),
            PoolState::Unmapped => None,
        }
    }

    /// Translate a pool offset to the owning process' address
    pub fn user_address_of(&self, offset: PoolOffset) -> Result<UserAddr> {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) if offset.0 < mapped.region.size() => {
                Ok(UserAddr(mapped.user_base + offset.0))
            }
            PoolState::Mapped(mapped) => Err(IpcError::OutOfRange {
                addr: mapped.user_base.saturating_add(offset.0),
            }),
            PoolState::Unmapped => Err(IpcError::PoolNotBound),
        }
    }

    /// Translate a user address inside the pool to its offset
    pub fn kernel_address_of(&self, addr: UserAddr) -> Result<PoolOffset> {
        match &*self.state.lock() {
            PoolState::Mapped(mapped)
                if addr.0 >= mapped.user_base && addr.0 - mapped.user_base < mapped.region.size() =>
            {
                Ok(PoolOffset(addr.0 - mapped.user_base))
            }
            PoolState::Mapped(_) => Err(IpcError::OutOfRange { addr: addr.0 }),
            PoolState::Unmapped => Err(IpcError::PoolNotBound),
        }
    }

    /// Copy `data` into the pool at `offset`
    pub fn write(&self, offset: PoolOffset, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let PoolState::Mapped(mapped) = &mut *state else {
            return Err(IpcError::PoolNotBound);
        };
        mapped.check_range(offset, data.len())?;
        mapped.region.write(offset.0, data)?;
        Ok(())
    }

    /// Copy `len` bytes out of the pool at `offset`
    pub fn read(&self, offset: PoolOffset, len: usize) -> Result<Vec<u8>> {
        let state = self.state.lock();
        let PoolState::Mapped(mapped) = &*state else {
            return Err(IpcError::PoolNotBound);
        };
        mapped.check_range(offset, len)?;
        let mut buf = vec![0u8; len];
        mapped.region.read(offset.0, &mut buf)?;
        Ok(buf)
    }

    /// Read through the owning process' view of the pool
    pub fn read_user(&self, addr: UserAddr, len: usize) -> Result<Vec<u8>> {
        let offset = self.kernel_address_of(addr)?;
        self.read(offset, len)
    }

    pub fn used_bytes(&self) -> usize {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => mapped.heap.used(),
            PoolState::Unmapped => 0,
        }
    }

    pub fn free_bytes(&self) -> usize {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => mapped.heap.free(),
            PoolState::Unmapped => 0,
        }
    }

    pub fn stats(&self) -> PoolStats {
        match &*self.state.lock() {
            PoolState::Mapped(mapped) => PoolStats {
                size: mapped.region.size(),
                used: mapped.heap.used(),
                free: mapped.heap.free(),
                outstanding: mapped.outstanding.len(),
            },
            PoolState::Unmapped => PoolStats::default(),
        }
    }
}
