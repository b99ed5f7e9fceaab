//! Kernel-visible memory regions
//!
//! A [`KernelRegion`] is a run of zeroed, page-aligned memory owned by the
//! kernel, together with the physical frames that back each page. The IPC pool
//! lives in one region; each frame is mapped into the owning process so the
//! user sees the same bytes read-only.
//!
//! # Design
//! - Backing memory comes from the host allocator with page alignment
//! - Frames are opaque numbers handed out by the [`crate::PageMapper`]
//! - All byte access goes through bounds-checked copies on the raw base
//!   pointer, so an allocator placed inside the region can keep raw pointers
//!   into it while the region is borrowed

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::{PlatformError, Result};

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysFrame(pub u64);

/// Page-aligned kernel memory backed by physical frames
#[derive(Debug)]
pub struct KernelRegion {
    base: NonNull<u8>,
    layout: Layout,
    page_size: usize,
    frames: Vec<PhysFrame>,
}

// SAFETY: the region exclusively owns its allocation; shared access only
// reads through `read`, mutation requires `&mut self`.
unsafe impl Send for KernelRegion {}
unsafe impl Sync for KernelRegion {}

impl KernelRegion {
    /// Allocate zeroed memory for one page per frame
    ///
    /// # Errors
    ///
    /// [`PlatformError::OutOfFrames`] if `frames` is empty, the page size is
    /// not a power of two, or the host allocator fails.
    pub fn new(page_size: usize, frames: Vec<PhysFrame>) -> Result<Self> {
        let requested = frames.len();
        let size = page_size
            .checked_mul(requested)
            .ok_or(PlatformError::OutOfFrames { requested })?;
        if size == 0 {
            return Err(PlatformError::OutOfFrames { requested });
        }
        let layout = Layout::from_size_align(size, page_size)
            .map_err(|_| PlatformError::OutOfFrames { requested })?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(PlatformError::OutOfFrames { requested })?;

        Ok(Self {
            base,
            layout,
            page_size,
            frames,
        })
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn page_count(&self) -> usize {
        self.frames.len()
    }

    /// Backing frames, one per page, in address order
    pub fn frames(&self) -> &[PhysFrame] {
        &self.frames
    }

    /// Kernel base pointer
    ///
    /// Valid for [`KernelRegion::size`] bytes until the region is dropped.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size() => Ok(()),
            _ => Err(PlatformError::BadAddress { addr: offset, len }),
        }
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.check(offset, buf.len())?;
        // SAFETY: range checked above; `buf` cannot alias the region because
        // no slice into the region is ever handed out.
        unsafe {
            core::ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy `data` into the region at `offset`
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len())?;
        // SAFETY: range checked above.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.base.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    /// Release the backing memory and hand the frames back to the caller
    pub fn into_frames(self) -> Vec<PhysFrame> {
        let mut this = core::mem::ManuallyDrop::new(self);
        let frames = core::mem::take(&mut this.frames);
        // SAFETY: allocated in `new` with this layout; `this` is never used again.
        unsafe { dealloc(this.base.as_ptr(), this.layout) };
        frames
    }
}

impl Drop for KernelRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}
