//! Anonymous shared memory regions.
//!
//! A [`SharedRegion`] is a `MAP_SHARED | MAP_ANONYMOUS` mapping that holds a
//! single value of type `T`. Because the mapping is shared rather than
//! private, every process forked after it is created sees the same physical
//! pages, so atomics placed inside it synchronize across processes. The
//! mapping never has a name in the filesystem; it disappears when the last
//! process holding it exits.

use std::ops::Deref;
use std::ptr::NonNull;
use tracing::debug;
use warp_common::error::{WarpError, WarpResult};

/// Smallest mapping we ever create.
pub const SHARED_PAGE_SIZE: usize = 4096;

/// A value living in memory shared with forked children.
pub struct SharedRegion<T> {
    ptr: NonNull<T>,
    len: usize,
}

// Safety: the region hands out `&T` to every thread and drops `T` on
// whichever thread drops the region, so it needs both bounds.
unsafe impl<T: Send + Sync> Send for SharedRegion<T> {}
unsafe impl<T: Send + Sync> Sync for SharedRegion<T> {}

impl<T> SharedRegion<T> {
    /// Map a fresh zero-filled shared region and move `value` into it.
    ///
    /// # Errors
    ///
    /// Returns [`WarpError::SharedMemory`] if the mapping cannot be created.
    pub fn new(value: T) -> WarpResult<Self> {
        let len = mapping_len(std::mem::size_of::<T>());
        if std::mem::align_of::<T>() > len {
            return Err(WarpError::SharedMemory(format!(
                "alignment {} exceeds mapping size {len}",
                std::mem::align_of::<T>()
            )));
        }

        // SAFETY: anonymous mapping with no address hint; the kernel picks a
        // page-aligned address and zero-fills the pages.
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(WarpError::SharedMemory(format!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }

        let ptr = NonNull::new(addr.cast::<T>())
            .ok_or_else(|| WarpError::SharedMemory("mmap returned null".into()))?;

        // SAFETY: the mapping is at least size_of::<T>() bytes, page aligned
        // (which satisfies align_of::<T>() as checked above) and writable.
        unsafe { ptr.as_ptr().write(value) };

        debug!(len, addr = ?ptr, "Shared region mapped");
        Ok(Self { ptr, len })
    }

    /// Size of the underlying mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; a region holds exactly one value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl<T> Deref for SharedRegion<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: initialized in `new` and valid until `drop`.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> Drop for SharedRegion<T> {
    fn drop(&mut self) {
        // SAFETY: we own the value and the mapping; no reference outlives
        // `self` because `deref` borrows from it.
        unsafe {
            std::ptr::drop_in_place(self.ptr.as_ptr());
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Round `size` up to whole pages, never below one page.
fn mapping_len(size: usize) -> usize {
    let page = page_size().max(SHARED_PAGE_SIZE);
    size.max(1).div_ceil(page) * page
}

/// Get system page size.
fn page_size() -> usize {
    // SAFETY: sysconf is safe to call
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(SHARED_PAGE_SIZE)
}
