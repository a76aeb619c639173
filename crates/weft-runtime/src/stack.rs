//! Fiber stacks
//!
//! Each fiber owns an mmap'd stack with a PROT_NONE guard page at the low
//! end, so overflow faults instead of corrupting a neighbor.

use weft_core::constants::GUARD_SIZE;
use weft_core::error::{SchedResult, StackError};

/// An owned, mmap'd stack region
///
/// The usable area is `[base + GUARD_SIZE, base + size)`; fibers enter at
/// `top()` and grow downward toward the guard page.
pub struct FiberStack {
    base: *mut u8,
    size: usize,
}

// The raw pointer is only ever dereferenced by the machine while the
// owning fiber is RUNNING on exactly one thread.
unsafe impl Send for FiberStack {}
unsafe impl Sync for FiberStack {}

impl FiberStack {
    /// Allocate a stack of `size` bytes (rounded up to whole pages)
    pub fn new(size: usize) -> SchedResult<Self> {
        if size < GUARD_SIZE * 2 {
            return Err(StackError::TooSmall.into());
        }
        let size = (size + GUARD_SIZE - 1) & !(GUARD_SIZE - 1);

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(StackError::AllocationFailed.into());
        }
        let base = base as *mut u8;

        // Guard page at the low end; overflow becomes SIGSEGV
        let ret = unsafe { libc::mprotect(base as *mut libc::c_void, GUARD_SIZE, libc::PROT_NONE) };
        if ret != 0 {
            unsafe { libc::munmap(base as *mut libc::c_void, size) };
            return Err(StackError::ProtectionFailed.into());
        }

        Ok(Self { base, size })
    }

    /// High end of the stack (initial stack pointer)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    /// Total mapping size including the guard page
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for FiberStack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}
