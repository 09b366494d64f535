use std::alloc::{self, Layout};
use std::io;
use std::ptr::NonNull;

use super::{block_size, Stack, StackPointer, CONTROL_RESERVE, STACK_ALIGNMENT};
use crate::error::{Error, Result};

/// Stack allocated as one zero-initialized heap block.
///
/// Because the memory starts out zeroed, the deepest byte ever written can be
/// found by scanning, which gives [`Stack::high_water_mark`].
pub struct HeapStack {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapStack {
    /// Allocates a stack with at least `size` usable bytes, 0 meaning the
    /// default size.
    pub fn new(size: usize) -> Result<Self> {
        let len = block_size(size)?;
        let layout = Layout::from_size_align(len, STACK_ALIGNMENT).map_err(|e| {
            Error::Allocation {
                size: len,
                source: io::Error::new(io::ErrorKind::InvalidInput, e),
            }
        })?;

        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| Error::Allocation {
            size: len,
            source: io::Error::from(io::ErrorKind::OutOfMemory),
        })?;
        log::debug!("allocated {} byte heap stack at {:p}", len, ptr);

        Ok(Self { ptr, layout })
    }
}

// The block is owned exclusively and never aliased.
unsafe impl Send for HeapStack {}
unsafe impl Sync for HeapStack {}

impl Drop for HeapStack {
    fn drop(&mut self) {
        log::debug!("releasing heap stack at {:p}", self.ptr);
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

unsafe impl Stack for HeapStack {
    #[inline]
    fn base(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.ptr.as_ptr() as usize + self.layout.size()) }
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        unsafe { StackPointer::new_unchecked(self.ptr.as_ptr() as usize) }
    }

    fn high_water_mark(&self) -> Option<usize> {
        let len = self.layout.size() - CONTROL_RESERVE;
        let start = unsafe { self.ptr.as_ptr().add(CONTROL_RESERVE) };
        // Untouched bytes are still zero, so the first non-zero byte from the
        // bottom marks the deepest point the stack has reached.
        let untouched = (0..len)
            .take_while(|&i| unsafe { start.add(i).read_volatile() } == 0)
            .count();
        Some(len - untouched)
    }
}
