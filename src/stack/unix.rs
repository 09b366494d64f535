use std::io;
use std::ptr;

use super::{block_size, Stack, StackPointer};
use crate::error::{Error, Result};

fn page_size() -> usize {
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    assert!(pagesize.is_power_of_two());
    pagesize
}

/// Stack backed by an anonymous `mmap` with an inaccessible guard page below
/// the control structure.
///
/// Physical pages are only committed once touched, so large stacks that are
/// rarely used in full are cheap.
pub struct MmapStack {
    base: StackPointer,
    mmap_len: usize,
    page_size: usize,
}

impl MmapStack {
    /// Maps a stack with at least `size` usable bytes, 0 meaning the default
    /// size. The block is rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self> {
        let len = block_size(size)?;
        let page_size = page_size();

        // One extra page for the guard, then round to a page boundary.
        let mmap_len = len
            .checked_add(page_size + page_size - 1)
            .map(|n| n & !(page_size - 1))
            .ok_or_else(|| Error::Allocation {
                size: len,
                source: io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows usize"),
            })?;

        // OpenBSD requires MAP_STACK on anything that is used as a stack.
        cfg_if::cfg_if! {
            if #[cfg(target_os = "openbsd")] {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_STACK;
            } else {
                let map_flags = libc::MAP_ANONYMOUS | libc::MAP_PRIVATE;
            }
        }

        unsafe {
            let mmap = libc::mmap(ptr::null_mut(), mmap_len, libc::PROT_NONE, map_flags, -1, 0);
            if mmap == libc::MAP_FAILED {
                return Err(Error::Allocation {
                    size: mmap_len,
                    source: io::Error::last_os_error(),
                });
            }

            // From here on dropping `out` unmaps the region.
            let out = Self {
                base: StackPointer::new_unchecked(mmap as usize + mmap_len),
                mmap_len,
                page_size,
            };

            // Everything but the lowest page becomes accessible.
            if libc::mprotect(
                mmap.cast::<u8>().add(page_size).cast(),
                mmap_len - page_size,
                libc::PROT_READ | libc::PROT_WRITE,
            ) != 0
            {
                return Err(Error::Allocation {
                    size: mmap_len,
                    source: io::Error::last_os_error(),
                });
            }

            log::debug!("mapped {} byte stack at {:#x}", mmap_len, mmap as usize);
            Ok(out)
        }
    }
}

impl Drop for MmapStack {
    fn drop(&mut self) {
        let mmap = self.base.get() - self.mmap_len;
        log::debug!("unmapping stack at {:#x}", mmap);
        unsafe {
            let ret = libc::munmap(mmap as _, self.mmap_len);
            debug_assert_eq!(ret, 0);
        }
    }
}

unsafe impl Stack for MmapStack {
    #[inline]
    fn base(&self) -> StackPointer {
        self.base
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        // The guard page is not part of the usable block.
        unsafe { StackPointer::new_unchecked(self.base.get() - self.mmap_len + self.page_size) }
    }
}
