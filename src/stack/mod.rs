//! Stack memory for coroutines.
//!
//! Every coroutine runs on one contiguous block of memory. The lowest
//! [`CONTROL_RESERVE`] bytes of the block hold the coroutine's control
//! structure; the rest is the execution stack, which grows downwards from
//! [`Stack::base`] towards the control structure.
//!
//! ```text
//! +--------------------+  <- base()
//! |                    |
//! ~   usable stack     ~  <- size() bytes, grows downwards
//! |                    |
//! +--------------------+
//! | control structure  |  <- CONTROL_RESERVE bytes, overflow guard on top
//! +--------------------+  <- limit()
//! ```
//!
//! In most cases [`DefaultStack`] is all that is needed. Custom memory can be
//! used by implementing [`Stack`].

use core::num::NonZeroUsize;
use std::io;

use crate::error::{Error, Result};

mod heap;
pub use self::heap::HeapStack;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use self::unix::MmapStack;
    }
}

/// Type to represent a stack address.
pub type StackPointer = NonZeroUsize;

/// Required stack alignment at function call boundaries.
pub const STACK_ALIGNMENT: usize = crate::arch::STACK_ALIGNMENT;

/// Smallest usable stack a coroutine is given, whatever was requested.
pub const MIN_STACK_SIZE: usize = 32 * 1024;

/// Usable stack size used when 0 is requested.
pub const DEFAULT_STACK_SIZE: usize = 56 * 1024;

/// Bytes reserved at the low end of every stack block for the control
/// structure of the coroutine running on it.
pub const CONTROL_RESERVE: usize = 256;

/// Computes the usable stack size actually provided for a request of
/// `requested` bytes.
///
/// 0 selects [`DEFAULT_STACK_SIZE`]. Anything smaller than [`MIN_STACK_SIZE`]
/// is raised to it and the result is rounded up to [`STACK_ALIGNMENT`].
/// Returns `None` if the rounding overflows.
pub fn normalize_stack_size(requested: usize) -> Option<usize> {
    let size = if requested == 0 {
        DEFAULT_STACK_SIZE
    } else {
        requested.max(MIN_STACK_SIZE)
    };
    let rounded = size.checked_add(STACK_ALIGNMENT - 1)? & !(STACK_ALIGNMENT - 1);
    Some(rounded)
}

/// Size of the whole block (control structure plus usable stack) needed for a
/// request of `requested` bytes.
pub(crate) fn block_size(requested: usize) -> Result<usize> {
    normalize_stack_size(requested)
        .and_then(|size| size.checked_add(CONTROL_RESERVE))
        .ok_or_else(|| Error::Allocation {
            size: requested,
            source: io::Error::new(io::ErrorKind::InvalidInput, "stack size overflows usize"),
        })
}

/// How the memory of a [`DefaultStack`] is obtained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum StackStrategy {
    /// Zero-initialized heap block. Supports [`Stack::high_water_mark`].
    #[default]
    Heap,

    /// Anonymous memory mapping with a guard page below it. Pages are only
    /// committed when touched, which suits large stacks that are mostly
    /// unused.
    #[cfg(unix)]
    Mapped,
}

/// A trait for objects that own the memory of one coroutine.
///
/// # Safety
///
/// `limit()..base()` must be a region of readable and writable memory owned
/// exclusively by this object for as long as it lives, at least
/// [`CONTROL_RESERVE`] + [`MIN_STACK_SIZE`] bytes large. Both addresses must
/// be aligned to [`STACK_ALIGNMENT`] and must not change while the object is
/// alive, even if it is moved.
pub unsafe trait Stack {
    /// Returns the base address of the stack. This is the highest address
    /// since the stack grows downwards.
    fn base(&self) -> StackPointer;

    /// Returns the lowest address of the block. The control structure of the
    /// coroutine is placed here.
    fn limit(&self) -> StackPointer;

    /// Usable stack size, excluding the control structure.
    fn size(&self) -> usize {
        self.base().get() - self.limit().get() - CONTROL_RESERVE
    }

    /// Approximate number of bytes of the usable stack that have ever been
    /// written to, or `None` if this stack can't tell.
    fn high_water_mark(&self) -> Option<usize> {
        None
    }
}

/// A mutable reference to a stack can be used as a stack. The lifetime of the
/// resulting coroutine is bound to that of the reference.
unsafe impl<'a, S: Stack> Stack for &'a mut S {
    #[inline]
    fn base(&self) -> StackPointer {
        (**self).base()
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        (**self).limit()
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn high_water_mark(&self) -> Option<usize> {
        (**self).high_water_mark()
    }
}

/// Stack used by coroutines unless another one is supplied: one of the
/// built-in strategies, chosen at runtime.
pub enum DefaultStack {
    /// See [`HeapStack`].
    Heap(HeapStack),

    /// See [`MmapStack`].
    #[cfg(unix)]
    Mapped(MmapStack),
}

impl DefaultStack {
    /// Allocates a stack of at least `size` usable bytes (0 for the default)
    /// with the given strategy.
    pub fn new(size: usize, strategy: StackStrategy) -> Result<Self> {
        match strategy {
            StackStrategy::Heap => HeapStack::new(size).map(DefaultStack::Heap),
            #[cfg(unix)]
            StackStrategy::Mapped => MmapStack::new(size).map(DefaultStack::Mapped),
        }
    }

    /// The strategy this stack was allocated with.
    pub fn strategy(&self) -> StackStrategy {
        match self {
            DefaultStack::Heap(_) => StackStrategy::Heap,
            #[cfg(unix)]
            DefaultStack::Mapped(_) => StackStrategy::Mapped,
        }
    }
}

unsafe impl Stack for DefaultStack {
    #[inline]
    fn base(&self) -> StackPointer {
        match self {
            DefaultStack::Heap(s) => s.base(),
            #[cfg(unix)]
            DefaultStack::Mapped(s) => s.base(),
        }
    }

    #[inline]
    fn limit(&self) -> StackPointer {
        match self {
            DefaultStack::Heap(s) => s.limit(),
            #[cfg(unix)]
            DefaultStack::Mapped(s) => s.limit(),
        }
    }

    fn high_water_mark(&self) -> Option<usize> {
        match self {
            DefaultStack::Heap(s) => s.high_water_mark(),
            #[cfg(unix)]
            DefaultStack::Mapped(s) => s.high_water_mark(),
        }
    }
}
