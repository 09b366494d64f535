//! The yield side of a coroutine.
//!
//! Code running inside a coroutine suspends itself through the [`Control`]
//! handle passed to its body, or through the free functions in this module,
//! which find the running coroutine through a thread-local pointer.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use crate::arch::{self, EncodedValue};
use crate::coroutine::{Header, GUARD_WORD};
use crate::error::{Error, Operation, Result};
use crate::payload::Payload;
use crate::stack::StackPointer;
use crate::status::Status;
use crate::unwind;

/// Passed across a switch to continue normally.
pub(crate) const SIGNAL_RESUME: EncodedValue = 0;

/// Passed across a switch to make the pending suspend point unwind.
pub(crate) const SIGNAL_UNWIND: EncodedValue = 1;

thread_local! {
    // Control structure of the coroutine running on this thread, null when
    // the thread is on its own stack.
    static CURRENT: Cell<*const Header> = const { Cell::new(ptr::null()) };
}

#[inline]
fn current() -> *const Header {
    CURRENT.with(Cell::get)
}

/// Makes `header` the running coroutine before switching into it. The
/// previously running coroutine, if any, becomes `Calling` and is remembered
/// in the resume chain.
pub(crate) fn enter(header: &Header) {
    let previous = CURRENT.with(|current| current.replace(header));
    if let Some(previous) = unsafe { previous.as_ref() } {
        previous.status.set(Status::Calling);
    }
    header.previous.set(previous);
    header.status.set(Status::Running);
}

/// Undoes [`enter`] before `header` switches out, leaving it in `status`.
pub(crate) fn leave(header: &Header, status: Status) {
    header.status.set(status);
    let previous = header.previous.replace(ptr::null());
    CURRENT.with(|current| current.set(previous));
    if let Some(previous) = unsafe { previous.as_ref() } {
        previous.status.set(Status::Running);
    }
}

/// Handle through which a coroutine body suspends itself.
///
/// A `Control` is only valid for its own coroutine while that coroutine is
/// running. Using it at any other time, for instance from a nested coroutine
/// while the owner is `Calling`, fails with a state error.
pub struct Control {
    header: NonNull<Header>,
    marker: PhantomData<*mut ()>,
}

impl Control {
    pub(crate) fn new(header: NonNull<Header>) -> Self {
        Self {
            header,
            marker: PhantomData,
        }
    }

    #[inline]
    fn header(&self) -> &Header {
        unsafe { self.header.as_ref() }
    }

    /// Status of the coroutine this handle belongs to.
    pub fn status(&self) -> Status {
        self.header().status.get()
    }

    /// Usable stack size of the coroutine.
    pub fn stack_size(&self) -> usize {
        self.header().stack_size
    }

    /// Takes the value the coroutine was last resumed with. Inside a fresh
    /// body this is the value passed to the first resume.
    pub fn take_input(&self) -> Payload {
        self.header().slot.take()
    }

    /// Suspends the coroutine, discarding whatever the next resume passes in.
    pub fn suspend(&self) -> Result<()> {
        self.suspend_any(Payload::empty()).map(drop)
    }

    /// Suspends the coroutine, handing `val` to the resumer.
    pub fn suspend_with<T: 'static>(&self, val: T) -> Result<Payload> {
        self.suspend_any(Payload::new(val))
    }

    /// Suspends the coroutine and takes a `T` from the next resume.
    pub fn suspend_as<T: 'static>(&self, val: Payload) -> Result<T> {
        self.suspend_any(val)?.take()
    }

    /// Suspends the coroutine and takes a `T` from the next resume, if that is
    /// what was passed.
    pub fn suspend_opt<T: 'static>(&self, val: Payload) -> Result<Option<T>> {
        Ok(self.suspend_any(val)?.take_opt())
    }

    /// Suspends the coroutine.
    ///
    /// `val` becomes the result of the `resume` call that is waiting for this
    /// coroutine. Returns the payload passed by the next `resume`.
    ///
    /// If the coroutine is aborted while suspended here, this function does
    /// not return. Instead it starts unwinding the body.
    pub fn suspend_any(&self, val: Payload) -> Result<Payload> {
        let header = self.header();
        let status = header.status.get();
        if !status.can_suspend() {
            return Err(Error::State {
                op: Operation::Suspend,
                status,
            });
        }
        if current() != header as *const Header {
            return Err(Error::NotInCoroutine {
                op: Operation::Suspend,
            });
        }

        let sp = arch::current_stack_ptr();
        if sp <= header.stack_bottom
            || sp > header.stack_base.get()
            || header.guard.get() != GUARD_WORD
        {
            log::error!("stack overflow in coroutine {:p}", header);
            return Err(Error::StackOverflow);
        }

        header.slot.set(val);
        leave(header, Status::Sleeping);
        log::trace!("coroutine {:p} suspended", header);

        let parent_link = (header.stack_base.get() - arch::PARENT_LINK_OFFSET) as *mut StackPointer;
        let signal = unsafe { arch::switch_yield(SIGNAL_RESUME, parent_link) };

        if signal == SIGNAL_UNWIND {
            log::trace!("coroutine {:p} unwinding", header);
            unwind::force_unwind(header as *const Header as usize);
        }
        Ok(header.slot.take())
    }
}

fn with_current<T>(op: Operation, f: impl FnOnce(&Control) -> Result<T>) -> Result<T> {
    let header = NonNull::new(current() as *mut Header).ok_or(Error::NotInCoroutine { op })?;
    f(&Control::new(header))
}

/// Suspends the coroutine running on this thread. See [`Control::suspend`].
pub fn suspend() -> Result<()> {
    with_current(Operation::Suspend, Control::suspend)
}

/// See [`Control::suspend_with`].
pub fn suspend_with<T: 'static>(val: T) -> Result<Payload> {
    with_current(Operation::Suspend, |control| control.suspend_with(val))
}

/// See [`Control::suspend_any`].
pub fn suspend_any(val: Payload) -> Result<Payload> {
    with_current(Operation::Suspend, |control| control.suspend_any(val))
}

/// See [`Control::suspend_as`].
pub fn suspend_as<T: 'static>(val: Payload) -> Result<T> {
    with_current(Operation::Suspend, |control| control.suspend_as(val))
}

/// See [`Control::suspend_opt`].
pub fn suspend_opt<T: 'static>(val: Payload) -> Result<Option<T>> {
    with_current(Operation::Suspend, |control| control.suspend_opt(val))
}

/// Status of the coroutine running on this thread, `None` outside of any
/// coroutine.
pub fn running_status() -> Option<Status> {
    unsafe { current().as_ref() }.map(|header| header.status.get())
}

/// Whether the caller is executing inside a coroutine.
pub fn is_inside_coroutine() -> bool {
    !current().is_null()
}
