use core::cell::Cell;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::arch::{self, initial_func_abi, EncodedValue};
use crate::control::{self, Control, SIGNAL_RESUME, SIGNAL_UNWIND};
use crate::error::{BoxError, Error, Operation, Result};
use crate::payload::Payload;
use crate::stack::{DefaultStack, Stack, StackPointer, StackStrategy, CONTROL_RESERVE};
use crate::status::Status;
use crate::unwind::{self, Failure};

/// Value of the guard word while the stack below it is intact.
pub(crate) const GUARD_WORD: usize = 0x7e3c_b1a5_5ac3_e7d9;

/// Control structure of a coroutine.
///
/// It lives at the top of the reserved area at the low end of the stack block,
/// so `guard` is the first word an overflowing stack overwrites.
#[repr(C)]
pub(crate) struct Header {
    pub(crate) status: Cell<Status>,

    /// Saved stack pointer of the coroutine, `None` once it has completed.
    pub(crate) stack_ptr: Cell<Option<StackPointer>>,

    pub(crate) stack_base: StackPointer,

    /// Lowest address the stack pointer may reach.
    pub(crate) stack_bottom: usize,

    pub(crate) stack_size: usize,

    /// Coroutine that was running when this one was resumed. Only meaningful
    /// while this coroutine runs.
    pub(crate) previous: Cell<*const Header>,

    pub(crate) slot: Cell<Payload>,

    pub(crate) failure: Cell<Option<Failure>>,

    /// Destroys the entry object of a coroutine that never started.
    drop_fn: unsafe fn(ptr: *mut u8),

    pub(crate) guard: Cell<usize>,
}

const _: () = assert!(mem::size_of::<Header>() <= CONTROL_RESERVE);

/// Return type of a coroutine body: either `()` or a `Result` whose error is
/// handed to the resumer as [`Error::Body`].
pub trait BodyResult {
    /// Converts the returned value into the outcome of the body.
    fn into_result(self) -> Result<(), BoxError>;
}

impl BodyResult for () {
    #[inline]
    fn into_result(self) -> Result<(), BoxError> {
        Ok(())
    }
}

impl<E: Into<BoxError>> BodyResult for Result<(), E> {
    #[inline]
    fn into_result(self) -> Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

/// Bodies larger than this, or aligned more strictly, are moved to the heap
/// and only a box is placed on the coroutine stack.
const MAX_INLINE_BODY: usize = 1024;

/// Initial object on a fresh coroutine stack.
struct Start<F> {
    header: NonNull<Header>,
    body: F,
}

/// A stackful coroutine.
///
/// The body runs on its own stack and may suspend itself from any depth of
/// its call graph, either through the [`Control`] it receives or through
/// [`suspend`](crate::suspend). Every handoff carries one [`Payload`] in each
/// direction.
///
/// # Lifetime
///
/// The `'a` lifetime is that of the body, which may borrow from its
/// environment.
///
/// # Dropping a coroutine
///
/// A coroutine that has started but not finished is aborted when dropped, so
/// every object on its stack is dropped. An error returned by the body while
/// it unwinds is logged and discarded; a panic is propagated.
///
/// Dropping a coroutine that is running or calling another coroutine aborts
/// the process, since its stack is still in use.
///
/// # `Send`
///
/// A coroutine stays on the thread that created it, so `Coroutine` does not
/// implement `Send`.
pub struct Coroutine<'a, S: Stack = DefaultStack> {
    // None after `clear`.
    stack: Option<S>,
    pub(crate) header: NonNull<Header>,
    marker: PhantomData<&'a ()>,
}

impl<'a> Coroutine<'a, DefaultStack> {
    /// Creates a coroutine on a default heap stack. The body is not entered
    /// until the first resume.
    pub fn new<F, R>(body: F) -> Result<Self>
    where
        F: FnOnce(&Control) -> R + 'a,
        R: BodyResult,
    {
        Builder::new().spawn(body)
    }

    /// Creates a coroutine whose body takes no handle. It can still suspend
    /// itself with the free [`suspend`](crate::suspend) functions.
    pub fn from_fn<F, R>(body: F) -> Result<Self>
    where
        F: FnOnce() -> R + 'a,
        R: BodyResult,
    {
        Builder::new().spawn_fn(body)
    }
}

impl<'a, S: Stack> Coroutine<'a, S> {
    /// Creates a coroutine on the given stack.
    pub fn with_stack<F, R>(stack: S, body: F) -> Self
    where
        F: FnOnce(&Control) -> R + 'a,
        R: BodyResult,
    {
        Self::build(stack, move |control: &Control| body(control).into_result())
    }

    fn build<F>(stack: S, body: F) -> Self
    where
        F: FnOnce(&Control) -> Result<(), BoxError> + 'a,
    {
        if mem::size_of::<F>() > MAX_INLINE_BODY || mem::align_of::<F>() > MAX_INLINE_BODY {
            let body = Box::new(body);
            return Self::build_inline(stack, move |control: &Control| body(control));
        }
        Self::build_inline(stack, body)
    }

    fn build_inline<F>(stack: S, body: F) -> Self
    where
        F: FnOnce(&Control) -> Result<(), BoxError> + 'a,
    {
        initial_func_abi! {
            unsafe fn coroutine_entry<F>(
                signal: EncodedValue,
                parent_link: &mut StackPointer,
                start: *mut Start<F>,
            ) -> !
            where
                F: FnOnce(&Control) -> Result<(), BoxError>,
            {
                debug_assert_eq!(start as usize % mem::align_of::<Start<F>>(), 0);
                let Start { header, body } = start.read();

                // Aborting a coroutine that never started doesn't switch into
                // it, so the first signal is always a plain resume.
                debug_assert_eq!(signal, SIGNAL_RESUME);

                let control = Control::new(header);
                let failure =
                    unwind::catch_unwind_at_root(header.as_ptr() as usize, || body(&control));

                // Nothing that needs dropping may be left on this stack past
                // this point.
                let header = header.as_ref();
                header.failure.set(failure);
                control::leave(header, Status::Completed);
                log::trace!("coroutine {:p} completed", header);
                arch::switch_and_reset(SIGNAL_RESUME, parent_link);
            }
        }

        unsafe fn drop_fn<T>(ptr: *mut u8) {
            ptr::drop_in_place(ptr as *mut T);
        }

        let base = stack.base();
        let bottom = stack.limit().get() + CONTROL_RESERVE;
        let size = stack.size();

        unsafe {
            let header = NonNull::new_unchecked((bottom - mem::size_of::<Header>()) as *mut Header);
            header.as_ptr().write(Header {
                status: Cell::new(Status::Starting),
                stack_ptr: Cell::new(None),
                stack_base: base,
                stack_bottom: bottom,
                stack_size: size,
                previous: Cell::new(ptr::null()),
                slot: Cell::new(Payload::empty()),
                failure: Cell::new(None),
                drop_fn: drop_fn::<Start<F>>,
                guard: Cell::new(GUARD_WORD),
            });

            let stack_ptr = arch::init_stack(base, coroutine_entry::<F>, Start { header, body });
            header.as_ref().stack_ptr.set(Some(stack_ptr));
            log::trace!("created coroutine {:p} with a {} byte stack", header, size);

            Self {
                stack: Some(stack),
                header,
                marker: PhantomData,
            }
        }
    }

    #[inline]
    fn header(&self) -> Option<&Header> {
        self.stack.as_ref()?;
        Some(unsafe { self.header.as_ref() })
    }

    /// Current status. A cleared coroutine reports `Completed`.
    pub fn status(&self) -> Status {
        self.header()
            .map_or(Status::Completed, |header| header.status.get())
    }

    /// Usable stack size, 0 once cleared.
    pub fn stack_size(&self) -> usize {
        self.header().map_or(0, |header| header.stack_size)
    }

    /// Approximate number of stack bytes used so far, if the stack can tell.
    pub fn stack_used(&self) -> Option<usize> {
        self.stack.as_ref()?.high_water_mark()
    }

    /// Resumes the coroutine without passing a value, discarding whatever it
    /// hands back.
    pub fn resume(&self) -> Result<()> {
        self.resume_any(Payload::empty()).map(drop)
    }

    /// Resumes the coroutine, passing `val` to its pending suspend.
    pub fn resume_with<T: 'static>(&self, val: T) -> Result<Payload> {
        self.resume_any(Payload::new(val))
    }

    /// Resumes the coroutine and takes a `T` from what it hands back.
    pub fn resume_as<T: 'static>(&self, val: Payload) -> Result<T> {
        self.resume_any(val)?.take()
    }

    /// Resumes the coroutine and takes a `T` from what it hands back, if that
    /// is what it passed.
    pub fn resume_opt<T: 'static>(&self, val: Payload) -> Result<Option<T>> {
        Ok(self.resume_any(val)?.take_opt())
    }

    /// Resumes execution of the coroutine.
    ///
    /// Control returns once the coroutine suspends or finishes. A suspend
    /// yields the payload passed to it. A finished body yields an empty
    /// payload, or its error as [`Error::Body`]. A panic in the body is
    /// propagated from here.
    ///
    /// Only `Starting` and `Sleeping` coroutines can be resumed. When called
    /// from inside another coroutine, that coroutine is `Calling` until this
    /// one suspends or finishes.
    pub fn resume_any(&self, val: Payload) -> Result<Payload> {
        let header = self.header().ok_or(Error::State {
            op: Operation::Resume,
            status: Status::Completed,
        })?;
        let status = header.status.get();
        if !status.can_resume() {
            return Err(Error::State {
                op: Operation::Resume,
                status,
            });
        }
        if header.guard.get() != GUARD_WORD {
            log::error!("stack overflow in coroutine {:p}", header);
            return Err(Error::StackOverflow);
        }

        header.slot.set(val);
        self.switch_in(header, SIGNAL_RESUME)
    }

    fn switch_in(&self, header: &Header, signal: EncodedValue) -> Result<Payload> {
        let stack_ptr = match header.stack_ptr.get() {
            Some(stack_ptr) => stack_ptr,
            None => {
                return Err(Error::State {
                    op: Operation::Resume,
                    status: Status::Completed,
                })
            }
        };

        control::enter(header);
        log::trace!("resuming coroutine {:p}", header);

        let (_, stack_ptr) =
            unsafe { arch::switch_and_link(signal, stack_ptr, header.stack_base) };
        header.stack_ptr.set(stack_ptr);

        if stack_ptr.is_some() {
            return Ok(header.slot.take());
        }
        drop(header.slot.take());
        match header.failure.take() {
            Some(failure) => Err(unwind::resume_failure(failure)),
            None => Ok(Payload::empty()),
        }
    }

    /// Tears the coroutine down.
    ///
    /// A coroutine that never started completes without entering its body,
    /// which is simply dropped. A sleeping coroutine is resumed with a forced
    /// unwind from its pending suspend, which drops everything on its stack.
    /// The unwind itself never reaches the caller, but an error or panic the
    /// body raises on the way does. Aborting a completed coroutine does
    /// nothing.
    ///
    /// If the body catches the unwind and suspends again, this returns
    /// [`Error::UnwindIntercepted`] and the coroutine stays `Sleeping`.
    pub fn abort(&self) -> Result<()> {
        let header = match self.header() {
            Some(header) => header,
            None => return Ok(()),
        };

        let status = header.status.get();
        if !status.can_abort() {
            return Err(Error::State {
                op: Operation::Abort,
                status,
            });
        }
        if status == Status::Completed {
            return Ok(());
        }

        if status == Status::Starting {
            log::debug!("aborting coroutine {:p} before it started", header);
            if let Some(stack_ptr) = header.stack_ptr.take() {
                header.status.set(Status::Completed);
                unsafe { arch::drop_initial_obj(stack_ptr, header.drop_fn) };
            }
            return Ok(());
        }

        log::debug!("aborting coroutine {:p}", header);
        if header.guard.get() != GUARD_WORD {
            log::error!("stack overflow in coroutine {:p}", header);
            return Err(Error::StackOverflow);
        }
        header.slot.set(Payload::empty());
        self.switch_in(header, SIGNAL_UNWIND)?;
        if header.status.get() == Status::Sleeping {
            log::warn!("coroutine {:p} suspended while being aborted", header);
            return Err(Error::UnwindIntercepted);
        }
        Ok(())
    }

    /// Releases the stack of a coroutine that has completed or never
    /// started. The body of an unstarted coroutine is dropped.
    ///
    /// Afterwards the coroutine reports `Completed` with a stack size of 0.
    /// Clearing twice is fine.
    pub fn clear(&mut self) -> Result<()> {
        let header = match self.header() {
            Some(header) => header,
            None => return Ok(()),
        };
        match header.status.get() {
            Status::Starting => self.abort()?,
            Status::Completed => {}
            status => {
                return Err(Error::State {
                    op: Operation::Clear,
                    status,
                })
            }
        }
        unsafe { self.release() };
        Ok(())
    }

    /// Drops the control structure and frees the stack.
    ///
    /// # Safety
    ///
    /// Nothing may live on the stack anymore.
    unsafe fn release(&mut self) {
        if let Some(stack) = self.stack.take() {
            log::debug!("releasing stack of coroutine {:p}", self.header);
            ptr::drop_in_place(self.header.as_ptr());
            drop(stack);
        }
    }
}

impl<'a, S: Stack> Drop for Coroutine<'a, S> {
    fn drop(&mut self) {
        let status = match self.header() {
            Some(header) => header.status.get(),
            None => return,
        };

        match status {
            Status::Running | Status::Calling => {
                log::error!("dropped a coroutine that is still {}", status);
                std::process::abort();
            }
            Status::Starting | Status::Sleeping => {
                // Free the stack even if the body panics while unwinding.
                let guard = scopeguard::guard(self, |this| unsafe { this.release() });
                match guard.abort() {
                    Ok(()) => {}
                    Err(Error::Body(err)) => {
                        log::warn!("discarding error from aborted coroutine: {}", err);
                    }
                    Err(err) => {
                        log::error!("failed to abort dropped coroutine: {}", err);
                        std::process::abort();
                    }
                }
            }
            Status::Completed => unsafe { self.release() },
        }
    }
}

impl<'a, S: Stack> fmt::Debug for Coroutine<'a, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("status", &self.status())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Coroutine factory with a configurable stack.
///
/// ```
/// use coroplus::{Builder, StackStrategy};
///
/// let co = Builder::new()
///     .stack_size(128 * 1024)
///     .strategy(StackStrategy::Heap)
///     .spawn_fn(|| println!("hello"))?;
/// co.resume()?;
/// # Ok::<(), coroplus::Error>(())
/// ```
#[derive(Clone, Copy, Debug, Default)]
pub struct Builder {
    stack_size: usize,
    strategy: StackStrategy,
}

impl Builder {
    /// Default size and heap strategy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requested usable stack size in bytes. 0 selects the default, smaller
    /// requests are raised to the minimum.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Where the stack memory comes from.
    pub fn strategy(mut self, strategy: StackStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Allocates the stack and creates a coroutine on it.
    pub fn spawn<'a, F, R>(self, body: F) -> Result<Coroutine<'a>>
    where
        F: FnOnce(&Control) -> R + 'a,
        R: BodyResult,
    {
        let stack = DefaultStack::new(self.stack_size, self.strategy)?;
        Ok(Coroutine::with_stack(stack, body))
    }

    /// Like [`Builder::spawn`] for a body that takes no handle.
    pub fn spawn_fn<'a, F, R>(self, body: F) -> Result<Coroutine<'a>>
    where
        F: FnOnce() -> R + 'a,
        R: BodyResult,
    {
        self.spawn(move |_: &Control| body())
    }
}
