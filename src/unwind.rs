//! This file contains the logic for carrying failures out of a coroutine and
//! for tearing a suspended coroutine down.
//!
//! Panics never cross the assembly code at the root of a coroutine: they are
//! caught with `catch_unwind` at the trampoline, stored in the control
//! structure and re-raised with `resume_unwind` once the resumer is back on its
//! own stack.
//!
//! Aborting a suspended coroutine resumes it with a signal that makes the
//! pending suspend point start unwinding with a [`ForcedUnwind`] payload. Every
//! live scope of the body runs its destructors, and the trampoline recognizes
//! and swallows the payload.
//!
//! Bodies must not swallow a [`ForcedUnwind`] with `catch_unwind` without
//! resuming it. If they suspend again, the abort fails with
//! `Error::UnwindIntercepted`.

use core::any::Any;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{BoxError, Error};

/// Why a body left its coroutine other than by returning normally.
pub(crate) enum Failure {
    Panic(Box<dyn Any + Send>),
    Error(BoxError),
}

/// Unwind payload used to tear down an aborted coroutine. Holds the address
/// of the control structure of the coroutine being aborted.
pub(crate) struct ForcedUnwind(pub usize);

/// Starts unwinding the current coroutine after an abort request.
#[inline(never)]
#[cold]
pub(crate) fn force_unwind(owner: usize) -> ! {
    // resume_unwind skips the panic hook, so aborts don't print anything.
    panic::resume_unwind(Box::new(ForcedUnwind(owner)))
}

/// Runs a body at the root of coroutine `owner`, turning every way out of it
/// into a value.
pub(crate) fn catch_unwind_at_root<F>(owner: usize, f: F) -> Option<Failure>
where
    F: FnOnce() -> Result<(), BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(Failure::Error(Error::flatten_body(err))),
        Err(payload) => match payload.downcast::<ForcedUnwind>() {
            Ok(unwind) if unwind.0 == owner => None,
            Ok(unwind) => Some(Failure::Panic(unwind)),
            Err(payload) => Some(Failure::Panic(payload)),
        },
    }
}

/// Hands a caught failure over to the resumer.
pub(crate) fn resume_failure(failure: Failure) -> Error {
    match failure {
        Failure::Panic(payload) => panic::resume_unwind(payload),
        Failure::Error(err) => Error::Body(err),
    }
}
