//! Error types returned by coroutine operations.

use core::fmt;
use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use crate::status::Status;

/// Error type produced by a coroutine body.
pub type BoxError = Box<dyn StdError>;

/// Result type used throughout this crate.
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// The operation that was rejected by a state check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Operation {
    Resume,
    Suspend,
    Abort,
    Clear,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Resume => "resume",
            Operation::Suspend => "suspend",
            Operation::Abort => "abort",
            Operation::Clear => "clear",
        })
    }
}

/// Errors returned by coroutine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The coroutine's status does not allow the operation. Nothing was
    /// changed.
    #[error("cannot {op} a coroutine that is {status}")]
    State {
        /// The rejected operation.
        op: Operation,
        /// Status of the coroutine at the time.
        status: Status,
    },

    /// A yield-side operation was used outside of any running coroutine, or
    /// from a coroutine other than the one it belongs to.
    #[error("cannot {op}: not running inside the coroutine")]
    NotInCoroutine {
        /// The rejected operation.
        op: Operation,
    },

    /// The stack pointer left the usable region, or the guard word below the
    /// stack was overwritten. Memory corruption may already have happened.
    #[error("coroutine stack overflow detected")]
    StackOverflow,

    /// Stack memory could not be obtained.
    #[error("failed to allocate a {size} byte coroutine stack")]
    Allocation {
        /// Requested size in bytes.
        size: usize,
        /// Reason reported by the allocator or the OS.
        #[source]
        source: io::Error,
    },

    /// The payload holds no value of the requested type.
    #[error("payload does not hold a value of type `{expected}`")]
    TypeMismatch {
        /// Name of the requested type.
        expected: &'static str,
    },

    /// The body caught the forced unwind of an abort and suspended again
    /// instead of finishing. The coroutine is still sleeping.
    #[error("coroutine suspended again while being aborted")]
    UnwindIntercepted,

    /// The body returned an error. The original error object is kept as is.
    #[error(transparent)]
    Body(BoxError),
}

impl Error {
    /// Whether this is a rejected state transition.
    pub fn is_state_error(&self) -> bool {
        matches!(self, Error::State { .. } | Error::NotInCoroutine { .. })
    }

    /// Extracts the error returned by a coroutine body.
    pub fn into_body(self) -> Option<BoxError> {
        match self {
            Error::Body(e) => Some(e),
            _ => None,
        }
    }

    /// Converts an error leaving a body into the stored failure. A body error
    /// forwarded from a nested coroutine with `?` is unwrapped so the original
    /// object reaches the outermost resumer.
    pub(crate) fn flatten_body(err: BoxError) -> BoxError {
        match err.downcast::<Error>() {
            Ok(err) => match *err {
                Error::Body(inner) => inner,
                other => Box::new(other),
            },
            Err(err) => err,
        }
    }
}
