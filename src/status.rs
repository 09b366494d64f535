use core::fmt;

/// Lifecycle state of a coroutine.
///
/// ```text
///            resume                suspend
/// Starting ---------> Running -------------> Sleeping
///    |                 |   ^ <--------------   |
///    |           resume|   |     resume        |
///    |          (nested)   | nested suspends   |
///    |                 v   |   or completes    |
///    |                 Calling                 |
///    |   abort                                 | abort
///    +------------> Completed <----------------+
///                       ^
///                       | body returns, fails or panics
///                    Running
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Created, the body has not been entered yet.
    Starting,
    /// The body is executing on this thread.
    Running,
    /// Suspended in the middle of its body.
    Sleeping,
    /// The body has resumed another coroutine and waits for it to suspend or
    /// finish.
    Calling,
    /// The body has finished, failed, or been aborted. Terminal.
    Completed,
}

impl Status {
    /// Whether `resume` is allowed in this state.
    #[inline]
    pub fn can_resume(self) -> bool {
        matches!(self, Status::Starting | Status::Sleeping)
    }

    /// Whether `abort` is allowed in this state. Aborting a completed
    /// coroutine does nothing.
    #[inline]
    pub fn can_abort(self) -> bool {
        matches!(self, Status::Starting | Status::Sleeping | Status::Completed)
    }

    /// Whether the coroutine may suspend itself in this state.
    #[inline]
    pub fn can_suspend(self) -> bool {
        self == Status::Running
    }

    /// Whether the coroutine has completed.
    #[inline]
    pub fn is_terminal(self) -> bool {
        self == Status::Completed
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Starting => "starting",
            Status::Running => "running",
            Status::Sleeping => "sleeping",
            Status::Calling => "calling",
            Status::Completed => "completed",
        })
    }
}
