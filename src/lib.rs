//! *Stackful coroutines with a type-erased value channel.*
//!
//! ## Overview
//!
//! This crate provides [coroutines] that run on their own stack. A coroutine
//! body can suspend itself from any depth of its call graph and be resumed
//! later from exactly that point. Each suspend hands a value to the resumer
//! and each resume hands a value to the pending suspend.
//!
//! Coroutines nest: a body may resume another coroutine, which then returns to
//! it, not to whoever resumed the outer one. Scheduling is cooperative and
//! single-threaded; a coroutine only stops running at its own suspend points.
//!
//! [coroutines]: https://en.wikipedia.org/wiki/Coroutine
//!
//! ## Example
//!
//! ```rust
//! use coroplus::Coroutine;
//!
//! fn main() -> coroplus::Result<()> {
//!     println!("[main] creating coroutine");
//!
//!     let co = Coroutine::new(|control| -> coroplus::Result<()> {
//!         let mut input: i32 = control.take_input().take()?;
//!         println!("[coroutine] started with input {}", input);
//!         for i in 0..3 {
//!             println!("[coroutine] yielding {}", i);
//!             input = control.suspend_with(i)?.take()?;
//!             println!("[coroutine] got {} from parent", input);
//!         }
//!         println!("[coroutine] exiting");
//!         Ok(())
//!     })?;
//!
//!     let mut counter = 100;
//!     loop {
//!         println!("[main] resuming coroutine with argument {}", counter);
//!         let mut out = co.resume_with(counter)?;
//!         if co.status().is_terminal() {
//!             break;
//!         }
//!         println!("[main] got {:?} from coroutine", out.take::<i32>()?);
//!         counter += 1;
//!     }
//!
//!     println!("[main] exiting");
//!     Ok(())
//! }
//! ```
//!
//! ## Supported targets
//!
//! |         | ELF (Linux, BSD, etc) | Darwin (macOS, iOS, etc) | Windows |
//! |---------|-----------------------|--------------------------|---------|
//! | x86_64  | ✅                     | ✅                        | ❌       |
//! | AArch64 | ✅                     | ✅                        | ❌       |
//!
//! ## Features
//!
//! #### Error and panic propagation
//!
//! A body may return `()` or a `Result`. An error it returns surfaces as
//! [`Error::Body`] from the resume that observed it finishing, holding the
//! original error object. A panic unwinds out of the coroutine stack and
//! continues from that same resume call. Either way the coroutine is
//! [`Status::Completed`] afterwards.
//!
//! #### Cleanup on abort and drop
//!
//! [`Coroutine::abort`] unwinds a suspended coroutine from its pending suspend
//! point, dropping every local variable on its stack. Dropping a suspended
//! coroutine does the same.
//!
//! #### Linked backtraces
//!
//! Backtraces taken inside a coroutine continue into the stack of whoever last
//! resumed it, through the standard unwinding metadata.
//!
//! #### Stack overflow detection
//!
//! The control structure of a coroutine sits just below its stack and ends
//! with a guard word. Every suspend checks the stack pointer and the guard,
//! every resume checks the guard, and a violation is reported as
//! [`Error::StackOverflow`].
//!
//! ## Logging
//!
//! State transitions are logged through the [`log`] facade at `trace` level,
//! stack allocation and aborts at `debug` level.

#![warn(missing_docs)]

mod arch;
mod control;
mod coroutine;
mod error;
mod payload;
pub mod stack;
mod status;
mod unwind;

pub use control::{
    is_inside_coroutine, running_status, suspend, suspend_any, suspend_as, suspend_opt,
    suspend_with, Control,
};
pub use coroutine::{BodyResult, Builder, Coroutine};
pub use error::{BoxError, Error, Operation, Result};
pub use payload::Payload;
pub use stack::{DefaultStack, StackStrategy};
pub use status::Status;

#[cfg(test)]
mod tests;
