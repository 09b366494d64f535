//! Context-switch primitive.
//!
//! Everything in here moves raw register state between stacks. The rest of
//! the crate only ever sees five operations:
//!
//! - `init_stack` writes the initial register image of a coroutine so that the
//!   first switch into it lands in `stack_init_trampoline`.
//! - `switch_and_link` saves the caller and transfers into a coroutine,
//!   recording the caller's stack pointer in the coroutine's parent link.
//! - `switch_yield` saves the coroutine and returns into whoever linked it.
//! - `switch_and_reset` leaves a coroutine for the last time.
//! - `drop_initial_obj` destroys the entry object of a coroutine that was
//!   never switched into.
//!
//! No allocation and no locking happens at this level.

use core::mem;

use crate::stack::StackPointer;

// ELF and Mach-O differ in symbol mangling and in the directives used to
// declare a function in `global_asm!`.
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_mangle {
            ($name:literal) => { concat!("_", $name) };
        }
    } else {
        macro_rules! asm_mangle {
            ($name:literal) => { $name };
        }
    }
}
cfg_if::cfg_if! {
    if #[cfg(target_vendor = "apple")] {
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".private_extern ", asm_mangle!($name), "\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        // Mach-O places every symbol in its own subsection unless it is
        // declared as an alternate entry of the enclosing function.
        macro_rules! asm_function_alt_entry {
            ($name:literal) => {
                concat!(
                    ".alt_entry ", asm_mangle!($name), "\n",
                    asm_function_begin!($name),
                )
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                ""
            };
        }
        // The Darwin unwinder will not walk through signal frames.
        macro_rules! cfi_signal_frame {
            () => { "" }
        }
    } else {
        macro_rules! asm_function_begin {
            ($name:literal) => {
                concat!(
                    ".globl ", asm_mangle!($name), "\n",
                    ".hidden ", asm_mangle!($name), "\n",
                    ".type ", asm_mangle!($name), ", @function\n",
                    asm_mangle!($name), ":\n",
                )
            };
        }
        macro_rules! asm_function_alt_entry {
            ($name:literal) => {
                asm_function_begin!($name)
            };
        }
        macro_rules! asm_function_end {
            ($name:literal) => {
                concat!(".size ", asm_mangle!($name), ", . - ", asm_mangle!($name), "\n")
            };
        }
        macro_rules! cfi_signal_frame {
            () => { ".cfi_signal_frame" }
        }
    }
}

// Signature of the function a coroutine starts in. It receives the value
// passed to the first `switch_and_link`, the parent link and the entry object
// written by `init_stack`. On x86_64 the SysV ABI is forced so the trampoline
// can hand over arguments in RDI, RSI and RDX on every OS.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type InitialFunc<T> = unsafe extern "sysv64" fn(
            arg: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut T,
        ) -> !;
        macro_rules! initial_func_abi {
            (unsafe fn $($tt:tt)*) => {
                unsafe extern "sysv64" fn $($tt)*
            };
        }
    } else {
        pub type InitialFunc<T> = unsafe extern "C" fn(
            arg: EncodedValue,
            parent_link: &mut StackPointer,
            obj: *mut T,
        ) -> !;
        macro_rules! initial_func_abi {
            (unsafe fn $($tt:tt)*) => {
                unsafe extern "C" fn $($tt)*
            };
        }
    }
}
pub(crate) use initial_func_abi;

/// A machine word handed across a switch in a register.
pub type EncodedValue = usize;

cfg_if::cfg_if! {
    if #[cfg(all(target_arch = "x86_64", not(windows)))] {
        mod x86_64;
        pub use self::x86_64::*;
    } else if #[cfg(all(target_arch = "aarch64", not(windows)))] {
        mod aarch64;
        pub use self::aarch64::*;
    } else {
        compile_error!("coroplus only supports x86_64 and aarch64 on non-Windows targets");
    }
}

/// Writes `obj` below `sp`, keeping `sp + sp_offset` aligned to
/// `STACK_ALIGNMENT` afterwards.
///
/// `sp_offset` is the number of bytes already pushed since the last aligned
/// address, which lets the padding computation fold away for small objects.
#[inline]
unsafe fn allocate_obj_on_stack<T>(sp: &mut usize, sp_offset: usize, obj: T) {
    // Large bodies are boxed before they get here.
    debug_assert!(
        mem::size_of::<T>() <= crate::stack::MIN_STACK_SIZE / 4,
        "coroutine entry object is too large"
    );

    if mem::align_of::<T>() > STACK_ALIGNMENT {
        *sp -= mem::size_of::<T>();
        *sp &= !(mem::align_of::<T>() - 1);
    } else {
        let total_size = sp_offset + mem::size_of::<T>();
        let align_offset = total_size % STACK_ALIGNMENT;
        if align_offset != 0 {
            *sp -= STACK_ALIGNMENT - align_offset;
        }
        *sp -= mem::size_of::<T>();
    }
    (*sp as *mut T).write(obj);

    debug_assert_eq!(*sp % STACK_ALIGNMENT, 0);
}

/// Pushes one machine word, or reserves an uninitialized slot for `None`.
#[inline]
unsafe fn push(sp: &mut usize, val: Option<StackWord>) {
    *sp -= mem::size_of::<StackWord>();
    if let Some(val) = val {
        *(*sp as *mut StackWord) = val;
    }
}
