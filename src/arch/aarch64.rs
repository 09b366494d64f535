//! AArch64 implementation of the context switch.
//!
//! The protocol mirrors x86_64.rs; only the register assignment and the
//! frame shapes differ.
//!
//! Suspended coroutine:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Entry func   |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! ~     ...      ~
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Saved PC     |
//! +--------------+
//! | Saved X29    |
//! +--------------+
//! | Saved X19    |  <- Saved stack pointer of the coroutine.
//! +--------------+
//! ```
//!
//! Resumer while a coroutine runs:
//!
//! ```text
//! +-----------+
//! | Padding   |
//! +-----------+
//! | Saved X19 |
//! +-----------+
//! | Saved PC  |
//! +-----------+
//! | Saved X29 |
//! +-----------+  <- Parent link points here.
//! ```
//!
//! Fresh coroutine:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Entry func   |
//! +--------------+
//! | Parent link  |
//! +--------------+
//! ~ Entry object ~
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Initial PC   |
//! +--------------+
//! | Padding      |
//! +--------------+
//! | Padding      |
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, EncodedValue, InitialFunc};
use crate::stack::StackPointer;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

global_asm!(
    ".balign 4",
    asm_function_begin!("coroplus_stack_init_trampoline"),
    ".cfi_startproc",
    cfi_signal_frame!(),
    // Registers on entry (from switch_and_link):
    // - SP: top of the resumer's stack.
    // - LR: return address into the resumer.
    // - X19, X29: the resumer's values.
    // - X2: our initial stack pointer.
    // - X1: our stack base.
    // - X0: the value passed to switch_and_link.
    "stp x29, lr, [sp, #-32]!",
    "str x19, [sp, #16]",
    // Record the resumer in the parent link; X1 now points at it.
    "mov x3, sp",
    "str x3, [x1, #-16]!",
    // Move onto the coroutine stack, dropping the padding and initial PC.
    "add sp, x2, #32",
    "mov x29, x1",
    // CFA = *(x29) + 32:
    // 0x0f DW_CFA_def_cfa_expression, 5 bytes follow
    // 0x8d 0x00 DW_OP_breg29 (x29 + 0)
    // 0x06 DW_OP_deref
    // 0x23 0x20 DW_OP_plus_uconst 32
    ".cfi_escape 0x0f, 5, 0x8d, 0x00, 0x06, 0x23, 0x20",
    ".cfi_offset x19, -16",
    ".cfi_offset lr, -24",
    ".cfi_offset x29, -32",
    // 3rd argument: the entry object.
    "mov x2, sp",
    // Branch with a poisoned link register rather than BLR so the return
    // predictor stays in sync with the RET in switch_yield.
    "adr lr, 0f",
    "ldr x3, [x1, #8]",
    "br x3",
    // Mach-O can't relocate ADR against a global symbol, hence the local
    // label.
    "0:",
    asm_function_alt_entry!("coroplus_stack_init_trampoline_return"),
    // The entry function never returns. Landing here means it did, which
    // traps.
    "brk #0",
    ".cfi_endproc",
    asm_function_end!("coroplus_stack_init_trampoline"),
);

// Custom calling convention, only ever reached from inline assembly.
extern "C" {
    fn coroplus_stack_init_trampoline(
        arg: EncodedValue,
        stack_base: StackPointer,
        stack_ptr: StackPointer,
    );
}

/// Prepares a never-run coroutine so that the first `switch_and_link` into
/// the returned stack pointer calls `func(arg, parent_link, &mut obj)`.
#[inline]
pub unsafe fn init_stack<T>(stack_base: StackPointer, func: InitialFunc<T>, obj: T) -> StackPointer {
    let mut sp = stack_base.get();

    push(&mut sp, Some(func as StackWord));

    // Parent link.
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);

    // Keeps the final stack pointer aligned.
    push(&mut sp, None);

    push(&mut sp, Some(coroplus_stack_init_trampoline as StackWord));

    // switch_and_link looks for the target PC 16 bytes above the stack
    // pointer.
    push(&mut sp, None);
    push(&mut sp, None);

    StackPointer::new_unchecked(sp)
}

/// Switches into the coroutine whose saved stack pointer is `sp`.
///
/// Returns once the coroutine switches back, with the value it passed and its
/// new saved stack pointer, or `None` if it left through `switch_and_reset`.
#[inline]
pub unsafe fn switch_and_link(
    arg: EncodedValue,
    sp: StackPointer,
    stack_base: StackPointer,
) -> (EncodedValue, Option<StackPointer>) {
    let (ret_val, ret_sp);

    asm!(
        "ldr x3, [x2, #16]",
        "blr x3",

        // Back from the coroutine:
        // - X2: our stack pointer.
        // - X1: the coroutine stack pointer, or 0 if it finished.
        // - X0: the value it passed.
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        lateout("x1") ret_sp,
        in("x1") stack_base.get() as u64,
        in("x2") sp.get() as u64,

        // clobber_abi covers X18 when the platform doesn't reserve it.
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the running coroutine and returns into its resumer. Returns the
/// value passed by the next `switch_and_link` into this coroutine.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        // Save X19 and X29 and reserve the slot for our PC.
        "stp x19, x29, [sp, #-32]!",
        "adr lr, 0f",
        "str lr, [sp, #16]",

        // Resumer's stack pointer.
        "ldr x2, [x2]",

        // Our saved stack pointer goes out in X1.
        "mov x1, sp",

        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",
        "ret",

        // Entered from switch_and_link:
        // - SP: top of the resumer's stack.
        // - LR: return address into the resumer.
        // - X2: our saved stack pointer.
        // - X1: our stack base.
        // - X0: the value passed in.
        "0:",
        "stp x29, lr, [sp, #-32]!",
        "str x19, [sp, #16]",
        "mov x3, sp",
        "str x3, [x1, #-16]",
        "ldp x19, x29, [x2]",
        "add sp, x2, #32",

        inlateout("x0") arg => ret_val,
        in("x2") parent_link as u64,
        lateout("x20") _, lateout("x21") _, lateout("x22") _, lateout("x23") _,
        lateout("x24") _, lateout("x25") _, lateout("x26") _, lateout("x27") _,
        lateout("x28") _,
        clobber_abi("C"),
    );

    ret_val
}

/// Leaves a finished coroutine for good. The resumer sees a `None` stack
/// pointer. Nothing with a pending destructor may remain on the stack.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    asm!(
        "ldr x2, [{parent_link}]",
        "ldr x19, [x2, #16]",
        "ldp x29, lr, [x2]",
        "ret",
        parent_link = in(reg) parent_link as u64,
        in("x0") arg,
        in("x1") 0,
        options(noreturn),
    );
}

/// Drops the entry object of a coroutine that was never switched into.
#[inline]
pub unsafe fn drop_initial_obj(stack_ptr: StackPointer, drop_fn: unsafe fn(ptr: *mut u8)) {
    // Skip the two padding words, the initial PC and its alignment padding.
    let ptr = (stack_ptr.get() as *mut u8).add(32);
    drop_fn(ptr);
}

/// Offset below the stack base of the parent link slot.
pub const PARENT_LINK_OFFSET: usize = 16;

/// Current value of the stack pointer.
#[inline(always)]
pub fn current_stack_ptr() -> usize {
    let sp: usize;
    unsafe {
        asm!("mov {}, sp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
