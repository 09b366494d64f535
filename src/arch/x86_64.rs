//! x86_64 System V implementation of the context switch.
//!
//! ## Stack layout
//!
//! A suspended coroutine keeps its callee-saved state at the top of its own
//! stack, and its stack pointer is what `switch_and_link` is handed:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Entry func   |  <- Read once, by the first switch.
//! +--------------+
//! | Parent link  |  <- Stack pointer of whoever resumed us. Rewritten on
//! +--------------+     every resume.
//! |              |
//! ~     ...      ~
//! |              |
//! +--------------+
//! | Saved RBP    |
//! +--------------+
//! | Saved RBX    |
//! +--------------+
//! | Saved RIP    |  <- Saved stack pointer of the coroutine.
//! +--------------+
//! ```
//!
//! While a coroutine runs, the top of the resumer's stack holds its saved
//! RBX, RIP and RBP. RIP and RBP together form an ordinary frame record so
//! that frame-pointer walkers continue from the coroutine into the resumer:
//!
//! ```text
//! +-------------+
//! | Saved RBX   |
//! +-------------+
//! | Saved RIP   |
//! +-------------+
//! | Saved RBP   |
//! +-------------+  <- Parent link points here.
//! ```
//!
//! A fresh coroutine has no saved registers yet, only the entry object and a
//! return address into `stack_init_trampoline`:
//!
//! ```text
//! +--------------+  <- Stack base
//! | Entry func   |
//! +--------------+
//! | Parent link  |  <- Filled in by the first switch.
//! +--------------+
//! |              |
//! ~ Entry object ~  <- Rounded up to STACK_ALIGNMENT.
//! |              |
//! +--------------+
//! | Initial RIP  |  <- stack_init_trampoline
//! +--------------+  <- Initial stack pointer
//! ```

use core::arch::{asm, global_asm};

use super::{allocate_obj_on_stack, push, EncodedValue, InitialFunc};
use crate::stack::StackPointer;

pub const STACK_ALIGNMENT: usize = 16;
pub type StackWord = u64;

// The base frame of every coroutine. `init_stack` points the first resume at
// this code, which links the coroutine to its resumer and jumps to the entry
// function.
//
// The CFI below lets unwinders and debuggers step from the coroutine stack
// back into the stack of the resumer through the parent link.
global_asm!(
    ".balign 16",
    asm_function_begin!("coroplus_stack_init_trampoline"),
    ".cfi_startproc",
    // Marking the frame as a signal frame stops GDB from rejecting traces in
    // which the coroutine stack sits above the resumer's stack. The unwinder
    // then looks up unwind info for the instruction *after* a return address,
    // hence the trailing int3 below.
    cfi_signal_frame!(),
    // Registers on entry (from switch_and_link):
    // - RSP: top of the resumer's stack, return address already pushed.
    // - RBP: the resumer's frame pointer.
    // - RDX: our initial stack pointer.
    // - RSI: our stack base.
    // - RDI: the value passed to switch_and_link.
    "push rbp",
    // Record the resumer in the parent link.
    "mov [rsi - 16], rsp",
    // RSI becomes the parent link, the 2nd argument of the entry function.
    "sub rsi, 16",
    // Move onto the coroutine stack, skipping our own address.
    "lea rsp, [rdx + 8]",
    "mov rbp, rsi",
    // CFA = *(rbp) + 24:
    // 0x0f DW_CFA_def_cfa_expression, 5 bytes follow
    // 0x76 0x00 DW_OP_breg6 (rbp + 0)
    // 0x06 DW_OP_deref
    // 0x23 0x18 DW_OP_plus_uconst 24
    ".cfi_escape 0x0f, 5, 0x76, 0x00, 0x06, 0x23, 0x18",
    ".cfi_offset rbx, -8",
    ".cfi_offset rip, -16",
    ".cfi_offset rbp, -24",
    // 3rd argument: the entry object init_stack placed on the stack.
    "mov rdx, rsp",
    // Push a poisoned return address and jump instead of calling, so the
    // return predictor stays in sync with the RET in switch_yield.
    concat!(
        "lea rcx, [rip + ",
        asm_mangle!("coroplus_stack_init_trampoline_return"),
        "]"
    ),
    "push rcx",
    "jmp [rsi + 8]",
    // The entry function never returns. Landing here means it did, which
    // traps.
    asm_function_alt_entry!("coroplus_stack_init_trampoline_return"),
    "int3",
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

    // Read by the trampoline through the parent link.
    push(&mut sp, Some(func as StackWord));

    // Parent link, filled in by every switch_and_link.
    push(&mut sp, None);

    allocate_obj_on_stack(&mut sp, 16, obj);

    // Return address used by the first switch_and_link.
    push(&mut sp, Some(coroplus_stack_init_trampoline as StackWord));

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
        // RBX and RBP are reserved by LLVM so they can't be clobbers. RBX is
        // saved here, RBP by the code we return into.
        "push rbx",

        // Continue at the saved RIP of the coroutine: either
        // coroplus_stack_init_trampoline or label 0 of switch_yield.
        "call [rdx]",

        // Back on our stack. RSI holds the coroutine stack pointer (0 if it
        // finished) and RDI the value it passed.
        "pop rbx",

        inlateout("rdi") arg => ret_val,
        lateout("rsi") ret_sp,
        in("rsi") stack_base.get() as u64,
        in("rdx") sp.get() as u64,

        // All remaining callee-saved registers are clobbered so the compiler
        // saves only what it actually needs around the switch.
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    (ret_val, StackPointer::new(ret_sp))
}

/// Suspends the running coroutine and returns into its resumer, whose stack
/// pointer is read from `parent_link`. Returns the value passed by the next
/// `switch_and_link` into this coroutine.
// Always inlined: the RET below must pair with the CALL in switch_and_link
// for the return predictor.
#[inline(always)]
pub unsafe fn switch_yield(arg: EncodedValue, parent_link: *mut StackPointer) -> EncodedValue {
    let ret_val;

    asm!(
        "push rbp",
        "push rbx",

        // Where the next switch_and_link continues.
        "lea rax, [rip + 2f]",
        "push rax",

        // Our saved stack pointer goes out in RSI.
        "mov rsi, rsp",

        // Back to the resumer's stack.
        "mov rsp, [rdx]",
        "pop rbp",
        "ret",

        // Entered from switch_and_link:
        // - RSP: top of the resumer's stack.
        // - RBP: the resumer's frame pointer.
        // - RDX: our saved stack pointer, including the return address.
        // - RSI: our stack base.
        // - RDI: the value passed in.
        "2:",
        "push rbp",
        "mov [rsi - 16], rsp",
        "lea rsp, [rdx + 8]",
        "pop rbx",
        "pop rbp",

        inlateout("rdi") arg => ret_val,
        in("rdx") parent_link as u64,
        lateout("r12") _, lateout("r13") _, lateout("r14") _, lateout("r15") _,
        clobber_abi("sysv64"),
    );

    ret_val
}

/// Leaves a finished coroutine for good. The resumer sees a `None` stack
/// pointer. Nothing with a pending destructor may remain on the stack.
#[inline(always)]
pub unsafe fn switch_and_reset(arg: EncodedValue, parent_link: *mut StackPointer) -> ! {
    asm!(
        "mov rsp, [{parent_link}]",
        "pop rbp",
        "ret",
        parent_link = in(reg) parent_link as u64,
        in("rdi") arg,
        in("rsi") 0,
        options(noreturn),
    );
}

/// Drops the entry object of a coroutine that was never switched into.
#[inline]
pub unsafe fn drop_initial_obj(stack_ptr: StackPointer, drop_fn: unsafe fn(ptr: *mut u8)) {
    // Skip the return address pushed last by init_stack.
    let ptr = (stack_ptr.get() as *mut u8).add(8);
    drop_fn(ptr);
}

/// Offset below the stack base of the parent link slot.
pub const PARENT_LINK_OFFSET: usize = 16;

/// Current value of the stack pointer.
#[inline(always)]
pub fn current_stack_ptr() -> usize {
    let sp: usize;
    unsafe {
        asm!("mov {}, rsp", out(reg) sp, options(nomem, nostack, preserves_flags));
    }
    sp
}
