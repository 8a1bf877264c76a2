//! x86_64 context switch
//!
//! Naked-function inline assembly, stable since Rust 1.88.

use std::arch::naked_asm;

use super::SavedContext;

/// Prepare a fresh context so that switching to it enters the trampoline
/// with `entry_fn(entry_arg)` staged in callee-saved registers.
///
/// # Safety
///
/// `regs` must point to writable `SavedContext` memory and `stack_top`
/// must be the high end of a valid, live stack mapping.
pub unsafe fn init_context(
    regs: *mut SavedContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    // 16-byte alignment per the System V AMD64 ABI. The trampoline's `call`
    // then leaves the entry function with the standard post-call alignment.
    let aligned_sp = (stack_top as usize) & !0xF;

    let regs = &mut *regs;
    regs.sp = aligned_sp as u64;
    regs.ip = fiber_trampoline as usize as u64;
    regs.rbx = 0;
    regs.rbp = 0;
    regs.r12 = entry_fn as u64;
    regs.r13 = entry_arg as u64;
    regs.r14 = 0;
    regs.r15 = 0;
}

/// First code a new fiber runs: call the entry with its argument.
///
/// The entry function never returns (it switches away for good when the
/// fiber terminates); the trap instruction documents that.
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current context into `save` and resume `load`.
///
/// Control returns here (with the stack of `save`) the next time somebody
/// switches back to `save`.
///
/// # Safety
///
/// Both pointers must reference valid `SavedContext` memory; `load` must
/// hold either a context captured by a previous switch or one prepared by
/// `init_context`.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    naked_asm!(
        // Save callee-saved state into `save` (RDI)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load state from `load` (RSI)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        // Enter the loaded context
        "jmp rax",
        // Resume point for the saved context
        "1:",
        "ret",
    );
}
