//! aarch64 context switch
//!
//! TODO: port the x86_64 switch (x19-x28, fp, lr, sp save/restore).

use super::SavedContext;

/// Prepare a fresh context for a new fiber
pub unsafe fn init_context(
    _regs: *mut SavedContext,
    _stack_top: *mut u8,
    _entry_fn: usize,
    _entry_arg: usize,
) {
    todo!("aarch64 init_context not yet implemented")
}

/// Save the current context and resume another
pub unsafe extern "C" fn switch_context(_save: *mut SavedContext, _load: *const SavedContext) {
    todo!("aarch64 switch_context not yet implemented")
}
