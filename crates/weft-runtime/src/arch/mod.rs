//! Architecture-specific context switching
//!
//! A fiber switch only has to preserve what the ABI says survives a call:
//! the callee-saved registers, the stack pointer, and a resume address.
//! Everything else is dead across the switch because switches only happen
//! at function-call boundaries.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
#[cfg(target_arch = "x86_64")]
pub use x86_64::{init_context, switch_context};

#[cfg(target_arch = "aarch64")]
pub mod aarch64;
#[cfg(target_arch = "aarch64")]
pub use aarch64::{init_context, switch_context};

/// Callee-saved machine state for a suspended fiber
///
/// Field layout is load-bearing: the switch assembly addresses the struct
/// by fixed byte offsets (sp at +0x00, ip at +0x08, then the callee-saved
/// registers in declaration order).
#[repr(C)]
#[derive(Debug)]
pub struct SavedContext {
    pub sp: u64,
    pub ip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SavedContext {
    pub const fn zeroed() -> Self {
        Self {
            sp: 0,
            ip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}
