//! Fiber state type

use core::fmt;

/// State of a fiber
///
/// The full transition set is `Ready -> Running` (resume),
/// `Running -> Ready` (yield) and `Running -> Term` (entry returned).
/// `Term` is terminal; a terminated fiber can only be revived through
/// `Fiber::reset`, which installs a new entry and moves it back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Runnable, waiting to be resumed
    Ready = 0,

    /// Currently executing on an OS thread
    Running = 1,

    /// Entry callable returned or panicked
    Term = 2,
}

impl FiberState {
    /// Check if the fiber may be resumed
    #[inline]
    pub const fn is_runnable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber has finished
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            _ => FiberState::Term,
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Ready => "READY",
            FiberState::Running => "RUNNING",
            FiberState::Term => "TERM",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        for s in [FiberState::Ready, FiberState::Running, FiberState::Term] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
    }

    #[test]
    fn test_state_predicates() {
        assert!(FiberState::Ready.is_runnable());
        assert!(!FiberState::Running.is_runnable());
        assert!(FiberState::Term.is_terminated());
        assert!(!FiberState::Ready.is_terminated());
    }
}
