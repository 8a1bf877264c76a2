//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while bringing runtime components up or down
///
/// Contract violations (resuming a non-READY fiber, double-registering a
/// descriptor event) are not represented here; those panic with a
/// diagnostic instead of being reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Scheduler was already started
    AlreadyStarted,

    /// Scheduler was asked to start after stop
    Stopped,

    /// Failed to spawn an OS worker thread
    SpawnFailed,

    /// Stack mmap or guard-page mprotect failed (errno)
    StackAlloc(i32),

    /// Readiness poller creation failed (errno)
    PollerCreate(i32),

    /// Wake-pipe creation failed (errno)
    WakePipe(i32),

    /// Registering a descriptor with the poller failed (errno)
    PollerRegister { fd: i32, errno: i32 },

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::Stopped => write!(f, "scheduler is stopped"),
            RuntimeError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            RuntimeError::StackAlloc(e) => write!(f, "fiber stack allocation failed: errno {}", e),
            RuntimeError::PollerCreate(e) => write!(f, "poller creation failed: errno {}", e),
            RuntimeError::WakePipe(e) => write!(f, "wake pipe creation failed: errno {}", e),
            RuntimeError::PollerRegister { fd, errno } => {
                write!(f, "poller registration failed: fd {} errno {}", fd, errno)
            }
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Errors raised by `ByteArray` read operations
///
/// Writes grow the buffer and cannot fail; reads past the written range do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Fewer readable bytes than requested
    OutOfRange { requested: usize, available: usize },

    /// Cursor set beyond the buffer capacity
    PositionOutOfRange { position: usize, capacity: usize },

    /// A length-prefixed string did not decode as UTF-8
    InvalidUtf8,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::OutOfRange {
                requested,
                available,
            } => write!(
                f,
                "read of {} bytes exceeds readable range of {}",
                requested, available
            ),
            BufferError::PositionOutOfRange { position, capacity } => {
                write!(f, "position {} beyond capacity {}", position, capacity)
            }
            BufferError::InvalidUtf8 => write!(f, "string bytes are not valid UTF-8"),
        }
    }
}

impl std::error::Error for BufferError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::PollerRegister { fd: 7, errno: 9 };
        assert_eq!(format!("{}", e), "poller registration failed: fd 7 errno 9");

        let e = BufferError::OutOfRange {
            requested: 8,
            available: 3,
        };
        assert_eq!(format!("{}", e), "read of 8 bytes exceeds readable range of 3");
    }
}
