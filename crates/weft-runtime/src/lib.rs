//! # weft-runtime
//!
//! A cooperative M:N runtime: user tasks run on stackful fibers that are
//! multiplexed over a small pool of OS threads. Blocking-style socket code
//! keeps its shape; when a descriptor would block, the calling fiber is
//! suspended, the descriptor is parked in the epoll set, and the worker
//! thread moves on to the next task. Kernel readiness resumes the fiber.
//!
//! The pieces, bottom up:
//!
//! - [`fiber::Fiber`]: a stackful execution context with resume/yield
//! - [`thread::Thread`]: named OS thread with a startup handshake
//! - [`scheduler::Scheduler`] + [`scheduler::Schedule`]: the task queue and
//!   per-worker scheduling loop
//! - [`timer::TimerManager`]: ordered deadline set feeding the poll timeout
//! - [`io::IoManager`]: the scheduler whose idle loop is an epoll wait
//! - [`fd::FdManager`]: per-descriptor blocking-mode and timeout tracking
//! - [`hook`]: blocking-call lookalikes that suspend instead of blocking

pub mod arch;
pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod io;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;
pub mod tls;

pub use config::{runtime_config, RuntimeConfig};
pub use fd::{fd_manager, FdCtx, FdManager};
pub use fiber::Fiber;
pub use io::IoManager;
pub use scheduler::{Schedule, Scheduler, Task, TaskItem};
pub use thread::Thread;
pub use timer::{Timer, TimerManager};

pub use weft_core::{EventSet, FiberState, RuntimeError, RuntimeResult};
