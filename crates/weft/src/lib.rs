//! # weft
//!
//! Blocking-style networking over cooperative fibers.
//!
//! User tasks run on stackful fibers multiplexed over a fixed pool of OS
//! threads. Socket calls that would block suspend the calling fiber and
//! park the descriptor in an epoll set; kernel readiness (or a timeout)
//! resumes the fiber. Code keeps the shape of ordinary blocking I/O.
//!
//! ## Quick start
//!
//! ```no_run
//! use weft::{Address, IoManager, Socket, Task};
//!
//! let iom = IoManager::new(4, false, "app").unwrap();
//!
//! iom.schedule(Task::call(|| {
//!     let addr = Address::lookup_any("127.0.0.1:8080", libc::AF_INET, libc::SOCK_STREAM, 0)
//!         .unwrap();
//!     let sock = Socket::tcp_for(&addr);
//!     sock.connect(&addr).unwrap();
//!     sock.send(b"hello", 0).unwrap();
//!
//!     let mut buf = [0u8; 64];
//!     let n = sock.recv(&mut buf, 0).unwrap();   // suspends, never blocks
//!     println!("{} bytes back", n);
//! }));
//! ```

pub use weft_core::{
    env_get, env_get_bool, BufferError, ByteArray, Endian, EventSet, FiberState, RuntimeError,
    RuntimeResult,
};

pub use weft_runtime::config::{runtime_config, RuntimeConfig};
pub use weft_runtime::fd::{fd_manager, FdCtx, FdManager, TimeoutKind};
pub use weft_runtime::hook;
pub use weft_runtime::scheduler::{schedule, schedule_all, Schedule, Scheduler, Task, TaskItem};
pub use weft_runtime::{Fiber, IoManager, Thread, Timer, TimerManager};

pub use weft_net::{Address, Ipv4Address, Ipv6Address, Socket, UnixAddress};

/// Enqueue a callable on the I/O manager driving the calling thread
///
/// # Panics
/// Panics when the calling thread is not a runtime worker; schedule onto
/// an explicit handle from the outside instead.
pub fn spawn<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    let iom = IoManager::current().expect("spawn outside the runtime; use IoManager::schedule");
    iom.schedule(Task::call(f));
}

/// Cooperative sleep: suspends the calling fiber, not its thread
///
/// Outside the runtime this degrades to a plain blocking sleep.
pub fn sleep_ms(ms: u64) {
    if ms >= 1000 {
        hook::sleep((ms / 1000) as u32);
        let rest = ms % 1000;
        if rest > 0 {
            hook::usleep((rest * 1000) as u32);
        }
    } else {
        hook::usleep((ms * 1000) as u32);
    }
}
