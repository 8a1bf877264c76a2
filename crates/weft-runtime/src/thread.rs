//! Worker thread wrapper
//!
//! Thin layer over `std::thread` adding a kernel thread id, a runtime-wide
//! name, and a startup handshake: the constructor does not return until the
//! spawned thread is executing its callable. Task pinning keys off the
//! kernel tid, so a worker must have published its tid before anything can
//! be scheduled onto it.

use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::sync::Semaphore;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
    static THREAD_TID: RefCell<i32> = const { RefCell::new(-1) };
}

/// A named OS thread with a published kernel tid
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    tid: i32,
    name: String,
}

impl Thread {
    /// Spawn a thread running `callable`; returns once it is running
    pub fn new<F>(callable: F, name: &str) -> RuntimeResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = if name.is_empty() { "UNKNOWN" } else { name }.to_string();
        let started = Arc::new(Semaphore::new(0));
        let tid_slot = Arc::new(AtomicI32::new(-1));

        let thread_name = name.clone();
        let started2 = started.clone();
        let tid_slot2 = tid_slot.clone();

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                Thread::bind_current(&thread_name);
                tid_slot2.store(Thread::current_tid(), Ordering::Release);
                started2.post();
                callable();
            })
            .map_err(|e| {
                error!("thread spawn failed: name={} err={}", name, e);
                RuntimeError::SpawnFailed
            })?;

        started.wait();

        Ok(Thread {
            handle: Some(handle),
            tid: tid_slot.load(Ordering::Acquire),
            name,
        })
    }

    /// Kernel thread id of the wrapped thread
    #[inline]
    pub fn tid(&self) -> i32 {
        self.tid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread {} panicked", self.name);
            }
        }
    }

    /// Kernel thread id of the calling thread, cached per thread
    pub fn current_tid() -> i32 {
        THREAD_TID.with(|cell| {
            let mut tid = *cell.borrow();
            if tid < 0 {
                tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
                *cell.borrow_mut() = tid;
            }
            tid
        })
    }

    /// Runtime-visible name of the calling thread
    pub fn current_name() -> String {
        THREAD_NAME.with(|cell| cell.borrow().clone())
    }

    /// Rename the calling thread (thread-local and kernel-visible)
    pub fn set_name(name: &str) {
        if name.is_empty() {
            return;
        }
        Thread::bind_current(name);
    }

    fn bind_current(name: &str) {
        THREAD_NAME.with(|cell| *cell.borrow_mut() = name.to_string());
        // The kernel cap for comm names is 15 bytes + NUL
        let truncated: String = name.chars().take(15).collect();
        if let Ok(cname) = std::ffi::CString::new(truncated) {
            unsafe {
                libc::prctl(libc::PR_SET_NAME, cname.as_ptr() as libc::c_ulong, 0, 0, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_constructor_waits_for_startup() {
        let running = Arc::new(AtomicBool::new(false));
        let r = running.clone();
        let t = Thread::new(
            move || {
                r.store(true, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(20));
            },
            "startup-test",
        )
        .unwrap();
        // The handshake guarantees the thread is executing by the time
        // new() returns; give the first statement of the callable a bounded
        // window to become visible.
        let mut spins = 0;
        while !running.load(Ordering::SeqCst) {
            assert!(spins < 1000, "callable never observed running");
            std::thread::sleep(std::time::Duration::from_millis(1));
            spins += 1;
        }
        assert!(t.tid() > 0);
        assert_eq!(t.name(), "startup-test");
        t.join();
    }

    #[test]
    fn test_thread_local_name() {
        let t = Thread::new(
            || {
                assert_eq!(Thread::current_name(), "named");
            },
            "named",
        )
        .unwrap();
        t.join();
    }

    #[test]
    fn test_tid_is_stable() {
        assert_eq!(Thread::current_tid(), Thread::current_tid());
    }
}
