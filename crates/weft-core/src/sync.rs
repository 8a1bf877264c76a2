//! OS-level synchronization helpers
//!
//! These block the calling OS thread; they are for runtime-internal startup
//! handshakes, not for use inside fibers.

use std::sync::{Condvar, Mutex};

/// A counting semaphore over `Mutex` + `Condvar`
///
/// Used by the thread wrapper to hold the constructor until the spawned
/// thread is actually running its callable.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Block the calling OS thread until a permit is available
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Release one permit, waking one waiter
    pub fn post(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new(0);
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_cross_thread_handshake() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();
        let handle = std::thread::spawn(move || {
            sem2.post();
        });
        sem.wait();
        handle.join().unwrap();
    }
}
