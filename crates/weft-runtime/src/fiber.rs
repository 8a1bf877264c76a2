//! Stackful fibers
//!
//! A fiber is a user-space execution context: its own stack, its saved
//! callee-state, and an entry callable. Exactly one fiber runs per OS
//! thread at any instant; `resume` transfers control into a fiber and
//! `yield` transfers it back to the counterpart context.
//!
//! Every thread has an implicit *main fiber* that owns the OS stack. A
//! fiber constructed with `run_in_scheduler = true` yields to the thread's
//! scheduling fiber instead, so the worker loop picks the next task; one
//! constructed with `false` yields straight back to the main fiber and is
//! driven manually.
//!
//! A plain yield suspends the fiber without requeueing it; whoever holds a
//! handle (the I/O manager, a timer callback) is responsible for scheduling
//! it again. `yield_to_ready` instead asks the worker loop to requeue the
//! fiber after its context has been saved, which is what makes the yield
//! safe against another worker picking the fiber up mid-switch.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use log::error;

use weft_core::error::RuntimeResult;
use weft_core::state::FiberState;

use crate::arch::{self, SavedContext};
use crate::config::runtime_config;
use crate::stack::Stack;
use crate::tls;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

type Entry = Box<dyn FnOnce() + Send>;

/// A stackful cooperative execution context
pub struct Fiber {
    id: u64,
    state: AtomicU8,
    /// Yield returns to the scheduling fiber instead of the main fiber
    run_in_scheduler: bool,
    /// Ask the worker loop to requeue this fiber once its context is saved
    requeue_on_yield: AtomicBool,
    /// `None` for a thread's main fiber, which runs on the OS stack
    stack: Option<Stack>,
    ctx: UnsafeCell<SavedContext>,
    entry: UnsafeCell<Option<Entry>>,
}

// A fiber executes on one thread at a time; `ctx` and `entry` are only
// touched by the thread that currently owns it (resume/yield are the sole
// access points, and the scheduler hands a fiber to one worker at most).
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber with its own guarded stack
    ///
    /// `stack_size == 0` selects the configured default. With
    /// `run_in_scheduler` set, yields return to the thread's scheduling
    /// fiber so the worker loop can run the next task.
    pub fn new<F>(entry: F, stack_size: usize, run_in_scheduler: bool) -> RuntimeResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        let size = if stack_size == 0 {
            runtime_config().stack_size
        } else {
            stack_size
        };
        let stack = Stack::alloc(size)?;

        let fiber = Arc::new(Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Ready as u8),
            run_in_scheduler,
            requeue_on_yield: AtomicBool::new(false),
            stack: Some(stack),
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(Some(Box::new(entry))),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.ctx.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                0,
            );
        }
        Ok(fiber)
    }

    /// The implicit fiber for a thread's original stack
    fn new_main() -> Fiber {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(FiberState::Running as u8),
            run_in_scheduler: false,
            requeue_on_yield: AtomicBool::new(false),
            stack: None,
            ctx: UnsafeCell::new(SavedContext::zeroed()),
            entry: UnsafeCell::new(None),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True for a thread's main fiber
    #[inline]
    pub fn is_main(&self) -> bool {
        self.stack.is_none()
    }

    /// Count of live fibers in the process (main fibers included)
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// The fiber executing on the calling thread
    ///
    /// First use on a thread materialises its main fiber.
    pub fn current() -> Arc<Fiber> {
        if let Some(cur) = tls::current_fiber() {
            return cur;
        }
        Self::main_of_thread()
    }

    /// The fiber executing on the calling thread, if the thread has one
    pub fn try_current() -> Option<Arc<Fiber>> {
        tls::current_fiber()
    }

    /// This thread's main fiber, created on first use
    pub(crate) fn main_of_thread() -> Arc<Fiber> {
        if let Some(main) = tls::main_fiber() {
            return main;
        }
        let main = Arc::new(Fiber::new_main());
        tls::set_main_fiber(main.clone());
        if tls::current_fiber().is_none() {
            tls::set_current_fiber(main.clone());
        }
        main
    }

    /// Rearm a terminated fiber with a new entry, reusing its stack
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + Send + 'static,
    {
        assert!(
            self.stack.is_some(),
            "reset on a main fiber (id {})",
            self.id
        );
        assert_eq!(
            self.state(),
            FiberState::Term,
            "reset on fiber {} in state {}",
            self.id,
            self.state()
        );
        unsafe {
            *self.entry.get() = Some(Box::new(entry));
            arch::init_context(
                self.ctx.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                0,
            );
        }
        self.requeue_on_yield.store(false, Ordering::Relaxed);
        self.set_state(FiberState::Ready);
    }

    /// Transfer control into this fiber
    ///
    /// Must be called from the fiber's counterpart context: the thread's
    /// scheduling fiber for `run_in_scheduler` fibers, the thread's main
    /// fiber otherwise. Returns when the fiber yields or terminates.
    pub fn resume(self: &Arc<Self>) {
        assert_eq!(
            self.state(),
            FiberState::Ready,
            "resume on fiber {} in state {}",
            self.id,
            self.state()
        );
        let parent = self.counterpart();

        if parent.state() == FiberState::Running {
            parent.set_state(FiberState::Ready);
        }
        self.set_state(FiberState::Running);
        tls::set_current_fiber(self.clone());

        unsafe {
            arch::switch_context(parent.ctx.get(), self.ctx.get());
        }
        // Back in the parent: the fiber yielded or terminated. Its own
        // yield already restored the thread-locals and our RUNNING state.
    }

    /// Suspend the calling fiber, returning to its counterpart context
    ///
    /// The fiber transitions to READY but is *not* requeued; its next
    /// resume comes from whoever holds a handle.
    pub fn yield_now() {
        let cur = tls::current_fiber().expect("yield with no fiber running");
        assert_eq!(
            cur.state(),
            FiberState::Running,
            "yield on fiber {} in state {}",
            cur.id,
            cur.state()
        );
        cur.switch_out();
    }

    /// Suspend the calling fiber and have the worker loop requeue it
    ///
    /// The requeue happens after the context switch completes, so another
    /// worker can never resume the fiber before its state is saved.
    pub fn yield_to_ready() {
        let cur = tls::current_fiber().expect("yield with no fiber running");
        assert_eq!(
            cur.state(),
            FiberState::Running,
            "yield on fiber {} in state {}",
            cur.id,
            cur.state()
        );
        cur.requeue_on_yield.store(true, Ordering::Release);
        cur.switch_out();
    }

    /// Consume the requeue request, if any (worker loop only)
    pub(crate) fn take_requeue(&self) -> bool {
        self.requeue_on_yield.swap(false, Ordering::AcqRel)
    }

    fn counterpart(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            tls::scheduler_fiber().expect("no scheduling fiber on this thread")
        } else {
            Fiber::main_of_thread()
        }
    }

    /// Switch back to the counterpart context. Also the exit path for a
    /// terminated fiber, which is why TERM is left untouched here.
    fn switch_out(&self) {
        let counterpart = self.counterpart();

        if self.state() == FiberState::Running {
            self.set_state(FiberState::Ready);
        }
        counterpart.set_state(FiberState::Running);
        tls::set_current_fiber(counterpart.clone());

        unsafe {
            arch::switch_context(self.ctx.get(), counterpart.ctx.get());
        }
        // Resumed again.
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Every fiber starts here (staged by `init_context`).
///
/// Runs the entry callable, contains any panic, marks the fiber TERM and
/// switches away for good. The handle juggling at the end matters: this
/// stack frame never unwinds, so the local `Arc` must be dropped before
/// the final switch or the fiber would leak itself.
extern "C" fn fiber_main(_arg: usize) {
    let fiber = tls::current_fiber().expect("fiber entry with no current fiber");

    let entry = unsafe { (*fiber.entry.get()).take() };
    if let Some(f) = entry {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            let msg = payload
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("non-string panic payload");
            error!("fiber {} panicked: {}", fiber.id(), msg);
        }
    }

    fiber.set_state(FiberState::Term);

    let raw: *const Fiber = Arc::as_ptr(&fiber);
    drop(fiber);
    // The thread-local slot and the resuming caller still hold handles, so
    // the referent stays alive across this final switch.
    unsafe {
        (*raw).switch_out();
    }
    unreachable!("terminated fiber was resumed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_run_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let fiber = Fiber::new(
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
        .unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_and_resume() {
        let steps = Arc::new(AtomicUsize::new(0));
        let s = steps.clone();
        let fiber = Fiber::new(
            move || {
                s.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                s.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        fiber.reset(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_terminates_fiber() {
        let fiber = Fiber::new(
            || {
                panic!("boom");
            },
            0,
            false,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Fiber::new(|| {}, 0, false).unwrap();
        let b = Fiber::new(|| {}, 0, false).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_single_running_per_thread() {
        // While a fiber runs, the main fiber must not be RUNNING
        let fiber = Fiber::new(
            || {
                let main = tls::main_fiber().unwrap();
                assert_ne!(main.state(), FiberState::Running);
                assert_eq!(Fiber::current().state(), FiberState::Running);
            },
            0,
            false,
        )
        .unwrap();
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(Fiber::current().state(), FiberState::Running);
    }

    #[test]
    fn test_interleave_two_fibers() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let a = Fiber::new(
            move || {
                o1.lock().unwrap().push("a1");
                Fiber::yield_now();
                o1.lock().unwrap().push("a2");
            },
            0,
            false,
        )
        .unwrap();
        let b = Fiber::new(
            move || {
                o2.lock().unwrap().push("b1");
                Fiber::yield_now();
                o2.lock().unwrap().push("b2");
            },
            0,
            false,
        )
        .unwrap();

        a.resume();
        b.resume();
        a.resume();
        b.resume();
        assert_eq!(order.lock().unwrap().as_slice(), ["a1", "b1", "a2", "b2"]);
        assert_eq!(a.state(), FiberState::Term);
        assert_eq!(b.state(), FiberState::Term);
    }
}
