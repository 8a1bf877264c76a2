//! Per-thread runtime state
//!
//! Every OS thread participating in the runtime tracks: the fiber it is
//! executing right now, its implicit main fiber (the one that owns the OS
//! stack), its scheduling fiber, and the scheduler it works for. All
//! accessors clone out of the slot immediately; no borrow is ever held
//! across a context switch.

use std::cell::RefCell;
use std::sync::Arc;

use crate::fiber::Fiber;
use crate::io::IoManager;
use crate::scheduler::Schedule;

thread_local! {
    /// Fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's main fiber (owns the OS stack)
    static MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's scheduling fiber: the context running the worker loop
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread currently works for
    static CURRENT_SCHEDULER: RefCell<Option<Arc<dyn Schedule>>> = const { RefCell::new(None) };

    /// Same scheduler, downcast to the I/O manager when it is one
    static CURRENT_IO: RefCell<Option<Arc<IoManager>>> = const { RefCell::new(None) };
}

#[inline]
pub fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_fiber(fiber: Arc<Fiber>) {
    CURRENT_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn main_fiber() -> Option<Arc<Fiber>> {
    MAIN_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_main_fiber(fiber: Arc<Fiber>) {
    MAIN_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_scheduler_fiber(fiber: Arc<Fiber>) {
    SCHEDULER_FIBER.with(|cell| *cell.borrow_mut() = Some(fiber));
}

#[inline]
pub fn current_scheduler() -> Option<Arc<dyn Schedule>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_scheduler(sched: Arc<dyn Schedule>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = Some(sched));
}

#[inline]
pub fn clear_current_scheduler() {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = None);
    CURRENT_IO.with(|cell| *cell.borrow_mut() = None);
}

#[inline]
pub fn current_io() -> Option<Arc<IoManager>> {
    CURRENT_IO.with(|cell| cell.borrow().clone())
}

#[inline]
pub fn set_current_io(io: Arc<IoManager>) {
    CURRENT_IO.with(|cell| *cell.borrow_mut() = Some(io));
}
