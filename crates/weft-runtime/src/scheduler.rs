//! M:N fiber scheduler
//!
//! A `Scheduler` owns a FIFO of tasks (fibers or plain callables, each
//! optionally pinned to one worker) and a pool of worker threads running
//! the scheduling loop. The loop body lives here; the two policy points a
//! subclass-alike wants to replace, waking an idle worker (`tickle`) and
//! what a worker does when the queue is empty (`idle`), are methods on the
//! [`Schedule`] trait with base implementations. The I/O manager overrides
//! both to plug the epoll wait into the idle slot.
//!
//! In use-caller mode the constructing thread counts as a worker: it gets a
//! dedicated root scheduling fiber whose entry is the worker loop, resumed
//! from `stop()` so the caller thread drains the queue before shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::state::FiberState;

use crate::fiber::Fiber;
use crate::hook;
use crate::thread::Thread;
use crate::tls;

/// What a task runs: an existing fiber, or a callable wrapped in one
pub enum TaskItem {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// A queue entry: the work plus an optional worker pin (kernel tid, -1 = any)
pub struct Task {
    item: TaskItem,
    thread: i32,
}

impl Task {
    pub fn new(item: TaskItem) -> Task {
        Task { item, thread: -1 }
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Task {
        Task {
            item: TaskItem::Fiber(fiber),
            thread: -1,
        }
    }

    pub fn call<F>(callable: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            item: TaskItem::Call(Box::new(callable)),
            thread: -1,
        }
    }

    /// Pin the task to the worker with the given kernel tid
    pub fn pinned(mut self, tid: i32) -> Task {
        self.thread = tid;
        self
    }
}

/// Scheduler state: queue, counters, worker handles
pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    /// Workers to spawn (excludes the caller thread in use-caller mode)
    thread_count: usize,
    active_count: AtomicUsize,
    idle_count: AtomicUsize,
    stop_requested: AtomicBool,
    use_caller: bool,
    /// Kernel tid of the caller thread in use-caller mode, -1 otherwise
    root_tid: AtomicI32,
    /// The caller thread's scheduling fiber in use-caller mode
    root_fiber: Mutex<Option<Arc<Fiber>>>,
}

impl Scheduler {
    /// `threads` counts every worker, the caller thread included when
    /// `use_caller` is set.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Scheduler {
        assert!(threads > 0, "scheduler needs at least one worker");
        let spawn_count = if use_caller { threads - 1 } else { threads };
        Scheduler {
            name: if name.is_empty() { "scheduler" } else { name }.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_count: spawn_count,
            active_count: AtomicUsize::new(0),
            idle_count: AtomicUsize::new(0),
            stop_requested: AtomicBool::new(false),
            use_caller,
            root_tid: AtomicI32::new(-1),
            root_fiber: Mutex::new(None),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn has_idle_workers(&self) -> bool {
        self.idle_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Total worker count, caller thread included
    #[inline]
    pub fn worker_count(&self) -> usize {
        self.thread_count + usize::from(self.use_caller)
    }

    /// Kernel tids of all workers, for use with [`Task::pinned`]
    pub fn worker_tids(&self) -> Vec<i32> {
        let mut tids: Vec<i32> = self.threads.lock().unwrap().iter().map(Thread::tid).collect();
        let root = self.root_tid.load(Ordering::Acquire);
        if root != -1 {
            tids.push(root);
        }
        tids
    }

    #[inline]
    pub(crate) fn idle_workers(&self) -> usize {
        self.idle_count.load(Ordering::Acquire)
    }

    /// Enqueue a task; true if the queue went empty to non-empty
    pub(crate) fn push_task(&self, task: Task) -> bool {
        let mut q = self.tasks.lock().unwrap();
        let was_empty = q.is_empty();
        q.push_back(task);
        was_empty
    }

    /// Stop requested, queue drained, and nothing running
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_count.load(Ordering::Acquire) == 0
    }

    // Sugar over the free functions for plain-scheduler users.

    pub fn start(self: &Arc<Self>) -> RuntimeResult<()> {
        let this: Arc<dyn Schedule> = self.clone();
        start(&this)
    }

    pub fn stop(self: &Arc<Self>) {
        let this: Arc<dyn Schedule> = self.clone();
        stop(&this);
    }

    pub fn schedule(self: &Arc<Self>, task: Task) {
        let this: Arc<dyn Schedule> = self.clone();
        schedule(&this, task);
    }
}

/// The overridable half of a scheduler
///
/// `Scheduler` itself implements this with the base behaviors; the I/O
/// manager re-implements `tickle`/`idle`/`stopping` around its poller.
pub trait Schedule: Send + Sync + 'static {
    /// The scheduler state this instance drives
    fn scheduler(&self) -> &Scheduler;

    /// Wake an idle worker. Base: nothing to wake with, just trace.
    fn tickle(&self) {
        trace!("{}: tickle", self.scheduler().name());
    }

    /// Run while the queue is empty. Base: spin-yield until stop.
    fn idle(&self) {
        trace!("{}: idle", self.scheduler().name());
        while !self.stopping() {
            Fiber::yield_now();
        }
    }

    /// Whether workers may shut down
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Publish any extra thread-local identity for this scheduler kind
    fn bind_thread(self: Arc<Self>) {}
}

impl Schedule for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

/// Enqueue one task, waking a worker if the queue was empty
pub fn schedule(this: &Arc<dyn Schedule>, task: Task) {
    if this.scheduler().push_task(task) {
        this.tickle();
    }
}

/// Enqueue a batch atomically, tickling at most once
pub fn schedule_all<I>(this: &Arc<dyn Schedule>, tasks: I)
where
    I: IntoIterator<Item = Task>,
{
    let need_tickle = {
        let sched = this.scheduler();
        let mut q = sched.tasks.lock().unwrap();
        let was_empty = q.is_empty();
        q.extend(tasks);
        was_empty && !q.is_empty()
    };
    if need_tickle {
        this.tickle();
    }
}

/// Spawn the worker pool (and arm the caller thread in use-caller mode)
pub fn start(this: &Arc<dyn Schedule>) -> RuntimeResult<()> {
    let sched = this.scheduler();
    debug!("{}: start", sched.name);

    if sched.stop_requested.load(Ordering::Acquire) {
        return Err(RuntimeError::Stopped);
    }

    let mut threads = sched.threads.lock().unwrap();
    if !threads.is_empty() {
        return Err(RuntimeError::AlreadyStarted);
    }

    if sched.use_caller {
        let mut root = sched.root_fiber.lock().unwrap();
        if root.is_none() {
            // The caller becomes a worker: its scheduling fiber is a fresh
            // fiber running the worker loop, resumed later from stop().
            Fiber::main_of_thread();
            let run_this = this.clone();
            let fiber = Fiber::new(move || run(run_this), 0, false)?;
            tls::set_current_scheduler(this.clone());
            this.clone().bind_thread();
            tls::set_scheduler_fiber(fiber.clone());
            sched.root_tid.store(Thread::current_tid(), Ordering::Release);
            Thread::set_name(&sched.name);
            *root = Some(fiber);
        }
    }

    for i in 0..sched.thread_count {
        let run_this = this.clone();
        let thread = Thread::new(move || run(run_this), &format!("{}_{}", sched.name, i))?;
        threads.push(thread);
    }
    Ok(())
}

/// Request shutdown, wake everyone, drain (use-caller), and join workers
pub fn stop(this: &Arc<dyn Schedule>) {
    let sched = this.scheduler();
    debug!("{}: stop", sched.name);
    if this.stopping() {
        return;
    }
    sched.stop_requested.store(true, Ordering::Release);

    if sched.use_caller {
        // Only the thread that started a use-caller scheduler may stop it;
        // its scheduling state lives in that thread's locals.
        let current = tls::current_scheduler();
        assert!(
            current.is_some_and(|c| Arc::ptr_eq(&c, this)),
            "{}: use-caller stop from a foreign thread",
            sched.name
        );
    }

    for _ in 0..sched.thread_count {
        this.tickle();
    }

    let root = sched.root_fiber.lock().unwrap().clone();
    if root.is_some() {
        this.tickle();
    }
    if let Some(root_fiber) = root {
        // Run the caller thread's share of the drain.
        root_fiber.resume();
        debug!("{}: root fiber returned", sched.name);
    }

    let threads = {
        let mut guard = sched.threads.lock().unwrap();
        std::mem::take(&mut *guard)
    };
    for t in threads {
        t.join();
    }
}

/// The per-worker scheduling loop
pub(crate) fn run(this: Arc<dyn Schedule>) {
    let sched = this.scheduler();
    debug!("{}: run on tid {}", sched.name, Thread::current_tid());

    hook::set_hook_enabled(true);
    tls::set_current_scheduler(this.clone());
    this.clone().bind_thread();

    // On a spawned worker the scheduling fiber is the thread's main fiber;
    // on the caller thread it is the root fiber, installed by start().
    if Thread::current_tid() != sched.root_tid.load(Ordering::Acquire) {
        tls::set_scheduler_fiber(Fiber::main_of_thread());
    }

    let idle_this = this.clone();
    let idle_fiber =
        Fiber::new(move || idle_this.idle(), 0, true).expect("idle fiber allocation failed");
    let mut cb_fiber: Option<Arc<Fiber>> = None;

    loop {
        let mut picked: Option<TaskItem> = None;
        let mut tickle_me = false;
        {
            let mut q = sched.tasks.lock().unwrap();
            let mut i = 0;
            while i < q.len() {
                let task = &q[i];
                // Pinned to a different worker: leave it, wake the others.
                if task.thread != -1 && task.thread != Thread::current_tid() {
                    tickle_me = true;
                    i += 1;
                    continue;
                }
                // A fiber can surface here while still RUNNING when its
                // wake was enqueued from another thread before it finished
                // switching out. Leave it for the next pass.
                if let TaskItem::Fiber(f) = &task.item {
                    if f.state() == FiberState::Running {
                        i += 1;
                        continue;
                    }
                }
                let task = q.remove(i).unwrap();
                sched.active_count.fetch_add(1, Ordering::AcqRel);
                picked = Some(task.item);
                break;
            }
            if picked.is_some() {
                tickle_me = tickle_me || !q.is_empty();
            }
        }

        if tickle_me {
            this.tickle();
        }

        match picked {
            Some(TaskItem::Fiber(fiber)) => {
                fiber.resume();
                sched.active_count.fetch_sub(1, Ordering::AcqRel);
                if fiber.state() == FiberState::Ready && fiber.take_requeue() {
                    // Requeue only now that the context switch is complete,
                    // so no other worker can resume a half-saved fiber.
                    schedule(&this, Task::fiber(fiber));
                }
            }
            Some(TaskItem::Call(cb)) => {
                let fiber = match cb_fiber.take() {
                    Some(f) => {
                        f.reset(cb);
                        f
                    }
                    None => Fiber::new(cb, 0, true).expect("task fiber allocation failed"),
                };
                fiber.resume();
                sched.active_count.fetch_sub(1, Ordering::AcqRel);
                match fiber.state() {
                    // Finished: keep the fiber around for the next callable.
                    FiberState::Term => cb_fiber = Some(fiber),
                    FiberState::Ready if fiber.take_requeue() => {
                        schedule(&this, Task::fiber(fiber));
                    }
                    // Suspended on I/O or a timer; the waiter holds the
                    // handle and will schedule it as a fiber task.
                    _ => {}
                }
            }
            None => {
                if idle_fiber.state() == FiberState::Term {
                    debug!("{}: idle fiber terminated", sched.name);
                    break;
                }
                sched.idle_count.fetch_add(1, Ordering::AcqRel);
                idle_fiber.resume();
                sched.idle_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    // Hand the shutdown wake on to any sibling still parked in idle.
    this.tickle();

    debug!("{}: run exit on tid {}", sched.name, Thread::current_tid());
    tls::clear_current_scheduler();
}

/// Scheduler driving the calling thread, if any
pub fn current() -> Option<Arc<dyn Schedule>> {
    tls::current_scheduler()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_callables_run_on_workers() {
        let sched = Arc::new(Scheduler::new(2, false, "test-sched"));
        sched.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let d = done.clone();
            sched.schedule(Task::call(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 32 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn test_fifo_order_single_worker() {
        let sched = Arc::new(Scheduler::new(1, false, "fifo"));
        sched.start().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let o = order.clone();
            sched.schedule(Task::call(move || {
                o.lock().unwrap().push(i);
            }));
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while order.lock().unwrap().len() < 16 {
            assert!(std::time::Instant::now() < deadline, "tasks did not drain");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        sched.stop();
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Arc::new(Scheduler::new(1, true, "caller"));
        sched.start().unwrap();

        // No spawned workers; nothing runs until stop() lends this thread.
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let d = done.clone();
            sched.schedule(Task::call(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(done.load(Ordering::SeqCst), 0);
        sched.stop();
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_scheduled_fiber_runs() {
        let sched = Arc::new(Scheduler::new(1, false, "fiber-task"));
        sched.start().unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let fiber = Fiber::new(
            move || {
                d.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_to_ready();
                d.fetch_add(1, Ordering::SeqCst);
            },
            0,
            true,
        )
        .unwrap();
        sched.schedule(Task::fiber(fiber));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 2 {
            assert!(std::time::Instant::now() < deadline, "fiber did not finish");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        sched.stop();
    }

    #[test]
    fn test_task_panic_does_not_kill_worker() {
        let sched = Arc::new(Scheduler::new(1, false, "panicky"));
        sched.start().unwrap();

        sched.schedule(Task::call(|| panic!("task blew up")));

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        sched.schedule(Task::call(move || {
            d.fetch_add(1, Ordering::SeqCst);
        }));

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while done.load(Ordering::SeqCst) < 1 {
            assert!(std::time::Instant::now() < deadline, "worker died with task");
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        sched.stop();
    }
}
