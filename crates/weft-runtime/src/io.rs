//! Epoll-driven scheduler
//!
//! `IoManager` is a [`Scheduler`] whose idle loop is an `epoll_wait`
//! bounded by the next timer deadline. Each registered descriptor carries
//! up to two armed handlers (READ, WRITE), each being either a suspended
//! fiber to resume or a callable to enqueue. When the kernel reports
//! readiness the matching handlers are scheduled and the descriptor is
//! rearmed with whatever events remain.
//!
//! Workers with nothing to poll still park in the kernel; a self-pipe
//! registered for READ lets `tickle` (and a timer insert that moves the
//! next deadline earlier) cut the wait short.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{debug, error, warn};

use weft_core::error::{RuntimeError, RuntimeResult};
use weft_core::event::EventSet;
use weft_core::state::FiberState;

use crate::config::runtime_config;
use crate::fiber::Fiber;
use crate::scheduler::{self, Schedule, Scheduler, Task, TaskItem};
use crate::timer::TimerManager;
use crate::tls;

/// What resumes when an event fires
enum Waiter {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// An armed handler plus the scheduler that will run it
struct EventHandler {
    scheduler: Weak<dyn Schedule>,
    waiter: Waiter,
}

struct FdEventsInner {
    /// Events currently armed in the poller for this fd
    registered: EventSet,
    read: Option<EventHandler>,
    write: Option<EventHandler>,
}

/// Per-descriptor registration state
struct FdEvents {
    fd: i32,
    inner: Mutex<FdEventsInner>,
}

impl FdEvents {
    fn new(fd: i32) -> FdEvents {
        FdEvents {
            fd,
            inner: Mutex::new(FdEventsInner {
                registered: EventSet::NONE,
                read: None,
                write: None,
            }),
        }
    }
}

/// A scheduler whose idle loop polls the kernel
pub struct IoManager {
    sched: Scheduler,
    timers: TimerManager,
    epfd: i32,
    wake_read: i32,
    wake_write: i32,
    /// Armed event handlers across all descriptors
    pending: AtomicUsize,
    slots: RwLock<Vec<Option<Arc<FdEvents>>>>,
}

impl IoManager {
    /// Create the poller, the wake pipe and the worker pool, and start it.
    ///
    /// `threads` counts every worker including the caller thread when
    /// `use_caller` is set, exactly as for [`Scheduler::new`].
    pub fn new(threads: usize, use_caller: bool, name: &str) -> RuntimeResult<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RuntimeError::PollerCreate(errno()));
        }

        let mut pipe_fds = [0i32; 2];
        if unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            let e = errno();
            unsafe { libc::close(epfd) };
            return Err(RuntimeError::WakePipe(e));
        }
        let [wake_read, wake_write] = pipe_fds;

        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: wake_read as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, wake_read, &mut ev) } != 0 {
            let e = errno();
            unsafe {
                libc::close(epfd);
                libc::close(wake_read);
                libc::close(wake_write);
            }
            return Err(RuntimeError::PollerRegister {
                fd: wake_read,
                errno: e,
            });
        }

        // A timer insert that becomes the new head must shorten a poll
        // already in flight; one byte down the pipe does that.
        let timers = TimerManager::with_notifier(Box::new(move || {
            let byte = [b'T'];
            unsafe {
                libc::write(wake_write, byte.as_ptr() as *const libc::c_void, 1);
            }
        }));

        let this = Arc::new(IoManager {
            sched: Scheduler::new(threads, use_caller, name),
            timers,
            epfd,
            wake_read,
            wake_write,
            pending: AtomicUsize::new(0),
            slots: RwLock::new(vec![None; 64]),
        });

        let as_dyn: Arc<dyn Schedule> = this.clone();
        scheduler::start(&as_dyn)?;
        Ok(this)
    }

    /// The I/O manager driving the calling thread, if any
    pub fn current() -> Option<Arc<IoManager>> {
        tls::current_io()
    }

    /// The deadline set feeding this manager's poll timeout
    #[inline]
    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// Count of armed event handlers
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn schedule(self: &Arc<Self>, task: Task) {
        let as_dyn: Arc<dyn Schedule> = self.clone();
        scheduler::schedule(&as_dyn, task);
    }

    pub fn stop(self: &Arc<Self>) {
        let as_dyn: Arc<dyn Schedule> = self.clone();
        scheduler::stop(&as_dyn);
    }

    /// Arm a handler for `event` on `fd`
    ///
    /// With `callback = None` the current fiber is captured as the waiter
    /// and will be rescheduled when the event fires. Arming an event that
    /// is already armed is a caller bug and panics.
    pub fn add_event(
        self: &Arc<Self>,
        fd: i32,
        event: EventSet,
        callback: Option<Box<dyn FnOnce() + Send>>,
    ) -> RuntimeResult<()> {
        assert!(
            event == EventSet::READ || event == EventSet::WRITE,
            "add_event takes exactly one of READ or WRITE"
        );
        let ctx = self.fd_events(fd);
        let mut inner = ctx.inner.lock().unwrap();

        assert!(
            !inner.registered.contains(event),
            "fd {} already has {} armed",
            fd,
            event
        );

        let op = if inner.registered.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (inner.registered | event).bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            let e = errno();
            error!("epoll_ctl arm failed: fd={} event={} errno={}", fd, event, e);
            return Err(RuntimeError::PollerRegister { fd, errno: e });
        }

        self.pending.fetch_add(1, Ordering::AcqRel);
        inner.registered |= event;

        let sched: Weak<dyn Schedule> = match tls::current_scheduler() {
            Some(cur) => Arc::downgrade(&cur),
            None => {
                let as_dyn: Arc<dyn Schedule> = self.clone();
                Arc::downgrade(&as_dyn)
            }
        };
        let waiter = match callback {
            Some(cb) => Waiter::Call(cb),
            None => {
                let cur = Fiber::current();
                assert_eq!(
                    cur.state(),
                    FiberState::Running,
                    "fiber waiter must be the running fiber"
                );
                Waiter::Fiber(cur)
            }
        };
        let handler = EventHandler {
            scheduler: sched,
            waiter,
        };
        match event {
            EventSet::READ => inner.read = Some(handler),
            _ => inner.write = Some(handler),
        }
        Ok(())
    }

    /// Disarm a handler without running it
    pub fn del_event(self: &Arc<Self>, fd: i32, event: EventSet) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.registered.contains(event) {
            return false;
        }

        let left = inner.registered & !event;
        if !self.rearm(fd, left) {
            return false;
        }
        inner.registered = left;
        let slot = match event {
            EventSet::READ => &mut inner.read,
            _ => &mut inner.write,
        };
        if slot.take().is_some() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
        true
    }

    /// Disarm a handler and run it as if the event had fired
    pub fn cancel_event(self: &Arc<Self>, fd: i32, event: EventSet) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.registered.contains(event) {
            return false;
        }

        let left = inner.registered & !event;
        if !self.rearm(fd, left) {
            return false;
        }
        self.trigger(&mut inner, event);
        true
    }

    /// Cancel both READ and WRITE on a descriptor
    pub fn cancel_all(self: &Arc<Self>, fd: i32) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.registered.is_empty() {
            return false;
        }

        if !self.rearm(fd, EventSet::NONE) {
            return false;
        }
        if inner.registered.contains(EventSet::READ) {
            self.trigger(&mut inner, EventSet::READ);
        }
        if inner.registered.contains(EventSet::WRITE) {
            self.trigger(&mut inner, EventSet::WRITE);
        }
        debug_assert!(inner.registered.is_empty());
        true
    }

    /// Update the poller registration for `fd` to exactly `events`
    fn rearm(&self, fd: i32, events: EventSet) -> bool {
        let op = if events.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | events.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) } != 0 {
            error!(
                "epoll_ctl rearm failed: fd={} events={} errno={}",
                fd,
                events,
                errno()
            );
            return false;
        }
        true
    }

    /// Detach one handler and schedule it; the registered bit goes with it
    fn trigger(&self, inner: &mut FdEventsInner, event: EventSet) {
        let slot = match event {
            EventSet::READ => &mut inner.read,
            _ => &mut inner.write,
        };
        let Some(handler) = slot.take() else {
            return;
        };
        inner.registered.remove(event);
        self.pending.fetch_sub(1, Ordering::AcqRel);

        let Some(sched) = handler.scheduler.upgrade() else {
            warn!("event handler outlived its scheduler; dropping waiter");
            return;
        };
        let item = match handler.waiter {
            Waiter::Fiber(f) => TaskItem::Fiber(f),
            Waiter::Call(cb) => TaskItem::Call(cb),
        };
        scheduler::schedule(&sched, Task::new(item));
    }

    /// Registration slot for `fd`, created on demand
    fn fd_events(&self, fd: i32) -> Arc<FdEvents> {
        assert!(fd >= 0, "invalid descriptor {}", fd);
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut slots = self.slots.write().unwrap();
        if fd as usize >= slots.len() {
            slots.resize((fd as usize + 1).next_power_of_two(), None);
        }
        if let Some(ctx) = &slots[fd as usize] {
            return ctx.clone();
        }
        let ctx = Arc::new(FdEvents::new(fd));
        slots[fd as usize] = Some(ctx.clone());
        ctx
    }

    fn lookup(&self, fd: i32) -> Option<Arc<FdEvents>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).cloned().flatten()
    }

    /// Shutdown test shared by `stopping` and the idle loop
    fn quiescent(&self, next_timer_ms: u64) -> bool {
        next_timer_ms == u64::MAX
            && self.pending.load(Ordering::Acquire) == 0
            && self.sched.base_stopping()
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake_read,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Schedule for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Wake one parked worker by writing the pipe; pointless when nobody
    /// is parked in the poller.
    fn tickle(&self) {
        if !self.sched.has_idle_workers() {
            return;
        }
        let byte = [b'T'];
        unsafe {
            libc::write(self.wake_write, byte.as_ptr() as *const libc::c_void, 1);
        }
    }

    fn stopping(&self) -> bool {
        self.quiescent(self.timers.next_timer_ms())
    }

    /// The poll loop each worker parks in while the task queue is empty
    fn idle(&self) {
        debug!("{}: idle enter", self.sched.name());
        let cfg = runtime_config();
        let batch = cfg.poll_batch;
        let mut events: Vec<libc::epoll_event> = vec![unsafe { std::mem::zeroed() }; batch];
        let mut expired = Vec::new();

        loop {
            let next_timer = self.timers.next_timer_ms();
            if self.quiescent(next_timer) {
                debug!("{}: idle exit", self.sched.name());
                break;
            }

            let timeout = next_timer.min(cfg.max_poll_timeout_ms) as i32;
            let n = loop {
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), batch as i32, timeout)
                };
                if rc < 0 && errno() == libc::EINTR {
                    continue;
                }
                break rc;
            };
            if n < 0 {
                error!("{}: epoll_wait failed: errno={}", self.sched.name(), errno());
                Fiber::yield_now();
                continue;
            }

            // Deadlines first, then readiness, in poller order; the FIFO
            // queue preserves this for the workers.
            expired.clear();
            self.timers.expired_callbacks(&mut expired);
            if !expired.is_empty() {
                let this: Arc<dyn Schedule> =
                    tls::current_scheduler().expect("idle loop without scheduler binding");
                scheduler::schedule_all(
                    &this,
                    expired
                        .drain(..)
                        .map(|cb| Task::call(move || cb())),
                );
            }

            for ev in &events[..n as usize] {
                let fd = ev.u64 as i32;
                if fd == self.wake_read {
                    self.drain_wake_pipe();
                    continue;
                }

                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock().unwrap();

                let mut real = EventSet::from_bits_truncate(ev.events);
                // An error or hangup must release every waiter on the fd,
                // whichever direction it was armed for.
                if ev.events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    real |= EventSet::BOTH & inner.registered;
                }
                if (real & inner.registered).is_empty() {
                    continue;
                }

                let left = inner.registered & !real;
                if !self.rearm(ctx.fd, left) {
                    continue;
                }
                if real.contains(EventSet::READ) {
                    self.trigger(&mut inner, EventSet::READ);
                }
                if real.contains(EventSet::WRITE) {
                    self.trigger(&mut inner, EventSet::WRITE);
                }
            }

            // Let the worker loop run whatever was just scheduled.
            Fiber::yield_now();
        }
    }

    fn bind_thread(self: Arc<Self>) {
        tls::set_current_io(self);
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
    }
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn pipe_pair() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn wait_for(cond: impl Fn() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_read_event_fires_on_data() {
        let iom = IoManager::new(1, false, "io-read").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            EventSet::READ,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert_eq!(iom.pending_events(), 1);

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        wait_for(|| hits.load(Ordering::SeqCst) == 1, "read handler");
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_cancel_event_runs_handler() {
        let iom = IoManager::new(1, false, "io-cancel").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            EventSet::READ,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        assert!(iom.cancel_event(r, EventSet::READ));
        wait_for(|| hits.load(Ordering::SeqCst) == 1, "cancelled handler");
        assert_eq!(iom.pending_events(), 0);

        // Nothing left to cancel.
        assert!(!iom.cancel_event(r, EventSet::READ));

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_del_event_discards_handler() {
        let iom = IoManager::new(1, false, "io-del").unwrap();
        let (r, w) = pipe_pair();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        iom.add_event(
            r,
            EventSet::READ,
            Some(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        assert!(iom.del_event(r, EventSet::READ));
        assert_eq!(iom.pending_events(), 0);

        // Data arriving later must not fire the deleted handler.
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_pending_counts_both_directions() {
        let iom = IoManager::new(1, false, "io-pending").unwrap();
        let (r, w) = pipe_pair();

        iom.add_event(r, EventSet::READ, Some(Box::new(|| {}))).unwrap();
        // A pipe write end starts out writable; arming it for READ keeps
        // the handler parked so the counter stays observable.
        iom.add_event(w, EventSet::READ, Some(Box::new(|| {}))).unwrap();
        assert_eq!(iom.pending_events(), 2);

        assert!(iom.cancel_all(r));
        assert_eq!(iom.pending_events(), 1);
        assert!(iom.del_event(w, EventSet::READ));
        assert_eq!(iom.pending_events(), 0);

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_timer_fires_through_idle_loop() {
        let iom = IoManager::new(1, false, "io-timer").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let start = Instant::now();
        iom.timers().add_timer(
            30,
            move || {
                h.fetch_add(1, Ordering::SeqCst);
            },
            false,
        );

        wait_for(|| hits.load(Ordering::SeqCst) == 1, "timer callback");
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);

        iom.stop();
    }

    #[test]
    fn test_fiber_waiter_resumes_on_readiness() {
        let iom = IoManager::new(2, false, "io-fiber").unwrap();
        let (r, w) = pipe_pair();

        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        iom.schedule(Task::call(move || {
            // Park this fiber on READ, then prove we got resumed.
            let iom = IoManager::current().expect("worker must expose its io manager");
            iom.add_event(r, EventSet::READ, None).unwrap();
            Fiber::yield_now();
            d.fetch_add(1, Ordering::SeqCst);
        }));

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(Ordering::SeqCst), 0, "must stay parked");

        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
        wait_for(|| done.load(Ordering::SeqCst) == 1, "parked fiber resume");

        iom.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }
}
