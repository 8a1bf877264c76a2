//! Hooked blocking primitives
//!
//! Libc-parity wrappers around the blocking syscalls. With hooking off
//! (the default for any thread not owned by a scheduler) every wrapper
//! calls straight through. With hooking on, a call that would block
//! instead arms a readiness event for the calling fiber, optionally arms a
//! watchdog timer for the descriptor's configured timeout, and yields; the
//! syscall is retried once the kernel reports readiness.
//!
//! Return conventions match libc exactly: -1 with `errno` set on failure,
//! `ETIMEDOUT` when the watchdog won the race.

use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use libc::{c_int, c_uint, c_ulong, c_void, size_t, socklen_t, ssize_t};
use log::error;

use weft_core::event::EventSet;

use crate::config::runtime_config;
use crate::fd::{fd_manager, TimeoutKind};
use crate::fiber::Fiber;
use crate::io::IoManager;
use crate::scheduler::Task;

thread_local! {
    /// Hooking switch; the scheduler flips this on when a worker enters
    /// its run loop
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

#[inline]
pub fn hook_enabled() -> bool {
    HOOK_ENABLED.with(|cell| cell.get())
}

#[inline]
pub fn set_hook_enabled(on: bool) {
    HOOK_ENABLED.with(|cell| cell.set(on));
}

#[inline]
fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(e: i32) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Cancellation marker shared between a waiting fiber and its watchdog
/// timer; doubles as the liveness condition for that timer.
#[derive(Default)]
struct TimerInfo {
    cancelled: AtomicI32,
}

/// The blocking-to-suspension transform shared by all data-path hooks.
///
/// Retries `f` through EINTR; on EAGAIN arms `event` for the current
/// fiber (plus the watchdog if the fd has a finite timeout), yields, and
/// loops back to retry. A fired watchdog cancels the event registration
/// and stamps `ETIMEDOUT` into the shared marker.
fn do_io<F>(fd: c_int, name: &str, event: EventSet, timeout_kind: TimeoutKind, mut f: F) -> ssize_t
where
    F: FnMut() -> ssize_t,
{
    if !hook_enabled() {
        return f();
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        return f();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return f();
    }

    let timeout_ms = ctx.timeout_ms(timeout_kind);
    let tinfo = Arc::new(TimerInfo::default());

    loop {
        let mut n = f();
        while n == -1 && errno() == libc::EINTR {
            n = f();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        let iom = IoManager::current().expect("hooked call outside an io manager worker");

        let timer = if timeout_ms != u64::MAX {
            let winfo = Arc::downgrade(&tinfo);
            let iom_timer = iom.clone();
            let tinfo_dyn: Arc<dyn std::any::Any + Send + Sync> = tinfo.clone();
            let cond: Weak<dyn std::any::Any + Send + Sync> = Arc::downgrade(&tinfo_dyn);
            Some(iom.timers().add_condition_timer(
                timeout_ms,
                move || {
                    let Some(t) = winfo.upgrade() else {
                        return;
                    };
                    if t.cancelled.load(Ordering::Acquire) != 0 {
                        return;
                    }
                    t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                    iom_timer.cancel_event(fd, event);
                },
                cond,
                false,
            ))
        } else {
            None
        };

        match iom.add_event(fd, event, None) {
            Err(e) => {
                error!("{}: failed to arm {} on fd {}: {}", name, event, fd, e);
                if let Some(t) = &timer {
                    t.cancel();
                }
                return -1;
            }
            Ok(()) => {
                Fiber::yield_now();
                if let Some(t) = &timer {
                    t.cancel();
                }
                let cancelled = tinfo.cancelled.load(Ordering::Acquire);
                if cancelled != 0 {
                    set_errno(cancelled);
                    return -1;
                }
                // Readiness reported (or the registration was cancelled);
                // go round and retry the call.
            }
        }
    }
}

// ── Sleeps ────────────────────────────────────────────────────────────

/// Park the current fiber on a one-shot timer
fn do_sleep(ms: u64) {
    let iom = IoManager::current().expect("hooked sleep outside an io manager worker");
    let fiber = Fiber::current();
    let iom_timer = iom.clone();
    iom.timers().add_timer(
        ms,
        move || {
            iom_timer.schedule(Task::fiber(fiber.clone()));
        },
        false,
    );
    Fiber::yield_now();
}

pub fn sleep(seconds: c_uint) -> c_uint {
    if !hook_enabled() {
        return unsafe { libc::sleep(seconds) };
    }
    do_sleep(seconds as u64 * 1000);
    0
}

pub fn usleep(usec: c_uint) -> c_int {
    if !hook_enabled() {
        return unsafe { libc::usleep(usec) };
    }
    do_sleep(usec as u64 / 1000);
    0
}

/// # Safety
/// `req` must point to a valid timespec; `rem` may be null.
pub unsafe fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> c_int {
    if !hook_enabled() {
        return libc::nanosleep(req, rem);
    }
    let ms = (*req).tv_sec as u64 * 1000 + (*req).tv_nsec as u64 / 1_000_000;
    do_sleep(ms);
    0
}

// ── Socket lifecycle ──────────────────────────────────────────────────

pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && hook_enabled() {
        // Seeds the context, which also forces kernel-level O_NONBLOCK
        fd_manager().get(fd, true);
    }
    fd
}

/// # Safety
/// `addr` must point to `addrlen` valid bytes of socket address.
pub unsafe fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !hook_enabled() {
        return libc::connect(fd, addr, addrlen);
    }
    let Some(ctx) = fd_manager().get(fd, false) else {
        set_errno(libc::EBADF);
        return -1;
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return libc::connect(fd, addr, addrlen);
    }

    let n = libc::connect(fd, addr, addrlen);
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n as c_int;
    }

    // Non-blocking connect in flight: wait for writability.
    let iom = IoManager::current().expect("hooked connect outside an io manager worker");
    let tinfo = Arc::new(TimerInfo::default());

    let timer = if timeout_ms != u64::MAX {
        let winfo = Arc::downgrade(&tinfo);
        let iom_timer = iom.clone();
        let tinfo_dyn: Arc<dyn std::any::Any + Send + Sync> = tinfo.clone();
        let cond: Weak<dyn std::any::Any + Send + Sync> = Arc::downgrade(&tinfo_dyn);
        Some(iom.timers().add_condition_timer(
            timeout_ms,
            move || {
                let Some(t) = winfo.upgrade() else {
                    return;
                };
                if t.cancelled.load(Ordering::Acquire) != 0 {
                    return;
                }
                t.cancelled.store(libc::ETIMEDOUT, Ordering::Release);
                iom_timer.cancel_event(fd, EventSet::WRITE);
            },
            cond,
            false,
        ))
    } else {
        None
    };

    match iom.add_event(fd, EventSet::WRITE, None) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = tinfo.cancelled.load(Ordering::Acquire);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            error!("connect: failed to arm WRITE on fd {}: {}", fd, e);
            return -1;
        }
    }

    // The handshake finished one way or the other; ask the kernel how.
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    if libc::getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut err as *mut c_int as *mut c_void,
        &mut len,
    ) == -1
    {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// # Safety
/// As for [`connect_with_timeout`].
pub unsafe fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    connect_with_timeout(fd, addr, addrlen, runtime_config().connect_timeout_ms)
}

/// # Safety
/// `addr`/`addrlen` follow the accept(2) contract; both may be null.
pub unsafe fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", EventSet::READ, TimeoutKind::Recv, || {
        libc::accept(fd, addr, addrlen) as ssize_t
    }) as c_int;
    if n >= 0 && hook_enabled() {
        fd_manager().get(n, true);
    }
    n
}

pub fn close(fd: c_int) -> c_int {
    if hook_enabled() && fd_manager().get(fd, false).is_some() {
        // Release any parked waiters before the descriptor goes away.
        if let Some(iom) = IoManager::current() {
            iom.cancel_all(fd);
        }
        fd_manager().del(fd);
    }
    unsafe { libc::close(fd) }
}

// ── Reads ─────────────────────────────────────────────────────────────

/// # Safety
/// `buf` must be valid for `count` bytes of writes.
pub unsafe fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    do_io(fd, "read", EventSet::READ, TimeoutKind::Recv, || {
        libc::read(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn readv(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "readv", EventSet::READ, TimeoutKind::Recv, || {
        libc::readv(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for `len` bytes of writes.
pub unsafe fn recv(fd: c_int, buf: *mut c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "recv", EventSet::READ, TimeoutKind::Recv, || {
        libc::recv(fd, buf, len, flags)
    })
}

/// # Safety
/// As recvfrom(2): `src_addr`/`addrlen` may be null.
pub unsafe fn recvfrom(
    fd: c_int,
    buf: *mut c_void,
    len: size_t,
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> ssize_t {
    do_io(fd, "recvfrom", EventSet::READ, TimeoutKind::Recv, || {
        libc::recvfrom(fd, buf, len, flags, src_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "recvmsg", EventSet::READ, TimeoutKind::Recv, || {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── Writes ────────────────────────────────────────────────────────────

/// # Safety
/// `buf` must be valid for `count` bytes of reads.
pub unsafe fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    do_io(fd, "write", EventSet::WRITE, TimeoutKind::Send, || {
        libc::write(fd, buf, count)
    })
}

/// # Safety
/// `iov` must point to `iovcnt` valid iovecs.
pub unsafe fn writev(fd: c_int, iov: *const libc::iovec, iovcnt: c_int) -> ssize_t {
    do_io(fd, "writev", EventSet::WRITE, TimeoutKind::Send, || {
        libc::writev(fd, iov, iovcnt)
    })
}

/// # Safety
/// `buf` must be valid for `len` bytes of reads.
pub unsafe fn send(fd: c_int, buf: *const c_void, len: size_t, flags: c_int) -> ssize_t {
    do_io(fd, "send", EventSet::WRITE, TimeoutKind::Send, || {
        libc::send(fd, buf, len, flags)
    })
}

/// # Safety
/// As sendto(2): `dest_addr` valid for `addrlen` bytes.
pub unsafe fn sendto(
    fd: c_int,
    buf: *const c_void,
    len: size_t,
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> ssize_t {
    do_io(fd, "sendto", EventSet::WRITE, TimeoutKind::Send, || {
        libc::sendto(fd, buf, len, flags, dest_addr, addrlen)
    })
}

/// # Safety
/// `msg` must point to a valid msghdr.
pub unsafe fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> ssize_t {
    do_io(fd, "sendmsg", EventSet::WRITE, TimeoutKind::Send, || {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── Blocking-mode and option tracking ─────────────────────────────────

/// fcntl with an integer argument (covers F_GETFL/F_SETFL/F_DUPFD/...)
///
/// For sockets the runtime keeps the kernel in non-blocking mode no
/// matter what; the user's requested mode is tracked and reflected back
/// out of F_GETFL.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let mut flags = arg;
            if let Some(ctx) = fd_manager().get(fd, false) {
                if !ctx.is_closed() && ctx.is_socket() {
                    ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                    if ctx.sys_nonblock() {
                        flags |= libc::O_NONBLOCK;
                    } else {
                        flags &= !libc::O_NONBLOCK;
                    }
                }
            }
            unsafe { libc::fcntl(fd, cmd, flags) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd) };
            if flags < 0 {
                return flags;
            }
            match fd_manager().get(fd, false) {
                Some(ctx) if !ctx.is_closed() && ctx.is_socket() => {
                    if ctx.user_nonblock() {
                        flags | libc::O_NONBLOCK
                    } else {
                        flags & !libc::O_NONBLOCK
                    }
                }
                _ => flags,
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// # Safety
/// `arg` must match what the request expects, per ioctl(2).
pub unsafe fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO as c_ulong {
        if let Some(ctx) = fd_manager().get(fd, false) {
            if !ctx.is_closed() && ctx.is_socket() {
                let user_nonblock = *(arg as *const c_int) != 0;
                ctx.set_user_nonblock(user_nonblock);
                // Kernel stays non-blocking either way.
                let mut on: c_int = 1;
                return libc::ioctl(fd, libc::FIONBIO, &mut on as *mut c_int);
            }
        }
    }
    libc::ioctl(fd, request, arg)
}

/// # Safety
/// As getsockopt(2).
pub unsafe fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    libc::getsockopt(fd, level, optname, optval, optlen)
}

/// # Safety
/// `optval` must be valid for `optlen` bytes.
///
/// `SO_RCVTIMEO`/`SO_SNDTIMEO` are absorbed into the descriptor context
/// and never reach the kernel: the watchdog timer in the hook layer is
/// what enforces them, and a kernel-side timeout on a non-blocking socket
/// would be meaningless anyway.
pub unsafe fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = fd_manager().get(fd, true) {
            let tv = &*(optval as *const libc::timeval);
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // Zero timeval means "block forever", as for the kernel option.
            let ms = if ms == 0 { u64::MAX } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout_ms(kind, ms);
            return 0;
        }
    }
    libc::setsockopt(fd, level, optname, optval, optlen)
}
