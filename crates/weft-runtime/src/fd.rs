//! Per-descriptor state
//!
//! The hook layer needs to know, for any fd it sees: is this a socket, did
//! the *user* ask for non-blocking mode, and what send/recv timeouts are
//! configured. Sockets are silently forced to `O_NONBLOCK` at the kernel
//! the first time they are seen; the user-visible blocking behavior is then
//! reconstructed by the hooks (suspend instead of block), so user code
//! never observes the difference.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use weft_core::event::EventSet;

/// Timeout slot selector for [`FdCtx::timeout_ms`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Recv,
    Send,
}

impl TimeoutKind {
    /// The readiness event a timed-out wait was armed on
    pub fn event(self) -> EventSet {
        match self {
            TimeoutKind::Recv => EventSet::READ,
            TimeoutKind::Send => EventSet::WRITE,
        }
    }
}

/// Cached per-descriptor facts
pub struct FdCtx {
    fd: i32,
    is_socket: bool,
    is_closed: AtomicBool,
    /// Non-blocking as requested by the user via fcntl/ioctl
    user_nonblock: AtomicBool,
    /// Non-blocking as actually set at the kernel
    sys_nonblock: AtomicBool,
    /// Milliseconds, `u64::MAX` = wait forever
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    fn new(fd: i32) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = if unsafe { libc::fstat(fd, &mut stat) } == 0 {
            (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
        } else {
            false
        };

        let mut sys_nonblock = false;
        if is_socket {
            // Force kernel-level non-blocking so a hooked call can turn
            // EAGAIN into a fiber suspension. The user did not ask for
            // this, which is exactly what `user_nonblock = false` records.
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            is_closed: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(sys_nonblock),
            recv_timeout_ms: AtomicU64::new(u64::MAX),
            send_timeout_ms: AtomicU64::new(u64::MAX),
        }
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_sys_nonblock(&self, on: bool) {
        self.sys_nonblock.store(on, Ordering::Release);
    }

    pub fn timeout_ms(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }

    fn mark_closed(&self) {
        self.is_closed.store(true, Ordering::Release);
    }
}

/// Process-wide, lazily populated fd table
pub struct FdManager {
    slots: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdManager {
    fn new() -> FdManager {
        FdManager {
            slots: RwLock::new(vec![None; 64]),
        }
    }

    /// Look up a descriptor, creating its context on first sight when
    /// `auto_create` is set
    pub fn get(&self, fd: i32, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            if let Some(Some(ctx)) = slots.get(fd as usize) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut slots = self.slots.write().unwrap();
        if fd as usize >= slots.len() {
            slots.resize((fd as usize + 1).next_power_of_two(), None);
        }
        // Double-checked: another thread may have raced us here.
        if let Some(ctx) = &slots[fd as usize] {
            return Some(ctx.clone());
        }
        let ctx = Arc::new(FdCtx::new(fd));
        slots[fd as usize] = Some(ctx.clone());
        Some(ctx)
    }

    /// Forget a descriptor, marking its context closed
    pub fn del(&self, fd: i32) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

static FD_MANAGER: OnceLock<FdManager> = OnceLock::new();

/// The process-wide descriptor table
pub fn fd_manager() -> &'static FdManager {
    FD_MANAGER.get_or_init(FdManager::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_socket_fd() {
        // stdin is not a socket
        let ctx = fd_manager().get(0, true).unwrap();
        assert!(!ctx.is_socket());
        assert!(!ctx.user_nonblock());
        fd_manager().del(0);
    }

    #[test]
    fn test_socket_forced_nonblocking() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);

        let ctx = fd_manager().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock(), "kernel nonblock must be forced");
        assert!(!ctx.user_nonblock(), "user did not ask for nonblock");

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        fd_manager().del(fd);
        assert!(ctx.is_closed());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_default_infinite() {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        assert!(fd >= 0);
        let ctx = fd_manager().get(fd, true).unwrap();
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), u64::MAX);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), u64::MAX);

        ctx.set_timeout_ms(TimeoutKind::Recv, 250);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout_ms(TimeoutKind::Send), u64::MAX);

        fd_manager().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_get_without_create() {
        assert!(fd_manager().get(4095, false).is_none());
        assert!(fd_manager().get(-1, true).is_none());
    }
}
