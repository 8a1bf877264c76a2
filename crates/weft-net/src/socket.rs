//! Cooperative socket
//!
//! A typed handle over one descriptor. Every potentially-blocking
//! operation goes through the runtime hooks, so on an I/O manager worker
//! the calling fiber suspends instead of the thread blocking; off the
//! runtime the same code degrades to plain blocking calls.
//!
//! Construction side effects: `SO_REUSEADDR` always, `TCP_NODELAY` for
//! stream sockets. The descriptor is owned and closed on drop.

use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use libc::{c_int, c_void, socklen_t};
use log::error;

use weft_core::event::EventSet;
use weft_runtime::fd::{fd_manager, TimeoutKind};
use weft_runtime::hook;
use weft_runtime::io::IoManager;

use crate::address::Address;

/// A cooperative, owned socket descriptor
pub struct Socket {
    fd: AtomicI32,
    family: c_int,
    ty: c_int,
    protocol: c_int,
    connected: AtomicBool,
    local: Mutex<Option<Address>>,
    remote: Mutex<Option<Address>>,
}

impl Socket {
    /// A handle with no descriptor yet; one is created lazily by
    /// `bind`/`connect`
    pub fn new(family: c_int, ty: c_int, protocol: c_int) -> Socket {
        Socket {
            fd: AtomicI32::new(-1),
            family,
            ty,
            protocol,
            connected: AtomicBool::new(false),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        }
    }

    pub fn tcp_v4() -> Socket {
        Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    pub fn tcp_v6() -> Socket {
        Socket::new(libc::AF_INET6, libc::SOCK_STREAM, 0)
    }

    pub fn udp_v4() -> io::Result<Socket> {
        let sock = Socket::new(libc::AF_INET, libc::SOCK_DGRAM, 0);
        sock.ensure_fd()?;
        sock.connected.store(true, Ordering::Release);
        Ok(sock)
    }

    pub fn udp_v6() -> io::Result<Socket> {
        let sock = Socket::new(libc::AF_INET6, libc::SOCK_DGRAM, 0);
        sock.ensure_fd()?;
        sock.connected.store(true, Ordering::Release);
        Ok(sock)
    }

    pub fn unix_stream() -> Socket {
        Socket::new(libc::AF_UNIX, libc::SOCK_STREAM, 0)
    }

    /// A TCP socket matching the family of `addr`
    pub fn tcp_for(addr: &Address) -> Socket {
        Socket::new(addr.family(), libc::SOCK_STREAM, 0)
    }

    /// A UDP socket matching the family of `addr`
    pub fn udp_for(addr: &Address) -> io::Result<Socket> {
        let sock = Socket::new(addr.family(), libc::SOCK_DGRAM, 0);
        sock.ensure_fd()?;
        sock.connected.store(true, Ordering::Release);
        Ok(sock)
    }

    #[inline]
    pub fn fd(&self) -> i32 {
        self.fd.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd() != -1
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn family(&self) -> c_int {
        self.family
    }

    #[inline]
    pub fn socket_type(&self) -> c_int {
        self.ty
    }

    #[inline]
    pub fn protocol(&self) -> c_int {
        self.protocol
    }

    fn ensure_fd(&self) -> io::Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        let fd = hook::socket(self.family, self.ty, self.protocol);
        if fd < 0 {
            let err = io::Error::last_os_error();
            error!(
                "socket({}, {}, {}) failed: {}",
                self.family, self.ty, self.protocol, err
            );
            return Err(err);
        }
        self.fd.store(fd, Ordering::Release);
        self.init_options();
        Ok(())
    }

    /// Adopt an accepted descriptor
    fn from_accept(fd: i32, family: c_int, ty: c_int, protocol: c_int) -> Socket {
        let sock = Socket {
            fd: AtomicI32::new(fd),
            family,
            ty,
            protocol,
            connected: AtomicBool::new(true),
            local: Mutex::new(None),
            remote: Mutex::new(None),
        };
        sock.init_options();
        sock.refresh_local();
        sock.refresh_remote();
        sock
    }

    fn init_options(&self) {
        let one: c_int = 1;
        let _ = self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &one);
        if self.ty == libc::SOCK_STREAM && self.family != libc::AF_UNIX {
            let _ = self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, &one);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────

    pub fn bind(&self, addr: &Address) -> io::Result<()> {
        self.ensure_fd()?;
        if addr.family() != self.family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "bind family mismatch: socket {} address {}",
                    self.family,
                    addr.family()
                ),
            ));
        }
        let rc = unsafe { libc::bind(self.fd(), addr.as_sockaddr(), addr.addr_len()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.refresh_local();
        Ok(())
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        if !self.is_valid() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "listen before bind"));
        }
        let rc = unsafe { libc::listen(self.fd(), backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one connection; suspends the calling fiber until a client
    /// arrives (or the recv timeout expires)
    pub fn accept(&self) -> io::Result<Socket> {
        let fd = unsafe { hook::accept(self.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Socket::from_accept(fd, self.family, self.ty, self.protocol))
    }

    /// Connect with the runtime's default connect timeout
    pub fn connect(&self, addr: &Address) -> io::Result<()> {
        self.connect_with_timeout(addr, weft_runtime::config::runtime_config().connect_timeout_ms)
    }

    pub fn connect_with_timeout(&self, addr: &Address, timeout_ms: u64) -> io::Result<()> {
        self.ensure_fd()?;
        if addr.family() != self.family {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "connect family mismatch: socket {} address {}",
                    self.family,
                    addr.family()
                ),
            ));
        }
        *self.remote.lock().unwrap() = Some(addr.clone());

        let rc = unsafe {
            hook::connect_with_timeout(self.fd(), addr.as_sockaddr(), addr.addr_len(), timeout_ms)
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            self.close();
            return Err(err);
        }
        self.connected.store(true, Ordering::Release);
        self.refresh_local();
        Ok(())
    }

    /// Re-dial the last remote address after a failure
    pub fn reconnect(&self, timeout_ms: u64) -> io::Result<()> {
        let remote = self.remote.lock().unwrap().clone();
        let Some(addr) = remote else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "reconnect with no previous remote address",
            ));
        };
        *self.local.lock().unwrap() = None;
        self.connect_with_timeout(&addr, timeout_ms)
    }

    /// Close the descriptor, releasing any fiber parked on it
    pub fn close(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);
        self.connected.store(false, Ordering::Release);
        if fd != -1 {
            hook::close(fd);
        }
    }

    // ── Data path ─────────────────────────────────────────────────────

    pub fn send(&self, buf: &[u8], flags: c_int) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "send on closed socket"));
        }
        let n = unsafe {
            hook::send(
                self.fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Gather-send from iovec views (e.g. `ByteArray::read_buffers`)
    pub fn send_vectored(&self, bufs: &[libc::iovec], flags: c_int) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "send on closed socket"));
        }
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len();
        let n = unsafe { hook::sendmsg(self.fd(), &msg, flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send_to(&self, buf: &[u8], to: &Address, flags: c_int) -> io::Result<usize> {
        self.ensure_fd()?;
        let n = unsafe {
            hook::sendto(
                self.fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                flags,
                to.as_sockaddr(),
                to.addr_len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn send_to_vectored(
        &self,
        bufs: &[libc::iovec],
        to: &Address,
        flags: c_int,
    ) -> io::Result<usize> {
        self.ensure_fd()?;
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len();
        msg.msg_name = to.as_sockaddr() as *mut c_void;
        msg.msg_namelen = to.addr_len();
        let n = unsafe { hook::sendmsg(self.fd(), &msg, flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn recv(&self, buf: &mut [u8], flags: c_int) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "recv on closed socket"));
        }
        let n = unsafe {
            hook::recv(
                self.fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Scatter-receive into iovec views (e.g. `ByteArray::write_buffers`)
    pub fn recv_vectored(&self, bufs: &[libc::iovec], flags: c_int) -> io::Result<usize> {
        if !self.is_connected() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "recv on closed socket"));
        }
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = bufs.len();
        let n = unsafe { hook::recvmsg(self.fd(), &mut msg, flags) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub fn recv_from(&self, buf: &mut [u8], flags: c_int) -> io::Result<(usize, Address)> {
        self.ensure_fd()?;
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let n = unsafe {
            hook::recvfrom(
                self.fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                flags,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let from = unsafe {
            Address::from_raw(
                &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                len,
            )
        };
        Ok((n as usize, from))
    }

    // ── Cancellation ──────────────────────────────────────────────────

    /// Release a fiber parked on readability
    pub fn cancel_read(&self) -> bool {
        match IoManager::current() {
            Some(iom) => iom.cancel_event(self.fd(), EventSet::READ),
            None => false,
        }
    }

    /// Release a fiber parked on writability
    pub fn cancel_write(&self) -> bool {
        match IoManager::current() {
            Some(iom) => iom.cancel_event(self.fd(), EventSet::WRITE),
            None => false,
        }
    }

    /// Release a fiber parked in accept
    pub fn cancel_accept(&self) -> bool {
        self.cancel_read()
    }

    /// Release everything parked on this socket
    pub fn cancel_all(&self) -> bool {
        match IoManager::current() {
            Some(iom) => iom.cancel_all(self.fd()),
            None => false,
        }
    }

    // ── Options and metadata ──────────────────────────────────────────

    pub fn set_option<T>(&self, level: c_int, name: c_int, value: &T) -> io::Result<()> {
        let rc = unsafe {
            hook::setsockopt(
                self.fd(),
                level,
                name,
                value as *const T as *const c_void,
                mem::size_of::<T>() as socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn get_option<T>(&self, level: c_int, name: c_int, value: &mut T) -> io::Result<()> {
        let mut len = mem::size_of::<T>() as socklen_t;
        let rc = unsafe {
            hook::getsockopt(
                self.fd(),
                level,
                name,
                value as *mut T as *mut c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Pending socket error, cleared by the read (`SO_ERROR`)
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: c_int = 0;
        self.get_option(libc::SOL_SOCKET, libc::SO_ERROR, &mut err)?;
        if err == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(err)))
        }
    }

    pub fn set_recv_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_RCVTIMEO, ms)
    }

    pub fn recv_timeout(&self) -> u64 {
        self.timeout(TimeoutKind::Recv)
    }

    pub fn set_send_timeout(&self, ms: u64) -> io::Result<()> {
        self.set_timeout(libc::SO_SNDTIMEO, ms)
    }

    pub fn send_timeout(&self) -> u64 {
        self.timeout(TimeoutKind::Send)
    }

    fn set_timeout(&self, opt: c_int, ms: u64) -> io::Result<()> {
        self.ensure_fd()?;
        // Zero timeval = wait forever, matching the kernel option.
        let tv = if ms == u64::MAX {
            libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            }
        } else {
            libc::timeval {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
            }
        };
        self.set_option(libc::SOL_SOCKET, opt, &tv)
    }

    fn timeout(&self, kind: TimeoutKind) -> u64 {
        match fd_manager().get(self.fd(), false) {
            Some(ctx) => ctx.timeout_ms(kind),
            None => u64::MAX,
        }
    }

    /// Address this socket is bound to
    pub fn local_address(&self) -> Option<Address> {
        let cached = self.local.lock().unwrap().clone();
        if cached.is_some() {
            return cached;
        }
        self.refresh_local();
        self.local.lock().unwrap().clone()
    }

    /// Peer address of a connected socket
    pub fn remote_address(&self) -> Option<Address> {
        let cached = self.remote.lock().unwrap().clone();
        if cached.is_some() {
            return cached;
        }
        self.refresh_remote();
        self.remote.lock().unwrap().clone()
    }

    fn refresh_local(&self) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getsockname(
                self.fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            *self.local.lock().unwrap() = Some(unsafe {
                Address::from_raw(
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    len,
                )
            });
        }
    }

    fn refresh_remote(&self) {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let rc = unsafe {
            libc::getpeername(
                self.fd(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            *self.remote.lock().unwrap() = Some(unsafe {
                Address::from_raw(
                    &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                    len,
                )
            });
        }
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Socket fd={} family={} type={} protocol={} connected={}",
            self.fd(),
            self.family,
            self.ty,
            self.protocol,
            self.is_connected()
        )?;
        if let Some(local) = self.local.lock().unwrap().as_ref() {
            write!(f, " local={}", local)?;
        }
        if let Some(remote) = self.remote.lock().unwrap().as_ref() {
            write!(f, " remote={}", remote)?;
        }
        write!(f, "]")
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Ipv4Address;

    #[test]
    fn test_lazy_fd_creation() {
        let sock = Socket::tcp_v4();
        assert!(!sock.is_valid());
        assert!(!sock.is_connected());

        sock.bind(&Ipv4Address::loopback(0).into()).unwrap();
        assert!(sock.is_valid());
        let local = sock.local_address().unwrap();
        assert_ne!(local.port(), 0, "bind to port 0 must pick a real port");
    }

    #[test]
    fn test_reuseaddr_set_on_creation() {
        let sock = Socket::tcp_v4();
        sock.bind(&Ipv4Address::loopback(0).into()).unwrap();
        let mut val: c_int = 0;
        sock.get_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &mut val)
            .unwrap();
        assert_ne!(val, 0);
    }

    #[test]
    fn test_family_mismatch_rejected() {
        let sock = Socket::tcp_v6();
        let v4: Address = Ipv4Address::loopback(0).into();
        assert!(sock.bind(&v4).is_err());
    }

    #[test]
    fn test_udp_roundtrip_without_runtime() {
        // Off the runtime the hooks pass straight through to libc.
        let a = Socket::udp_v4().unwrap();
        a.bind(&Ipv4Address::loopback(0).into()).unwrap();
        let a_addr = a.local_address().unwrap();

        let b = Socket::udp_v4().unwrap();
        b.send_to(b"datagram", &a_addr, 0).unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = a.recv_from(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from.family(), libc::AF_INET);
    }

    #[test]
    fn test_close_invalidates() {
        let sock = Socket::udp_v4().unwrap();
        assert!(sock.is_valid());
        sock.close();
        assert!(!sock.is_valid());
        assert!(!sock.is_connected());
        assert!(sock.recv(&mut [0u8; 4], 0).is_err());
    }

    #[test]
    fn test_timeout_bookkeeping() {
        let sock = Socket::udp_v4().unwrap();
        assert_eq!(sock.recv_timeout(), u64::MAX);
        sock.set_recv_timeout(250).unwrap();
        assert_eq!(sock.recv_timeout(), 250);
        assert_eq!(sock.send_timeout(), u64::MAX);
        sock.set_send_timeout(u64::MAX).unwrap();
        assert_eq!(sock.send_timeout(), u64::MAX);
    }

    #[test]
    fn test_display_includes_addresses() {
        let sock = Socket::tcp_v4();
        sock.bind(&Ipv4Address::loopback(0).into()).unwrap();
        let rendered = sock.to_string();
        assert!(rendered.contains("family=2"));
        assert!(rendered.contains("local=127.0.0.1:"));
    }
}
