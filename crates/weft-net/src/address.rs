//! Socket addresses
//!
//! A tagged wrapper over the platform sockaddr types: IPv4, IPv6, Unix
//! domain (including the abstract namespace), and a raw fallback for
//! anything else the kernel hands back. Name resolution goes through
//! `getaddrinfo`, interface enumeration through `getifaddrs`.
//!
//! Textual forms: `a.b.c.d:port`, `[v6-with-::-compression]:port`, Unix
//! paths with abstract names rendered as `\0<name>`.

use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;

use libc::{c_int, socklen_t};

// The vendored `libc` crate here doesn't expose `inet_pton`; bind it
// directly since it's part of libc.so on every supported platform.
extern "C" {
    fn inet_pton(af: c_int, src: *const libc::c_char, dst: *mut libc::c_void) -> c_int;
}

/// Any socket address the runtime can carry
#[derive(Clone)]
pub enum Address {
    Ipv4(Ipv4Address),
    Ipv6(Ipv6Address),
    Unix(UnixAddress),
    Unknown(UnknownAddress),
}

impl Address {
    /// Address family (`AF_INET`, `AF_INET6`, `AF_UNIX`, ...)
    pub fn family(&self) -> c_int {
        match self {
            Address::Ipv4(_) => libc::AF_INET,
            Address::Ipv6(_) => libc::AF_INET6,
            Address::Unix(_) => libc::AF_UNIX,
            Address::Unknown(a) => a.addr.ss_family as c_int,
        }
    }

    /// Raw pointer for passing to the socket syscalls
    pub fn as_sockaddr(&self) -> *const libc::sockaddr {
        match self {
            Address::Ipv4(a) => &a.addr as *const libc::sockaddr_in as *const libc::sockaddr,
            Address::Ipv6(a) => &a.addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
            Address::Unix(a) => &a.addr as *const libc::sockaddr_un as *const libc::sockaddr,
            Address::Unknown(a) => {
                &a.addr as *const libc::sockaddr_storage as *const libc::sockaddr
            }
        }
    }

    /// Length of the valid part of the sockaddr
    pub fn addr_len(&self) -> socklen_t {
        match self {
            Address::Ipv4(_) => mem::size_of::<libc::sockaddr_in>() as socklen_t,
            Address::Ipv6(_) => mem::size_of::<libc::sockaddr_in6>() as socklen_t,
            Address::Unix(a) => a.len,
            Address::Unknown(a) => a.len,
        }
    }

    /// Port for IP addresses, 0 otherwise
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(a) => a.port(),
            Address::Ipv6(a) => a.port(),
            _ => 0,
        }
    }

    /// Build from a kernel-filled sockaddr (accept, getsockname, ...)
    ///
    /// # Safety
    /// `addr` must point to `len` valid bytes of socket address.
    pub unsafe fn from_raw(addr: *const libc::sockaddr, len: socklen_t) -> Address {
        match (*addr).sa_family as c_int {
            libc::AF_INET => Address::Ipv4(Ipv4Address {
                addr: *(addr as *const libc::sockaddr_in),
            }),
            libc::AF_INET6 => Address::Ipv6(Ipv6Address {
                addr: *(addr as *const libc::sockaddr_in6),
            }),
            libc::AF_UNIX => {
                let mut un: libc::sockaddr_un = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    addr as *const u8,
                    &mut un as *mut libc::sockaddr_un as *mut u8,
                    (len as usize).min(mem::size_of::<libc::sockaddr_un>()),
                );
                Address::Unix(UnixAddress { addr: un, len })
            }
            _ => {
                let mut storage: libc::sockaddr_storage = mem::zeroed();
                std::ptr::copy_nonoverlapping(
                    addr as *const u8,
                    &mut storage as *mut libc::sockaddr_storage as *mut u8,
                    (len as usize).min(mem::size_of::<libc::sockaddr_storage>()),
                );
                Address::Unknown(UnknownAddress { addr: storage, len })
            }
        }
    }

    /// Resolve a host string to all matching addresses
    ///
    /// Accepted forms: `host`, `host:service`, `[v6]`, `[v6]:service`.
    /// `family`/`socktype`/`protocol` filter the results (`AF_UNSPEC`/0
    /// for no filter).
    pub fn lookup(
        host: &str,
        family: c_int,
        socktype: c_int,
        protocol: c_int,
    ) -> io::Result<Vec<Address>> {
        let (node, service) = split_host_service(host)?;
        let c_node = CString::new(node)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in host"))?;
        let c_service = match service {
            Some(s) => Some(
                CString::new(s)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in service"))?,
            ),
            None => None,
        };

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = family;
        hints.ai_socktype = socktype;
        hints.ai_protocol = protocol;

        let mut results: *mut libc::addrinfo = std::ptr::null_mut();
        let rc = unsafe {
            libc::getaddrinfo(
                c_node.as_ptr(),
                c_service.as_ref().map_or(std::ptr::null(), |s| s.as_ptr()),
                &hints,
                &mut results,
            )
        };
        if rc != 0 {
            let msg = unsafe {
                std::ffi::CStr::from_ptr(libc::gai_strerror(rc))
                    .to_string_lossy()
                    .into_owned()
            };
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("lookup of {} failed: {}", host, msg),
            ));
        }

        let mut out = Vec::new();
        let mut cursor = results;
        while !cursor.is_null() {
            let ai = unsafe { &*cursor };
            if !ai.ai_addr.is_null() {
                out.push(unsafe { Address::from_raw(ai.ai_addr, ai.ai_addrlen) });
            }
            cursor = ai.ai_next;
        }
        unsafe { libc::freeaddrinfo(results) };
        Ok(out)
    }

    /// First address a lookup returns
    pub fn lookup_any(
        host: &str,
        family: c_int,
        socktype: c_int,
        protocol: c_int,
    ) -> io::Result<Address> {
        Self::lookup(host, family, socktype, protocol)?
            .into_iter()
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {}", host)))
    }

    /// Local interface addresses as (name, address, prefix length)
    ///
    /// `family` filters (`AF_UNSPEC` for all IP families).
    pub fn interfaces(family: c_int) -> io::Result<Vec<(String, Address, u32)>> {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if unsafe { libc::getifaddrs(&mut ifaddrs) } != 0 {
            return Err(io::Error::last_os_error());
        }

        let mut out = Vec::new();
        let mut cursor = ifaddrs;
        while !cursor.is_null() {
            let ifa = unsafe { &*cursor };
            cursor = ifa.ifa_next;
            if ifa.ifa_addr.is_null() {
                continue;
            }
            let fam = unsafe { (*ifa.ifa_addr).sa_family } as c_int;
            if fam != libc::AF_INET && fam != libc::AF_INET6 {
                continue;
            }
            if family != libc::AF_UNSPEC && fam != family {
                continue;
            }

            let len = if fam == libc::AF_INET {
                mem::size_of::<libc::sockaddr_in>()
            } else {
                mem::size_of::<libc::sockaddr_in6>()
            } as socklen_t;
            let addr = unsafe { Address::from_raw(ifa.ifa_addr, len) };
            let prefix = unsafe { netmask_prefix(ifa.ifa_netmask, fam) };
            let name = unsafe {
                std::ffi::CStr::from_ptr(ifa.ifa_name)
                    .to_string_lossy()
                    .into_owned()
            };
            out.push((name, addr, prefix));
        }
        unsafe { libc::freeifaddrs(ifaddrs) };
        Ok(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(a) => a.fmt(f),
            Address::Ipv6(a) => a.fmt(f),
            Address::Unix(a) => a.fmt(f),
            Address::Unknown(a) => a.fmt(f),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

fn split_host_service(host: &str) -> io::Result<(&str, Option<&str>)> {
    if host.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host"));
    }
    if let Some(rest) = host.strip_prefix('[') {
        // [v6] or [v6]:service
        let Some(end) = rest.find(']') else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unbalanced '['"));
        };
        let node = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((node, None));
        }
        let Some(service) = tail.strip_prefix(':') else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "garbage after ']'"));
        };
        return Ok((node, Some(service)));
    }
    // A single colon separates host from service; more than one means a
    // bare IPv6 literal with no port.
    if host.bytes().filter(|&b| b == b':').count() == 1 {
        let (node, service) = host.split_once(':').unwrap();
        return Ok((node, Some(service)));
    }
    Ok((host, None))
}

unsafe fn netmask_prefix(mask: *const libc::sockaddr, family: c_int) -> u32 {
    if mask.is_null() {
        return 0;
    }
    match family {
        libc::AF_INET => {
            let m = &*(mask as *const libc::sockaddr_in);
            u32::from_be(m.sin_addr.s_addr).count_ones()
        }
        libc::AF_INET6 => {
            let m = &*(mask as *const libc::sockaddr_in6);
            m.sin6_addr.s6_addr.iter().map(|b| b.count_ones()).sum()
        }
        _ => 0,
    }
}

/// Mask of host-part bits for a prefix inside a 32-bit address
fn host_mask_v4(prefix: u32) -> u32 {
    if prefix == 0 {
        u32::MAX
    } else if prefix >= 32 {
        0
    } else {
        (1u32 << (32 - prefix)) - 1
    }
}

/// Mask of host-part bits inside one byte of an IPv6 address
fn host_mask_u8(bits: u32) -> u8 {
    if bits == 0 {
        0xff
    } else {
        ((1u16 << (8 - bits)) - 1) as u8
    }
}

// ── IPv4 ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct Ipv4Address {
    addr: libc::sockaddr_in,
}

impl Ipv4Address {
    /// From a host-order 32-bit address and port
    pub fn new(addr: u32, port: u16) -> Ipv4Address {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        raw.sin_family = libc::AF_INET as libc::sa_family_t;
        raw.sin_port = port.to_be();
        raw.sin_addr.s_addr = addr.to_be();
        Ipv4Address { addr: raw }
    }

    /// Parse dotted-decimal text
    pub fn parse(text: &str, port: u16) -> io::Result<Ipv4Address> {
        let c_text = CString::new(text)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in address"))?;
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        raw.sin_family = libc::AF_INET as libc::sa_family_t;
        raw.sin_port = port.to_be();
        let rc = unsafe {
            inet_pton(
                libc::AF_INET,
                c_text.as_ptr(),
                &mut raw.sin_addr as *mut libc::in_addr as *mut libc::c_void,
            )
        };
        if rc != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad IPv4 literal: {}", text),
            ));
        }
        Ok(Ipv4Address { addr: raw })
    }

    /// 0.0.0.0 with the given port
    pub fn any(port: u16) -> Ipv4Address {
        Self::new(0, port)
    }

    /// 127.0.0.1 with the given port
    pub fn loopback(port: u16) -> Ipv4Address {
        Self::new(0x7f00_0001, port)
    }

    #[inline]
    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin_port)
    }

    #[inline]
    pub fn set_port(&mut self, port: u16) {
        self.addr.sin_port = port.to_be();
    }

    /// Host-order address value
    #[inline]
    pub fn octets_u32(&self) -> u32 {
        u32::from_be(self.addr.sin_addr.s_addr)
    }

    pub fn broadcast_address(&self, prefix: u32) -> Option<Ipv4Address> {
        if prefix > 32 {
            return None;
        }
        Some(Ipv4Address::new(
            self.octets_u32() | host_mask_v4(prefix),
            self.port(),
        ))
    }

    pub fn network_address(&self, prefix: u32) -> Option<Ipv4Address> {
        if prefix > 32 {
            return None;
        }
        Some(Ipv4Address::new(
            self.octets_u32() & !host_mask_v4(prefix),
            self.port(),
        ))
    }

    pub fn subnet_mask(prefix: u32) -> Option<Ipv4Address> {
        if prefix > 32 {
            return None;
        }
        Some(Ipv4Address::new(!host_mask_v4(prefix), 0))
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.octets_u32();
        write!(
            f,
            "{}.{}.{}.{}:{}",
            (v >> 24) & 0xff,
            (v >> 16) & 0xff,
            (v >> 8) & 0xff,
            v & 0xff,
            self.port()
        )
    }
}

impl From<Ipv4Address> for Address {
    fn from(a: Ipv4Address) -> Address {
        Address::Ipv4(a)
    }
}

// ── IPv6 ──────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct Ipv6Address {
    addr: libc::sockaddr_in6,
}

impl Ipv6Address {
    pub fn new(octets: [u8; 16], port: u16) -> Ipv6Address {
        let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        raw.sin6_port = port.to_be();
        raw.sin6_addr.s6_addr = octets;
        Ipv6Address { addr: raw }
    }

    /// Parse colon-hex text (no brackets)
    pub fn parse(text: &str, port: u16) -> io::Result<Ipv6Address> {
        let c_text = CString::new(text)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in address"))?;
        let mut raw: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        raw.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        raw.sin6_port = port.to_be();
        let rc = unsafe {
            inet_pton(
                libc::AF_INET6,
                c_text.as_ptr(),
                &mut raw.sin6_addr as *mut libc::in6_addr as *mut libc::c_void,
            )
        };
        if rc != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("bad IPv6 literal: {}", text),
            ));
        }
        Ok(Ipv6Address { addr: raw })
    }

    /// `::` with the given port
    pub fn any(port: u16) -> Ipv6Address {
        Self::new([0; 16], port)
    }

    #[inline]
    pub fn port(&self) -> u16 {
        u16::from_be(self.addr.sin6_port)
    }

    #[inline]
    pub fn set_port(&mut self, port: u16) {
        self.addr.sin6_port = port.to_be();
    }

    #[inline]
    pub fn octets(&self) -> [u8; 16] {
        self.addr.sin6_addr.s6_addr
    }

    pub fn broadcast_address(&self, prefix: u32) -> Option<Ipv6Address> {
        if prefix > 128 {
            return None;
        }
        let mut octets = self.octets();
        octets[(prefix / 8) as usize] |= host_mask_u8(prefix % 8);
        for b in octets.iter_mut().skip((prefix / 8 + 1) as usize) {
            *b = 0xff;
        }
        Some(Ipv6Address::new(octets, self.port()))
    }

    pub fn network_address(&self, prefix: u32) -> Option<Ipv6Address> {
        if prefix > 128 {
            return None;
        }
        let mut octets = self.octets();
        octets[(prefix / 8) as usize] &= !host_mask_u8(prefix % 8);
        for b in octets.iter_mut().skip((prefix / 8 + 1) as usize) {
            *b = 0;
        }
        Some(Ipv6Address::new(octets, self.port()))
    }

    pub fn subnet_mask(prefix: u32) -> Option<Ipv6Address> {
        if prefix > 128 {
            return None;
        }
        let mut octets = [0u8; 16];
        for b in octets.iter_mut().take((prefix / 8) as usize) {
            *b = 0xff;
        }
        if prefix % 8 != 0 {
            octets[(prefix / 8) as usize] = !host_mask_u8(prefix % 8);
        }
        Some(Ipv6Address::new(octets, 0))
    }
}

impl fmt::Display for Ipv6Address {
    /// `[groups]:port` with the first zero run compressed to `::`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.octets();
        let mut groups = [0u16; 8];
        for (i, g) in groups.iter_mut().enumerate() {
            *g = u16::from_be_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }

        write!(f, "[")?;
        let mut used_zeros = false;
        for i in 0..8 {
            if groups[i] == 0 && !used_zeros {
                continue;
            }
            if i > 0 && groups[i - 1] == 0 && !used_zeros {
                write!(f, ":")?;
                used_zeros = true;
            }
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:x}", groups[i])?;
        }
        if !used_zeros && groups[7] == 0 {
            write!(f, "::")?;
        }
        write!(f, "]:{}", self.port())
    }
}

impl From<Ipv6Address> for Address {
    fn from(a: Ipv6Address) -> Address {
        Address::Ipv6(a)
    }
}

// ── Unix domain ───────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct UnixAddress {
    addr: libc::sockaddr_un,
    len: socklen_t,
}

fn sun_path_offset() -> usize {
    let probe: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &probe as *const libc::sockaddr_un as usize;
    let path = probe.sun_path.as_ptr() as usize;
    path - base
}

impl UnixAddress {
    /// A filesystem path, or an abstract name when it starts with NUL
    pub fn new(path: &str) -> io::Result<UnixAddress> {
        let mut raw: libc::sockaddr_un = unsafe { mem::zeroed() };
        raw.sun_family = libc::AF_UNIX as libc::sa_family_t;

        let bytes = path.as_bytes();
        if bytes.len() > raw.sun_path.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unix path too long",
            ));
        }
        for (dst, src) in raw.sun_path.iter_mut().zip(bytes) {
            *dst = *src as libc::c_char;
        }

        // Abstract names are length-delimited and carry no trailing NUL.
        let path_len = if bytes.first() == Some(&0) {
            bytes.len()
        } else {
            bytes.len() + 1
        };
        Ok(UnixAddress {
            addr: raw,
            len: (sun_path_offset() + path_len) as socklen_t,
        })
    }

    /// The path bytes, with abstract names keeping their leading NUL
    pub fn path_bytes(&self) -> Vec<u8> {
        let path_len = (self.len as usize).saturating_sub(sun_path_offset());
        let mut bytes: Vec<u8> = self.addr.sun_path[..path_len]
            .iter()
            .map(|&c| c as u8)
            .collect();
        // Strip the trailing NUL of a filesystem path.
        if bytes.last() == Some(&0) && bytes.first() != Some(&0) {
            bytes.pop();
        }
        bytes
    }
}

impl fmt::Display for UnixAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.path_bytes();
        if bytes.first() == Some(&0) {
            write!(f, "\\0{}", String::from_utf8_lossy(&bytes[1..]))
        } else {
            write!(f, "{}", String::from_utf8_lossy(&bytes))
        }
    }
}

impl From<UnixAddress> for Address {
    fn from(a: UnixAddress) -> Address {
        Address::Unix(a)
    }
}

// ── Anything else ─────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct UnknownAddress {
    addr: libc::sockaddr_storage,
    len: socklen_t,
}

impl fmt::Display for UnknownAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[unknown address family={}]", self.addr.ss_family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_format() {
        let a = Ipv4Address::parse("192.168.1.10", 80).unwrap();
        assert_eq!(a.to_string(), "192.168.1.10:80");
        assert_eq!(a.port(), 80);

        let any = Ipv4Address::any(0);
        assert_eq!(any.to_string(), "0.0.0.0:0");

        assert_eq!(Ipv4Address::loopback(8080).to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_ipv4_rejects_garbage() {
        assert!(Ipv4Address::parse("not an ip", 0).is_err());
        assert!(Ipv4Address::parse("300.1.1.1", 0).is_err());
    }

    #[test]
    fn test_ipv6_format_compression() {
        let a = Ipv6Address::parse("fe80::1", 8080).unwrap();
        assert_eq!(a.to_string(), "[fe80::1]:8080");

        let loopback = Ipv6Address::parse("::1", 443).unwrap();
        assert_eq!(loopback.to_string(), "[::1]:443");

        let any = Ipv6Address::any(0);
        assert_eq!(any.to_string(), "[::]:0");

        let full = Ipv6Address::parse("2001:db8:1:2:3:4:5:6", 1).unwrap();
        assert_eq!(full.to_string(), "[2001:db8:1:2:3:4:5:6]:1");

        let trailing = Ipv6Address::parse("fe80::", 7).unwrap();
        assert_eq!(trailing.to_string(), "[fe80::]:7");
    }

    #[test]
    fn test_ipv4_subnet_helpers() {
        let a = Ipv4Address::parse("192.168.1.10", 0).unwrap();
        assert_eq!(
            a.broadcast_address(24).unwrap().to_string(),
            "192.168.1.255:0"
        );
        assert_eq!(a.network_address(24).unwrap().to_string(), "192.168.1.0:0");
        assert_eq!(
            Ipv4Address::subnet_mask(24).unwrap().to_string(),
            "255.255.255.0:0"
        );
        assert!(a.broadcast_address(33).is_none());
    }

    #[test]
    fn test_ipv6_subnet_helpers() {
        let mask = Ipv6Address::subnet_mask(64).unwrap();
        assert_eq!(mask.octets()[..8], [0xff; 8]);
        assert_eq!(mask.octets()[8..], [0x00; 8]);
    }

    #[test]
    fn test_unix_paths() {
        let a = UnixAddress::new("/tmp/weft.sock").unwrap();
        assert_eq!(a.to_string(), "/tmp/weft.sock");
        assert_eq!(a.path_bytes(), b"/tmp/weft.sock");

        let abstract_addr = UnixAddress::new("\0weft-abstract").unwrap();
        assert_eq!(abstract_addr.to_string(), "\\0weft-abstract");

        let too_long = "x".repeat(200);
        assert!(UnixAddress::new(&too_long).is_err());
    }

    #[test]
    fn test_split_host_service() {
        assert_eq!(split_host_service("example.com").unwrap(), ("example.com", None));
        assert_eq!(
            split_host_service("example.com:80").unwrap(),
            ("example.com", Some("80"))
        );
        assert_eq!(
            split_host_service("[fe80::1]:443").unwrap(),
            ("fe80::1", Some("443"))
        );
        assert_eq!(split_host_service("[::1]").unwrap(), ("::1", None));
        // A bare v6 literal has many colons and no service part.
        assert_eq!(split_host_service("fe80::1").unwrap(), ("fe80::1", None));
        assert!(split_host_service("[::1").is_err());
    }

    #[test]
    fn test_lookup_loopback() {
        let addrs = Address::lookup("127.0.0.1:80", libc::AF_INET, libc::SOCK_STREAM, 0).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].to_string(), "127.0.0.1:80");
        assert_eq!(addrs[0].family(), libc::AF_INET);
    }

    #[test]
    fn test_from_raw_roundtrip() {
        let a = Ipv4Address::parse("10.0.0.1", 1234).unwrap();
        let addr: Address = a.into();
        let back = unsafe { Address::from_raw(addr.as_sockaddr(), addr.addr_len()) };
        assert_eq!(back.to_string(), "10.0.0.1:1234");
    }
}
