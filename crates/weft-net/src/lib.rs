//! # weft-net
//!
//! Address types and the cooperative `Socket`. Sockets route every
//! potentially-blocking call through the runtime's hook layer, so code
//! written in plain blocking style suspends its fiber instead of its
//! thread whenever it runs on an I/O manager worker.

pub mod address;
pub mod socket;

pub use address::{Address, Ipv4Address, Ipv6Address, UnixAddress, UnknownAddress};
pub use socket::Socket;
