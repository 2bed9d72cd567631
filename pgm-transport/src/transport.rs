use std::fmt::Debug;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Datagram I/O capability consumed by the engine.
///
/// The engine never opens sockets itself: it hands encoded PGM packets to
/// `send_to` and pulls raw datagrams from `recv_from`. Both are
/// non-blocking; `recv_from` reports an empty queue as
/// `io::ErrorKind::WouldBlock`, and blocking `recvmsg` parks on
/// `wait_readable` so external reactors can integrate through the same
/// readiness handle.
pub trait DatagramTransport: Send + Sync + Debug {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize>;

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Waits until a datagram is readable or the timeout passes. Returns
    /// whether data is ready.
    fn wait_readable(&self, timeout: Duration) -> io::Result<bool>;

    fn join_group(&self, group: IpAddr) -> io::Result<()>;

    fn set_multicast_loop(&self, enable: bool) -> io::Result<()>;

    fn set_multicast_ttl(&self, ttl: u32) -> io::Result<()>;

    fn set_tos(&self, tos: u32) -> io::Result<()>;

    /// Whether outgoing packets carry the router-alert IP option.
    fn router_alert(&self) -> bool {
        false
    }
}

/// Where an outbound packet goes: downstream to the multicast group, or
/// upstream toward a source's advertised NLA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dest {
    Group,
    Source(IpAddr),
}

/// An encoded packet the engine wants sent.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub data: Vec<u8>,
    pub dest: Dest,
}

impl Outbound {
    pub fn group(data: Vec<u8>) -> Self {
        Outbound {
            data,
            dest: Dest::Group,
        }
    }

    pub fn to_source(data: Vec<u8>, nla: IpAddr) -> Self {
        Outbound {
            data,
            dest: Dest::Source(nla),
        }
    }
}
