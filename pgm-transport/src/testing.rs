//! In-memory network for deterministic protocol simulations.
//!
//! A `SimNet` connects any number of `SimTransport` endpoints. Multicast
//! destinations fan out to every endpoint that joined the group; unicast
//! goes to the endpoint bound at that address. A loss filter drops
//! selected packets on the wire, which is how the tests script loss.

use crate::transport::DatagramTransport;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

type LossFilter = Box<dyn Fn(&[u8], SocketAddr, SocketAddr) -> bool + Send + Sync>;

#[derive(Default)]
struct SimNetInner {
    endpoints: Vec<Arc<EndpointState>>,
    /// Returns true to drop the packet (bytes, src, dst).
    loss_filter: Option<LossFilter>,
    dropped: u64,
    delivered: u64,
}

struct EndpointState {
    addr: SocketAddr,
    groups: Mutex<Vec<IpAddr>>,
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    readable: Condvar,
    multicast_loop: Mutex<bool>,
}

/// The shared fabric.
#[derive(Clone, Default)]
pub struct SimNet {
    inner: Arc<Mutex<SimNetInner>>,
}

impl SimNet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a new endpoint at `addr`.
    pub fn endpoint(&self, addr: SocketAddr) -> SimTransport {
        let state = Arc::new(EndpointState {
            addr,
            groups: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            readable: Condvar::new(),
            multicast_loop: Mutex::new(false),
        });
        self.inner.lock().endpoints.push(state.clone());
        SimTransport {
            net: self.clone(),
            state,
        }
    }

    /// Installs a wire-level drop predicate.
    pub fn set_loss_filter<F>(&self, filter: F)
    where
        F: Fn(&[u8], SocketAddr, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.inner.lock().loss_filter = Some(Box::new(filter));
    }

    pub fn clear_loss_filter(&self) {
        self.inner.lock().loss_filter = None;
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }

    fn route(&self, buf: &[u8], src: SocketAddr, dst: SocketAddr) {
        let mut inner = self.inner.lock();
        if let Some(filter) = &inner.loss_filter {
            if filter(buf, src, dst) {
                inner.dropped += 1;
                return;
            }
        }
        let is_multicast = dst.ip().is_multicast();
        let targets: Vec<Arc<EndpointState>> = inner
            .endpoints
            .iter()
            .filter(|ep| {
                if is_multicast {
                    let joined = ep.groups.lock().contains(&dst.ip());
                    let loopback = ep.addr == src;
                    joined && (!loopback || *ep.multicast_loop.lock())
                } else {
                    ep.addr == dst
                }
            })
            .cloned()
            .collect();
        if !targets.is_empty() {
            inner.delivered += 1;
        }
        drop(inner);

        for ep in targets {
            ep.queue.lock().push_back((buf.to_vec(), src));
            ep.readable.notify_all();
        }
    }
}

/// One endpoint's view of the fabric.
pub struct SimTransport {
    net: SimNet,
    state: Arc<EndpointState>,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("addr", &self.state.addr)
            .finish()
    }
}

impl DatagramTransport for SimTransport {
    fn send_to(&self, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
        self.net.route(buf, self.state.addr, dst);
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut queue = self.state.queue.lock();
        match queue.pop_front() {
            Some((data, src)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, src))
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn wait_readable(&self, timeout: Duration) -> io::Result<bool> {
        let mut queue = self.state.queue.lock();
        if !queue.is_empty() {
            return Ok(true);
        }
        self.state.readable.wait_for(&mut queue, timeout);
        Ok(!queue.is_empty())
    }

    fn join_group(&self, group: IpAddr) -> io::Result<()> {
        let mut groups = self.state.groups.lock();
        if !groups.contains(&group) {
            groups.push(group);
        }
        Ok(())
    }

    fn set_multicast_loop(&self, enable: bool) -> io::Result<()> {
        *self.state.multicast_loop.lock() = enable;
        Ok(())
    }

    fn set_multicast_ttl(&self, _ttl: u32) -> io::Result<()> {
        Ok(())
    }

    fn set_tos(&self, _tos: u32) -> io::Result<()> {
        Ok(())
    }
}
