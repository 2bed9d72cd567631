//! The PGM socket endpoint.
//!
//! Owns the send- and receive-side state machines, the peer map, the
//! capability handles (transport, clock), and the public send/recv API.
//! The endpoint runs cooperatively on the caller's thread: `send` and
//! `recvmsg` both pump inbound datagrams and due timers before doing
//! their own work, so a process that only sends or only receives still
//! services the whole protocol.
//!
//! Locking: one mutex over the send side (transmit window and rate
//! buckets), one over the receive side (peer map and timers). Inbound
//! packets are parsed outside both locks, then routed under exactly one
//! of them; nothing blocks while holding a lock.

use crate::clock::Clock;
use crate::error::{PgmError, PgmResult};
use crate::options::{SockOpt, SocketConfig};
use crate::receiver::{Front, Receiver, ReceiverConfig};
use crate::rxw::{RxMessage, RxwConfig};
use crate::source::{Source, SourceConfig};
use crate::timer::TimerCore;
use crate::transport::{DatagramTransport, Dest, Outbound};
use parking_lot::Mutex;
use pgm_proto::{Gsi, PacketBody, PgmPacket, Tsi};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Non-blocking receive: return `WouldBlock` instead of waiting.
pub const MSG_DONTWAIT: u32 = 0x01;
/// Deliver loss reports as messages instead of `ConnReset` errors.
pub const MSG_ERRQUEUE: u32 = 0x02;
/// Acknowledge an earlier `ConnReset` and resume draining.
pub const MSG_ACK_RESET: u32 = 0x04;

/// Longest single park on the transport, so close and timer deadlines are
/// observed promptly.
const MAX_WAIT_SLICE: Duration = Duration::from_millis(250);

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tsi: Tsi,
    pub msg: RxMessage,
}

/// Session parameters for `bind`.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Global session identifier; generated from the RNG when `None`.
    pub gsi: Option<Gsi>,
    /// Data-source port; random when zero.
    pub sport: u16,
    /// Data-destination port.
    pub dport: u16,
    /// Multicast group address.
    pub group: IpAddr,
    /// This host's network-layer address, advertised in SPMs.
    pub nla: IpAddr,
}

#[derive(Debug, Default)]
struct IoStats {
    malformed: u64,
    self_traffic: u64,
}

#[derive(Debug)]
struct Session {
    tsi: Tsi,
    dport: u16,
    group: IpAddr,
}

pub struct PgmSocket {
    transport: Arc<dyn DatagramTransport>,
    clock: Arc<dyn Clock>,
    config: Mutex<SocketConfig>,
    session: Mutex<Option<Session>>,
    send_side: Mutex<Option<Source>>,
    recv_side: Mutex<Option<Receiver>>,
    rng: Mutex<StdRng>,
    io_stats: Mutex<IoStats>,
    /// Cached next-expiry scalar; recomputed after every service pass.
    timers: Mutex<TimerCore>,
    closed: AtomicBool,
}

impl PgmSocket {
    /// A fresh, unbound socket. Options may be set until `bind`.
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        clock: Arc<dyn Clock>,
        rng: &mut dyn RngCore,
    ) -> Self {
        PgmSocket {
            transport,
            clock,
            config: Mutex::new(SocketConfig::default()),
            session: Mutex::new(None),
            send_side: Mutex::new(None),
            recv_side: Mutex::new(None),
            rng: Mutex::new(StdRng::seed_from_u64(rng.next_u64())),
            io_stats: Mutex::new(IoStats::default()),
            timers: Mutex::new(TimerCore::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn set_option(&self, opt: SockOpt) -> PgmResult<()> {
        let bound = self.session.lock().is_some();
        self.config.lock().apply(opt, bound)
    }

    pub fn is_bound(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Joins the group and brings up the configured halves of the engine.
    pub fn bind(&self, params: SessionParams) -> PgmResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PgmError::Engine("socket is closed".into()));
        }
        let mut session = self.session.lock();
        if session.is_some() {
            return Err(PgmError::Config("socket already bound".into()));
        }
        let config = self.config.lock().clone();
        if config.send_only && config.recv_only {
            return Err(PgmError::Config("send-only and recv-only".into()));
        }

        let mut rng = self.rng.lock();
        let gsi = params.gsi.unwrap_or_else(|| match params.nla {
            IpAddr::V4(v4) => Gsi::from_addr(v4, &mut *rng),
            IpAddr::V6(_) => Gsi::random(&mut *rng),
        });
        let sport = if params.sport != 0 {
            params.sport
        } else {
            rng.next_u32() as u16 | 1
        };
        let tsi = Tsi::new(gsi, sport);
        let now = self.clock.now();

        self.transport.join_group(params.group)?;
        self.transport.set_multicast_loop(config.multicast_loop)?;
        self.transport.set_multicast_ttl(config.multicast_ttl)?;

        if !config.recv_only {
            let source_config = SourceConfig {
                max_tsdu: config.max_tsdu(),
                max_tsdu_fragment: config.max_tsdu_fragment(),
                max_apdu_fragments: config.max_apdu_fragments as usize,
                txw_capacity: config.txw_capacity(),
                txw_max_rte: config.txw_max_rte,
                nak_rte: config.nak_rte,
                ambient_spm: config.ambient_spm,
                heartbeat_spm: config.heartbeat_spm.clone(),
                fec: config.fec,
            };
            let source = Source::new(tsi, params.dport, params.nla, source_config, now, &mut *rng)?;
            *self.send_side.lock() = Some(source);
        }
        if !config.send_only {
            let receiver_config = ReceiverConfig {
                rxw: RxwConfig {
                    capacity: config.rxw_capacity(),
                    nak_bo_ivl: config.nak_bo_ivl,
                    nak_rpt_ivl: config.nak_rpt_ivl,
                    nak_rdata_ivl: config.nak_rdata_ivl,
                    nak_ncf_retries: config.nak_ncf_retries,
                    nak_data_retries: config.nak_data_retries,
                },
                peer_expiry: config.peer_expiry,
                spmr_expiry: config.spmr_expiry,
                dport: params.dport,
                group: params.group,
            };
            *self.recv_side.lock() = Some(Receiver::new(receiver_config, &mut *rng));
        }

        *session = Some(Session {
            tsi,
            dport: params.dport,
            group: params.group,
        });
        debug!(%tsi, group = %params.group, "socket bound");
        Ok(())
    }

    pub fn tsi(&self) -> Option<Tsi> {
        self.session.lock().as_ref().map(|s| s.tsi)
    }

    /// Packets dropped before reaching the state machines: malformed or
    /// corrupt, and our own multicast echo.
    pub fn drop_counts(&self) -> (u64, u64) {
        let stats = self.io_stats.lock();
        (stats.malformed, stats.self_traffic)
    }

    fn resolve(&self, dest: Dest) -> PgmResult<SocketAddr> {
        let session = self.session.lock();
        let session = session
            .as_ref()
            .ok_or_else(|| PgmError::Config("socket not bound".into()))?;
        let config = self.config.lock();
        Ok(match dest {
            Dest::Group => {
                let port = if config.udp_encap_mcast_port != 0 {
                    config.udp_encap_mcast_port
                } else {
                    session.dport
                };
                SocketAddr::new(session.group, port)
            }
            Dest::Source(nla) => {
                let port = if config.udp_encap_ucast_port != 0 {
                    config.udp_encap_ucast_port
                } else {
                    session.dport
                };
                SocketAddr::new(nla, port)
            }
        })
    }

    fn transmit(&self, outbound: Vec<Outbound>) -> PgmResult<()> {
        for out in outbound {
            let dst = self.resolve(out.dest)?;
            match self.transport.send_to(&out.data, dst) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // Transport back-pressure: the packet is dropped and
                    // recovered through the normal NAK path.
                    trace!(%dst, "transport full, packet dropped");
                }
                Err(e) => return Err(PgmError::Transport(e)),
            }
        }
        Ok(())
    }

    /// Drains inbound datagrams, then dispatches timers when the cached
    /// expiry has passed or inbound work may have moved a deadline.
    /// Dispatch is idempotent; the scalar is re-prepared on the way out.
    fn pump(&self) -> PgmResult<()> {
        let now = self.clock.now();
        let mut buf = vec![0u8; 65536];
        let mut inbound = false;
        loop {
            match self.transport.recv_from(&mut buf) {
                Ok((len, src)) => {
                    inbound = true;
                    self.dispatch(&buf[..len], src, now)?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(PgmError::Transport(e)),
            }
        }

        if inbound || self.timers.lock().check(now) {
            let out = {
                let mut recv = self.recv_side.lock();
                match recv.as_mut() {
                    Some(receiver) => {
                        let mut rng = self.rng.lock();
                        receiver.timers(now, &mut *rng)
                    }
                    None => Vec::new(),
                }
            };
            self.transmit(out)?;

            let out = {
                let mut send = self.send_side.lock();
                match send.as_mut() {
                    Some(source) => source.poll(now),
                    None => Vec::new(),
                }
            };
            self.transmit(out)?;
        }

        self.prepare_wakeup(now);
        Ok(())
    }

    /// Parses one datagram and routes it to the owning side.
    fn dispatch(&self, buf: &[u8], src: SocketAddr, now: Instant) -> PgmResult<()> {
        let packet = match PgmPacket::decode(buf) {
            Ok(p) => p,
            Err(err) => {
                self.io_stats.lock().malformed += 1;
                trace!(%src, %err, "dropping malformed packet");
                return Ok(());
            }
        };
        let own_tsi = self.session.lock().as_ref().map(|s| s.tsi);

        if packet.header.packet_type.is_upstream() {
            // NAK, N-NAK, SPMR, ACK: for our source half, if it is ours.
            if own_tsi != Some(packet.tsi()) {
                // SPMRs from sibling receivers still matter for
                // suppression on the receive side.
                if matches!(packet.body, PacketBody::Spmr(_)) {
                    let out = self.route_to_receiver(&packet, now)?;
                    return self.transmit(out);
                }
                return Ok(());
            }
            let out = {
                let mut send = self.send_side.lock();
                let Some(source) = send.as_mut() else {
                    return Ok(());
                };
                match &packet.body {
                    PacketBody::Nak(nak) => source.handle_nak(packet.header.flags, nak),
                    PacketBody::NullNak(_) => {
                        source.handle_nnak();
                        Vec::new()
                    }
                    PacketBody::Spmr(_) => source.handle_spmr(now),
                    PacketBody::Ack(_) => {
                        source.handle_ack();
                        Vec::new()
                    }
                    _ => Vec::new(),
                }
            };
            return self.transmit(out);
        }

        // Downstream traffic: our own multicast loops back when the
        // transport echoes it; never feed our session to ourselves.
        if own_tsi == Some(packet.tsi()) {
            self.io_stats.lock().self_traffic += 1;
            return Ok(());
        }
        let out = self.route_to_receiver(&packet, now)?;
        self.transmit(out)
    }

    fn route_to_receiver(&self, packet: &PgmPacket, now: Instant) -> PgmResult<Vec<Outbound>> {
        let mut recv = self.recv_side.lock();
        let Some(receiver) = recv.as_mut() else {
            return Ok(Vec::new());
        };
        let mut rng = self.rng.lock();
        Ok(receiver.handle_packet(packet, now, &mut *rng))
    }

    /// Publishes one APDU. Fragments, enqueues into the transmit window,
    /// and transmits whatever the rate bucket allows right away; the
    /// remainder flows on subsequent calls or timer services.
    pub fn send(&self, data: &[u8]) -> PgmResult<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PgmError::Engine("socket is closed".into()));
        }
        self.pump()?;
        let now = self.clock.now();
        let out = {
            let mut send = self.send_side.lock();
            let source = send
                .as_mut()
                .ok_or_else(|| PgmError::Config("socket is receive-only".into()))?;
            let sent = source.send_apdu(data, now)?;
            let out = source.poll(now);
            (sent, out)
        };
        self.transmit(out.1)?;
        // The APDU moved the SPM and rate deadlines; refresh the scalar.
        self.prepare_wakeup(now);
        Ok(out.0)
    }

    /// Gather variant of `send`: the segments form one APDU.
    pub fn sendv(&self, iov: &[&[u8]]) -> PgmResult<usize> {
        let total: usize = iov.iter().map(|s| s.len()).sum();
        let mut apdu = Vec::with_capacity(total);
        for seg in iov {
            apdu.extend_from_slice(seg);
        }
        self.send(&apdu)
    }

    /// Receives the next in-order message from any peer.
    ///
    /// A peer that lost data unrecoverably surfaces once as `ConnReset`;
    /// pass `MSG_ACK_RESET` on the next call to drop the gap and resume,
    /// or `MSG_ERRQUEUE` to receive loss reports as ordinary messages.
    pub fn recvmsg(&self, flags: u32) -> PgmResult<Message> {
        let deadline = self
            .config
            .lock()
            .recv_timeout
            .map(|t| self.clock.now() + t);
        let mut ack_budget = (flags & MSG_ACK_RESET != 0) as u32;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PgmError::Engine("socket is closed".into()));
            }
            self.pump()?;

            {
                let mut recv = self.recv_side.lock();
                let receiver = recv
                    .as_mut()
                    .ok_or_else(|| PgmError::Config("socket is send-only".into()))?;
                loop {
                    match receiver.front() {
                        None => break,
                        Some(Front::Data(_)) => {
                            let (tsi, msg) =
                                receiver.pop_message().expect("front observed");
                            return Ok(Message { tsi, msg });
                        }
                        Some(Front::Loss(tsi)) => {
                            if flags & MSG_ERRQUEUE != 0 {
                                let (tsi, msg) =
                                    receiver.pop_message().expect("front observed");
                                return Ok(Message { tsi, msg });
                            }
                            if ack_budget > 0 {
                                ack_budget -= 1;
                                receiver.pop_message();
                                continue;
                            }
                            return Err(PgmError::ConnReset(tsi.to_string()));
                        }
                    }
                }
            }

            if flags & MSG_DONTWAIT != 0 {
                return Err(PgmError::WouldBlock);
            }
            let now = self.clock.now();
            if let Some(d) = deadline {
                if now >= d {
                    return Err(PgmError::Timeout);
                }
            }
            let next = self.next_wakeup(now);
            let mut wait = next
                .map(|t| t.saturating_duration_since(now))
                .unwrap_or(MAX_WAIT_SLICE);
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(now));
            }
            wait = wait.min(MAX_WAIT_SLICE).max(Duration::from_millis(1));
            self.transport.wait_readable(wait)?;
        }
    }

    /// Services timers and I/O without receiving; pure senders call this
    /// (or `send`) at least as often as `next_wakeup` demands.
    pub fn poll(&self) -> PgmResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PgmError::Engine("socket is closed".into()));
        }
        self.pump()
    }

    /// Next instant the endpoint needs servicing: SPM schedule, NAK state
    /// deadlines, peer expiries, deferred repairs.
    pub fn next_wakeup(&self, now: Instant) -> Option<Instant> {
        self.prepare_wakeup(now)
    }

    /// Recomputes the timer core's scalar from the component deadlines.
    fn prepare_wakeup(&self, now: Instant) -> Option<Instant> {
        let send_deadline = self
            .send_side
            .lock()
            .as_mut()
            .and_then(|s| s.next_deadline(now));
        let recv_deadline = self
            .recv_side
            .lock()
            .as_ref()
            .and_then(|r| r.next_deadline(now));
        self.timers.lock().prepare([send_deadline, recv_deadline])
    }

    /// Flushes the send side, announces the session end with an OPT_FIN
    /// SPM, and releases all peers. Blocking receivers notice within one
    /// wait slice.
    pub fn close(&self) -> PgmResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let out = {
            let mut send = self.send_side.lock();
            match send.take() {
                Some(mut source) => source.close(),
                None => Vec::new(),
            }
        };
        let result = self.transmit(out);
        *self.recv_side.lock() = None;
        if let Err(err) = &result {
            warn!(%err, "close flush failed");
        }
        result
    }
}

impl Drop for PgmSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
