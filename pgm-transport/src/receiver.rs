//! Receive-side protocol state machine.
//!
//! Decodes nothing itself: the endpoint parses datagrams and hands typed
//! packets here. This component owns the peer map, routes each packet to
//! the right peer's receive window, answers POLLs, overhears SPMRs for
//! suppression, and drives every peer's NAK state machine from the timer
//! path, emitting the upstream packets that fall due.

use crate::peer::Peer;
use crate::rxw::{Insert, RxMessage, RxwConfig};
use crate::skb::{Skb, SkbMeta};
use crate::timer;
use crate::transport::Outbound;
use pgm_fec::DEFAULT_N;
use pgm_proto::options::OptionSet;
use pgm_proto::packet::{
    DataPacket, NakPacket, PacketBody, PgmPacket, Poll, Polr, Spm, Spmr, OPT_PARITY,
    OPT_VAR_PKTLEN,
};
use pgm_proto::{Tsi, NAK_LIST_MAX};
use rand::RngCore;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub rxw: RxwConfig,
    pub peer_expiry: Duration,
    pub spmr_expiry: Duration,
    /// Session destination port; the source port of our upstream packets.
    pub dport: u16,
    pub group: IpAddr,
}

/// Head of the delivery queue, as seen by `recvmsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Front {
    Data(Tsi),
    Loss(Tsi),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ReceiverStats {
    pub packets: u64,
    pub stale_spms: u64,
    pub peers_created: u64,
    pub peers_expired: u64,
    pub resets: u64,
}

#[derive(Debug)]
pub struct Receiver {
    config: ReceiverConfig,
    peers: HashMap<Tsi, Peer>,
    /// Peer delivery order, oldest session first.
    order: Vec<Tsi>,
    /// Random identity for POLL predicate matching.
    poll_rand: u32,
    stats: ReceiverStats,
}

impl Receiver {
    pub fn new(config: ReceiverConfig, rng: &mut dyn RngCore) -> Self {
        Receiver {
            config,
            peers: HashMap::new(),
            order: Vec::new(),
            poll_rand: rng.next_u32(),
            stats: ReceiverStats::default(),
        }
    }

    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer(&self, tsi: &Tsi) -> Option<&Peer> {
        self.peers.get(tsi)
    }

    fn peer_entry(&mut self, tsi: Tsi, now: Instant) -> &mut Peer {
        if !self.peers.contains_key(&tsi) {
            debug!(%tsi, "new peer");
            self.stats.peers_created += 1;
            let peer = Peer::new(tsi, self.config.rxw.clone(), now, self.config.spmr_expiry);
            self.peers.insert(tsi, peer);
            self.order.push(tsi);
        }
        self.peers.get_mut(&tsi).expect("peer just ensured")
    }

    /// Routes one downstream packet. Returns any packets to emit now.
    pub fn handle_packet(
        &mut self,
        packet: &PgmPacket,
        now: Instant,
        rng: &mut dyn RngCore,
    ) -> Vec<Outbound> {
        self.stats.packets += 1;
        let tsi = packet.tsi();
        match &packet.body {
            PacketBody::Odata(data) | PacketBody::Rdata(data) => {
                self.handle_data(tsi, packet, data, now, rng);
                Vec::new()
            }
            PacketBody::Spm(spm) => {
                self.handle_spm(tsi, packet, spm, now);
                Vec::new()
            }
            PacketBody::Ncf(ncf) => {
                self.handle_ncf(tsi, ncf, now);
                Vec::new()
            }
            PacketBody::Spmr(_) => {
                self.handle_overheard_spmr(tsi, now);
                Vec::new()
            }
            PacketBody::Poll(poll) => self.handle_poll(tsi, poll),
            // Upstream traffic from other receivers carries nothing for us.
            PacketBody::Nak(_) | PacketBody::NullNak(_) | PacketBody::Ack(_)
            | PacketBody::Polr(_) => {
                trace!(%tsi, ptype = ?packet.header.packet_type, "ignoring upstream packet");
                Vec::new()
            }
        }
    }

    fn handle_data(
        &mut self,
        tsi: Tsi,
        packet: &PgmPacket,
        data: &DataPacket,
        now: Instant,
        rng: &mut dyn RngCore,
    ) {
        let is_parity = packet.header.flags & OPT_PARITY != 0;
        let meta = SkbMeta {
            tsi,
            packet_type: packet.header.packet_type,
            sqn: data.sqn,
            trail: data.trail,
            fragment: data.options.fragment,
            parity_index: if is_parity {
                Some(data.options.parity_grp.unwrap_or(0))
            } else {
                None
            },
        };
        let payload_len = data.payload.len();
        let skb = Skb::new(data.payload.clone(), 0..payload_len, meta);

        let peer = self.peer_entry(tsi, now);
        peer.last_activity = now;
        match peer.rxw.insert(skb, now, rng) {
            Insert::Stored => {}
            Insert::Duplicate => trace!(%tsi, sqn = %data.sqn, "duplicate"),
            Insert::OutOfWindow => trace!(%tsi, sqn = %data.sqn, "out of window"),
        }
    }

    fn handle_spm(&mut self, tsi: Tsi, packet: &PgmPacket, spm: &Spm, now: Instant) {
        let var_pktlen = packet.header.flags & OPT_VAR_PKTLEN != 0;
        let rxw_config = self.config.rxw.clone();
        let peer = self.peer_entry(tsi, now);
        peer.last_activity = now;
        if !peer.accept_spm(spm.spm_sqn) {
            self.stats.stale_spms += 1;
            return;
        }
        peer.nla = Some(spm.nla);
        peer.spmr_deadline = None;

        if spm.options.rst {
            warn!(%tsi, "session aborted by source");
            peer.reset_pending = true;
            self.stats.resets += 1;
            return;
        }
        if spm.options.syn {
            // Session (re)start: discard any stale window.
            peer.rxw = crate::rxw::ReceiveWindow::new(tsi, rxw_config);
        }
        if spm.options.fin {
            debug!(%tsi, "session finished by source");
            peer.fin_seen = true;
        }
        if let Some(prm) = &spm.options.parity_prm {
            let k = prm.group_size as usize;
            if peer.rxw.fec_params() != Some((DEFAULT_N, k)) {
                peer.rxw.set_fec(DEFAULT_N, k, var_pktlen);
            }
        }
        peer.rxw.update_trail(spm.trail);
    }

    fn handle_ncf(&mut self, tsi: Tsi, ncf: &NakPacket, now: Instant) {
        if let Some(peer) = self.peers.get_mut(&tsi) {
            peer.last_activity = now;
            peer.rxw.confirm(ncf.sqn, now);
            for &sqn in &ncf.options.nak_list {
                peer.rxw.confirm(sqn, now);
            }
        }
    }

    /// Another receiver multicast an SPMR for this session; ours can wait.
    fn handle_overheard_spmr(&mut self, tsi: Tsi, now: Instant) {
        if let Some(peer) = self.peers.get_mut(&tsi) {
            if peer.spmr_deadline.is_some() {
                peer.spmr_deadline = Some(now + self.config.spmr_expiry);
            }
        }
    }

    fn handle_poll(&mut self, tsi: Tsi, poll: &Poll) -> Vec<Outbound> {
        // Answer when the poll's random-mask predicate selects us.
        let rand = u32::from_be_bytes(poll.rand);
        if poll.mask != 0 && (self.poll_rand & poll.mask) != (rand & poll.mask) {
            return Vec::new();
        }
        let polr = PgmPacket::new(
            self.config.dport,
            tsi.sport,
            tsi.gsi,
            PacketBody::Polr(Polr {
                sqn: poll.sqn,
                round: poll.round,
                options: OptionSet::default(),
            }),
        );
        vec![Outbound::to_source(polr.encode(), poll.nla)]
    }

    /// Advances NAK state machines, solicits missing source paths, and
    /// expires dead peers.
    pub fn timers(&mut self, now: Instant, rng: &mut dyn RngCore) -> Vec<Outbound> {
        let mut out = Vec::new();
        let dport = self.config.dport;
        let group = self.config.group;
        let spmr_expiry = self.config.spmr_expiry;

        for peer in self.peers.values_mut() {
            let naks = peer.rxw.timer_expired(now, rng);
            if !naks.is_empty() {
                if let Some(nla) = peer.nla {
                    for batch in naks.chunks(1 + NAK_LIST_MAX) {
                        let mut options = OptionSet::default();
                        for &sqn in &batch[1..] {
                            options.nak_list.push(sqn);
                        }
                        let nak = PgmPacket::new(
                            dport,
                            peer.tsi.sport,
                            peer.tsi.gsi,
                            PacketBody::Nak(NakPacket {
                                sqn: batch[0],
                                src_nla: nla,
                                grp_nla: group,
                                options,
                            }),
                        );
                        out.push(Outbound::to_source(nak.encode(), nla));
                    }
                } else {
                    trace!(tsi = %peer.tsi, "suppressing NAKs, no source path yet");
                }
            }

            if let Some(deadline) = peer.spmr_deadline {
                if deadline <= now && peer.nla.is_none() {
                    let spmr = PgmPacket::new(
                        dport,
                        peer.tsi.sport,
                        peer.tsi.gsi,
                        PacketBody::Spmr(Spmr {
                            options: OptionSet::default(),
                        }),
                    );
                    // Multicast so sibling receivers suppress their own.
                    out.push(Outbound::group(spmr.encode()));
                    peer.spmr_deadline = Some(now + spmr_expiry);
                }
            }
        }

        let expiry = self.config.peer_expiry;
        let expired: Vec<Tsi> = self
            .peers
            .iter()
            .filter(|(_, p)| p.is_expired(now, expiry))
            .map(|(t, _)| *t)
            .collect();
        for tsi in expired {
            debug!(%tsi, "peer expired");
            self.stats.peers_expired += 1;
            self.peers.remove(&tsi);
            self.order.retain(|t| *t != tsi);
        }

        out
    }

    /// Earliest deadline across all peers, for the endpoint timer scalar.
    pub fn next_deadline(&self, _now: Instant) -> Option<Instant> {
        let expiry = self.config.peer_expiry;
        timer::earliest(self.peers.values().flat_map(|p| {
            [
                p.rxw.next_deadline(),
                p.spmr_deadline,
                Some(p.last_activity + expiry),
            ]
        }))
    }

    /// Next in-order delivery across peers: data, or a loss report.
    pub fn pop_message(&mut self) -> Option<(Tsi, RxMessage)> {
        // Session resets outrank buffered data.
        for tsi in &self.order {
            if let Some(peer) = self.peers.get_mut(tsi) {
                if peer.reset_pending {
                    peer.reset_pending = false;
                    let commit = peer.rxw.commit();
                    return Some((*tsi, RxMessage::Lost { first: commit, count: 0 }));
                }
            }
        }
        for tsi in &self.order {
            if let Some(peer) = self.peers.get_mut(tsi) {
                if let Some(msg) = peer.rxw.pop_message() {
                    return Some((*tsi, msg));
                }
            }
        }
        None
    }

    /// What `pop_message` would return next, without consuming it.
    pub fn front(&self) -> Option<Front> {
        for tsi in &self.order {
            if let Some(peer) = self.peers.get(tsi) {
                if peer.reset_pending {
                    return Some(Front::Loss(*tsi));
                }
            }
        }
        for tsi in &self.order {
            if let Some(peer) = self.peers.get(tsi) {
                match peer.rxw.peek_message() {
                    Some(RxMessage::Data(_)) => return Some(Front::Data(*tsi)),
                    Some(RxMessage::Lost { .. }) => return Some(Front::Loss(*tsi)),
                    None => {}
                }
            }
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        self.peers
            .values()
            .any(|p| p.rxw.has_pending() || p.reset_pending)
    }
}
