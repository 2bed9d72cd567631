//! Send-side protocol state machine.
//!
//! Owns the transmit window, the rate buckets, the SPM schedule, and the
//! parity encoder. The endpoint feeds it APDUs and inbound upstream
//! packets (NAK, SPMR); it answers with the downstream packets that are
//! due, each already checksummed and rate-gated.

use crate::error::PgmError;
use crate::options::FecParams;
use crate::rate::{RateBucket, RateDecision};
use crate::skb::{Skb, SkbMeta};
use crate::timer::SpmSchedule;
use crate::transport::Outbound;
use crate::txw::{fragment_plan, NakOutcome, Repair, TransmitWindow, TxwError};
use pgm_fec::{ReedSolomon, DEFAULT_N};
use pgm_proto::options::{OptFragment, OptParityPrm, OptionSet, PARITY_PRM_OND, PARITY_PRM_PRO};
use pgm_proto::packet::{
    DataPacket, NakPacket, PacketBody, PacketType, PgmPacket, Spm, OPT_PARITY, OPT_VAR_PKTLEN,
};
use pgm_proto::{Sqn, Tsi};
use rand::RngCore;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub max_tsdu: usize,
    pub max_tsdu_fragment: usize,
    pub max_apdu_fragments: usize,
    pub txw_capacity: usize,
    pub txw_max_rte: u64,
    pub nak_rte: u64,
    pub ambient_spm: Duration,
    pub heartbeat_spm: Vec<Duration>,
    pub fec: Option<FecParams>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SourceStats {
    pub apdus_sent: u64,
    pub odata_sent: u64,
    pub rdata_sent: u64,
    pub parity_sent: u64,
    pub spms_sent: u64,
    pub naks_ignored: u64,
    pub nnaks: u64,
    pub acks: u64,
}

#[derive(Debug)]
struct TxFec {
    rs: ReedSolomon,
    params: FecParams,
    /// Next on-demand parity index per transmission group.
    next_parity: HashMap<u32, u32>,
}

#[derive(Debug)]
pub struct Source {
    tsi: Tsi,
    dport: u16,
    nla: IpAddr,
    config: SourceConfig,
    txw: TransmitWindow,
    data_bucket: RateBucket,
    repair_bucket: RateBucket,
    spm_sqn: Sqn,
    spm: SpmSchedule,
    fec: Option<TxFec>,
    /// Encoded ODATA and proactive parity awaiting the data bucket.
    pending: VecDeque<Skb>,
    stats: SourceStats,
}

impl Source {
    pub fn new(
        tsi: Tsi,
        dport: u16,
        nla: IpAddr,
        config: SourceConfig,
        now: Instant,
        rng: &mut dyn RngCore,
    ) -> Result<Self, PgmError> {
        let mut initial = Sqn(rng.next_u32());
        let fec = match &config.fec {
            Some(params) => {
                let k = params.group_size as usize;
                let rs = ReedSolomon::new(DEFAULT_N, k)
                    .map_err(|e| PgmError::Config(e.to_string()))?;
                // Transmission groups align to multiples of k.
                initial = Sqn(initial.0 - initial.0 % k as u32);
                Some(TxFec {
                    rs,
                    params: *params,
                    next_parity: HashMap::new(),
                })
            }
            None => None,
        };
        let data_bucket = if config.txw_max_rte > 0 {
            RateBucket::new(config.txw_max_rte, now)
        } else {
            RateBucket::unlimited(now)
        };
        let repair_bucket = if config.nak_rte > 0 {
            RateBucket::new(config.nak_rte, now)
        } else {
            RateBucket::unlimited(now)
        };
        Ok(Source {
            tsi,
            dport,
            nla,
            txw: TransmitWindow::new(config.txw_capacity, initial),
            data_bucket,
            repair_bucket,
            spm_sqn: Sqn(0),
            spm: SpmSchedule::new(config.ambient_spm, config.heartbeat_spm.clone(), now),
            fec,
            pending: VecDeque::new(),
            stats: SourceStats::default(),
            config,
        })
    }

    pub fn tsi(&self) -> Tsi {
        self.tsi
    }

    pub fn stats(&self) -> SourceStats {
        self.stats
    }

    pub fn txw(&self) -> &TransmitWindow {
        &self.txw
    }

    /// Enqueues one APDU: assigns sequence numbers, fragments when it
    /// exceeds one TSDU, and retains everything for repair. Transmission
    /// itself happens in `poll` under the rate bucket.
    pub fn send_apdu(&mut self, data: &[u8], now: Instant) -> Result<usize, PgmError> {
        if data.is_empty() {
            return Ok(0);
        }
        let fragmented = data.len() > self.config.max_tsdu;
        if fragmented && self.fec.is_some() {
            // Parity symbols carry no fragment metadata, so a repaired
            // fragment could not rejoin its APDU.
            return Err(PgmError::Config(
                "fragmented APDUs cannot join parity groups".into(),
            ));
        }
        let plan = if fragmented {
            fragment_plan(
                data.len(),
                self.config.max_tsdu_fragment,
                self.config.max_apdu_fragments,
            )
            .map_err(|e| match e {
                TxwError::ApduTooLarge { .. } => PgmError::Config(e.to_string()),
                other => PgmError::Engine(other.to_string()),
            })?
        } else {
            vec![0..data.len()]
        };

        if self.txw.len() + plan.len() > self.txw.capacity() {
            return Err(PgmError::WouldBlock);
        }

        let first_sqn = self.txw.next_lead();
        let multi = plan.len() > 1;
        for range in plan {
            let sqn = self.txw.next_lead();
            let fragment = multi.then(|| OptFragment {
                apdu_first_sqn: first_sqn,
                offset: range.start as u32,
                apdu_len: data.len() as u32,
            });
            let skb = self.build_odata(sqn, &data[range], fragment);
            self.txw
                .push(skb.clone())
                .map_err(|e| PgmError::Engine(e.to_string()))?;
            self.pending.push_back(skb);
            self.stats.odata_sent += 1;
            self.maybe_proactive_parity(sqn);
        }
        self.stats.apdus_sent += 1;
        self.spm.reset_heartbeat(now);
        trace!(tsi = %self.tsi, %first_sqn, len = data.len(), "APDU queued");
        Ok(data.len())
    }

    fn build_odata(&self, sqn: Sqn, payload: &[u8], fragment: Option<OptFragment>) -> Skb {
        let trail = self.txw.trail();
        let mut options = OptionSet::default();
        options.fragment = fragment;
        let packet = PgmPacket::new(
            self.tsi.sport,
            self.dport,
            self.tsi.gsi,
            PacketBody::Odata(DataPacket {
                sqn,
                trail,
                options,
                payload: payload.to_vec(),
            }),
        );
        let wire = packet.encode();
        let payload_range = wire.len() - payload.len()..wire.len();
        Skb::new(
            wire,
            payload_range,
            SkbMeta {
                tsi: self.tsi,
                packet_type: PacketType::Odata,
                sqn,
                trail,
                fragment,
                parity_index: None,
            },
        )
    }

    /// After the last packet of a transmission group, queue the configured
    /// proactive parity.
    fn maybe_proactive_parity(&mut self, sqn: Sqn) {
        let Some(fec) = &self.fec else {
            return;
        };
        let k = fec.params.group_size as u32;
        let proactive = fec.params.proactive_packets as u32;
        if proactive == 0 || sqn.0.wrapping_add(1) % k != 0 {
            return;
        }
        let group = Sqn(sqn.0.wrapping_add(1).wrapping_sub(k));
        for h in 0..proactive {
            match self.build_parity_skb(group, h) {
                Some(skb) => {
                    self.pending.push_back(skb);
                    self.stats.parity_sent += 1;
                }
                None => warn!(tsi = %self.tsi, %group, "proactive parity unavailable"),
            }
        }
    }

    fn build_parity_skb(&self, group: Sqn, h: u32) -> Option<Skb> {
        let fec = self.fec.as_ref()?;
        let k = fec.params.group_size as usize;
        let var = fec.params.var_pktlen;
        let payloads = self.txw.group_payloads(group, k)?;
        let data_max = payloads.iter().map(|p| p.len()).max()?;
        let symbol_len = data_max + if var { 2 } else { 0 };

        let symbols: Vec<Vec<u8>> = payloads
            .iter()
            .map(|p| {
                let mut s = p.to_vec();
                if var {
                    let plen = s.len() as u16;
                    s.resize(symbol_len - 2, 0);
                    s.extend_from_slice(&plen.to_be_bytes());
                } else {
                    s.resize(symbol_len, 0);
                }
                s
            })
            .collect();
        let refs: Vec<&[u8]> = symbols.iter().map(|s| s.as_slice()).collect();
        let mut parity = vec![0u8; symbol_len];
        if let Err(err) = fec.rs.encode(&refs, k + h as usize, &mut parity) {
            warn!(tsi = %self.tsi, %group, %err, "parity encode failed");
            return None;
        }

        let trail = self.txw.trail();
        let mut options = OptionSet::default();
        options.parity_grp = Some(h);
        let mut packet = PgmPacket::new(
            self.tsi.sport,
            self.dport,
            self.tsi.gsi,
            PacketBody::Rdata(DataPacket {
                sqn: group,
                trail,
                options,
                payload: parity,
            }),
        );
        packet.header.flags |= OPT_PARITY;
        if var {
            packet.header.flags |= OPT_VAR_PKTLEN;
        }
        let wire = packet.encode();
        let payload_range = wire.len() - symbol_len..wire.len();
        Some(Skb::new(
            wire,
            payload_range,
            SkbMeta {
                tsi: self.tsi,
                packet_type: PacketType::Rdata,
                sqn: group,
                trail,
                fragment: None,
                parity_index: Some(h),
            },
        ))
    }

    /// Rebuilds an RDATA packet from a retained ODATA skb, with the
    /// current trailing edge.
    fn build_rdata(&self, skb: &Skb) -> Vec<u8> {
        let meta = skb.meta();
        let mut options = OptionSet::default();
        options.fragment = meta.fragment;
        let packet = PgmPacket::new(
            self.tsi.sport,
            self.dport,
            self.tsi.gsi,
            PacketBody::Rdata(DataPacket {
                sqn: meta.sqn,
                trail: self.txw.trail(),
                options,
                payload: skb.payload().to_vec(),
            }),
        );
        packet.encode()
    }

    fn build_spm(&mut self, fin: bool) -> Vec<u8> {
        let mut options = OptionSet::default();
        if let Some(fec) = &self.fec {
            let mut flags = 0u8;
            if fec.params.proactive_packets > 0 {
                flags |= PARITY_PRM_PRO;
            }
            if fec.params.ondemand {
                flags |= PARITY_PRM_OND;
            }
            options.parity_prm = Some(OptParityPrm {
                flags,
                group_size: fec.params.group_size as u32,
            });
        }
        if fin {
            options.fin = true;
        }
        let mut packet = PgmPacket::new(
            self.tsi.sport,
            self.dport,
            self.tsi.gsi,
            PacketBody::Spm(Spm {
                spm_sqn: self.spm_sqn,
                trail: self.txw.trail(),
                lead: self.txw.lead(),
                nla: self.nla,
                options,
            }),
        );
        if self.fec.as_ref().is_some_and(|f| f.params.var_pktlen) {
            packet.header.flags |= OPT_VAR_PKTLEN;
        }
        self.spm_sqn = self.spm_sqn.next();
        self.stats.spms_sent += 1;
        packet.encode()
    }

    /// A NAK (or its OPT_NAK_LIST tail) queues repairs; sequence numbers
    /// the window has discarded are answered with an NCF carrying no data.
    pub fn handle_nak(&mut self, header_flags: u8, nak: &NakPacket) -> Vec<Outbound> {
        let mut out = Vec::new();
        let parity_nak = header_flags & OPT_PARITY != 0;
        if parity_nak {
            if self.fec.as_ref().is_some_and(|f| f.params.ondemand) {
                let count = 1 + nak.options.nak_list.len() as u32;
                self.txw.queue_parity_nak(nak.sqn, count);
            } else {
                self.stats.naks_ignored += 1;
            }
            return out;
        }

        let mut missing: Vec<Sqn> = Vec::new();
        for sqn in std::iter::once(nak.sqn).chain(nak.options.nak_list.iter().copied()) {
            match self.txw.queue_nak(sqn) {
                NakOutcome::Queued | NakOutcome::Eliminated => {}
                NakOutcome::Missing => missing.push(sqn),
            }
        }
        if !missing.is_empty() {
            debug!(tsi = %self.tsi, count = missing.len(), "NAK for discarded data");
            let mut options = OptionSet::default();
            for &sqn in &missing[1..] {
                options.nak_list.push(sqn);
            }
            let ncf = PgmPacket::new(
                self.tsi.sport,
                self.dport,
                self.tsi.gsi,
                PacketBody::Ncf(NakPacket {
                    sqn: missing[0],
                    src_nla: self.nla,
                    grp_nla: nak.grp_nla,
                    options,
                }),
            );
            out.push(Outbound::group(ncf.encode()));
        }
        out
    }

    /// An SPMR solicits the source path: the scheduled SPM is pulled
    /// forward and fired through the schedule, so answering also restarts
    /// the ambient cadence from now.
    pub fn handle_spmr(&mut self, now: Instant) -> Vec<Outbound> {
        self.spm.expedite(now);
        let mut out = Vec::new();
        if self.spm.fire(now) {
            out.push(Outbound::group(self.build_spm(false)));
        }
        out
    }

    pub fn handle_nnak(&mut self) {
        self.stats.nnaks += 1;
    }

    pub fn handle_ack(&mut self) {
        // PGMCC is not implemented; ACKs are counted and dropped.
        self.stats.acks += 1;
    }

    /// Emits everything that is due: scheduled SPMs, rate-gated original
    /// data, and rate-gated repairs.
    pub fn poll(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();

        if self.spm.fire(now) {
            out.push(Outbound::group(self.build_spm(false)));
        }

        while let Some(skb) = self.pending.front() {
            let len = skb.wire().len();
            match self.data_bucket.check(len, now) {
                RateDecision::Accept => {
                    self.data_bucket.consume(len);
                    let skb = self.pending.pop_front().expect("front just observed");
                    out.push(Outbound::group(skb.wire().to_vec()));
                }
                RateDecision::Defer(_) => break,
            }
        }

        'repairs: while let Some(repair) = self.txw.pop_repair() {
            match repair {
                Repair::Selective(skb) => {
                    let bytes = self.build_rdata(&skb);
                    match self.repair_bucket.check(bytes.len(), now) {
                        RateDecision::Accept => {
                            self.repair_bucket.consume(bytes.len());
                            self.stats.rdata_sent += 1;
                            out.push(Outbound::group(bytes));
                        }
                        RateDecision::Defer(_) => {
                            self.txw.push_repair_front(Repair::Selective(skb));
                            break 'repairs;
                        }
                    }
                }
                Repair::Parity { group, count } => {
                    for i in 0..count {
                        let h = self.next_parity_index(group);
                        let Some(skb) = self.build_parity_skb(group, h) else {
                            debug!(tsi = %self.tsi, %group, "parity request unservable");
                            break;
                        };
                        let len = skb.wire().len();
                        match self.repair_bucket.check(len, now) {
                            RateDecision::Accept => {
                                self.repair_bucket.consume(len);
                                self.stats.parity_sent += 1;
                                out.push(Outbound::group(skb.wire().to_vec()));
                            }
                            RateDecision::Defer(_) => {
                                self.txw.push_repair_front(Repair::Parity {
                                    group,
                                    count: count - i,
                                });
                                break 'repairs;
                            }
                        }
                    }
                }
            }
        }

        out
    }

    fn next_parity_index(&mut self, group: Sqn) -> u32 {
        let Some(fec) = self.fec.as_mut() else {
            return 0;
        };
        let span = (DEFAULT_N - fec.params.group_size as usize) as u32;
        let counter = fec.next_parity.entry(group.0).or_insert(0);
        let h = *counter % span;
        *counter += 1;
        h
    }

    /// Next instant this source needs servicing.
    pub fn next_deadline(&mut self, now: Instant) -> Option<Instant> {
        let mut next = self.spm.next_expiry();
        if let Some(skb) = self.pending.front() {
            let at = match self.data_bucket.check(skb.wire().len(), now) {
                RateDecision::Accept => now,
                RateDecision::Defer(d) => now + d,
            };
            next = next.min(at);
        }
        if self.txw.has_repairs() {
            let at = match self.repair_bucket.check(self.config.max_tsdu, now) {
                RateDecision::Accept => now,
                RateDecision::Defer(d) => now + d,
            };
            next = next.min(at);
        }
        Some(next)
    }

    /// Flushes whatever is still queued and announces the session end.
    pub fn close(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Some(skb) = self.pending.pop_front() {
            out.push(Outbound::group(skb.wire().to_vec()));
        }
        out.push(Outbound::group(self.build_spm(true)));
        debug!(tsi = %self.tsi, "session closed");
        out
    }
}
