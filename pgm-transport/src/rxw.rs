//! Receiver-side receive window.
//!
//! A per-source circular buffer that places arriving data at its sequence
//! number, detects holes, drives the NAK state machine for each missing
//! packet, reconstructs erased packets from parity, reassembles fragmented
//! APDUs, and delivers contiguous data in order.
//!
//! Slot states advance monotonically:
//!
//! ```text
//! Missing -> (first NAK) -> WaitNcf -> (NCF) -> WaitData -> HaveData
//!    WaitData -(timeout)-> BackOff -(NAK resent)-> WaitNcf
//!    any pre-data state -(retries exhausted or trail passed)-> Lost
//!    HaveData -(contiguous, APDU complete)-> Committed
//! ```

use crate::skb::{Skb, SkbMeta};
use pgm_fec::ReedSolomon;
use pgm_proto::{PacketType, Sqn, Tsi};
use rand::Rng;
use rand::RngCore;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone)]
pub struct RxwConfig {
    pub capacity: usize,
    pub nak_bo_ivl: Duration,
    pub nak_rpt_ivl: Duration,
    pub nak_rdata_ivl: Duration,
    pub nak_ncf_retries: u32,
    pub nak_data_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Hole discovered; first NAK not yet sent.
    Missing,
    /// Retry back-off after a Wait-Data timeout.
    BackOff,
    /// NAK sent; awaiting the source's NCF.
    WaitNcf,
    /// NCF seen; awaiting RDATA.
    WaitData,
    HaveData,
    HaveParity,
    Lost,
    Committed,
}

impl SlotState {
    fn awaits_data(self) -> bool {
        matches!(
            self,
            SlotState::Missing | SlotState::BackOff | SlotState::WaitNcf | SlotState::WaitData
        )
    }
}

#[derive(Debug)]
struct RxSlot {
    state: SlotState,
    skb: Option<Skb>,
    deadline: Option<Instant>,
    ncf_retry: u32,
    data_retry: u32,
}

impl RxSlot {
    fn missing(deadline: Instant) -> Self {
        RxSlot {
            state: SlotState::Missing,
            skb: None,
            deadline: Some(deadline),
            ncf_retry: 0,
            data_retry: 0,
        }
    }

    fn with_data(skb: Skb) -> Self {
        let state = if skb.is_parity() {
            SlotState::HaveParity
        } else {
            SlotState::HaveData
        };
        RxSlot {
            state,
            skb: Some(skb),
            deadline: None,
            ncf_retry: 0,
            data_retry: 0,
        }
    }
}

/// One entry of the in-order delivery queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxMessage {
    /// A complete APDU.
    Data(Vec<u8>),
    /// `count` sequence numbers from `first` were declared lost; reported
    /// exactly once, then the range counts as committed.
    Lost { first: Sqn, count: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Stored,
    Duplicate,
    OutOfWindow,
}

#[derive(Debug, Clone)]
struct RxFec {
    rs: ReedSolomon,
    k: u32,
    var_pktlen: bool,
}

#[derive(Debug)]
pub struct ReceiveWindow {
    tsi: Tsi,
    slots: Vec<Option<RxSlot>>,
    config: RxwConfig,
    defined: bool,
    trail: Sqn,
    commit: Sqn,
    lead: Sqn,
    delivery: VecDeque<RxMessage>,
    fec: Option<RxFec>,
    lost_count: u64,
    dup_count: u64,
    committed_count: u64,
}

impl ReceiveWindow {
    pub fn new(tsi: Tsi, config: RxwConfig) -> Self {
        assert!(config.capacity > 0);
        let mut slots = Vec::with_capacity(config.capacity);
        slots.resize_with(config.capacity, || None);
        ReceiveWindow {
            tsi,
            slots,
            config,
            defined: false,
            trail: Sqn(0),
            commit: Sqn(0),
            lead: Sqn(0),
            delivery: VecDeque::new(),
            fec: None,
            lost_count: 0,
            dup_count: 0,
            committed_count: 0,
        }
    }

    /// Enables parity reconstruction with the source's advertised RS
    /// parameters.
    pub fn set_fec(&mut self, n: usize, k: usize, var_pktlen: bool) -> bool {
        match ReedSolomon::new(n, k) {
            Ok(rs) => {
                self.fec = Some(RxFec {
                    rs,
                    k: k as u32,
                    var_pktlen,
                });
                true
            }
            Err(err) => {
                warn!(tsi = %self.tsi, %err, "rejecting parity parameters");
                false
            }
        }
    }

    pub fn trail(&self) -> Sqn {
        self.trail
    }

    pub fn lead(&self) -> Sqn {
        self.lead
    }

    pub fn commit(&self) -> Sqn {
        self.commit
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn lost_count(&self) -> u64 {
        self.lost_count
    }

    /// The active RS parameters, if parity reconstruction is enabled.
    pub fn fec_params(&self) -> Option<(usize, usize)> {
        self.fec.as_ref().map(|f| (f.rs.n(), f.rs.k()))
    }

    pub fn dup_count(&self) -> u64 {
        self.dup_count
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn.0 as usize) % self.config.capacity
    }

    fn slot(&self, sqn: Sqn) -> Option<&RxSlot> {
        self.slots[(sqn.0 as usize) % self.config.capacity].as_ref()
    }

    fn slot_mut(&mut self, sqn: Sqn) -> Option<&mut RxSlot> {
        let idx = self.index(sqn);
        self.slots[idx].as_mut()
    }

    fn backoff_deadline(&self, now: Instant, rng: &mut dyn RngCore) -> Instant {
        // rand(0.5, 1.5) jitter decorrelates first NAKs across receivers.
        let jitter = rng.gen_range(0.5..1.5);
        now + self.config.nak_bo_ivl.mul_f64(jitter)
    }

    /// Places one data or parity packet. Holes opened by a leap in the
    /// lead are marked Missing with a randomized first-NAK deadline.
    pub fn insert(&mut self, skb: Skb, now: Instant, rng: &mut dyn RngCore) -> Insert {
        if !self.defined {
            self.define(&skb, now, rng);
        }

        if skb.is_parity() {
            let outcome = self.insert_parity(skb, now);
            self.try_commit();
            return outcome;
        }

        let s = skb.sqn();
        if s.lt(self.trail) {
            self.dup_count += 1;
            return Insert::Duplicate;
        }

        if s.gt(self.lead) {
            self.extend_lead(s, now, rng);
        }

        let outcome = {
            let idx = self.index(s);
            match self.slots[idx].as_mut() {
                Some(slot) if slot.state.awaits_data() => {
                    slot.state = SlotState::HaveData;
                    slot.skb = Some(skb);
                    slot.deadline = None;
                    Insert::Stored
                }
                Some(slot) if slot.state == SlotState::Lost => {
                    // Too late: the slot was already reported as a gap.
                    trace!(tsi = %self.tsi, sqn = %s, "repair after loss declaration");
                    self.dup_count += 1;
                    Insert::Duplicate
                }
                Some(_) => {
                    self.dup_count += 1;
                    Insert::Duplicate
                }
                None => {
                    self.slots[idx] = Some(RxSlot::with_data(skb));
                    Insert::Stored
                }
            }
        };

        if outcome == Insert::Stored {
            if let Some(group) = self.group_of(s) {
                self.try_fec_repair(group);
            }
            self.try_commit();
        }
        outcome
    }

    /// First packet from this source: the window takes its edges from the
    /// packet, requesting backfill down to its advertised trail when that
    /// still fits.
    fn define(&mut self, skb: &Skb, now: Instant, rng: &mut dyn RngCore) {
        let s = skb.sqn();
        let adv = skb.meta().trail;
        let base = if s.wrapping_sub(adv) < self.config.capacity as u32 && adv.lte(s) {
            adv
        } else {
            s
        };
        self.trail = base;
        self.commit = base;
        self.lead = s;
        self.defined = true;
        for g in base.range_to(s) {
            let idx = self.index(g);
            self.slots[idx] = Some(RxSlot::missing(self.backoff_deadline(now, rng)));
        }
        debug!(tsi = %self.tsi, trail = %base, lead = %s, "window defined");
    }

    fn extend_lead(&mut self, s: Sqn, now: Instant, rng: &mut dyn RngCore) {
        // An arrival beyond the capacity forces the trailing edge onward;
        // whatever falls off unrecovered is declared lost.
        if s.wrapping_sub(self.trail) >= self.config.capacity as u32 {
            let new_trail = Sqn(s.0.wrapping_sub(self.config.capacity as u32 - 1));
            warn!(tsi = %self.tsi, %new_trail, "window overrun, forcing trail");
            self.declare_lost_below(new_trail);
        }
        for g in self.lead.next().range_to(s) {
            let idx = self.index(g);
            debug_assert!(self.slots[idx].is_none());
            self.slots[idx] = Some(RxSlot::missing(self.backoff_deadline(now, rng)));
        }
        self.lead = s;
    }

    fn insert_parity(&mut self, skb: Skb, _now: Instant) -> Insert {
        let Some(fec) = self.fec.clone() else {
            self.dup_count += 1;
            return Insert::OutOfWindow;
        };
        let group = skb.sqn();
        if group.lt(self.trail) {
            self.dup_count += 1;
            return Insert::Duplicate;
        }
        // Parity fills the first slot of its group still waiting for data.
        let group_end = group.wrapping_add(fec.k);
        for s in group.range_to(group_end) {
            if s.gt(self.lead) {
                break;
            }
            let idx = self.index(s);
            if let Some(slot) = self.slots[idx].as_mut() {
                if slot.state.awaits_data() {
                    slot.state = SlotState::HaveParity;
                    slot.skb = Some(skb);
                    slot.deadline = None;
                    self.try_fec_repair(group);
                    return Insert::Stored;
                }
            }
        }
        self.dup_count += 1;
        Insert::Duplicate
    }

    /// Transmission group containing `s`. Sources align groups to
    /// multiples of k.
    fn group_of(&self, s: Sqn) -> Option<Sqn> {
        let fec = self.fec.as_ref()?;
        Some(Sqn(s.0 - (s.0 % fec.k)))
    }

    /// Reconstructs erased packets once every slot of the group holds
    /// either data or a parity symbol. Committed slots keep their payload
    /// until the trail passes, so a partially-delivered group stays
    /// repairable.
    fn try_fec_repair(&mut self, group: Sqn) {
        let Some(fec) = self.fec.clone() else {
            return;
        };
        let k = fec.k;
        let group_end = group.wrapping_add(k);
        if group_end.prev().gt(self.lead) || group.lt(self.trail) {
            return;
        }

        let mut erased: Vec<(usize, u32)> = Vec::new(); // (position, parity index)
        let mut data_len = 0usize;
        let mut parity_len = 0usize;
        for (i, s) in group.range_to(group_end).enumerate() {
            match self.slot(s) {
                Some(slot)
                    if matches!(slot.state, SlotState::HaveData | SlotState::Committed)
                        && slot.skb.is_some() =>
                {
                    let len = slot.skb.as_ref().map_or(0, |skb| skb.payload().len());
                    data_len = data_len.max(len);
                }
                Some(slot) if slot.state == SlotState::HaveParity => {
                    let skb = slot.skb.as_ref().expect("parity slot holds skb");
                    parity_len = parity_len.max(skb.payload().len());
                    let h = skb.meta().parity_index.unwrap_or(0);
                    erased.push((i, h));
                }
                _ => return, // a hole without parity, or a reaped gap
            }
        }
        if erased.is_empty() {
            return;
        }
        // Parity carries full symbols, so its length is authoritative.
        let symbol_len = parity_len.max(if fec.var_pktlen {
            data_len + 2
        } else {
            data_len
        });

        let mut block: Vec<Vec<u8>> = Vec::with_capacity(k as usize);
        let mut offsets: Vec<u8> = Vec::with_capacity(k as usize);
        for (i, s) in group.range_to(group_end).enumerate() {
            let slot = self.slot(s).expect("group slot exists");
            let skb = slot.skb.as_ref().expect("group slot holds skb");
            let is_parity = slot.state == SlotState::HaveParity;
            let mut symbol = skb.payload().to_vec();
            if fec.var_pktlen && !is_parity {
                // Rebuild the source-side symbol: payload, zero padding,
                // then the embedded length.
                let plen = symbol.len() as u16;
                symbol.resize(symbol_len - 2, 0);
                symbol.extend_from_slice(&plen.to_be_bytes());
            } else {
                symbol.resize(symbol_len, 0);
            }
            block.push(symbol);
            let off = match erased.iter().find(|(pos, _)| *pos == i) {
                Some((_, h)) => k + *h,
                None => i as u32,
            };
            offsets.push(off as u8);
        }

        let mut slices: Vec<&mut [u8]> = block.iter_mut().map(|b| b.as_mut_slice()).collect();
        if let Err(err) = fec.rs.decode_parity_inline(&mut slices, &offsets) {
            warn!(tsi = %self.tsi, %group, %err, "parity decode failed");
            return;
        }

        for (pos, _) in erased {
            let s = group.wrapping_add(pos as u32);
            let mut symbol = std::mem::take(&mut block[pos]);
            let len = if fec.var_pktlen {
                let tail = symbol.len().saturating_sub(2);
                let embedded =
                    u16::from_be_bytes([symbol[tail], symbol[tail + 1]]) as usize;
                embedded.min(tail)
            } else {
                symbol.len()
            };
            symbol.truncate(len);
            let meta = SkbMeta {
                tsi: self.tsi,
                packet_type: PacketType::Rdata,
                sqn: s,
                trail: self.trail,
                fragment: None,
                parity_index: None,
            };
            let payload_len = symbol.len();
            let skb = Skb::new(symbol, 0..payload_len, meta);
            if let Some(slot) = self.slot_mut(s) {
                slot.state = SlotState::HaveData;
                slot.skb = Some(skb);
                slot.deadline = None;
            }
        }
        debug!(tsi = %self.tsi, %group, "transmission group reconstructed");
    }

    /// NCF received: stop NAK repeats and wait for the repair data.
    pub fn confirm(&mut self, sqn: Sqn, now: Instant) -> bool {
        let rdata_ivl = self.config.nak_rdata_ivl;
        if let Some(slot) = self.slot_mut(sqn) {
            if matches!(
                slot.state,
                SlotState::Missing | SlotState::BackOff | SlotState::WaitNcf
            ) {
                slot.state = SlotState::WaitData;
                slot.deadline = Some(now + rdata_ivl);
                return true;
            }
        }
        false
    }

    /// The source's trailing edge moved: everything beneath it that never
    /// committed is lost.
    pub fn update_trail(&mut self, spm_trail: Sqn) {
        if !self.defined {
            self.trail = spm_trail;
            self.commit = spm_trail;
            self.lead = spm_trail.prev();
            self.defined = true;
            return;
        }
        if !spm_trail.gt(self.trail) {
            return;
        }
        self.declare_lost_below(spm_trail);
    }

    fn declare_lost_below(&mut self, new_trail: Sqn) {
        let beyond_lead = new_trail.gt(self.lead.next());
        let cut = if beyond_lead { self.lead.next() } else { new_trail };

        for s in self.trail.range_to(cut) {
            let idx = self.index(s);
            if let Some(slot) = self.slots[idx].as_mut() {
                if slot.state != SlotState::Committed && slot.state != SlotState::Lost {
                    slot.state = SlotState::Lost;
                    slot.skb = None;
                    slot.deadline = None;
                    self.lost_count += 1;
                }
            }
        }
        if beyond_lead {
            let first = self.lead.next();
            let count = new_trail.wrapping_sub(first);
            if count > 0 {
                self.lost_count += count as u64;
                self.delivery.push_back(RxMessage::Lost { first, count });
            }
        }
        self.try_commit();

        for s in self.trail.range_to(cut) {
            let idx = self.index(s);
            self.slots[idx] = None;
        }
        self.trail = new_trail;
        if beyond_lead {
            self.commit = new_trail;
            self.lead = new_trail.prev();
        }
    }

    /// Advances the NAK state machines. Returns the sequence numbers for
    /// which a NAK should go out now.
    pub fn timer_expired(&mut self, now: Instant, rng: &mut dyn RngCore) -> Vec<Sqn> {
        if !self.defined {
            return Vec::new();
        }
        let mut naks = Vec::new();
        let mut newly_lost = 0u64;
        let cfg = self.config.clone();
        for s in self.commit.range_to(self.lead.next()) {
            let jitter_deadline = self.backoff_deadline(now, rng);
            let idx = self.index(s);
            let Some(slot) = self.slots[idx].as_mut() else {
                continue;
            };
            let Some(deadline) = slot.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            match slot.state {
                SlotState::Missing | SlotState::BackOff => {
                    if slot.ncf_retry >= cfg.nak_ncf_retries {
                        slot.state = SlotState::Lost;
                        slot.deadline = None;
                        newly_lost += 1;
                    } else {
                        slot.ncf_retry += 1;
                        slot.state = SlotState::WaitNcf;
                        slot.deadline = Some(now + cfg.nak_rpt_ivl);
                        naks.push(s);
                    }
                }
                SlotState::WaitNcf => {
                    // No confirm arrived; repeat the NAK.
                    if slot.ncf_retry >= cfg.nak_ncf_retries {
                        slot.state = SlotState::Lost;
                        slot.deadline = None;
                        newly_lost += 1;
                    } else {
                        slot.ncf_retry += 1;
                        slot.deadline = Some(now + cfg.nak_rpt_ivl);
                        naks.push(s);
                    }
                }
                SlotState::WaitData => {
                    if slot.data_retry >= cfg.nak_data_retries {
                        slot.state = SlotState::Lost;
                        slot.deadline = None;
                        newly_lost += 1;
                    } else {
                        slot.data_retry += 1;
                        slot.state = SlotState::BackOff;
                        slot.deadline = Some(jitter_deadline);
                    }
                }
                _ => {
                    slot.deadline = None;
                }
            }
        }
        if newly_lost > 0 {
            self.lost_count += newly_lost;
            self.try_commit();
        }
        naks
    }

    /// Next NAK-state deadline, for the endpoint's timer scalar.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.defined {
            return None;
        }
        let mut min: Option<Instant> = None;
        for s in self.commit.range_to(self.lead.next()) {
            if let Some(slot) = self.slot(s) {
                if let Some(d) = slot.deadline {
                    min = Some(min.map_or(d, |m: Instant| m.min(d)));
                }
            }
        }
        min
    }

    pub fn pop_message(&mut self) -> Option<RxMessage> {
        self.delivery.pop_front()
    }

    pub fn peek_message(&self) -> Option<&RxMessage> {
        self.delivery.front()
    }

    pub fn has_pending(&self) -> bool {
        !self.delivery.is_empty()
    }

    /// Walks the contiguous prefix at the commit cursor, delivering
    /// complete APDUs and coalesced gap markers.
    fn try_commit(&mut self) {
        loop {
            if self.commit.gt(self.lead) {
                break;
            }
            let s = self.commit;
            let Some(state) = self.slot(s).map(|slot| slot.state) else {
                break;
            };
            match state {
                SlotState::Committed => {
                    self.commit = self.commit.next();
                }
                SlotState::Lost => {
                    let first = s;
                    let mut count = 0u32;
                    while !self.commit.gt(self.lead)
                        && self
                            .slot(self.commit)
                            .is_some_and(|slot| slot.state == SlotState::Lost)
                    {
                        let idx = self.index(self.commit);
                        if let Some(slot) = self.slots[idx].as_mut() {
                            slot.state = SlotState::Committed;
                            slot.skb = None;
                        }
                        count += 1;
                        self.commit = self.commit.next();
                    }
                    debug!(tsi = %self.tsi, %first, count, "gap delivered");
                    self.delivery.push_back(RxMessage::Lost { first, count });
                }
                SlotState::HaveData => {
                    if !self.commit_data(s) {
                        break;
                    }
                }
                _ => break,
            }
        }
    }

    /// Delivers the APDU starting at `s`, or returns false when more
    /// fragments are still outstanding.
    fn commit_data(&mut self, s: Sqn) -> bool {
        let fragment = {
            let slot = self.slot(s).expect("commit slot exists");
            let skb = slot.skb.as_ref().expect("HaveData slot holds skb");
            skb.meta().fragment
        };

        let Some(frag) = fragment else {
            // Whole APDU in one TSDU. The payload stays in the slot for
            // parity repair of its group until the trail reaps it.
            let idx = self.index(s);
            let slot = self.slots[idx].as_mut().expect("commit slot exists");
            let payload = slot
                .skb
                .as_ref()
                .expect("HaveData slot holds skb")
                .payload()
                .to_vec();
            slot.state = SlotState::Committed;
            self.committed_count += 1;
            self.delivery.push_back(RxMessage::Data(payload));
            self.commit = self.commit.next();
            return true;
        };

        if frag.apdu_first_sqn.lt(s) {
            // The APDU's first fragment fell below the window: the rest of
            // it can never be delivered.
            let idx = self.index(s);
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.state = SlotState::Committed;
                slot.skb = None;
            }
            self.lost_count += 1;
            self.delivery.push_back(RxMessage::Lost { first: s, count: 1 });
            self.commit = self.commit.next();
            return true;
        }

        // Fragment 0 at the cursor: check the whole APDU is on hand.
        let total = frag.apdu_len as usize;
        if total == 0 {
            // A fragmented APDU of zero length is nonsense; commit the
            // slot so the cursor cannot stall on it.
            let idx = self.index(s);
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.state = SlotState::Committed;
            }
            self.commit = self.commit.next();
            return true;
        }
        let mut have = 0usize;
        let mut end = s;
        while have < total {
            if end.gt(self.lead) {
                return false;
            }
            let Some(slot) = self.slot(end) else {
                return false;
            };
            if slot.state != SlotState::HaveData {
                return false;
            }
            let skb = slot.skb.as_ref().expect("HaveData slot holds skb");
            match skb.meta().fragment {
                Some(f) if f.apdu_first_sqn == s => have += skb.payload().len(),
                _ => {
                    // Fragment chain broken: treat as malformed and wait
                    // for a repair that will never come; the trail will
                    // eventually reap it.
                    warn!(tsi = %self.tsi, sqn = %end, "inconsistent fragment chain");
                    return false;
                }
            }
            end = end.next();
        }

        let mut apdu = Vec::with_capacity(total);
        for g in s.range_to(end) {
            let idx = self.index(g);
            let slot = self.slots[idx].as_mut().expect("fragment slot exists");
            let skb = slot.skb.as_ref().expect("fragment slot holds skb");
            apdu.extend_from_slice(skb.payload());
            slot.state = SlotState::Committed;
        }
        self.committed_count += 1;
        self.delivery.push_back(RxMessage::Data(apdu));
        self.commit = end;
        true
    }
}
