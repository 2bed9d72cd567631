//! Sender-side transmit window.
//!
//! A fixed-capacity circular buffer of sent ODATA packets indexed by
//! sequence number. Every packet is retained until the trailing edge
//! advances past it, serving retransmissions for NAKs. The window also
//! carries the NAK-elimination bookkeeping and the queue of repairs
//! awaiting the repair-rate bucket.

use crate::skb::Skb;
use pgm_proto::Sqn;
use std::collections::VecDeque;
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxwError {
    #[error("transmit window full")]
    WindowFull,
    #[error("APDU of {len} bytes exceeds the window's maximum of {max}")]
    ApduTooLarge { len: usize, max: usize },
    #[error("pushed sequence {got} does not extend the lead {want}")]
    NotNextLead { got: Sqn, want: Sqn },
}

/// Outcome of queueing a NAK against the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakOutcome {
    /// Repair queued for transmission.
    Queued,
    /// Already pending; the duplicate NAK is absorbed.
    Eliminated,
    /// The packet has been discarded; the receiver cannot be repaired.
    Missing,
}

#[derive(Debug)]
pub struct TxSlot {
    pub skb: Skb,
    pub retransmit_count: u32,
    pub nak_count: u32,
    /// Queued for retransmission and not yet sent.
    repair_pending: bool,
}

/// A request drained from the repair queue.
#[derive(Debug, Clone)]
pub enum Repair {
    /// Retransmit this original packet.
    Selective(Skb),
    /// Generate `count` on-demand parity packets for the transmission
    /// group starting at `group`.
    Parity { group: Sqn, count: u32 },
}

#[derive(Debug)]
pub struct TransmitWindow {
    slots: Vec<Option<TxSlot>>,
    capacity: usize,
    trail: Sqn,
    next_lead: Sqn,
    repair_queue: VecDeque<RepairRequest>,
    naks_received: u64,
    parity_naks_received: u64,
}

#[derive(Debug, Clone, Copy)]
enum RepairRequest {
    Selective(Sqn),
    Parity { group: Sqn, count: u32 },
}

impl TransmitWindow {
    /// An empty window of `capacity` slots whose first assigned sequence
    /// number will be `initial`.
    pub fn new(capacity: usize, initial: Sqn) -> Self {
        assert!(capacity > 0);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        TransmitWindow {
            slots,
            capacity,
            trail: initial,
            next_lead: initial,
            repair_queue: VecDeque::new(),
            naks_received: 0,
            parity_naks_received: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.next_lead.wrapping_sub(self.trail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_lead == self.trail
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity
    }

    /// The oldest retained sequence number.
    pub fn trail(&self) -> Sqn {
        self.trail
    }

    /// The highest assigned sequence number; one less than the trail while
    /// the window is empty.
    pub fn lead(&self) -> Sqn {
        self.next_lead.prev()
    }

    pub fn next_lead(&self) -> Sqn {
        self.next_lead
    }

    fn index(&self, sqn: Sqn) -> usize {
        (sqn.0 as usize) % self.capacity
    }

    fn in_window(&self, sqn: Sqn) -> bool {
        !self.is_empty() && self.trail.lte(sqn) && sqn.lte(self.lead())
    }

    /// Stores the next outgoing packet. The skb's sequence number must be
    /// the window's `next_lead`.
    pub fn push(&mut self, skb: Skb) -> Result<Sqn, TxwError> {
        if self.is_full() {
            return Err(TxwError::WindowFull);
        }
        let sqn = skb.sqn();
        if sqn != self.next_lead {
            return Err(TxwError::NotNextLead {
                got: sqn,
                want: self.next_lead,
            });
        }
        let idx = self.index(sqn);
        self.slots[idx] = Some(TxSlot {
            skb,
            retransmit_count: 0,
            nak_count: 0,
            repair_pending: false,
        });
        self.next_lead = self.next_lead.next();
        Ok(sqn)
    }

    pub fn get(&self, sqn: Sqn) -> Option<&TxSlot> {
        if !self.in_window(sqn) {
            return None;
        }
        self.slots[self.index(sqn)].as_ref()
    }

    /// A retransmit-ready clone of the stored packet, or `None` when the
    /// window has discarded it.
    pub fn retransmit(&mut self, sqn: Sqn) -> Option<Skb> {
        if !self.in_window(sqn) {
            return None;
        }
        let idx = self.index(sqn);
        let slot = self.slots[idx].as_mut()?;
        slot.retransmit_count += 1;
        Some(slot.skb.clone())
    }

    /// Moves the trailing edge forward, discarding retained packets.
    /// Idempotent; never advances past the lead.
    pub fn advance_trail(&mut self, new_trail: Sqn) {
        if !new_trail.gt(self.trail) {
            return;
        }
        let new_trail = if new_trail.gt(self.next_lead) {
            self.next_lead
        } else {
            new_trail
        };
        for sqn in self.trail.range_to(new_trail) {
            let idx = self.index(sqn);
            self.slots[idx] = None;
        }
        self.trail = new_trail;
    }

    /// Queues a selective NAK. Duplicate NAKs for an already-pending
    /// repair are absorbed.
    pub fn queue_nak(&mut self, sqn: Sqn) -> NakOutcome {
        self.naks_received += 1;
        if !self.in_window(sqn) {
            return NakOutcome::Missing;
        }
        let idx = self.index(sqn);
        let Some(slot) = self.slots[idx].as_mut() else {
            return NakOutcome::Missing;
        };
        slot.nak_count += 1;
        if slot.repair_pending {
            return NakOutcome::Eliminated;
        }
        slot.repair_pending = true;
        self.repair_queue.push_back(RepairRequest::Selective(sqn));
        NakOutcome::Queued
    }

    /// Queues a parity NAK: `count` parity packets for the group starting
    /// at `group`.
    pub fn queue_parity_nak(&mut self, group: Sqn, count: u32) {
        self.parity_naks_received += 1;
        self.repair_queue
            .push_back(RepairRequest::Parity { group, count });
    }

    /// Drains the next repair, skipping entries whose packets have since
    /// left the window.
    pub fn pop_repair(&mut self) -> Option<Repair> {
        while let Some(req) = self.repair_queue.pop_front() {
            match req {
                RepairRequest::Selective(sqn) => {
                    if !self.in_window(sqn) {
                        continue;
                    }
                    let idx = self.index(sqn);
                    let Some(slot) = self.slots[idx].as_mut() else {
                        continue;
                    };
                    slot.repair_pending = false;
                    slot.retransmit_count += 1;
                    return Some(Repair::Selective(slot.skb.clone()));
                }
                RepairRequest::Parity { group, count } => {
                    return Some(Repair::Parity { group, count });
                }
            }
        }
        None
    }

    /// Requeues a repair that could not be sent (rate deferred).
    pub fn push_repair_front(&mut self, repair: Repair) {
        match repair {
            Repair::Selective(skb) => {
                let sqn = skb.sqn();
                if self.in_window(sqn) {
                    let idx = self.index(sqn);
                    if let Some(slot) = self.slots[idx].as_mut() {
                        slot.repair_pending = true;
                    }
                    self.repair_queue.push_front(RepairRequest::Selective(sqn));
                }
            }
            Repair::Parity { group, count } => {
                self.repair_queue
                    .push_front(RepairRequest::Parity { group, count });
            }
        }
    }

    pub fn has_repairs(&self) -> bool {
        !self.repair_queue.is_empty()
    }

    /// Payloads of a complete transmission group, oldest first, for parity
    /// encoding. `None` unless all `k` packets are still retained.
    pub fn group_payloads(&self, group: Sqn, k: usize) -> Option<Vec<&[u8]>> {
        let mut payloads = Vec::with_capacity(k);
        for sqn in group.range_to(group.wrapping_add(k as u32)) {
            payloads.push(self.get(sqn)?.skb.payload());
        }
        Some(payloads)
    }

    pub fn naks_received(&self) -> u64 {
        self.naks_received
    }

    pub fn parity_naks_received(&self) -> u64 {
        self.parity_naks_received
    }
}

/// Splits an APDU into per-fragment byte ranges of at most `max_tsdu`
/// each, full-sized except for the remainder.
pub fn fragment_plan(
    apdu_len: usize,
    max_tsdu: usize,
    max_fragments: usize,
) -> Result<Vec<Range<usize>>, TxwError> {
    debug_assert!(max_tsdu > 0);
    let count = apdu_len.div_ceil(max_tsdu).max(1);
    if count > max_fragments {
        return Err(TxwError::ApduTooLarge {
            len: apdu_len,
            max: max_fragments * max_tsdu,
        });
    }
    Ok((0..count)
        .map(|i| {
            let start = i * max_tsdu;
            start..(start + max_tsdu).min(apdu_len)
        })
        .collect())
}
