//! Reference-counted packet buffers.
//!
//! An `Skb` wraps one encoded PGM packet together with its parsed view.
//! The bytes and the view are immutable after construction; `clone` is a
//! reference-count increment, so a transmit-window slot and an in-flight
//! send can hold the same buffer concurrently.

use pgm_proto::options::OptFragment;
use pgm_proto::{PacketType, Sqn, Tsi};
use std::ops::Range;
use std::sync::Arc;

/// Parsed view of a data-bearing packet, filled once at parse or build
/// time.
#[derive(Debug, Clone)]
pub struct SkbMeta {
    pub tsi: Tsi,
    pub packet_type: PacketType,
    pub sqn: Sqn,
    /// Trailing edge advertised by the packet.
    pub trail: Sqn,
    pub fragment: Option<OptFragment>,
    /// Parity symbol index within the transmission group, when this is a
    /// parity packet.
    pub parity_index: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct Skb {
    bytes: Arc<Vec<u8>>,
    payload: Range<usize>,
    meta: SkbMeta,
}

impl Skb {
    /// Wraps an encoded wire packet. `payload` delimits the TSDU within
    /// `bytes`.
    pub fn new(bytes: Vec<u8>, payload: Range<usize>, meta: SkbMeta) -> Self {
        debug_assert!(payload.end <= bytes.len());
        Skb {
            bytes: Arc::new(bytes),
            payload,
            meta,
        }
    }

    /// The full encoded PGM packet.
    pub fn wire(&self) -> &[u8] {
        &self.bytes
    }

    /// The TSDU carried by this packet.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.payload.clone()]
    }

    pub fn meta(&self) -> &SkbMeta {
        &self.meta
    }

    pub fn sqn(&self) -> Sqn {
        self.meta.sqn
    }

    pub fn is_parity(&self) -> bool {
        self.meta.parity_index.is_some()
    }

    /// Number of live references, counting this one.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.bytes)
    }
}
