//! # pgm-proto
//!
//! Wire model for PGM (Pragmatic General Multicast, RFC 3208): the fixed
//! packet header, typed packet bodies, option extensions, the internet
//! one's-complement checksum, RFC 1982 serial-number arithmetic, and the
//! GSI/TSI session identifiers.
//!
//! This crate is pure data: no sockets, no clocks, no state machines. The
//! protocol engine lives in `pgm-transport`.

pub mod checksum;
pub mod error;
pub mod gsi;
pub mod options;
pub mod packet;
pub mod sqn;

pub use error::WireError;
pub use gsi::{Gsi, Tsi};
pub use options::{OptFragment, OptParityPrm, OptionSet, NAK_LIST_MAX};
pub use packet::{
    Ack, DataPacket, NakPacket, PacketBody, PacketType, PgmHeader, PgmPacket, Poll, Polr, Spm,
    Spmr, HEADER_LEN,
};
pub use sqn::Sqn;
