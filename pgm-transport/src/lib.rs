//! # pgm-transport
//!
//! The PGM (RFC 3208) reliable multicast protocol engine.
//!
//! A producer publishes an ordered byte stream to a multicast group; each
//! receiver repairs loss with NAKs (and optionally Reed-Solomon parity)
//! and delivers the stream in order with bounded buffering.
//!
//! ## Architecture
//!
//! - **Windows**: a sender-side transmit window retains every packet for
//!   repair until the trailing edge passes; a per-source receive window
//!   detects holes, runs the NAK state machine, and reassembles APDUs.
//! - **Control plane**: SPM/NAK/NCF/SPMR generation driven by a single
//!   next-expiry timer scalar per endpoint.
//! - **Capabilities**: all I/O goes through a [`DatagramTransport`] and
//!   all time through a [`Clock`], so the whole engine runs under the
//!   deterministic harness in [`testing`].

pub mod clock;
pub mod error;
pub mod options;
pub mod peer;
pub mod rate;
pub mod receiver;
pub mod rxw;
pub mod skb;
pub mod socket;
pub mod source;
pub mod testing;
pub mod timer;
pub mod transport;
pub mod txw;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PgmError, PgmResult};
pub use options::{FecParams, SockOpt, SocketConfig};
pub use rxw::RxMessage;
pub use socket::{
    Message, PgmSocket, SessionParams, MSG_ACK_RESET, MSG_DONTWAIT, MSG_ERRQUEUE,
};
pub use transport::{DatagramTransport, Dest, Outbound};

pub use pgm_proto::{Gsi, Sqn, Tsi};
