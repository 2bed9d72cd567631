//! # pgm-fec
//!
//! Reed-Solomon forward error correction for PGM: RS(n, k) erasure codes
//! over GF(2^8) with Vandermonde-derived systematic generator matrices.
//! Used for proactive parity (sent alongside original data) and on-demand
//! parity (sent in answer to parity NAKs).

pub mod error;
pub mod galois;
pub mod rs;

pub use error::FecError;
pub use rs::ReedSolomon;

/// Default block size: the whole field, RS(255, k).
pub const DEFAULT_N: usize = 255;
