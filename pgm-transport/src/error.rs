use std::io;
use thiserror::Error;

/// Errors surfaced by the PGM engine.
///
/// Inbound malformed or corrupt packets never surface here: they are
/// counted and dropped inside the state machine. Per-peer failures isolate
/// to that peer; only `ConnReset` crosses to the application, and only via
/// `recvmsg`.
#[derive(Debug, Error)]
pub enum PgmError {
    /// Non-fatal; retry after readiness (window full, rate deferred, or no
    /// data in non-blocking mode).
    #[error("operation would block")]
    WouldBlock,
    /// The receive deadline passed with no data.
    #[error("timed out")]
    Timeout,
    /// A peer lost at least one APDU unrecoverably; acknowledge the reset
    /// before draining resumes.
    #[error("session reset: data lost from {0}")]
    ConnReset(String),
    /// A protocol invariant was violated; the endpoint must be closed.
    #[error("protocol engine fault: {0}")]
    Engine(String),
    /// Option rejected; endpoint state unchanged.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Underlying datagram I/O failure, propagated verbatim.
    #[error("transport: {0}")]
    Transport(#[from] io::Error),
}

pub type PgmResult<T> = Result<T, PgmError>;
