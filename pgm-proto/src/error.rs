use thiserror::Error;

/// Errors raised while parsing or building PGM wire packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad checksum")]
    BadChecksum,
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("unknown network-layer address family {0}")]
    UnknownAfi(u16),
    #[error("malformed option extension at offset {0}")]
    MalformedOption(usize),
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
    #[error("TSDU length {tsdu} exceeds packet bounds")]
    BadTsduLength { tsdu: usize },
    #[error("payload of {len} bytes exceeds the maximum TSDU of {max}")]
    TsduTooLarge { len: usize, max: usize },
}
