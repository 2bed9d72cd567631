use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FecError {
    #[error("invalid code parameters RS({n}, {k})")]
    InvalidParameters { n: usize, k: usize },
    #[error("block holds {have} symbols, expected {expect}")]
    WrongBlockSize { have: usize, expect: usize },
    #[error("offset {0} is not a valid symbol index")]
    BadOffset(usize),
    #[error("more erasures than parity symbols")]
    TooManyErasures,
    #[error("decode matrix is singular")]
    SingularMatrix,
}
