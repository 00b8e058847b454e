use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the encoding engine. All of them are pre-checks:
/// no partial output exists once an error is returned.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The requested parameter combination is rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The tile-pair difference matrix would exceed the memory ceiling.
    /// Surfaced before any allocation happens.
    #[error("image too large: {tiles} tiles require {needed} bytes of pair buffers (limit {limit})")]
    ImageTooLarge {
        tiles: usize,
        needed: usize,
        limit: usize,
    },
}
