use thiserror::Error;

/// Errors surfaced by `allnet-core`.
///
/// Library code always returns `Result` instead of exiting the process; only
/// the binaries in the `allnet` crate call `std::process::exit`, and only
/// after logging one of these.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame exceeded maximum size {max} bytes (got {got})")]
    Oversize { got: u32, max: u32 },

    #[error("malformed AllNet packet: {0}")]
    Parse(String),

    #[error("peer table is full")]
    TableFull,

    #[error("address already reserved by another dial in flight")]
    ReservationConflict,

    #[error("failed to persist bloom filters: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("fatal startup error: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
