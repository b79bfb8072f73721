use std::fmt;

use log::error;

/// Errors surfaced by the tiered allocator's internal engine.
///
/// The public `malloc`-family shim (see [`crate::api`]) never returns this
/// type directly -- it collapses it to a raw pointer plus a thread-local
/// `errno`, matching the calling convention the allocator API itself
/// requires. Everything underneath that shim uses `Result<_, TierError>`.
#[derive(Debug, thiserror::Error)]
pub enum TierError {
    #[error("out of memory (requested {requested} bytes)")]
    OutOfMemory { requested: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tier or backend unavailable: {0}")]
    Unavailable(String),

    #[error("entry already exists")]
    Exists,

    #[error("fatal internal error: {0}")]
    Fatal(String),
}

impl TierError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        TierError::InvalidArgument(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        TierError::Unavailable(msg.into())
    }
}

/// Log an invariant violation and abort the process.
///
/// Mirrors the teacher's `die()` pattern in `os.rs`: some failures (a
/// corrupted ranking, a move-pages call failing after bookkeeping already
/// reflects the move) cannot be meaningfully recovered from and are not
/// safe to paper over with a `Result`.
pub fn fatal(msg: impl fmt::Display) -> ! {
    error!("fatal: {}", msg);
    std::process::abort();
}

pub type Result<T> = std::result::Result<T, TierError>;
