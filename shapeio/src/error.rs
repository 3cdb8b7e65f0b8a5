//! Errors raised by the shaping layer itself.
//!
//! Errors coming from the wrapped stream are never wrapped or rewritten; only conditions the
//! shaper introduces show up here. When they have to cross an `io::Read`/`AsyncRead` boundary
//! they travel as `io::Error::other(ShapeError::..)`, and [`ShapeError::is_cancelled`] recovers
//! the kind on the caller side.
use std::io;

use thiserror::Error;

/// Result alias for configuration and limiter operations.
pub type Result<T> = std::result::Result<T, ShapeError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    /// A rate wait was aborted by a cancel signal. No bytes were transferred by the call that
    /// observed it.
    #[error("rate wait cancelled")]
    Cancelled,

    /// A bandwidth string could not be parsed.
    #[error("invalid bandwidth {0:?}; use a byte count such as 65536, 500KB or 10MiB/s")]
    InvalidBandwidth(String),
}

impl ShapeError {
    /// Returns `true` when `err` carries [`ShapeError::Cancelled`].
    pub fn is_cancelled(err: &io::Error) -> bool {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<ShapeError>())
            .is_some_and(|e| *e == ShapeError::Cancelled)
    }
}

impl From<ShapeError> for io::Error {
    fn from(err: ShapeError) -> Self {
        match err {
            ShapeError::InvalidBandwidth(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            ShapeError::Cancelled => io::Error::other(err),
        }
    }
}
