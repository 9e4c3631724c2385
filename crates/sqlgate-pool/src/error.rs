//! Pool and backend error types.

use std::time::Duration;

use sqlgate_wire::{ServerError, WireError};
use thiserror::Error;

/// Failure opening or talking to a single backend connection.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("backend returned {0}")]
    Server(#[from] ServerError),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by [`crate::BackendPool`]. All of them are values the
/// caller decides about; the pool never panics or exits.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("pool {pool}: backend unreachable: {source}")]
    Unreachable {
        pool: String,
        #[source]
        source: BackendError,
    },

    #[error("pool {pool} exhausted (waited {timeout:?})")]
    Exhausted { pool: String, timeout: Duration },

    #[error("pool {pool} is draining, no new checkouts accepted")]
    Draining { pool: String },
}
