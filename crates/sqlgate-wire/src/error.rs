//! Error types for the wire codec.

use thiserror::Error;

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while reading, writing or decoding packets.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    Closed,

    #[error("malformed packet: {0}")]
    Malformed(String),

    #[error("packet of {0} bytes exceeds the maximum allowed size")]
    TooLarge(usize),

    #[error("out-of-order packet: expected sequence {expected}, got {got}")]
    Sequence { expected: u8, got: u8 },
}

impl WireError {
    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        WireError::Malformed(what.into())
    }

    /// True when the peer went away rather than sending garbage.
    pub fn is_disconnect(&self) -> bool {
        match self {
            WireError::Closed => true,
            WireError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
