//! Error types for the proxy server and client sessions.

use sqlgate_core::ConfigError;
use sqlgate_pool::{BackendError, PoolError};
use sqlgate_wire::WireError;
use thiserror::Error;

/// Errors that stop the server. Returned from [`crate::ProxyServer::run`].
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("backend pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("server has already been started")]
    AlreadyStarted,
}

/// Errors that end a single client session. They are logged and never
/// reach the accept loop.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

impl SessionError {
    /// True when the client simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            SessionError::Wire(e) => e.is_disconnect(),
            SessionError::Io(e) => matches!(
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

/// Failure reported by a [`crate::TopologyInitializer`].
#[derive(Debug, Error)]
#[error("topology initialization failed: {0}")]
pub struct TopologyError(pub String);
