//! Connector traits injected into the pool.
//!
//! The pool never touches sockets itself: a [`BackendConnector`] opens
//! connections and each [`BackendConnection`] knows how to probe and close
//! itself. Futures are boxed so the traits stay object-safe and usable
//! behind `Arc<dyn BackendConnector<..>>`.

use std::future::Future;
use std::pin::Pin;

use crate::config::PoolConfig;
use crate::error::BackendError;

/// Boxed, sendable future used throughout the connector traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A live connection to a backend.
pub trait BackendConnection: Send + std::fmt::Debug + 'static {
    /// Liveness probe. Returns `true` if the connection can serve a command.
    fn ping(&mut self) -> BoxFuture<'_, bool>;

    /// Close the underlying transport, telling the backend when the
    /// protocol allows it.
    fn close(self) -> BoxFuture<'static, ()>
    where
        Self: Sized;
}

/// Factory for new backend connections.
pub trait BackendConnector: Send + Sync + 'static {
    type Connection: BackendConnection;

    /// Open one connection using the pool's target and credentials.
    fn connect<'a>(
        &'a self,
        config: &'a PoolConfig,
    ) -> BoxFuture<'a, Result<Self::Connection, BackendError>>;
}
