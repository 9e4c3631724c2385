//! The per-connection handler contract.
//!
//! The server owns the listener, the pools and the lifecycle; everything
//! protocol-specific happens behind [`SessionHandler`]. One `handle` call
//! serves one accepted socket to completion.

use std::net::SocketAddr;
use std::sync::Arc;

use sqlgate_pool::{BackendConnection, BackendPool, BoxFuture};
use tokio::net::TcpStream;

use crate::credentials::CredentialStore;
use crate::error::SessionError;

/// What a session gets besides its socket.
pub struct SessionContext<C: BackendConnection> {
    /// Unique per server run, never zero.
    pub session_id: u32,
    pub peer: SocketAddr,
    /// Pool for writes, transactions and anything not known to be a read.
    pub admin: Arc<BackendPool<C>>,
    /// Pool for plain reads outside transactions.
    pub readonly: Arc<BackendPool<C>>,
    pub credentials: Arc<CredentialStore>,
}

impl<C: BackendConnection> Clone for SessionContext<C> {
    fn clone(&self) -> Self {
        Self {
            session_id: self.session_id,
            peer: self.peer,
            admin: Arc::clone(&self.admin),
            readonly: Arc::clone(&self.readonly),
            credentials: Arc::clone(&self.credentials),
        }
    }
}

impl<C: BackendConnection> std::fmt::Debug for SessionContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .field("peer", &self.peer)
            .field("admin", &self.admin.name())
            .field("readonly", &self.readonly.name())
            .finish_non_exhaustive()
    }
}

/// Serves one client connection.
///
/// Implementations must check out backend connections only from the pools
/// in the context and hand every one back (or drop it) before returning.
/// Errors end the session only; the server logs them.
pub trait SessionHandler<C: BackendConnection>: Send + Sync + 'static {
    fn handle(
        &self,
        stream: TcpStream,
        ctx: SessionContext<C>,
    ) -> BoxFuture<'_, Result<(), SessionError>>;
}
