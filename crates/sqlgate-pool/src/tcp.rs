//! Plain TCP connector.
//!
//! Opens a socket and nothing more. Liveness is a non-blocking peek: a
//! socket with no pending data is alive, a zero-length read means the peer
//! hung up. Useful for protocol-agnostic backends and for tests.

use std::task::Poll;

use tokio::io::{AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::config::PoolConfig;
use crate::connector::{BackendConnection, BackendConnector, BoxFuture};
use crate::error::BackendError;

/// A [`BackendConnection`] over a bare TCP stream.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self { stream }
    }

    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl BackendConnection for TcpConnection {
    fn ping(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut byte = [0u8; 1];
            std::future::poll_fn(|cx| {
                let mut buf = ReadBuf::new(&mut byte);
                match self.stream.poll_peek(cx, &mut buf) {
                    // Peer closed.
                    Poll::Ready(Ok(0)) => Poll::Ready(false),
                    // Unsolicited data; still connected.
                    Poll::Ready(Ok(_)) => Poll::Ready(true),
                    Poll::Ready(Err(e)) => Poll::Ready(matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    )),
                    // Nothing to read right now.
                    Poll::Pending => Poll::Ready(true),
                }
            })
            .await
        })
    }

    fn close(mut self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let _ = self.stream.shutdown().await;
        })
    }
}

/// Opens [`TcpConnection`]s to `PoolConfig::address`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl BackendConnector for TcpConnector {
    type Connection = TcpConnection;

    fn connect<'a>(
        &'a self,
        config: &'a PoolConfig,
    ) -> BoxFuture<'a, Result<TcpConnection, BackendError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(config.address.as_str()).await?;
            tracing::debug!(address = %config.address, "tcp backend connected");
            Ok(TcpConnection::new(stream))
        })
    }
}
