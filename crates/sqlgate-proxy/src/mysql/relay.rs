//! Relaying one command's response from a backend to the client.
//!
//! Packets are re-framed rather than copied byte for byte: each side keeps
//! its own sequence counter, so the backend's sequence ids never leak to the
//! client. Both legs negotiate the same capability set, which keeps payloads
//! identical.
//!
//! ```text
//! Query     → OK | ERR | colcount, coldef*, EOF, row*, (EOF | ERR)   [repeat while MORE_RESULTS]
//! FieldList → coldef*, (EOF | ERR)
//! Single    → one packet
//! ```

use sqlgate_wire::codec::Reader;
use sqlgate_wire::response::{ERR_HEADER, OK_HEADER, eof_status, is_eof, is_err, ok_status};
use sqlgate_wire::status::SERVER_MORE_RESULTS_EXISTS;
use sqlgate_wire::{PacketConn, WireError};
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseKind {
    Query,
    FieldList,
    Single,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RelayOutcome {
    /// Status flags from the final OK or EOF packet, if the response ended
    /// with one.
    pub status: Option<u16>,
}

#[derive(Debug)]
pub(crate) enum RelayError {
    /// Writing to the client failed.
    Client(WireError),
    /// Talking to the backend failed. `forwarded` is true once any part of
    /// the response has reached the client.
    Backend { source: WireError, forwarded: bool },
}

struct Relay<'a, C, B> {
    client: &'a mut PacketConn<C>,
    backend: &'a mut PacketConn<B>,
    forwarded: bool,
}

impl<C, B> Relay<'_, C, B>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    fn backend_err(&self, source: WireError) -> RelayError {
        RelayError::Backend {
            source,
            forwarded: self.forwarded,
        }
    }

    /// Read one backend packet and pass it on.
    async fn pass(&mut self) -> Result<bytes::BytesMut, RelayError> {
        let packet = match self.backend.read_packet().await {
            Ok(packet) => packet,
            Err(e) => return Err(self.backend_err(e)),
        };
        self.forwarded = true;
        self.client
            .write_packet(&packet)
            .await
            .map_err(RelayError::Client)?;
        Ok(packet)
    }

    async fn query(&mut self) -> Result<Option<u16>, RelayError> {
        loop {
            let first = self.pass().await?;
            let status = match first.first().copied() {
                Some(OK_HEADER) => ok_status(&first).map_err(|e| self.backend_err(e))?,
                Some(ERR_HEADER) => return Ok(None),
                Some(_) => {
                    let columns = Reader::new(&first)
                        .lenenc_int()
                        .map_err(|e| self.backend_err(e))?;
                    for _ in 0..columns {
                        self.pass().await?;
                    }
                    let eof = self.pass().await?;
                    if !is_eof(&eof) {
                        return Err(
                            self.backend_err(WireError::Malformed("expected EOF after column definitions".into()))
                        );
                    }
                    match self.rows().await? {
                        Some(status) => status,
                        None => return Ok(None),
                    }
                }
                None => return Err(self.backend_err(WireError::Malformed("empty response packet".into()))),
            };
            if status & SERVER_MORE_RESULTS_EXISTS == 0 {
                return Ok(Some(status));
            }
        }
    }

    /// Rows until the terminating EOF (its status) or ERR (`None`).
    async fn rows(&mut self) -> Result<Option<u16>, RelayError> {
        loop {
            let row = self.pass().await?;
            if is_eof(&row) {
                return eof_status(&row).map(Some).map_err(|e| self.backend_err(e));
            }
            if is_err(&row) {
                return Ok(None);
            }
        }
    }

    async fn field_list(&mut self) -> Result<Option<u16>, RelayError> {
        loop {
            let packet = self.pass().await?;
            if is_eof(&packet) {
                return eof_status(&packet).map(Some).map_err(|e| self.backend_err(e));
            }
            if is_err(&packet) {
                return Ok(None);
            }
        }
    }

    async fn single(&mut self) -> Result<Option<u16>, RelayError> {
        let packet = self.pass().await?;
        if packet.first() == Some(&OK_HEADER) {
            return Ok(ok_status(&packet).ok());
        }
        Ok(None)
    }
}

/// Send `command` to the backend and stream its response to the client.
pub(crate) async fn relay<C, B>(
    client: &mut PacketConn<C>,
    backend: &mut PacketConn<B>,
    command: &[u8],
    kind: ResponseKind,
) -> Result<RelayOutcome, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    backend.reset_seq();
    backend
        .send(command)
        .await
        .map_err(|source| RelayError::Backend {
            source,
            forwarded: false,
        })?;

    let mut relay = Relay {
        client,
        backend,
        forwarded: false,
    };
    let status = match kind {
        ResponseKind::Query => relay.query().await?,
        ResponseKind::FieldList => relay.field_list().await?,
        ResponseKind::Single => relay.single().await?,
    };
    relay.client.flush().await.map_err(RelayError::Client)?;
    Ok(RelayOutcome { status })
}
