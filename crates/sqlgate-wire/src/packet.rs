//! Packet framing.
//!
//! Every MySQL packet carries a 3-byte little-endian payload length and a
//! 1-byte sequence id. Payloads of exactly [`MAX_PAYLOAD_LEN`] bytes are
//! continued in the next frame; [`PacketConn::read_packet`] joins them.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};

use crate::error::{WireError, WireResult};

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;

/// Upper bound on a reassembled logical packet.
pub const MAX_PACKET_SIZE: usize = 64 * 1024 * 1024;

/// A buffered, sequence-tracking packet stream.
#[derive(Debug)]
pub struct PacketConn<S> {
    stream: BufStream<S>,
    seq: u8,
}

impl<S> PacketConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
            seq: 0,
        }
    }

    /// Start a new command phase. Each client command restarts at zero.
    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// The sequence id the next packet is expected to carry.
    pub fn seq(&self) -> u8 {
        self.seq
    }

    /// Read one logical packet, joining continuation frames.
    ///
    /// A clean EOF before the first header byte maps to [`WireError::Closed`].
    pub async fn read_packet(&mut self) -> WireResult<BytesMut> {
        let mut payload = BytesMut::new();
        let mut first = true;
        loop {
            let mut header = [0u8; 4];
            match self.stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if first && e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(WireError::Closed);
                }
                Err(e) => return Err(e.into()),
            }
            first = false;

            let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
            let seq = header[3];
            if seq != self.seq {
                return Err(WireError::Sequence {
                    expected: self.seq,
                    got: seq,
                });
            }
            self.seq = self.seq.wrapping_add(1);

            if payload.len() + len > MAX_PACKET_SIZE {
                return Err(WireError::TooLarge(payload.len() + len));
            }
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;

            if len < MAX_PAYLOAD_LEN {
                return Ok(payload);
            }
        }
    }

    /// Buffer one logical packet, splitting it into frames as needed.
    /// Nothing reaches the peer until [`PacketConn::flush`].
    pub async fn write_packet(&mut self, payload: &[u8]) -> WireResult<()> {
        if payload.len() > MAX_PACKET_SIZE {
            return Err(WireError::TooLarge(payload.len()));
        }
        let mut rest = payload;
        loop {
            let chunk = rest.len().min(MAX_PAYLOAD_LEN);
            let mut header = BytesMut::with_capacity(4);
            header.put_uint_le(chunk as u64, 3);
            header.put_u8(self.seq);
            self.seq = self.seq.wrapping_add(1);

            self.stream.write_all(&header).await?;
            self.stream.write_all(&rest[..chunk]).await?;
            rest = &rest[chunk..];

            // A payload that is an exact multiple of the frame size ends
            // with an empty frame.
            if chunk < MAX_PAYLOAD_LEN {
                return Ok(());
            }
        }
    }

    pub async fn flush(&mut self) -> WireResult<()> {
        self.stream.flush().await?;
        Ok(())
    }

    /// Write and flush in one step.
    pub async fn send(&mut self, payload: &[u8]) -> WireResult<()> {
        self.write_packet(payload).await?;
        self.flush().await
    }

    pub fn get_ref(&self) -> &S {
        self.stream.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.stream.get_mut()
    }

    /// Recover the underlying stream. Buffered but unread bytes are lost.
    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_single_frame() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);

        tx.send(b"\x03SELECT 1").await.unwrap();
        tx.send(b"\x0e").await.unwrap();

        assert_eq!(&rx.read_packet().await.unwrap()[..], b"\x03SELECT 1");
        assert_eq!(&rx.read_packet().await.unwrap()[..], b"\x0e");
        assert_eq!(rx.seq(), 2);
    }

    #[tokio::test]
    async fn sequence_mismatch_is_reported() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);

        tx.send(b"first").await.unwrap();
        rx.read_packet().await.unwrap();
        tx.reset_seq();
        tx.send(b"again").await.unwrap();

        match rx.read_packet().await {
            Err(WireError::Sequence { expected, got }) => {
                assert_eq!(expected, 1);
                assert_eq!(got, 0);
            }
            other => panic!("expected sequence error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_eof_is_closed() {
        let (a, b) = tokio::io::duplex(64);
        drop(a);
        let mut rx = PacketConn::new(b);
        assert!(matches!(rx.read_packet().await, Err(WireError::Closed)));
    }

    #[tokio::test]
    async fn truncated_payload_is_io_error() {
        use tokio::io::AsyncWriteExt;

        let (mut a, b) = tokio::io::duplex(64);
        // Header claims 10 bytes, only 3 follow.
        a.write_all(&[10, 0, 0, 0, 1, 2, 3]).await.unwrap();
        drop(a);
        let mut rx = PacketConn::new(b);
        let err = rx.read_packet().await.unwrap_err();
        assert!(err.is_disconnect(), "got {err:?}");
    }

    #[tokio::test]
    async fn oversized_payload_is_split_and_joined() {
        let payload = vec![0xabu8; MAX_PAYLOAD_LEN + 10];
        let (a, b) = tokio::io::duplex(1 << 20);
        let mut tx = PacketConn::new(a);
        let mut rx = PacketConn::new(b);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            tx.send(&payload).await.unwrap();
            tx
        });

        let got = rx.read_packet().await.unwrap();
        let tx = writer.await.unwrap();
        assert_eq!(got.len(), expected.len());
        assert_eq!(&got[..], &expected[..]);
        assert_eq!(tx.seq(), 2);
        assert_eq!(rx.seq(), 2);
    }
}
