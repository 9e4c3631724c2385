//! Primitive encoders and a bounds-checked payload reader.
//!
//! MySQL integers are little-endian. "Length-encoded" integers use a one-byte
//! prefix: values below 251 are stored inline, `0xfc`/`0xfd`/`0xfe` announce a
//! 2, 3 or 8 byte value.

use bytes::{BufMut, BytesMut};

use crate::error::{WireError, WireResult};

/// Append a length-encoded integer.
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 1 << 16 {
        buf.put_u8(0xfc);
        buf.put_u16_le(value as u16);
    } else if value < 1 << 24 {
        buf.put_u8(0xfd);
        buf.put_uint_le(value, 3);
    } else {
        buf.put_u8(0xfe);
        buf.put_u64_le(value);
    }
}

/// Append a length-encoded byte string.
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Append a NUL-terminated string.
pub fn put_null_str(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Cursor over a packet payload. Every accessor fails with
/// [`WireError::Malformed`] instead of panicking on a short payload.
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(WireError::malformed(format!(
                "needed {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.bytes(n).map(|_| ())
    }

    pub fn u8(&mut self) -> WireResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16_le(&mut self) -> WireResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32_le(&mut self) -> WireResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn lenenc_int(&mut self) -> WireResult<u64> {
        match self.u8()? {
            n @ 0..=250 => Ok(u64::from(n)),
            0xfc => Ok(u64::from(self.u16_le()?)),
            0xfd => {
                let b = self.bytes(3)?;
                Ok(u64::from_le_bytes([b[0], b[1], b[2], 0, 0, 0, 0, 0]))
            }
            0xfe => {
                let b = self.bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_le_bytes(raw))
            }
            other => Err(WireError::malformed(format!(
                "invalid length-encoded integer prefix 0x{other:02x}"
            ))),
        }
    }

    pub fn lenenc_bytes(&mut self) -> WireResult<&'a [u8]> {
        let len = self.lenenc_int()?;
        let len = usize::try_from(len)
            .map_err(|_| WireError::malformed("length-encoded string too long"))?;
        self.bytes(len)
    }

    /// Read up to the next NUL. A missing terminator consumes the rest of
    /// the payload, which some clients send for the trailing field.
    pub fn null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.buf.len();
                rest
            }
        }
    }

    pub fn null_str(&mut self) -> WireResult<String> {
        let raw = self.null_bytes();
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::malformed("string is not valid UTF-8"))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}
