//! Generic response packets: OK, ERR and EOF.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::codec::{Reader, put_lenenc_int};
use crate::error::{WireError, WireResult};

pub const OK_HEADER: u8 = 0x00;
pub const ERR_HEADER: u8 = 0xff;
pub const EOF_HEADER: u8 = 0xfe;

/// Error codes and SQL states the proxy reports to clients.
pub mod codes {
    pub const ER_CON_COUNT_ERROR: u16 = 1040;
    pub const ER_HANDSHAKE_ERROR: u16 = 1043;
    pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
    pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
    pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
    pub const CR_SERVER_LOST: u16 = 2013;

    pub const STATE_ACCESS_DENIED: &str = "28000";
    pub const STATE_SYNTAX_OR_ACCESS: &str = "42000";
    pub const STATE_CONNECTION_REJECTED: &str = "08004";
    pub const STATE_COMMUNICATION: &str = "08S01";
    pub const STATE_GENERAL: &str = "HY000";
}

pub fn ok_packet(affected_rows: u64, last_insert_id: u64, status: u16, warnings: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(11);
    buf.put_u8(OK_HEADER);
    put_lenenc_int(&mut buf, affected_rows);
    put_lenenc_int(&mut buf, last_insert_id);
    buf.put_u16_le(status);
    buf.put_u16_le(warnings);
    buf
}

/// ERR packet in the 4.1 layout. `state` must be five characters.
pub fn err_packet(code: u16, state: &str, message: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(9 + message.len());
    buf.put_u8(ERR_HEADER);
    buf.put_u16_le(code);
    buf.put_u8(b'#');
    buf.put_slice(state.as_bytes());
    buf.put_slice(message.as_bytes());
    buf
}

pub fn eof_packet(warnings: u16, status: u16) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(EOF_HEADER);
    buf.put_u16_le(warnings);
    buf.put_u16_le(status);
    buf
}

pub fn is_ok(payload: &[u8]) -> bool {
    payload.first() == Some(&OK_HEADER)
}

pub fn is_err(payload: &[u8]) -> bool {
    payload.first() == Some(&ERR_HEADER)
}

/// EOF packets share their header byte with length-encoded integers of 8
/// bytes, so only short packets count.
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&EOF_HEADER) && payload.len() < 9
}

/// Server status flags of an OK packet.
pub fn ok_status(payload: &[u8]) -> WireResult<u16> {
    let mut r = Reader::new(payload);
    if r.u8()? != OK_HEADER {
        return Err(WireError::malformed("not an OK packet"));
    }
    r.lenenc_int()?;
    r.lenenc_int()?;
    r.u16_le()
}

/// Server status flags of an EOF packet. Pre-4.1 EOFs carry none.
pub fn eof_status(payload: &[u8]) -> WireResult<u16> {
    let mut r = Reader::new(payload);
    if r.u8()? != EOF_HEADER {
        return Err(WireError::malformed("not an EOF packet"));
    }
    if r.remaining() < 4 {
        return Ok(0);
    }
    r.skip(2)?;
    r.u16_le()
}

/// A decoded ERR packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub code: u16,
    pub state: String,
    pub message: String,
}

impl ServerError {
    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(payload);
        if r.u8()? != ERR_HEADER {
            return Err(WireError::malformed("not an ERR packet"));
        }
        let code = r.u16_le()?;
        let mut state = String::from("HY000");
        let rest = r.rest();
        let message = match rest {
            [b'#', tail @ ..] if tail.len() >= 5 => {
                state = String::from_utf8_lossy(&tail[..5]).into_owned();
                String::from_utf8_lossy(&tail[5..]).into_owned()
            }
            _ => String::from_utf8_lossy(rest).into_owned(),
        };
        Ok(Self {
            code,
            state,
            message,
        })
    }

    pub fn encode(&self) -> BytesMut {
        err_packet(self.code, &self.state, &self.message)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ERROR {} ({}): {}", self.code, self.state, self.message)
    }
}

impl std::error::Error for ServerError {}
