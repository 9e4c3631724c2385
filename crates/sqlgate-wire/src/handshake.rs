//! Connection-phase packets: the server greeting, the client's response
//! and the auth-switch exchange.

use bytes::{BufMut, BytesMut};

use crate::capability::{
    CLIENT_CONNECT_WITH_DB, CLIENT_PLUGIN_AUTH, CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
    CLIENT_PROTOCOL_41, CLIENT_SECURE_CONNECTION,
};
use crate::codec::{Reader, put_lenenc_bytes, put_null_str};
use crate::error::{WireError, WireResult};
use crate::response::ServerError;

pub const PROTOCOL_VERSION: u8 = 10;
pub const NATIVE_PASSWORD_PLUGIN: &str = "mysql_native_password";
pub const CACHING_SHA2_PLUGIN: &str = "caching_sha2_password";

/// First byte of an auth-switch request.
pub const AUTH_SWITCH: u8 = 0xfe;
/// First byte of an AuthMoreData packet.
pub const AUTH_MORE_DATA: u8 = 0x01;
/// caching_sha2 fast-path result: the scramble matched the server cache.
pub const FAST_AUTH_SUCCESS: u8 = 0x03;
/// caching_sha2 result asking for the cleartext password over a secure channel.
pub const FULL_AUTH_REQUIRED: u8 = 0x04;

/// Protocol::HandshakeV10, sent by the server when a connection opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Auth plugin data (the scramble), usually 20 bytes.
    pub salt: Vec<u8>,
    pub capabilities: u32,
    pub charset: u8,
    pub status: u16,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128);
        buf.put_u8(self.protocol_version);
        put_null_str(&mut buf, &self.server_version);
        buf.put_u32_le(self.connection_id);

        let split = self.salt.len().min(8);
        let (head, tail) = self.salt.split_at(split);
        buf.put_slice(head);
        buf.put_bytes(0, 8 - head.len());
        buf.put_u8(0);

        buf.put_u16_le(self.capabilities as u16);
        buf.put_u8(self.charset);
        buf.put_u16_le(self.status);
        buf.put_u16_le((self.capabilities >> 16) as u16);

        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            buf.put_u8((self.salt.len() + 1) as u8);
        } else {
            buf.put_u8(0);
        }
        buf.put_bytes(0, 10);

        if self.capabilities & CLIENT_SECURE_CONNECTION != 0 {
            // At least 12 bytes follow, NUL-terminated.
            buf.put_slice(tail);
            buf.put_bytes(0, 12usize.saturating_sub(tail.len()));
            buf.put_u8(0);
        }
        if self.capabilities & CLIENT_PLUGIN_AUTH != 0 {
            put_null_str(&mut buf, &self.auth_plugin);
        }
        buf
    }

    /// Decode a greeting. A server that refuses the connection outright
    /// (too many connections, host blocked) sends an ERR packet instead,
    /// which is returned as [`WireError::Malformed`] carrying its message.
    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        if payload.first() == Some(&0xff) {
            let err = ServerError::parse(payload)?;
            return Err(WireError::malformed(format!("server refused connection: {err}")));
        }

        let mut r = Reader::new(payload);
        let protocol_version = r.u8()?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::malformed(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let server_version = r.null_str()?;
        let connection_id = r.u32_le()?;
        let mut salt = r.bytes(8)?.to_vec();
        r.skip(1)?;
        let mut capabilities = u32::from(r.u16_le()?);

        let mut charset = 0;
        let mut status = 0;
        let mut auth_plugin = String::from(NATIVE_PASSWORD_PLUGIN);
        if !r.is_empty() {
            charset = r.u8()?;
            status = r.u16_le()?;
            capabilities |= u32::from(r.u16_le()?) << 16;
            let auth_data_len = r.u8()?;
            r.skip(10)?;

            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let len = (auth_data_len as usize).saturating_sub(8).max(13);
                let tail = r.bytes(len.min(r.remaining()))?;
                // The trailing NUL is not part of the scramble.
                let tail = tail.strip_suffix(&[0]).unwrap_or(tail);
                salt.extend_from_slice(tail);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 {
                auth_plugin = r.null_str()?;
            }
        }

        Ok(Self {
            protocol_version,
            server_version,
            connection_id,
            salt,
            capabilities,
            charset,
            status,
            auth_plugin,
        })
    }
}

/// Protocol::HandshakeResponse41, the client's reply to the greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    pub capabilities: u32,
    pub max_packet_size: u32,
    pub charset: u8,
    pub username: String,
    pub auth_response: Vec<u8>,
    pub database: Option<String>,
    pub auth_plugin: Option<String>,
}

impl HandshakeResponse {
    pub fn encode(&self) -> BytesMut {
        let mut capabilities = self.capabilities;
        if self.database.is_some() {
            capabilities |= CLIENT_CONNECT_WITH_DB;
        }
        if self.auth_plugin.is_some() {
            capabilities |= CLIENT_PLUGIN_AUTH;
        }

        let mut buf = BytesMut::with_capacity(96);
        buf.put_u32_le(capabilities);
        buf.put_u32_le(self.max_packet_size);
        buf.put_u8(self.charset);
        buf.put_bytes(0, 23);
        put_null_str(&mut buf, &self.username);

        if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            put_lenenc_bytes(&mut buf, &self.auth_response);
        } else {
            buf.put_u8(self.auth_response.len() as u8);
            buf.put_slice(&self.auth_response);
        }
        if let Some(db) = &self.database {
            put_null_str(&mut buf, db);
        }
        if let Some(plugin) = &self.auth_plugin {
            put_null_str(&mut buf, plugin);
        }
        buf
    }

    /// Decode a client response. Pre-4.1 clients are rejected.
    pub fn parse(payload: &[u8]) -> WireResult<Self> {
        let mut r = Reader::new(payload);
        let capabilities = r.u32_le()?;
        if capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(WireError::malformed("client does not speak protocol 4.1"));
        }
        let max_packet_size = r.u32_le()?;
        let charset = r.u8()?;
        r.skip(23)?;
        let username = r.null_str()?;

        let auth_response = if capabilities & CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
            r.lenenc_bytes()?.to_vec()
        } else if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = r.u8()? as usize;
            r.bytes(len)?.to_vec()
        } else {
            r.null_bytes().to_vec()
        };

        let database = if capabilities & CLIENT_CONNECT_WITH_DB != 0 && !r.is_empty() {
            Some(r.null_str()?).filter(|db| !db.is_empty())
        } else {
            None
        };
        let auth_plugin = if capabilities & CLIENT_PLUGIN_AUTH != 0 && !r.is_empty() {
            Some(r.null_str()?)
        } else {
            None
        };

        Ok(Self {
            capabilities,
            max_packet_size,
            charset,
            username,
            auth_response,
            database,
            auth_plugin,
        })
    }
}

/// Build an auth-switch request asking the client to re-scramble with
/// `plugin` against `salt`.
pub fn auth_switch_request(plugin: &str, salt: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(plugin.len() + salt.len() + 3);
    buf.put_u8(AUTH_SWITCH);
    put_null_str(&mut buf, plugin);
    buf.put_slice(salt);
    buf.put_u8(0);
    buf
}

/// Decode an auth-switch request into `(plugin, salt)`.
pub fn parse_auth_switch(payload: &[u8]) -> WireResult<(String, Vec<u8>)> {
    let mut r = Reader::new(payload);
    if r.u8()? != AUTH_SWITCH {
        return Err(WireError::malformed("not an auth switch request"));
    }
    let plugin = r.null_str()?;
    let salt = r.rest();
    let salt = salt.strip_suffix(&[0]).unwrap_or(salt);
    Ok((plugin, salt.to_vec()))
}
