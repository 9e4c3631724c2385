//! MySQL connector: client-side handshake, `COM_PING` probe, `COM_QUIT` close.
//!
//! ```text
//! backend ──HandshakeV10──────────────▶ connector
//! backend ◀─HandshakeResponse41──────── connector   (scramble for the advertised plugin)
//! backend ──[AuthSwitch | AuthMoreData]▶ connector   (optional, at most a few rounds)
//! backend ──OK | ERR──────────────────▶ connector
//! ```
//!
//! Only `mysql_native_password` and the fast path of `caching_sha2_password`
//! are supported; a backend asking for caching_sha2 full authentication
//! (which needs TLS or RSA key exchange) is reported as an auth failure.

use bytes::BytesMut;
use sqlgate_wire::auth::{caching_sha2_scramble, native_password_scramble};
use sqlgate_wire::capability::{CLIENT_PLUGIN_AUTH, CLIENT_PROTOCOL_41, PROXY_CAPABILITIES};
use sqlgate_wire::command::{COM_PING, COM_QUIT, COM_RESET_CONNECTION};
use sqlgate_wire::handshake::{
    AUTH_MORE_DATA, AUTH_SWITCH, CACHING_SHA2_PLUGIN, FAST_AUTH_SUCCESS, FULL_AUTH_REQUIRED,
    NATIVE_PASSWORD_PLUGIN, parse_auth_switch,
};
use sqlgate_wire::packet::MAX_PACKET_SIZE;
use sqlgate_wire::response::{ERR_HEADER, OK_HEADER, is_ok};
use sqlgate_wire::{
    CHARSET_UTF8MB4_GENERAL_CI, HandshakeResponse, InitialHandshake, PacketConn, ServerError,
    WireError,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::config::PoolConfig;
use crate::connector::{BackendConnection, BackendConnector, BoxFuture};
use crate::error::BackendError;

/// Auth-switch and AuthMoreData exchanges tolerated before giving up.
const MAX_AUTH_ROUNDS: usize = 4;

/// An authenticated MySQL backend connection.
#[derive(Debug)]
pub struct MysqlConnection {
    conn: PacketConn<TcpStream>,
    connection_id: u32,
    server_version: String,
}

impl MysqlConnection {
    /// Run the client side of the connection phase over `stream`.
    pub async fn handshake(stream: TcpStream, config: &PoolConfig) -> Result<Self, BackendError> {
        stream.set_nodelay(true).ok();
        let mut conn = PacketConn::new(stream);

        let greeting = InitialHandshake::parse(&conn.read_packet().await?)?;
        if greeting.capabilities & CLIENT_PROTOCOL_41 == 0 {
            return Err(WireError::Malformed("backend does not speak protocol 4.1".into()).into());
        }

        let supports_plugins = greeting.capabilities & CLIENT_PLUGIN_AUTH != 0;
        let mut plugin = if greeting.auth_plugin == CACHING_SHA2_PLUGIN {
            CACHING_SHA2_PLUGIN.to_string()
        } else {
            NATIVE_PASSWORD_PLUGIN.to_string()
        };
        let response = HandshakeResponse {
            capabilities: PROXY_CAPABILITIES & greeting.capabilities,
            max_packet_size: MAX_PACKET_SIZE as u32,
            charset: CHARSET_UTF8MB4_GENERAL_CI,
            username: config.user.clone(),
            auth_response: scramble(&plugin, config.password.as_bytes(), &greeting.salt)?,
            database: config.database.clone(),
            auth_plugin: supports_plugins.then(|| plugin.clone()),
        };
        conn.send(&response.encode()).await?;

        for _ in 0..MAX_AUTH_ROUNDS {
            let packet = conn.read_packet().await?;
            match packet.first().copied() {
                Some(OK_HEADER) => {
                    tracing::debug!(
                        address = %config.address,
                        connection_id = greeting.connection_id,
                        server_version = %greeting.server_version,
                        plugin = %plugin,
                        "mysql backend authenticated"
                    );
                    return Ok(Self {
                        conn,
                        connection_id: greeting.connection_id,
                        server_version: greeting.server_version,
                    });
                }
                Some(ERR_HEADER) => return Err(ServerError::parse(&packet)?.into()),
                Some(AUTH_SWITCH) => {
                    let (requested, salt) = parse_auth_switch(&packet)?;
                    let reply = scramble(&requested, config.password.as_bytes(), &salt)?;
                    plugin = requested;
                    conn.send(&reply).await?;
                }
                Some(AUTH_MORE_DATA) => match packet.get(1).copied() {
                    Some(FAST_AUTH_SUCCESS) => continue,
                    Some(FULL_AUTH_REQUIRED) => {
                        return Err(BackendError::Auth(
                            "caching_sha2_password full authentication requires a secure \
                             channel; use mysql_native_password for the proxy account"
                                .into(),
                        ));
                    }
                    other => {
                        return Err(BackendError::Auth(format!(
                            "unexpected auth data {other:?} during {plugin}"
                        )));
                    }
                },
                other => {
                    return Err(WireError::Malformed(format!(
                        "unexpected packet 0x{:02x} during authentication",
                        other.unwrap_or_default()
                    ))
                    .into());
                }
            }
        }
        Err(BackendError::Auth("too many authentication round trips".into()))
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Raw packet access for relaying commands.
    pub fn packets(&mut self) -> &mut PacketConn<TcpStream> {
        &mut self.conn
    }

    /// `COM_RESET_CONNECTION`: drop session state (variables, temporary
    /// tables, open transaction) so the connection can be reused.
    pub async fn reset(&mut self) -> Result<(), BackendError> {
        self.command(&[COM_RESET_CONNECTION]).await.map(|_| ())
    }

    /// Send a single-packet command and read a single-packet reply.
    async fn command(&mut self, payload: &[u8]) -> Result<BytesMut, BackendError> {
        self.conn.reset_seq();
        self.conn.send(payload).await?;
        let reply = self.conn.read_packet().await?;
        if reply.first() == Some(&ERR_HEADER) {
            return Err(ServerError::parse(&reply)?.into());
        }
        Ok(reply)
    }
}

impl BackendConnection for MysqlConnection {
    fn ping(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match self.command(&[COM_PING]).await {
                Ok(reply) => is_ok(&reply),
                Err(e) => {
                    tracing::debug!(connection_id = self.connection_id, error = %e, "mysql COM_PING failed");
                    false
                }
            }
        })
    }

    fn close(mut self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.conn.reset_seq();
            // The server closes without replying.
            let _ = self.conn.send(&[COM_QUIT]).await;
            let _ = self.conn.get_mut().shutdown().await;
        })
    }
}

fn scramble(plugin: &str, password: &[u8], salt: &[u8]) -> Result<Vec<u8>, BackendError> {
    match plugin {
        NATIVE_PASSWORD_PLUGIN => Ok(native_password_scramble(password, salt)),
        CACHING_SHA2_PLUGIN => Ok(caching_sha2_scramble(password, salt)),
        other => Err(BackendError::Auth(format!("unsupported auth plugin {other}"))),
    }
}

/// Opens authenticated [`MysqlConnection`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MysqlConnector;

impl BackendConnector for MysqlConnector {
    type Connection = MysqlConnection;

    fn connect<'a>(
        &'a self,
        config: &'a PoolConfig,
    ) -> BoxFuture<'a, Result<MysqlConnection, BackendError>> {
        Box::pin(async move {
            let stream = TcpStream::connect(config.address.as_str()).await?;
            MysqlConnection::handshake(stream, config).await
        })
    }
}
