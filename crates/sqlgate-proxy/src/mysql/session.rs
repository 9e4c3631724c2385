//! One MySQL client session.
//!
//! ```text
//! proxy  ──HandshakeV10 (salt, id = session id)──▶ client
//! proxy  ◀─HandshakeResponse41──────────────────── client
//! proxy  ──AuthSwitch(mysql_native_password)─────▶ client   (only for other plugins)
//! proxy  ──OK | ERR 1045 | ERR 1044──────────────▶ client
//! loop:
//!   proxy ◀─command──  client
//!   QUIT → end, PING / INIT_DB → answered locally,
//!   QUERY → router → admin or readonly backend → relayed response
//! ```
//!
//! Backend connections are leased on first use and held until the session
//! ends, at most one per pool. On the way out each is reset and checked in.

use std::net::IpAddr;

use bytes::BytesMut;
use sqlgate_pool::{BackendPool, BoxFuture, MysqlConnection, PoolError, PooledConnection};
use sqlgate_wire::auth::generate_salt;
use sqlgate_wire::capability::PROXY_CAPABILITIES;
use sqlgate_wire::command::{
    COM_FIELD_LIST, COM_INIT_DB, COM_PING, COM_QUERY, COM_QUIT, COM_STATISTICS,
};
use sqlgate_wire::handshake::{NATIVE_PASSWORD_PLUGIN, PROTOCOL_VERSION, auth_switch_request};
use sqlgate_wire::response::codes::{
    CR_SERVER_LOST, ER_ACCESS_DENIED_ERROR, ER_CON_COUNT_ERROR, ER_DBACCESS_DENIED_ERROR,
    ER_HANDSHAKE_ERROR, ER_UNKNOWN_COM_ERROR, STATE_ACCESS_DENIED, STATE_COMMUNICATION,
    STATE_CONNECTION_REJECTED, STATE_GENERAL, STATE_SYNTAX_OR_ACCESS,
};
use sqlgate_wire::response::{err_packet, ok_packet};
use sqlgate_wire::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use sqlgate_wire::{CHARSET_UTF8MB4_GENERAL_CI, HandshakeResponse, InitialHandshake, PacketConn};
use tokio::net::TcpStream;

use super::relay::{RelayError, ResponseKind, relay};
use super::router::{Route, Statement, classify, route};
use crate::error::SessionError;
use crate::handler::{SessionContext, SessionHandler};

const DEFAULT_SERVER_VERSION: &str = "5.7.44-sqlgate";

/// Serves MySQL clients over [`MysqlConnection`] pools.
#[derive(Debug, Clone)]
pub struct MysqlSessionHandler {
    server_version: String,
}

impl MysqlSessionHandler {
    /// `server_version` is what clients see in the greeting.
    pub fn new(server_version: impl Into<String>) -> Self {
        Self {
            server_version: server_version.into(),
        }
    }
}

impl Default for MysqlSessionHandler {
    fn default() -> Self {
        Self::new(DEFAULT_SERVER_VERSION)
    }
}

impl SessionHandler<MysqlConnection> for MysqlSessionHandler {
    fn handle(
        &self,
        stream: TcpStream,
        ctx: SessionContext<MysqlConnection>,
    ) -> BoxFuture<'_, Result<(), SessionError>> {
        Box::pin(async move {
            let mut session = Session {
                client: PacketConn::new(stream),
                ctx,
                user: String::new(),
                admin: None,
                readonly: None,
                in_transaction: false,
                autocommit: true,
            };
            let result = match session.handshake(&self.server_version).await {
                Ok(true) => session.command_loop().await,
                Ok(false) => Ok(()),
                Err(e) => Err(e),
            };
            session.release().await;
            result
        })
    }
}

/// Whether the command loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

type Lease = Option<PooledConnection<MysqlConnection>>;

struct Session {
    client: PacketConn<TcpStream>,
    ctx: SessionContext<MysqlConnection>,
    user: String,
    admin: Lease,
    readonly: Lease,
    in_transaction: bool,
    autocommit: bool,
}

impl Session {
    fn peer_ip(&self) -> IpAddr {
        self.ctx.peer.ip()
    }

    fn status(&self) -> u16 {
        let mut status = 0;
        if self.in_transaction {
            status |= SERVER_STATUS_IN_TRANS;
        }
        if self.autocommit {
            status |= SERVER_STATUS_AUTOCOMMIT;
        }
        status
    }

    /// Reads must see this session's own uncommitted writes.
    fn pinned(&self) -> bool {
        self.in_transaction || !self.autocommit
    }

    /// Returns `Ok(false)` when the client was rejected with an ERR packet.
    async fn handshake(&mut self, server_version: &str) -> Result<bool, SessionError> {
        let salt = generate_salt();
        let greeting = InitialHandshake {
            protocol_version: PROTOCOL_VERSION,
            server_version: server_version.to_string(),
            connection_id: self.ctx.session_id,
            salt: salt.to_vec(),
            capabilities: PROXY_CAPABILITIES,
            charset: CHARSET_UTF8MB4_GENERAL_CI,
            status: SERVER_STATUS_AUTOCOMMIT,
            auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
        };
        self.client.send(&greeting.encode()).await?;

        let packet = self.client.read_packet().await?;
        let response = match HandshakeResponse::parse(&packet) {
            Ok(response) => response,
            Err(e) => {
                self.client
                    .send(&err_packet(ER_HANDSHAKE_ERROR, STATE_COMMUNICATION, "Bad handshake"))
                    .await?;
                return Err(SessionError::Protocol(format!("bad handshake response: {e}")));
            }
        };
        self.user = response.username.clone();

        let auth_response = match response.auth_plugin.as_deref() {
            Some(plugin) if plugin != NATIVE_PASSWORD_PLUGIN => {
                tracing::debug!(plugin, "switching client to mysql_native_password");
                self.client
                    .send(&auth_switch_request(NATIVE_PASSWORD_PLUGIN, &salt))
                    .await?;
                self.client.read_packet().await?.to_vec()
            }
            _ => response.auth_response,
        };

        if !self
            .ctx
            .credentials
            .verify_scramble(&self.user, &salt, &auth_response)
        {
            tracing::info!(user = %self.user, "client authentication failed");
            let message = format!(
                "Access denied for user '{}'@'{}' (using password: {})",
                self.user,
                self.peer_ip(),
                if auth_response.is_empty() { "NO" } else { "YES" }
            );
            self.client
                .send(&err_packet(ER_ACCESS_DENIED_ERROR, STATE_ACCESS_DENIED, &message))
                .await?;
            return Ok(false);
        }

        if let Some(db) = response.database.as_deref() {
            if !self.database_allowed(db) {
                tracing::info!(user = %self.user, database = db, "database access denied");
                self.client.send(&self.db_denied(db)).await?;
                return Ok(false);
            }
        }

        self.client.send(&ok_packet(0, 0, self.status(), 0)).await?;
        tracing::info!(user = %self.user, database = ?response.database, "client authenticated");
        Ok(true)
    }

    async fn command_loop(&mut self) -> Result<(), SessionError> {
        loop {
            self.client.reset_seq();
            let packet = match self.client.read_packet().await {
                Ok(packet) => packet,
                Err(e) if e.is_disconnect() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            let Some(&command) = packet.first() else {
                return Err(SessionError::Protocol("empty command packet".into()));
            };

            let flow = match command {
                COM_QUIT => return Ok(()),
                COM_PING => {
                    self.client.send(&ok_packet(0, 0, self.status(), 0)).await?;
                    Flow::Continue
                }
                COM_INIT_DB => {
                    let db = String::from_utf8_lossy(&packet[1..]).into_owned();
                    self.select_database(&db).await?;
                    Flow::Continue
                }
                COM_QUERY => self.query(&packet).await?,
                COM_FIELD_LIST => {
                    self.forward(Route::Admin, &packet, ResponseKind::FieldList)
                        .await?
                }
                COM_STATISTICS => self.forward(Route::Admin, &packet, ResponseKind::Single).await?,
                other => {
                    tracing::debug!(command = other, "unsupported command");
                    self.client
                        .send(&err_packet(ER_UNKNOWN_COM_ERROR, STATE_COMMUNICATION, "Unknown command"))
                        .await?;
                    Flow::Continue
                }
            };
            if flow == Flow::Close {
                return Ok(());
            }
        }
    }

    async fn query(&mut self, packet: &BytesMut) -> Result<Flow, SessionError> {
        let sql = String::from_utf8_lossy(&packet[1..]);
        let statement = classify(&sql);
        if let Statement::Use(db) = &statement {
            self.select_database(db).await?;
            return Ok(Flow::Continue);
        }
        if statement == Statement::Begin {
            self.in_transaction = true;
        }
        let target = route(&statement, self.pinned());
        tracing::debug!(route = target.as_str(), statement = ?statement, "routing query");
        self.forward(target, packet, ResponseKind::Query).await
    }

    /// Relay `packet` through the `target` pool's connection.
    async fn forward(
        &mut self,
        target: Route,
        packet: &[u8],
        kind: ResponseKind,
    ) -> Result<Flow, SessionError> {
        let (pool, slot) = match target {
            Route::Admin => (&self.ctx.admin, &mut self.admin),
            Route::Readonly => (&self.ctx.readonly, &mut self.readonly),
        };

        let conn = match lease(slot, pool).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(pool = pool.name(), error = %e, "backend checkout failed");
                self.client.send(&pool_error_packet(&e)).await?;
                return Ok(Flow::Continue);
            }
        };

        match relay(&mut self.client, conn.packets(), packet, kind).await {
            Ok(outcome) => {
                if target == Route::Admin {
                    if let Some(status) = outcome.status {
                        self.in_transaction = status & SERVER_STATUS_IN_TRANS != 0;
                        self.autocommit = status & SERVER_STATUS_AUTOCOMMIT != 0;
                    }
                }
                Ok(Flow::Continue)
            }
            Err(RelayError::Backend { source, forwarded }) => {
                tracing::warn!(pool = pool.name(), error = %source, forwarded, "backend failed mid-command");
                if let Some(mut conn) = slot.take() {
                    conn.mark_broken();
                    pool.checkin(conn).await;
                }
                if target == Route::Admin {
                    // Whatever transaction the backend held is gone with it.
                    self.in_transaction = false;
                    self.autocommit = true;
                }
                if forwarded {
                    // The client has a partial response; it cannot be resynchronised.
                    return Ok(Flow::Close);
                }
                self.client
                    .send(&err_packet(
                        CR_SERVER_LOST,
                        STATE_GENERAL,
                        "Lost connection to backend server during query",
                    ))
                    .await?;
                Ok(Flow::Continue)
            }
            Err(RelayError::Client(e)) => {
                if let Some(mut conn) = slot.take() {
                    conn.mark_broken();
                    pool.checkin(conn).await;
                }
                Err(e.into())
            }
        }
    }

    async fn select_database(&mut self, db: &str) -> Result<(), SessionError> {
        let reply = if self.database_allowed(db) {
            ok_packet(0, 0, self.status(), 0)
        } else {
            tracing::info!(user = %self.user, database = db, "database access denied");
            self.db_denied(db)
        };
        self.client.send(&reply).await?;
        Ok(())
    }

    /// Allowed for the user and the database the admin pool is bound to.
    fn database_allowed(&self, db: &str) -> bool {
        if !self.ctx.credentials.allows_database(&self.user, db) {
            return false;
        }
        match self.ctx.admin.config().database.as_deref() {
            Some(bound) => bound == db,
            None => true,
        }
    }

    fn db_denied(&self, db: &str) -> BytesMut {
        err_packet(
            ER_DBACCESS_DENIED_ERROR,
            STATE_SYNTAX_OR_ACCESS,
            &format!(
                "Access denied for user '{}'@'{}' to database '{}'",
                self.user,
                self.peer_ip(),
                db
            ),
        )
    }

    /// Reset and check in every held backend connection.
    async fn release(&mut self) {
        for (pool, slot) in [
            (&self.ctx.admin, &mut self.admin),
            (&self.ctx.readonly, &mut self.readonly),
        ] {
            let Some(mut conn) = slot.take() else {
                continue;
            };
            if !conn.is_broken() {
                if let Err(e) = conn.reset().await {
                    tracing::debug!(pool = pool.name(), error = %e, "backend reset failed");
                    conn.mark_broken();
                }
            }
            pool.checkin(conn).await;
        }
    }
}

/// The connection held in `slot`, checking one out of `pool` first if needed.
async fn lease<'a>(
    slot: &'a mut Lease,
    pool: &BackendPool<MysqlConnection>,
) -> Result<&'a mut PooledConnection<MysqlConnection>, PoolError> {
    let conn = match slot.take() {
        Some(conn) => conn,
        None => pool.checkout().await?,
    };
    Ok(slot.insert(conn))
}

fn pool_error_packet(err: &PoolError) -> BytesMut {
    match err {
        PoolError::Exhausted { .. } | PoolError::Draining { .. } => err_packet(
            ER_CON_COUNT_ERROR,
            STATE_CONNECTION_REJECTED,
            "Too many connections",
        ),
        other => err_packet(
            CR_SERVER_LOST,
            STATE_GENERAL,
            &format!("Backend unavailable: {other}"),
        ),
    }
}
