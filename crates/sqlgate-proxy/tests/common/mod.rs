//! Shared fixtures: config builders, a server launcher, and an in-process
//! MySQL backend that answers every SELECT with its own name.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use sqlgate_core::{BackendConfig, MysqlConfig, P2pConfig, ProxyConfig, ServerConfig, UserConfig};
use sqlgate_pool::{BackendConnection, BackendConnector, BackendError, MysqlConnection, MysqlConnector, PoolConfig};
use sqlgate_proxy::{ProxyError, ProxyServer, ServerHandle, ServerState, SessionHandler};
use sqlgate_wire::auth::{generate_salt, verify_native_password};
use sqlgate_wire::capability::PROXY_CAPABILITIES;
use sqlgate_wire::codec::{Reader, put_lenenc_bytes, put_lenenc_int};
use sqlgate_wire::command::{COM_FIELD_LIST, COM_PING, COM_QUERY, COM_QUIT, COM_RESET_CONNECTION};
use sqlgate_wire::handshake::{NATIVE_PASSWORD_PLUGIN, PROTOCOL_VERSION};
use sqlgate_wire::response::{eof_packet, err_packet, is_eof, is_err, is_ok, ok_packet};
use sqlgate_wire::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use sqlgate_wire::{HandshakeResponse, InitialHandshake, PacketConn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const BACKEND_USER: &str = "proxy";
pub const BACKEND_PASSWORD: &str = "backend-pw";
pub const CLIENT_USER: &str = "app";
pub const CLIENT_PASSWORD: &str = "s3cret";
pub const DATABASE: &str = "app";

/// Install a test subscriber once; `RUST_LOG` controls output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Config ─────────────────────────────────────────────────────

pub fn backend(addr: &str) -> BackendConfig {
    BackendConfig {
        addr: addr.to_string(),
        user: BACKEND_USER.to_string(),
        password: BACKEND_PASSWORD.to_string(),
        db_name: DATABASE.to_string(),
        min_alive: 1,
        max_alive: 4,
        max_idle: 2,
        checkout_timeout: Duration::from_millis(300),
        connect_timeout: Duration::from_secs(2),
        idle_timeout: Duration::from_secs(300),
        health_check_interval: Duration::from_secs(30),
    }
}

pub fn proxy_config(admin: BackendConfig, readonly: BackendConfig) -> ProxyConfig {
    ProxyConfig {
        server: ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            shutdown_timeout: Duration::from_secs(2),
            accept_retry_limit: 8,
        },
        mysql: MysqlConfig { admin, readonly },
        user_list: vec![UserConfig {
            user: CLIENT_USER.to_string(),
            password: CLIENT_PASSWORD.to_string(),
            database: None,
        }],
        p2p: P2pConfig::default(),
    }
}

// ── Server launcher ────────────────────────────────────────────

pub struct Running {
    pub handle: ServerHandle,
    pub addr: SocketAddr,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<Result<(), ProxyError>>,
}

impl Running {
    /// Signal shutdown and wait for `run` to return.
    pub async fn shutdown(self) -> Result<(), ProxyError> {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("server did not stop in time")
            .expect("server task panicked")
    }
}

pub async fn start<C, H>(server: ProxyServer<C, H>) -> Running
where
    C: BackendConnection,
    H: SessionHandler<C>,
{
    let handle = server.handle();
    let (stop, rx) = watch::channel(false);
    let task = tokio::spawn(async move { server.run(rx).await });
    let state = tokio::time::timeout(Duration::from_secs(5), handle.wait_for_state(ServerState::Serving))
        .await
        .expect("server did not start in time");
    assert_eq!(state, ServerState::Serving, "server failed to start");
    let addr = handle.local_addr().expect("serving server has an address");
    Running {
        handle,
        addr,
        stop,
        task,
    }
}

/// Poll until `cond` holds or a second passes.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Plain TCP backend ──────────────────────────────────────────

/// Accepts connections and holds them open until the test ends.
pub async fn spawn_tcp_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

pub async fn unused_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

// ── Mock MySQL backend ─────────────────────────────────────────

#[derive(Clone)]
pub struct MockMysql {
    pub addr: String,
    pub queries: Arc<Mutex<Vec<String>>>,
    pub resets: Arc<AtomicU64>,
    pub connections: Arc<AtomicU64>,
}

impl MockMysql {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

pub async fn spawn_mock_mysql(name: &'static str) -> MockMysql {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mock = MockMysql {
        addr: listener.local_addr().unwrap().to_string(),
        queries: Arc::default(),
        resets: Arc::default(),
        connections: Arc::default(),
    };
    let shared = mock.clone();
    tokio::spawn(async move {
        let mut next_id = 0;
        while let Ok((stream, _)) = listener.accept().await {
            next_id += 1;
            shared.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_mysql(stream, name, next_id, shared.clone()));
        }
    });
    mock
}

async fn serve_mysql(stream: TcpStream, name: &'static str, connection_id: u32, mock: MockMysql) {
    let mut conn = PacketConn::new(stream);
    let salt = generate_salt();
    let greeting = InitialHandshake {
        protocol_version: PROTOCOL_VERSION,
        server_version: format!("8.0.36-{name}"),
        connection_id,
        salt: salt.to_vec(),
        capabilities: PROXY_CAPABILITIES,
        charset: 45,
        status: SERVER_STATUS_AUTOCOMMIT,
        auth_plugin: NATIVE_PASSWORD_PLUGIN.to_string(),
    };
    if conn.send(&greeting.encode()).await.is_err() {
        return;
    }
    let Ok(packet) = conn.read_packet().await else {
        return;
    };
    let Ok(response) = HandshakeResponse::parse(&packet) else {
        return;
    };
    if !verify_native_password(BACKEND_PASSWORD.as_bytes(), &salt, &response.auth_response) {
        let _ = conn.send(&err_packet(1045, "28000", "Access denied")).await;
        return;
    }
    if conn.send(&ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0)).await.is_err() {
        return;
    }

    let mut in_trans = false;
    let mut autocommit = true;
    loop {
        conn.reset_seq();
        let Ok(packet) = conn.read_packet().await else {
            return;
        };
        let status = status_flags(in_trans, autocommit);
        let replies = match packet.first().copied() {
            Some(COM_QUERY) => {
                let sql = String::from_utf8_lossy(&packet[1..]).to_string();
                mock.queries.lock().unwrap().push(sql.clone());
                let upper = sql.trim().to_ascii_uppercase();
                if upper.starts_with("CRASH") {
                    return;
                }
                if upper.starts_with("SELECT") {
                    vec![
                        column_count(1),
                        column_def("backend"),
                        eof_packet(0, status),
                        text_row(name),
                        eof_packet(0, status),
                    ]
                } else {
                    if upper.starts_with("BEGIN") || upper.starts_with("START TRANSACTION") {
                        in_trans = true;
                    } else if upper.starts_with("COMMIT") || upper.starts_with("ROLLBACK") {
                        in_trans = false;
                    } else if upper.replace(' ', "") == "SETAUTOCOMMIT=0" {
                        autocommit = false;
                    } else if upper.replace(' ', "") == "SETAUTOCOMMIT=1" {
                        autocommit = true;
                    }
                    vec![ok_packet(1, 0, status_flags(in_trans, autocommit), 0)]
                }
            }
            Some(COM_FIELD_LIST) => vec![column_def("id"), eof_packet(0, status)],
            Some(COM_PING) => vec![ok_packet(0, 0, status, 0)],
            Some(COM_RESET_CONNECTION) => {
                mock.resets.fetch_add(1, Ordering::SeqCst);
                in_trans = false;
                autocommit = true;
                vec![ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0)]
            }
            Some(COM_QUIT) | None => return,
            Some(_) => vec![err_packet(1047, "08S01", "Unknown command")],
        };
        for reply in &replies {
            if conn.write_packet(reply).await.is_err() {
                return;
            }
        }
        if conn.flush().await.is_err() {
            return;
        }
    }
}

fn status_flags(in_trans: bool, autocommit: bool) -> u16 {
    let mut status = 0;
    if in_trans {
        status |= SERVER_STATUS_IN_TRANS;
    }
    if autocommit {
        status |= SERVER_STATUS_AUTOCOMMIT;
    }
    status
}

fn column_count(n: u64) -> BytesMut {
    let mut buf = BytesMut::new();
    put_lenenc_int(&mut buf, n);
    buf
}

fn column_def(name: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    for part in ["def", DATABASE, "t", "t", name, name] {
        put_lenenc_bytes(&mut buf, part.as_bytes());
    }
    buf.put_u8(0x0c);
    buf.put_u16_le(45);
    buf.put_u32_le(255);
    buf.put_u8(0xfd);
    buf.put_u16_le(0);
    buf.put_u8(0);
    buf.put_u16_le(0);
    buf
}

fn text_row(value: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    put_lenenc_bytes(&mut buf, value.as_bytes());
    buf
}

// ── MySQL client ───────────────────────────────────────────────

pub async fn connect_client(
    addr: SocketAddr,
    user: &str,
    password: &str,
    database: Option<&str>,
) -> Result<MysqlConnection, BackendError> {
    MysqlConnector
        .connect(&PoolConfig {
            address: addr.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            database: database.map(str::to_string),
            ..PoolConfig::default()
        })
        .await
}

pub async fn connect_app(addr: SocketAddr) -> MysqlConnection {
    connect_client(addr, CLIENT_USER, CLIENT_PASSWORD, Some(DATABASE))
        .await
        .expect("client login")
}

/// Send a raw command and collect the full response.
pub async fn command(conn: &mut MysqlConnection, payload: &[u8]) -> Vec<BytesMut> {
    let packets = conn.packets();
    packets.reset_seq();
    packets.send(payload).await.unwrap();
    let first = packets.read_packet().await.unwrap();
    if is_ok(&first) || is_err(&first) || payload.first() != Some(&COM_QUERY) {
        let mut out = vec![first];
        if payload.first() == Some(&COM_FIELD_LIST) && !is_eof(&out[0]) && !is_err(&out[0]) {
            loop {
                let p = packets.read_packet().await.unwrap();
                let done = is_eof(&p) || is_err(&p);
                out.push(p);
                if done {
                    break;
                }
            }
        }
        return out;
    }
    let mut out = vec![first];
    let mut eofs = 0;
    while eofs < 2 {
        let p = packets.read_packet().await.unwrap();
        if is_eof(&p) {
            eofs += 1;
        }
        let failed = is_err(&p);
        out.push(p);
        if failed {
            break;
        }
    }
    out
}

pub async fn query(conn: &mut MysqlConnection, sql: &str) -> Vec<BytesMut> {
    let mut payload = vec![COM_QUERY];
    payload.extend_from_slice(sql.as_bytes());
    command(conn, &payload).await
}

/// Which mock answered a plain read.
pub async fn which_backend(conn: &mut MysqlConnection) -> String {
    let packets = query(conn, "SELECT name FROM whoami").await;
    assert_eq!(packets.len(), 5, "expected a one-row result set");
    let mut reader = Reader::new(&packets[3]);
    String::from_utf8(reader.lenenc_bytes().unwrap().to_vec()).unwrap()
}

pub fn error_code(packet: &[u8]) -> u16 {
    sqlgate_wire::ServerError::parse(packet).unwrap().code
}
