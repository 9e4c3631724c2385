//! MySQL connector against an in-process backend speaking the handshake,
//! COM_PING, COM_RESET_CONNECTION and COM_QUIT.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use sqlgate_pool::{
    BackendConnection, BackendConnector, BackendError, BackendPool, MysqlConnection,
    MysqlConnector, PoolConfig,
};
use sqlgate_wire::auth::{generate_salt, verify_native_password};
use sqlgate_wire::capability::PROXY_CAPABILITIES;
use sqlgate_wire::command::{COM_PING, COM_QUIT, COM_RESET_CONNECTION};
use sqlgate_wire::handshake::{
    AUTH_MORE_DATA, CACHING_SHA2_PLUGIN, FULL_AUTH_REQUIRED, NATIVE_PASSWORD_PLUGIN,
    PROTOCOL_VERSION, auth_switch_request,
};
use sqlgate_wire::response::{err_packet, ok_packet};
use sqlgate_wire::status::SERVER_STATUS_AUTOCOMMIT;
use sqlgate_wire::{HandshakeResponse, InitialHandshake, PacketConn};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Copy, PartialEq)]
enum AuthMode {
    Native,
    SwitchFromCachingSha2,
    FullAuthRequired,
}

#[derive(Default)]
struct Counters {
    pings: AtomicU64,
    resets: AtomicU64,
    quits: AtomicU64,
}

async fn spawn_backend(password: &'static str, mode: AuthMode) -> (String, Arc<Counters>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let counters = Arc::new(Counters::default());
    let shared = Arc::clone(&counters);
    tokio::spawn(async move {
        let mut next_id = 100;
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            next_id += 1;
            let counters = Arc::clone(&shared);
            tokio::spawn(serve(stream, next_id, password, mode, counters));
        }
    });
    (addr, counters)
}

async fn serve(
    stream: TcpStream,
    connection_id: u32,
    password: &'static str,
    mode: AuthMode,
    counters: Arc<Counters>,
) {
    let mut conn = PacketConn::new(stream);
    let salt = generate_salt().to_vec();
    let advertised = match mode {
        AuthMode::Native => NATIVE_PASSWORD_PLUGIN,
        _ => CACHING_SHA2_PLUGIN,
    };
    let greeting = InitialHandshake {
        protocol_version: PROTOCOL_VERSION,
        server_version: "8.0.36-mock".into(),
        connection_id,
        salt: salt.clone(),
        capabilities: PROXY_CAPABILITIES,
        charset: 45,
        status: SERVER_STATUS_AUTOCOMMIT,
        auth_plugin: advertised.into(),
    };
    if conn.send(&greeting.encode()).await.is_err() {
        return;
    }
    let Ok(packet) = conn.read_packet().await else {
        return;
    };
    let response = HandshakeResponse::parse(&packet).unwrap();
    assert_eq!(response.username, "proxy");
    assert_eq!(response.database.as_deref(), Some("app"));

    let auth_response = match mode {
        AuthMode::Native => response.auth_response,
        AuthMode::SwitchFromCachingSha2 => {
            conn.send(&auth_switch_request(NATIVE_PASSWORD_PLUGIN, &salt))
                .await
                .unwrap();
            conn.read_packet().await.unwrap().to_vec()
        }
        AuthMode::FullAuthRequired => {
            conn.send(&[AUTH_MORE_DATA, FULL_AUTH_REQUIRED]).await.unwrap();
            let _ = conn.read_packet().await;
            return;
        }
    };

    if !verify_native_password(password.as_bytes(), &salt, &auth_response) {
        let _ = conn
            .send(&err_packet(1045, "28000", "Access denied for user 'proxy'"))
            .await;
        return;
    }
    conn.send(&ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0))
        .await
        .unwrap();

    loop {
        conn.reset_seq();
        let Ok(packet) = conn.read_packet().await else {
            return;
        };
        let reply = match packet.first().copied() {
            Some(COM_PING) => {
                counters.pings.fetch_add(1, Ordering::SeqCst);
                ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0)
            }
            Some(COM_RESET_CONNECTION) => {
                counters.resets.fetch_add(1, Ordering::SeqCst);
                ok_packet(0, 0, SERVER_STATUS_AUTOCOMMIT, 0)
            }
            Some(COM_QUIT) => {
                counters.quits.fetch_add(1, Ordering::SeqCst);
                return;
            }
            _ => err_packet(1047, "08S01", "Unknown command"),
        };
        if conn.send(&reply).await.is_err() {
            return;
        }
    }
}

fn config(address: String, password: &str) -> PoolConfig {
    PoolConfig {
        address,
        user: "proxy".into(),
        password: password.into(),
        database: Some("app".into()),
        min_alive: 0,
        max_alive: 4,
        max_idle: 2,
        checkout_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_millis(500),
        ..PoolConfig::default()
    }
}

#[tokio::test]
async fn connects_pings_and_resets() {
    let (addr, counters) = spawn_backend("hunter2", AuthMode::Native).await;
    let mut conn = MysqlConnector
        .connect(&config(addr, "hunter2"))
        .await
        .unwrap();

    assert!(conn.connection_id() > 100);
    assert_eq!(conn.server_version(), "8.0.36-mock");
    assert!(conn.ping().await);
    conn.reset().await.unwrap();
    assert_eq!(counters.pings.load(Ordering::SeqCst), 1);
    assert_eq!(counters.resets.load(Ordering::SeqCst), 1);

    conn.close().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.quits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn wrong_password_surfaces_server_error() {
    let (addr, _) = spawn_backend("hunter2", AuthMode::Native).await;
    let err = MysqlConnector
        .connect(&config(addr, "nope"))
        .await
        .unwrap_err();
    match err {
        BackendError::Server(e) => assert_eq!(e.code, 1045),
        other => panic!("expected server error, got {other:?}"),
    }
}

#[tokio::test]
async fn follows_auth_switch_to_native_password() {
    let (addr, _) = spawn_backend("hunter2", AuthMode::SwitchFromCachingSha2).await;
    let mut conn = MysqlConnector
        .connect(&config(addr, "hunter2"))
        .await
        .unwrap();
    assert!(conn.ping().await);
}

#[tokio::test]
async fn full_authentication_is_reported_as_auth_failure() {
    let (addr, _) = spawn_backend("hunter2", AuthMode::FullAuthRequired).await;
    let err = MysqlConnector
        .connect(&config(addr, "hunter2"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Auth(_)), "got {err:?}");
}

#[tokio::test]
async fn ping_fails_after_backend_goes_away() {
    let (addr, _) = spawn_backend("hunter2", AuthMode::Native).await;
    let mut conn = MysqlConnector
        .connect(&config(addr, "hunter2"))
        .await
        .unwrap();
    conn.packets().get_mut().shutdown().await.ok();
    assert!(!conn.ping().await);
}

#[tokio::test]
async fn pool_prewarms_and_drains_mysql_connections() {
    let (addr, counters) = spawn_backend("hunter2", AuthMode::Native).await;
    let pool = BackendPool::<MysqlConnection>::connect(
        "admin",
        PoolConfig {
            min_alive: 2,
            ..config(addr, "hunter2")
        },
        Arc::new(MysqlConnector),
    )
    .await
    .unwrap();
    assert_eq!(pool.stats().idle, 2);

    let mut conn = pool.checkout().await.unwrap();
    // Checkout probes the idle connection first.
    assert_eq!(counters.pings.load(Ordering::SeqCst), 1);
    conn.reset().await.unwrap();
    pool.checkin(conn).await;

    assert_eq!(pool.drain().await, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(counters.quits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pool_reports_unreachable_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let err = BackendPool::<MysqlConnection>::connect(
        "readonly",
        PoolConfig {
            min_alive: 1,
            max_idle: 1,
            ..config(addr, "hunter2")
        },
        Arc::new(MysqlConnector),
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("unreachable"), "got {err}");
}
