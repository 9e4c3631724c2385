//! The proxy server: pool startup, accept loop, shutdown sequence.
//!
//! `run` owns the whole lifecycle. It builds and prewarms both pools, binds
//! the listener, then accepts until the stop signal fires. Each accepted
//! socket gets its own supervised task, so a panicking session is logged and
//! dropped without touching the loop. After the listener closes both pools
//! drain concurrently; sessions still running are left to finish on their own.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use sqlgate_core::ProxyConfig;
use sqlgate_pool::{BackendConnection, BackendConnector, BackendPool, PoolConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tracing::Instrument;

use crate::credentials::CredentialStore;
use crate::error::ProxyError;
use crate::handler::{SessionContext, SessionHandler};
use crate::state::{ServerState, StateCell};
use crate::supervise::spawn_supervised;
use crate::topology::TopologyInitializer;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct ServerShared {
    state: StateCell,
    active_sessions: AtomicUsize,
    next_session_id: AtomicU32,
    local_addr: OnceLock<SocketAddr>,
}

/// Read-only view of a server, usable while `run` is in progress.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shared: Arc<ServerShared>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        self.shared.state.get()
    }

    /// True unless the server is currently accepting connections.
    pub fn is_closed(&self) -> bool {
        self.shared.state.is_closed()
    }

    /// Sessions whose task has not finished yet.
    pub fn active_sessions(&self) -> usize {
        self.shared.active_sessions.load(Ordering::Acquire)
    }

    /// The bound listener address, once the server has reached `Serving`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.shared.local_addr.get().copied()
    }

    /// Wait until the server has reached `target` or any later state.
    /// Returns the state actually observed.
    pub async fn wait_for_state(&self, target: ServerState) -> ServerState {
        self.shared.state.wait_for(|s| s >= target).await
    }
}

/// Decrements the active-session count when the session task ends,
/// including by panic.
struct SessionGuard(Arc<ServerShared>);

impl SessionGuard {
    fn new(shared: Arc<ServerShared>) -> Self {
        shared.active_sessions.fetch_add(1, Ordering::AcqRel);
        Self(shared)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptFault {
    /// The pending connection died before we got to it.
    Transient,
    /// Out of descriptors or memory; retry after a pause.
    Exhausted,
    Fatal,
}

fn classify_accept_error(err: &std::io::Error) -> AcceptFault {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut => return AcceptFault::Transient,
        ErrorKind::OutOfMemory => return AcceptFault::Exhausted,
        _ => {}
    }
    if is_resource_exhaustion(err) {
        AcceptFault::Exhausted
    } else {
        AcceptFault::Fatal
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &std::io::Error) -> bool {
    false
}

/// MySQL-protocol front door over two backend pools.
pub struct ProxyServer<C: BackendConnection, H: SessionHandler<C>> {
    config: ProxyConfig,
    connector: Arc<dyn BackendConnector<Connection = C>>,
    handler: Arc<H>,
    credentials: Arc<CredentialStore>,
    topology: Option<Arc<dyn TopologyInitializer>>,
    shared: Arc<ServerShared>,
}

impl<C: BackendConnection, H: SessionHandler<C>> ProxyServer<C, H> {
    /// Validate `config` and load `[[user_list]]` into the credential store.
    pub fn new(
        config: ProxyConfig,
        connector: Arc<dyn BackendConnector<Connection = C>>,
        handler: H,
    ) -> Result<Self, ProxyError> {
        config.validate()?;
        let credentials = Arc::new(CredentialStore::from_users(&config.user_list));
        if credentials.is_empty() {
            tracing::warn!("user_list is empty; every client login will be rejected");
        }
        Ok(Self {
            config,
            connector,
            handler: Arc::new(handler),
            credentials,
            topology: None,
            shared: Arc::new(ServerShared {
                state: StateCell::new(),
                active_sessions: AtomicUsize::new(0),
                next_session_id: AtomicU32::new(1),
                local_addr: OnceLock::new(),
            }),
        })
    }

    /// Register the hook run when `[p2p] enable = true`.
    pub fn with_topology(mut self, topology: Arc<dyn TopologyInitializer>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Serve until `shutdown` carries `true` (or its sender is dropped).
    ///
    /// Returns once the listener is closed and both pools have drained.
    /// Startup failures (pool prewarm, bind) and fatal accept errors are
    /// returned after the same teardown; the server ends in `Stopped`
    /// either way.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ProxyError> {
        let state = &self.shared.state;
        if !state.transition(ServerState::Uninitialized, ServerState::Starting) {
            return Err(ProxyError::AlreadyStarted);
        }
        tracing::info!(addr = %self.config.server.addr, "starting proxy server");

        let drain_timeout = self.config.server.shutdown_timeout;
        let admin = match BackendPool::connect(
            "admin",
            PoolConfig::from_backend(&self.config.mysql.admin, drain_timeout),
            Arc::clone(&self.connector),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                state.advance(ServerState::Stopped);
                return Err(e.into());
            }
        };
        let readonly = match BackendPool::connect(
            "readonly",
            PoolConfig::from_backend(&self.config.mysql.readonly, drain_timeout),
            Arc::clone(&self.connector),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                admin.drain().await;
                state.advance(ServerState::Stopped);
                return Err(e.into());
            }
        };

        let listener = match TcpListener::bind(&self.config.server.addr).await {
            Ok(listener) => listener,
            Err(source) => {
                tokio::join!(admin.drain(), readonly.drain());
                state.advance(ServerState::Stopped);
                return Err(ProxyError::Bind {
                    addr: self.config.server.addr.clone(),
                    source,
                });
            }
        };
        if let Ok(addr) = listener.local_addr() {
            let _ = self.shared.local_addr.set(addr);
        }

        // The watcher below only exists once the listener does.
        state.transition(ServerState::Starting, ServerState::Serving);
        tracing::info!(
            addr = ?self.shared.local_addr.get(),
            users = self.credentials.len(),
            "proxy server listening"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        for pool in [&admin, &readonly] {
            spawn_supervised(
                "pool-maintenance",
                Arc::clone(pool).run_maintenance(stop_rx.clone()),
                |_| tracing::error!("pool maintenance stopped after a panic"),
            );
        }

        let (closed_tx, mut closed_rx) = oneshot::channel::<()>();
        let watcher = Arc::clone(&self.shared);
        let mut signal = shutdown;
        spawn_supervised(
            "shutdown-watcher",
            async move {
                let mut closed_tx = closed_tx;
                tokio::select! {
                    _ = wait_for_stop(&mut signal) => {
                        watcher.state.transition(ServerState::Serving, ServerState::Draining);
                        tracing::info!("stop signal received, closing listener");
                        let _ = closed_tx.send(());
                    }
                    _ = closed_tx.closed() => {}
                }
            },
            |_| tracing::error!("shutdown watcher panicked; stopping the listener"),
        );

        self.start_topology();

        let result = self
            .accept_loop(&listener, &mut closed_rx, &admin, &readonly)
            .await;
        drop(listener);
        drop(closed_rx);

        state.advance(ServerState::Draining);
        let _ = stop_tx.send(true);
        tracing::info!(
            active_sessions = self.shared.active_sessions.load(Ordering::Acquire),
            "listener closed, draining backend pools"
        );
        let (admin_left, readonly_left) = tokio::join!(admin.drain(), readonly.drain());
        admin.log_stats();
        readonly.log_stats();
        state.advance(ServerState::Stopped);
        tracing::info!(
            admin_outstanding = admin_left,
            readonly_outstanding = readonly_left,
            "proxy server stopped"
        );
        result
    }

    fn start_topology(&self) {
        if !self.config.p2p.enable {
            return;
        }
        let Some(topology) = self.topology.as_ref().map(Arc::clone) else {
            tracing::warn!("p2p is enabled but no topology initializer is registered");
            return;
        };
        let settings = self.config.p2p.clone();
        spawn_supervised(
            "topology",
            async move {
                match topology.initialize(&settings).await {
                    Ok(()) => tracing::info!("topology initialized"),
                    Err(e) => tracing::error!(error = %e, "topology initialization failed"),
                }
            },
            |_| tracing::error!("topology initializer panicked"),
        );
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        closed: &mut oneshot::Receiver<()>,
        admin: &Arc<BackendPool<C>>,
        readonly: &Arc<BackendPool<C>>,
    ) -> Result<(), ProxyError> {
        let limit = self.config.server.accept_retry_limit;
        let mut failures = 0u32;
        let mut backoff = ACCEPT_BACKOFF_START;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = &mut *closed => return Ok(()),
                accepted = listener.accept() => accepted,
            };

            let err = match accepted {
                Ok((stream, peer)) => {
                    failures = 0;
                    backoff = ACCEPT_BACKOFF_START;
                    self.dispatch(stream, peer, admin, readonly);
                    continue;
                }
                Err(e) => e,
            };

            match classify_accept_error(&err) {
                AcceptFault::Transient => {
                    tracing::debug!(error = %err, "transient accept error");
                }
                AcceptFault::Exhausted => {
                    failures += 1;
                    if failures > limit {
                        tracing::error!(error = %err, failures, "accept keeps failing, giving up");
                        return Err(ProxyError::Accept(err));
                    }
                    tracing::warn!(error = %err, failures, backoff = ?backoff, "accept failed, backing off");
                    tokio::select! {
                        biased;
                        _ = &mut *closed => return Ok(()),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
                AcceptFault::Fatal => {
                    tracing::error!(error = %err, "fatal accept error");
                    return Err(ProxyError::Accept(err));
                }
            }
        }
    }

    fn dispatch(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        admin: &Arc<BackendPool<C>>,
        readonly: &Arc<BackendPool<C>>,
    ) {
        stream.set_nodelay(true).ok();
        let session_id = self.next_session_id();
        let ctx = SessionContext {
            session_id,
            peer,
            admin: Arc::clone(admin),
            readonly: Arc::clone(readonly),
            credentials: Arc::clone(&self.credentials),
        };
        let handler = Arc::clone(&self.handler);
        let guard = SessionGuard::new(Arc::clone(&self.shared));
        let span = tracing::info_span!("session", id = session_id, %peer);

        spawn_supervised(
            "session",
            async move {
                let _guard = guard;
                tracing::debug!("session started");
                match handler.handle(stream, ctx).await {
                    Ok(()) => tracing::debug!("session ended"),
                    Err(e) if e.is_disconnect() => {
                        tracing::debug!(error = %e, "client disconnected");
                    }
                    Err(e) => tracing::warn!(error = %e, "session failed"),
                }
            }
            .instrument(span),
            move |panic| {
                tracing::warn!(session_id, %peer, panic, "session terminated by panic");
            },
        );
    }

    fn next_session_id(&self) -> u32 {
        loop {
            let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}

async fn wait_for_stop(signal: &mut watch::Receiver<bool>) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        // A dropped sender can never signal again; treat it as a stop.
        if signal.changed().await.is_err() {
            return;
        }
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ──

impl<C: BackendConnection, H: SessionHandler<C>> std::fmt::Debug for ProxyServer<C, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("addr", &self.config.server.addr)
            .field("state", &self.shared.state.get())
            .field("credentials", &self.credentials)
            .field("topology", &self.topology.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    // ── Accept error classification ────────────────────────────────

    #[test]
    fn aborted_connections_are_transient() {
        for kind in [
            ErrorKind::ConnectionAborted,
            ErrorKind::ConnectionReset,
            ErrorKind::Interrupted,
            ErrorKind::WouldBlock,
            ErrorKind::TimedOut,
        ] {
            assert_eq!(classify_accept_error(&Error::from(kind)), AcceptFault::Transient);
        }
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_backs_off() {
        for code in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let err = Error::from_raw_os_error(code);
            assert_eq!(classify_accept_error(&err), AcceptFault::Exhausted, "{err}");
        }
    }

    #[test]
    fn other_errors_are_fatal() {
        assert_eq!(
            classify_accept_error(&Error::from(ErrorKind::PermissionDenied)),
            AcceptFault::Fatal
        );
        assert_eq!(
            classify_accept_error(&Error::other("listener poisoned")),
            AcceptFault::Fatal
        );
    }

    // ── Stop signal ────────────────────────────────────────────────

    #[tokio::test]
    async fn stop_on_true() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_stop(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn stop_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), wait_for_stop(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn already_true_stops_immediately() {
        let (_tx, mut rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_millis(100), wait_for_stop(&mut rx))
            .await
            .unwrap();
    }

    // ── Session guard ──────────────────────────────────────────────

    #[test]
    fn session_guard_counts() {
        let shared = Arc::new(ServerShared {
            state: StateCell::new(),
            active_sessions: AtomicUsize::new(0),
            next_session_id: AtomicU32::new(1),
            local_addr: OnceLock::new(),
        });
        let a = SessionGuard::new(Arc::clone(&shared));
        let b = SessionGuard::new(Arc::clone(&shared));
        assert_eq!(shared.active_sessions.load(Ordering::SeqCst), 2);
        drop(a);
        assert_eq!(shared.active_sessions.load(Ordering::SeqCst), 1);
        drop(b);
        assert_eq!(shared.active_sessions.load(Ordering::SeqCst), 0);
    }
}
