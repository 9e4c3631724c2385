//! The backend connection pool.
//!
//! Accounting lives behind one `std::sync::Mutex` per pool that is never held
//! across an `.await`. Opening, probing and closing connections all happen
//! outside the lock; capacity for a connection that is still being opened is
//! held by a [`Slot`] so a cancelled checkout gives it back.
//!
//! Invariants, checked by the tests below:
//!
//! - `checked_out + idle <= total <= max_alive`
//! - `idle <= max_idle`; surplus connections are closed, not dropped
//! - a connection that failed its probe is never handed out

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::PoolConfig;
use crate::connector::{BackendConnection, BackendConnector};
use crate::error::{BackendError, PoolError};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Point-in-time counters for one pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections currently held by sessions.
    pub checked_out: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Open connections plus connections being opened.
    pub total: usize,
    /// Checkouts that had to wait for capacity.
    pub wait_count: u64,
    /// Connections opened over the pool's lifetime.
    pub opened: u64,
    /// Connections closed over the pool's lifetime.
    pub closed: u64,
}

struct IdleConnection<C> {
    id: u64,
    conn: C,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<C> {
    idle: VecDeque<IdleConnection<C>>,
    checked_out: usize,
    total: usize,
    draining: bool,
    next_id: u64,
    wait_count: u64,
    opened: u64,
    closed: u64,
}

impl<C> PoolState<C> {
    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Account for a connection that leaves the pool for good.
    fn forget_one(&mut self) {
        self.total = self.total.saturating_sub(1);
        self.closed += 1;
    }
}

struct Shared<C> {
    state: Mutex<PoolState<C>>,
    /// Woken whenever capacity comes back: checkin, close, released slot.
    notify: Notify,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Reserved capacity with no connection in it yet. Dropping an armed slot,
/// for instance when a checkout future is cancelled mid-connect, returns the
/// capacity to the pool.
struct Slot<C> {
    shared: Arc<Shared<C>>,
    armed: bool,
}

impl<C> Slot<C> {
    fn fill(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for Slot<C> {
    fn drop(&mut self) {
        if self.armed {
            {
                let mut state = self.shared.lock();
                state.total = state.total.saturating_sub(1);
            }
            self.shared.notify.notify_one();
        }
    }
}

/// A connection checked out of a [`BackendPool`].
///
/// Return it with [`BackendPool::checkin`]. Dropping it instead closes the
/// connection and frees its slot, so a failed or panicking session never
/// leaks capacity.
pub struct PooledConnection<C: BackendConnection> {
    conn: Option<C>,
    id: u64,
    created_at: Instant,
    broken: bool,
    shared: Arc<Shared<C>>,
}

impl<C: BackendConnection> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Flag the connection as unusable; checkin will close it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl<C: BackendConnection> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection is present until checkin")
    }
}

impl<C: BackendConnection> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection is present until checkin")
    }
}

impl<C: BackendConnection> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        {
            let mut state = self.shared.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            state.forget_one();
        }
        self.shared.notify.notify_one();
        tracing::debug!(
            connection_id = self.id,
            "connection dropped without checkin, closing"
        );
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(conn.close());
        }
    }
}

impl<C: BackendConnection> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("conn", &self.conn)
            .finish()
    }
}

enum Step<C> {
    Probe(IdleConnection<C>),
    Open(Slot<C>),
    Wait,
}

/// A bounded pool of connections to one backend.
pub struct BackendPool<C: BackendConnection> {
    name: String,
    config: PoolConfig,
    connector: Arc<dyn BackendConnector<Connection = C>>,
    shared: Arc<Shared<C>>,
}

impl<C: BackendConnection> BackendPool<C> {
    /// Validate `config` and prewarm `min_alive` connections.
    ///
    /// Fails with [`PoolError::Unreachable`] if any prewarm connection cannot
    /// be opened; connections opened before the failure are closed.
    pub async fn connect(
        name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn BackendConnector<Connection = C>>,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let pool = Self {
            name: name.into(),
            config,
            connector,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    checked_out: 0,
                    total: 0,
                    draining: false,
                    next_id: 1,
                    wait_count: 0,
                    opened: 0,
                    closed: 0,
                }),
                notify: Notify::new(),
            }),
        };

        tracing::info!(
            pool = %pool.name,
            address = %pool.config.address,
            min_alive = pool.config.min_alive,
            max_alive = pool.config.max_alive,
            max_idle = pool.config.max_idle,
            "prewarming backend pool"
        );
        for _ in 0..pool.config.min_alive {
            if let Err(e) = pool.open_idle().await {
                tracing::error!(pool = %pool.name, error = %e, "prewarm failed");
                pool.close_idle().await;
                return Err(e);
            }
        }

        Ok(Arc::new(pool))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_draining(&self) -> bool {
        self.shared.lock().draining
    }

    /// Check out a connection.
    ///
    /// Prefers the most recently returned idle connection after probing it,
    /// otherwise opens a new one if under `max_alive`, otherwise waits up to
    /// `checkout_timeout` for capacity to come back.
    pub async fn checkout(&self) -> Result<PooledConnection<C>, PoolError> {
        let deadline = Instant::now() + self.config.checkout_timeout;
        let mut counted_wait = false;

        loop {
            // Registered before the state check so a drain or checkin that
            // lands in between still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.shared.lock();
                if state.draining {
                    return Err(PoolError::Draining {
                        pool: self.name.clone(),
                    });
                }
                if let Some(idle) = state.idle.pop_back() {
                    state.checked_out += 1;
                    Step::Probe(idle)
                } else if state.total < self.config.max_alive {
                    state.total += 1;
                    Step::Open(self.slot())
                } else {
                    if !counted_wait {
                        state.wait_count += 1;
                        counted_wait = true;
                    }
                    Step::Wait
                }
            };

            match step {
                Step::Probe(idle) => {
                    let mut pooled = self.wrap(idle.id, idle.created_at, idle.conn);
                    if self.probe(&mut pooled).await {
                        tracing::debug!(
                            pool = %self.name,
                            connection_id = pooled.id,
                            "reused idle connection"
                        );
                        return Ok(pooled);
                    }

                    // Keep the capacity and open a replacement in it.
                    let dead = pooled.conn.take();
                    let slot = {
                        let mut state = self.shared.lock();
                        state.checked_out = state.checked_out.saturating_sub(1);
                        state.closed += 1;
                        self.slot()
                    };
                    tracing::info!(
                        pool = %self.name,
                        connection_id = pooled.id,
                        "idle connection failed liveness probe, replacing"
                    );
                    if let Some(dead) = dead {
                        tokio::spawn(dead.close());
                    }
                    return self.open_in_slot(slot).await;
                }
                Step::Open(slot) => return self.open_in_slot(slot).await,
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        tracing::warn!(
                            pool = %self.name,
                            timeout = ?self.config.checkout_timeout,
                            "checkout timed out on exhausted pool"
                        );
                        return Err(PoolError::Exhausted {
                            pool: self.name.clone(),
                            timeout: self.config.checkout_timeout,
                        });
                    }
                }
            }
        }
    }

    /// Return a connection. It is kept idle unless it is broken, the pool is
    /// draining, or `max_idle` connections are already idle; in those cases
    /// it is closed and its slot freed.
    pub async fn checkin(&self, mut conn: PooledConnection<C>) {
        if !Arc::ptr_eq(&conn.shared, &self.shared) {
            tracing::warn!(
                pool = %self.name,
                connection_id = conn.id,
                "connection returned to a pool it does not belong to"
            );
            return;
        }
        let Some(inner) = conn.conn.take() else {
            return;
        };

        let (to_close, reason) = {
            let mut state = self.shared.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            let reason = if conn.broken {
                Some("broken")
            } else if state.draining {
                Some("draining")
            } else if state.idle.len() >= self.config.max_idle {
                Some("idle limit reached")
            } else {
                None
            };
            match reason {
                Some(_) => {
                    state.forget_one();
                    (Some(inner), reason)
                }
                None => {
                    state.idle.push_back(IdleConnection {
                        id: conn.id,
                        conn: inner,
                        created_at: conn.created_at,
                        last_used: Instant::now(),
                    });
                    (None, None)
                }
            }
        };
        self.shared.notify.notify_one();

        if let Some(inner) = to_close {
            tracing::debug!(
                pool = %self.name,
                connection_id = conn.id,
                reason = reason.unwrap_or_default(),
                "closing returned connection"
            );
            inner.close().await;
        }
    }

    /// Stop handing out connections and close the pool.
    ///
    /// Waiting checkouts fail with [`PoolError::Draining`]. Waits up to
    /// `drain_timeout` for outstanding connections, then closes every idle
    /// one. Returns how many connections were still checked out; those are
    /// closed when their holders return or drop them.
    pub async fn drain(&self) -> usize {
        self.shared.lock().draining = true;
        self.shared.notify.notify_waiters();
        tracing::info!(
            pool = %self.name,
            drain_timeout = ?self.config.drain_timeout,
            "backend pool draining started"
        );

        let deadline = Instant::now() + self.config.drain_timeout;
        let outstanding = loop {
            let checked_out = self.shared.lock().checked_out;
            if checked_out == 0 {
                tracing::info!(pool = %self.name, "all checked-out connections returned");
                break 0;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    pool = %self.name,
                    remaining = checked_out,
                    "drain timeout expired with connections still checked out"
                );
                break checked_out;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        };

        let closed = self.close_idle().await;
        tracing::info!(
            pool = %self.name,
            closed_idle = closed,
            outstanding = outstanding,
            "backend pool drain complete"
        );
        outstanding
    }

    /// One maintenance pass: expire long-idle connections down to
    /// `min_alive`, probe the rest, then top the pool back up to `min_alive`.
    ///
    /// Connections are probed one at a time. The one under probe counts as
    /// checked out; the rest stay available to `checkout`.
    pub async fn maintain(&self) {
        let now = Instant::now();
        let (expired, to_probe) = {
            let mut state = self.shared.lock();
            if state.draining {
                return;
            }
            let mut expired = Vec::new();
            // Oldest first, so the least recently used go before warm ones.
            let mut i = 0;
            while i < state.idle.len() {
                let stale = now.duration_since(state.idle[i].last_used) >= self.config.idle_timeout;
                if stale && state.total > self.config.min_alive {
                    if let Some(idle) = state.idle.remove(i) {
                        state.forget_one();
                        expired.push(idle.conn);
                    }
                } else {
                    i += 1;
                }
            }
            let to_probe: Vec<u64> = state.idle.iter().map(|idle| idle.id).collect();
            (expired, to_probe)
        };

        if !expired.is_empty() {
            tracing::info!(
                pool = %self.name,
                expired = expired.len(),
                "closing connections idle past idle_timeout"
            );
            // Freed capacity lets waiters open fresh connections.
            self.shared.notify.notify_waiters();
        }
        for conn in expired {
            conn.close().await;
        }

        let mut dead = 0usize;
        for id in to_probe {
            if !self.probe_idle(id).await {
                dead += 1;
            }
        }
        if dead > 0 {
            tracing::info!(pool = %self.name, removed = dead, "removed dead idle connections");
        }

        loop {
            let below_min = {
                let state = self.shared.lock();
                !state.draining && state.total < self.config.min_alive
            };
            if !below_min {
                break;
            }
            match self.open_idle().await {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!(pool = %self.name, error = %e, "could not restore min_alive");
                    break;
                }
            }
        }
    }

    /// Run [`BackendPool::maintain`] every `health_check_interval` until the
    /// shutdown signal fires or the pool starts draining.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow_and_update() {
            return;
        }
        let mut ticker = tokio::time::interval(self.config.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_draining() {
                        break;
                    }
                    self.maintain().await;
                    self.log_stats();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(pool = %self.name, "maintenance loop stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            checked_out: state.checked_out,
            idle: state.idle.len(),
            total: state.total,
            wait_count: state.wait_count,
            opened: state.opened,
            closed: state.closed,
        }
    }

    /// Log pool statistics at `info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            pool = %self.name,
            checked_out = stats.checked_out,
            idle = stats.idle,
            total = stats.total,
            wait_count = stats.wait_count,
            opened = stats.opened,
            closed = stats.closed,
            "pool statistics"
        );
    }

    // ── Internals ───────────────────────────────────────────────────

    /// An armed slot for capacity the caller has already counted in `total`.
    fn slot(&self) -> Slot<C> {
        Slot {
            shared: Arc::clone(&self.shared),
            armed: true,
        }
    }

    fn wrap(&self, id: u64, created_at: Instant, conn: C) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            id,
            created_at,
            broken: false,
            shared: Arc::clone(&self.shared),
        }
    }

    fn unreachable(&self, source: BackendError) -> PoolError {
        PoolError::Unreachable {
            pool: self.name.clone(),
            source,
        }
    }

    async fn probe(&self, conn: &mut PooledConnection<C>) -> bool {
        tokio::time::timeout(self.config.connect_timeout, conn.ping())
            .await
            .unwrap_or(false)
    }

    /// Lease idle connection `id`, ping it and put it back where it was
    /// taken from. Returns `false` only when the connection was found dead.
    async fn probe_idle(&self, id: u64) -> bool {
        let mut idle = {
            let mut state = self.shared.lock();
            if state.draining {
                return true;
            }
            // Already checked out or closed since the pass started.
            let Some(pos) = state.idle.iter().position(|idle| idle.id == id) else {
                return true;
            };
            let Some(idle) = state.idle.remove(pos) else {
                return true;
            };
            state.checked_out += 1;
            idle
        };

        let alive = tokio::time::timeout(self.config.connect_timeout, idle.conn.ping())
            .await
            .unwrap_or(false);

        let to_close = {
            let mut state = self.shared.lock();
            state.checked_out = state.checked_out.saturating_sub(1);
            if alive && !state.draining && state.idle.len() < self.config.max_idle {
                // Connections returned during the probe are more recent.
                state.idle.push_front(idle);
                None
            } else {
                state.forget_one();
                Some(idle.conn)
            }
        };
        self.shared.notify.notify_one();

        if let Some(conn) = to_close {
            conn.close().await;
        }
        alive
    }

    async fn open_attempt(&self) -> Result<C, BackendError> {
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.config),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.connect_timeout)),
        }
    }

    async fn open_with_retry(&self) -> Result<C, PoolError> {
        match self.open_attempt().await {
            Ok(conn) => Ok(conn),
            Err(first) => {
                tracing::warn!(
                    pool = %self.name,
                    address = %self.config.address,
                    error = %first,
                    "backend connect failed, retrying once"
                );
                self.open_attempt()
                    .await
                    .map_err(|source| self.unreachable(source))
            }
        }
    }

    async fn open_in_slot(&self, slot: Slot<C>) -> Result<PooledConnection<C>, PoolError> {
        let conn = self.open_with_retry().await?;
        slot.fill();
        let id = {
            let mut state = self.shared.lock();
            state.opened += 1;
            state.checked_out += 1;
            state.next_id()
        };
        tracing::debug!(pool = %self.name, connection_id = id, "opened backend connection");
        Ok(self.wrap(id, Instant::now(), conn))
    }

    /// Open one connection straight into the idle set. Returns `false` when
    /// there is no capacity or the pool is draining.
    async fn open_idle(&self) -> Result<bool, PoolError> {
        let slot = {
            let mut state = self.shared.lock();
            if state.draining || state.total >= self.config.max_alive {
                return Ok(false);
            }
            state.total += 1;
            self.slot()
        };
        let conn = self
            .open_attempt()
            .await
            .map_err(|source| self.unreachable(source))?;
        slot.fill();

        let rejected = {
            let mut state = self.shared.lock();
            state.opened += 1;
            let id = state.next_id();
            if state.draining || state.idle.len() >= self.config.max_idle {
                state.forget_one();
                Some(conn)
            } else {
                let now = Instant::now();
                state.idle.push_back(IdleConnection {
                    id,
                    conn,
                    created_at: now,
                    last_used: now,
                });
                None
            }
        };
        self.shared.notify.notify_one();
        match rejected {
            Some(conn) => {
                conn.close().await;
                Ok(false)
            }
            None => Ok(true),
        }
    }

    async fn close_idle(&self) -> usize {
        let idle: Vec<_> = {
            let mut state = self.shared.lock();
            let idle: Vec<_> = state.idle.drain(..).collect();
            for _ in &idle {
                state.forget_one();
            }
            idle
        };
        let count = idle.len();
        for idle in idle {
            idle.conn.close().await;
        }
        count
    }
}

// ── Debug impl (cannot auto-derive due to dyn trait) ────────────────

impl<C: BackendConnection> std::fmt::Debug for BackendPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
