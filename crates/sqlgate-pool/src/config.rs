//! Pool sizing and timing configuration.

use std::time::Duration;

use sqlgate_core::BackendConfig;

use crate::error::PoolError;

/// Configuration for one backend pool. Immutable once the pool is built.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Backend address, `host:port`.
    pub address: String,
    pub user: String,
    pub password: String,
    /// Default schema selected during the backend handshake.
    pub database: Option<String>,
    /// Connections kept open even when unused (default: 2).
    pub min_alive: usize,
    /// Hard cap on open connections, idle plus checked out (default: 32).
    pub max_alive: usize,
    /// Idle connections retained after checkin; extras are closed (default: 8).
    pub max_idle: usize,
    /// How long a checkout waits on an exhausted pool (default: 5s).
    pub checkout_timeout: Duration,
    /// Bound on a single backend connect attempt, also used for pings (default: 3s).
    pub connect_timeout: Duration,
    /// Idle connections unused for longer are closed down to `min_alive` (default: 300s).
    pub idle_timeout: Duration,
    /// Period of the maintenance pass (default: 30s).
    pub health_check_interval: Duration,
    /// How long `drain()` waits for checked-out connections (default: 30s).
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:3306".to_string(),
            user: "root".to_string(),
            password: String::new(),
            database: None,
            min_alive: 2,
            max_alive: 32,
            max_idle: 8,
            checkout_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Build a pool config from one `[mysql.*]` section.
    pub fn from_backend(backend: &BackendConfig, drain_timeout: Duration) -> Self {
        Self {
            address: backend.addr.clone(),
            user: backend.user.clone(),
            password: backend.password.clone(),
            database: Some(backend.db_name.clone()).filter(|db| !db.is_empty()),
            min_alive: backend.min_alive,
            max_alive: backend.max_alive,
            max_idle: backend.max_idle,
            checkout_timeout: backend.checkout_timeout,
            connect_timeout: backend.connect_timeout,
            idle_timeout: backend.idle_timeout,
            health_check_interval: backend.health_check_interval,
            drain_timeout,
        }
    }

    /// Enforce `min_alive <= max_idle <= max_alive` and `max_alive >= 1`.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.address.is_empty() {
            return Err(PoolError::InvalidConfig("backend address is empty".into()));
        }
        if self.max_alive == 0 {
            return Err(PoolError::InvalidConfig("max_alive must be at least 1".into()));
        }
        if self.min_alive > self.max_idle {
            return Err(PoolError::InvalidConfig(format!(
                "min_alive ({}) exceeds max_idle ({})",
                self.min_alive, self.max_idle
            )));
        }
        if self.max_idle > self.max_alive {
            return Err(PoolError::InvalidConfig(format!(
                "max_idle ({}) exceeds max_alive ({})",
                self.max_idle, self.max_alive
            )));
        }
        if self.health_check_interval.is_zero() {
            return Err(PoolError::InvalidConfig(
                "health_check_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
