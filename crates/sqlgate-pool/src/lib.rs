//! sqlgate-pool — bounded pools of backend database connections.
//!
//! # Architecture
//!
//! ```text
//! BackendPool::checkout()
//!   → draining?                       → PoolError::Draining
//!   → idle connection (most recent)   → ping → hand out, or close and open a replacement
//!   → total < max_alive               → reserve slot, open (retry once) → hand out
//!   → total == max_alive              → wait for checkin, bounded by checkout_timeout
//!                                        → PoolError::Exhausted
//! ```
//!
//! Two pools run side by side in the proxy: `admin` for writes and
//! `readonly` for plain reads. Connectors are injected so the pool can be
//! exercised without a database.

pub mod config;
pub mod connector;
pub mod error;
pub mod mysql;
pub mod pool;
pub mod tcp;

pub use config::PoolConfig;
pub use connector::{BackendConnection, BackendConnector, BoxFuture};
pub use error::{BackendError, PoolError};
pub use mysql::{MysqlConnection, MysqlConnector};
pub use pool::{BackendPool, PoolStats, PooledConnection};
pub use tcp::{TcpConnection, TcpConnector};
