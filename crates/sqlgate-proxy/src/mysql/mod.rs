//! The default [`crate::SessionHandler`]: a MySQL server towards clients,
//! relaying queries to the admin or readonly pool.

mod relay;
pub mod router;
mod session;

use std::sync::Arc;

use sqlgate_core::ProxyConfig;
use sqlgate_pool::{MysqlConnection, MysqlConnector};

use crate::error::ProxyError;
use crate::server::ProxyServer;

pub use router::{Route, Statement, classify, route};
pub use session::MysqlSessionHandler;

/// A proxy server wired to real MySQL backends.
pub fn mysql_proxy(
    config: ProxyConfig,
) -> Result<ProxyServer<MysqlConnection, MysqlSessionHandler>, ProxyError> {
    ProxyServer::new(
        config,
        Arc::new(MysqlConnector),
        MysqlSessionHandler::default(),
    )
}
