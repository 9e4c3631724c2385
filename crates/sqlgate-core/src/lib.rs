//! sqlgate-core — configuration model shared by the sqlgate crates.
//!
//! The proxy is configured from a single `sqlgate.toml` file describing the
//! listen address, the admin and readonly backend pools, the accepted client
//! credentials and the optional peer-to-peer topology switch.

pub mod config;

pub use config::{
    BackendConfig, ConfigError, MysqlConfig, P2pConfig, ProxyConfig, ServerConfig, UserConfig,
};
