//! sqlgate.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid duration {0:?}: expected a number followed by ms, s, m or h")]
    Duration(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub server: ServerConfig,
    pub mysql: MysqlConfig,
    /// Client credentials accepted by the proxy.
    #[serde(default)]
    pub user_list: Vec<UserConfig>,
    #[serde(default)]
    pub p2p: P2pConfig,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port` the proxy listens on.
    pub addr: String,
    /// Upper bound on how long pools wait for checked-out connections during shutdown.
    #[serde(default = "default_shutdown_timeout", with = "duration_str")]
    pub shutdown_timeout: Duration,
    /// Consecutive resource-exhaustion accept failures tolerated before the
    /// accept loop gives up.
    #[serde(default = "default_accept_retry_limit")]
    pub accept_retry_limit: u32,
}

/// The two backend pools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MysqlConfig {
    /// Privileged pool serving writes and transactions.
    pub admin: BackendConfig,
    /// Pool serving read-only statements.
    pub readonly: BackendConfig,
}

/// A single backend pool: target, credentials and sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub addr: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub db_name: String,
    /// Warm connections kept open.
    #[serde(default = "default_min_alive")]
    pub min_alive: usize,
    /// Hard ceiling on open connections.
    #[serde(default = "default_max_alive")]
    pub max_alive: usize,
    /// Ceiling on connections sitting unused.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_checkout_timeout", with = "duration_str")]
    pub checkout_timeout: Duration,
    #[serde(default = "default_connect_timeout", with = "duration_str")]
    pub connect_timeout: Duration,
    #[serde(default = "default_idle_timeout", with = "duration_str")]
    pub idle_timeout: Duration,
    #[serde(default = "default_health_check_interval", with = "duration_str")]
    pub health_check_interval: Duration,
}

/// An accepted client credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub user: String,
    pub password: String,
    /// Restricts the user to a single database when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
}

/// Optional peer-to-peer topology subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct P2pConfig {
    #[serde(default)]
    pub enable: bool,
    /// Opaque settings handed to the topology initializer.
    #[serde(default, skip_serializing_if = "toml::Table::is_empty")]
    pub settings: toml::Table,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_accept_retry_limit() -> u32 {
    8
}
fn default_min_alive() -> usize {
    2
}
fn default_max_alive() -> usize {
    32
}
fn default_max_idle() -> usize {
    8
}
fn default_checkout_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

impl ProxyConfig {
    /// Read, parse and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ProxyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check cross-field invariants that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.addr.trim().is_empty() {
            return Err(ConfigError::Invalid("server.addr must not be empty".to_string()));
        }
        self.mysql.admin.validate("mysql.admin")?;
        self.mysql.readonly.validate("mysql.readonly")?;
        let (admin_db, readonly_db) = (&self.mysql.admin.db_name, &self.mysql.readonly.db_name);
        if !admin_db.is_empty() && !readonly_db.is_empty() && admin_db != readonly_db {
            // Reads and writes of one session must hit the same schema.
            return Err(ConfigError::Invalid(format!(
                "mysql.admin.db_name ({admin_db}) and mysql.readonly.db_name ({readonly_db}) must match"
            )));
        }
        for (i, user) in self.user_list.iter().enumerate() {
            if user.user.is_empty() {
                return Err(ConfigError::Invalid(format!("user_list[{i}].user must not be empty")));
            }
        }
        Ok(())
    }

    /// A starter configuration for `sqlgated init`.
    pub fn scaffold() -> Self {
        let backend = |db: &str| BackendConfig {
            addr: "127.0.0.1:3306".to_string(),
            user: "root".to_string(),
            password: String::new(),
            db_name: db.to_string(),
            min_alive: default_min_alive(),
            max_alive: default_max_alive(),
            max_idle: default_max_idle(),
            checkout_timeout: default_checkout_timeout(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            health_check_interval: default_health_check_interval(),
        };
        ProxyConfig {
            server: ServerConfig {
                addr: "127.0.0.1:3307".to_string(),
                shutdown_timeout: default_shutdown_timeout(),
                accept_retry_limit: default_accept_retry_limit(),
            },
            mysql: MysqlConfig {
                admin: backend("app"),
                readonly: backend("app"),
            },
            user_list: vec![UserConfig {
                user: "app".to_string(),
                password: "change-me".to_string(),
                database: None,
            }],
            p2p: P2pConfig::default(),
        }
    }
}

impl BackendConfig {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{section}.addr must not be empty")));
        }
        if self.max_alive == 0 {
            return Err(ConfigError::Invalid(format!("{section}.max_alive must be at least 1")));
        }
        if !(self.min_alive <= self.max_idle && self.max_idle <= self.max_alive) {
            return Err(ConfigError::Invalid(format!(
                "{section}: expected min_alive <= max_idle <= max_alive, got {} / {} / {}",
                self.min_alive, self.max_idle, self.max_alive
            )));
        }
        Ok(())
    }
}

/// Parse a duration such as `250ms`, `5s`, `2m` or `1h`. A bare number is seconds.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let text = input.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Duration(input.to_string()))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(ConfigError::Duration(input.to_string())),
    }
}

fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

/// Serde adapter storing durations as human-readable strings.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Seconds(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        }
    }
}
