//! Startup configuration.
//!
//! Two inputs: the server table, a line-oriented text file with one
//! `host serverId port` entry per line, and optional replica settings in
//! TOML. Any error here is fatal at startup.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::ServerId;
use crate::ledger::Balance;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("server {0} is listed more than once")]
    DuplicateServer(ServerId),

    #[error("server {0} is not in the server table")]
    UnknownServer(ServerId),

    #[error("server table is empty")]
    Empty,

    #[error("invalid settings: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Server id to network address table shared by every replica and client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    servers: BTreeMap<ServerId, ServerAddress>,
}

impl ClusterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut servers = BTreeMap::new();
        for (index, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number = index + 1;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [host, id, port] = fields.as_slice() else {
                return Err(ConfigError::Parse {
                    line: number,
                    reason: format!("expected `host serverId port`, got {} fields", fields.len()),
                });
            };
            let id: ServerId = id.parse().map_err(|_| ConfigError::Parse {
                line: number,
                reason: format!("invalid server id `{id}`"),
            })?;
            let port: u16 = port.parse().map_err(|_| ConfigError::Parse {
                line: number,
                reason: format!("invalid port `{port}`"),
            })?;
            let address = ServerAddress {
                host: host.to_string(),
                port,
            };
            if servers.insert(id, address).is_some() {
                return Err(ConfigError::DuplicateServer(id));
            }
        }

        if servers.is_empty() {
            return Err(ConfigError::Empty);
        }
        Ok(ClusterConfig { servers })
    }

    pub fn address(&self, id: ServerId) -> Result<&ServerAddress> {
        self.servers.get(&id).ok_or(ConfigError::UnknownServer(id))
    }

    /// Every server except `id`; fails if `id` itself is not listed.
    pub fn peers_of(&self, id: ServerId) -> Result<Vec<ServerId>> {
        if !self.servers.contains_key(&id) {
            return Err(ConfigError::UnknownServer(id));
        }
        Ok(self.servers.keys().copied().filter(|peer| *peer != id).collect())
    }

    pub fn server_ids(&self) -> Vec<ServerId> {
        self.servers.keys().copied().collect()
    }

    pub fn servers(&self) -> impl Iterator<Item = (ServerId, &ServerAddress)> {
        self.servers.iter().map(|(id, address)| (*id, address))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaSettings {
    /// Accounts created at boot, ids `1..=seed_accounts`.
    pub seed_accounts: u32,
    pub seed_balance: Balance,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// Time a halted node keeps serving in-flight replies before exiting.
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub audit_log: Option<PathBuf>,
}

impl Default for ReplicaSettings {
    fn default() -> Self {
        Self {
            seed_accounts: 20,
            seed_balance: 1000,
            connect_timeout: Duration::from_secs(1),
            connect_attempts: 5,
            retry_backoff: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(250),
            audit_log: None,
        }
    }
}

impl ReplicaSettings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let settings: ReplicaSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seed_balance < 0 {
            return Err(ConfigError::InvalidValue(format!(
                "seed_balance must be non-negative, got {}",
                self.seed_balance
            )));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
