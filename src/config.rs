//! Configuration loading and validation.
//!
//! One [`Config`] struct of per-concern sub-structs, deserialized from TOML
//! with serde defaults so a minimal file (or none at all) yields a working
//! single-node setup. Validation runs at startup and reports every problem
//! it finds, not just the first.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading or validating a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// This server's identity.
    #[serde(default)]
    pub server: ServerConfig,
    /// Provider discovery knobs.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Cluster lock knobs.
    #[serde(default)]
    pub lock: LockConfig,
    /// Cluster gossip knobs.
    #[serde(default)]
    pub cluster: ClusterConfig,
}

/// This server's identity within the cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Unique server name, gossiped to the rest of the cluster.
    #[serde(default = "defaults::server_name")]
    pub name: String,
    /// URL clients can reach this node on; carried in STATUS gossip.
    #[serde(default)]
    pub external_url: String,
    /// Informational role string carried in STATUS gossip.
    #[serde(default = "defaults::role")]
    pub role: String,
}

/// Provider discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenConfig {
    /// How long a provider has to answer a discovery offer, in milliseconds.
    #[serde(default = "defaults::listen_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Randomize candidate order so the same provider is not always asked
    /// first.
    #[serde(default)]
    pub shuffle_providers: bool,
}

/// Cluster lock configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockConfig {
    /// Auto-release leases after this long, in milliseconds.
    #[serde(default = "defaults::lock_timeout_ms")]
    pub timeout_ms: u64,
    /// How long a follower waits for the leader's lock response, in
    /// milliseconds.
    #[serde(default = "defaults::lock_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Cluster gossip configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Interval between STATUS broadcasts, in milliseconds.
    #[serde(default = "defaults::keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Interval between liveness sweeps, in milliseconds.
    #[serde(default = "defaults::check_interval_ms")]
    pub check_interval_ms: u64,
    /// Drop a node whose last STATUS is older than this, in milliseconds.
    #[serde(default = "defaults::node_inactive_timeout_ms")]
    pub node_inactive_timeout_ms: u64,
}

mod defaults {
    pub fn server_name() -> String {
        "drift".to_string()
    }

    pub fn role() -> String {
        "server".to_string()
    }

    pub fn listen_response_timeout_ms() -> u64 {
        500
    }

    pub fn lock_timeout_ms() -> u64 {
        1_000
    }

    pub fn lock_request_timeout_ms() -> u64 {
        1_000
    }

    pub fn keep_alive_interval_ms() -> u64 {
        5_000
    }

    pub fn check_interval_ms() -> u64 {
        2_000
    }

    pub fn node_inactive_timeout_ms() -> u64 {
        12_000
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: defaults::server_name(),
            external_url: String::new(),
            role: defaults::role(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: defaults::listen_response_timeout_ms(),
            shuffle_providers: false,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::lock_timeout_ms(),
            request_timeout_ms: defaults::lock_request_timeout_ms(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: defaults::keep_alive_interval_ms(),
            check_interval_ms: defaults::check_interval_ms(),
            node_inactive_timeout_ms: defaults::node_inactive_timeout_ms(),
        }
    }
}

impl Config {
    /// Load a configuration from a TOML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.server.name.is_empty() {
            problems.push("server.name must not be empty".to_string());
        }
        if self.listen.response_timeout_ms == 0 {
            problems.push("listen.response_timeout_ms must be non-zero".to_string());
        }
        if self.lock.timeout_ms == 0 {
            problems.push("lock.timeout_ms must be non-zero".to_string());
        }
        if self.lock.request_timeout_ms == 0 {
            problems.push("lock.request_timeout_ms must be non-zero".to_string());
        }
        if self.cluster.keep_alive_interval_ms == 0 {
            problems.push("cluster.keep_alive_interval_ms must be non-zero".to_string());
        }
        if self.cluster.node_inactive_timeout_ms <= self.cluster.keep_alive_interval_ms {
            problems.push(
                "cluster.node_inactive_timeout_ms must exceed keep_alive_interval_ms".to_string(),
            );
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems.join("; ")))
        }
    }

    /// Discovery offer timeout as a [`Duration`].
    pub fn listen_response_timeout(&self) -> Duration {
        Duration::from_millis(self.listen.response_timeout_ms)
    }

    /// Lock lease lifetime as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.timeout_ms)
    }

    /// Remote lock request timeout as a [`Duration`].
    pub fn lock_request_timeout(&self) -> Duration {
        Duration::from_millis(self.lock.request_timeout_ms)
    }

    /// Gossip keep-alive interval as a [`Duration`].
    pub fn cluster_keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.keep_alive_interval_ms)
    }

    /// Liveness sweep interval as a [`Duration`].
    pub fn cluster_check_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.check_interval_ms)
    }

    /// Node inactivity cutoff as a [`Duration`].
    pub fn cluster_node_inactive_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.node_inactive_timeout_ms)
    }
}
