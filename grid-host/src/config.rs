//! Cluster host configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Errors from loading or validating a host configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("could not read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML.
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration is well-formed but not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for one cluster host declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    /// Frontend machine that reservations are submitted through.
    pub headnode: String,

    /// Skip the headnode name sanity check.
    #[serde(default)]
    pub headnode_override: bool,

    /// Number of compute nodes this host wants from the reservation.
    #[serde(default = "default_node_count")]
    pub node_count: usize,

    /// Reservation duration in seconds.
    #[serde(default = "default_reserve_secs")]
    pub reserve_secs: u64,

    /// Account name on the cluster.
    pub user: String,

    /// Base directory for test files on the shared filesystem.
    ///
    /// Left unset, a fresh temporary directory is created per run.
    #[serde(default)]
    pub remote_dir: Option<String>,

    /// Seconds between keepalive frames on the mux channel.
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Command started on the frontend to act as the remote demuxer.
    #[serde(default = "default_mux_command")]
    pub mux_command: String,

    /// Local path of the demuxer helper to upload, if it is not already
    /// installed on the frontend.
    #[serde(default)]
    pub demux_helper: Option<PathBuf>,

    /// How many scheduler polls to attempt before giving up on a
    /// reservation becoming ready.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,

    /// Milliseconds to sleep between scheduler polls.
    #[serde(default = "default_poll_sleep_ms")]
    pub poll_sleep_ms: u64,
}

fn default_node_count() -> usize {
    2
}

fn default_reserve_secs() -> u64 {
    900
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_mux_command() -> String {
    "gridtest-demux".to_string()
}

fn default_max_poll_attempts() -> u32 {
    120
}

fn default_poll_sleep_ms() -> u64 {
    1000
}

impl HostConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values that can never work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.headnode.is_empty() {
            return Err(ConfigError::Invalid("headnode must not be empty".into()));
        }
        if !self.headnode_override && !self.headnode.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "headnode '{}' is not a fully qualified name; \
                 set headnode_override to use it anyway",
                self.headnode
            )));
        }
        if self.user.is_empty() {
            return Err(ConfigError::Invalid("user must not be empty".into()));
        }
        if self.node_count == 0 {
            return Err(ConfigError::Invalid("node_count must be at least 1".into()));
        }
        if self.reserve_secs == 0 {
            return Err(ConfigError::Invalid(
                "reserve_secs must be at least 1".into(),
            ));
        }
        if self.max_poll_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_poll_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> HostConfig {
        toml::from_str(
            r#"
            headnode = "fs0.grid.example.org"
            user = "tester"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.node_count, 2);
        assert_eq!(config.reserve_secs, 900);
        assert_eq!(config.keepalive_secs, 30);
        assert_eq!(config.mux_command, "gridtest-demux");
        assert_eq!(config.max_poll_attempts, 120);
        assert_eq!(config.poll_sleep_ms, 1000);
        assert!(config.remote_dir.is_none());
        assert!(config.demux_helper.is_none());
        assert!(!config.headnode_override);
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config: HostConfig = toml::from_str(
            r#"
            headnode = "fs2.grid.example.org"
            user = "tester"
            node_count = 5
            reserve_secs = 120
            remote_dir = "/var/scratch/tester/runs"
            "#,
        )
        .unwrap();
        assert_eq!(config.node_count, 5);
        assert_eq!(config.reserve_secs, 120);
        assert_eq!(config.remote_dir.as_deref(), Some("/var/scratch/tester/runs"));
    }

    #[test]
    fn bare_headnode_needs_the_override() {
        let mut config = minimal();
        config.headnode = "localcluster".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        config.headnode_override = true;
        config.validate().unwrap();
    }

    #[test]
    fn zero_node_count_is_rejected() {
        let mut config = minimal();
        config.node_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn missing_user_fails_to_parse() {
        let result: Result<HostConfig, _> =
            toml::from_str(r#"headnode = "fs0.grid.example.org""#);
        assert!(result.is_err());
    }
}
