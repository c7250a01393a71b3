#![deny(unsafe_code)]

//! Configuration loading and validation for the hast replication daemon.
//!
//! Loads TOML configuration files and validates them. [`HastConfig`] is the
//! central configuration structure: the daemon's control and peer-listen
//! addresses, per-resource defaults, and the ordered list of replicated
//! resources.
//!
//! Per-resource settings that may be omitted (`replication`, `timeout`,
//! `exec`, `provider`) are resolved against the `[daemon]` defaults when the
//! configuration is loaded, so two loaded configurations can be compared
//! field by field.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Default TCP port for peer connections.
pub const DEFAULT_PORT: u16 = 8457;

/// Maximum length in bytes of a resource name.
pub const MAX_RESOURCE_NAME_LEN: usize = 64;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// How writes are acknowledged to the local consumer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Acknowledge once both nodes have stored the write.
    Fullsync,
    /// Acknowledge once the peer has received the write.
    #[default]
    Memsync,
    /// Acknowledge once the local node has stored the write.
    Async,
}

impl ReplicationMode {
    /// Numeric form used on worker control messages.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Fullsync => 0,
            Self::Memsync => 1,
            Self::Async => 2,
        }
    }

    /// Inverse of [`ReplicationMode::as_i32`].
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Fullsync),
            1 => Some(Self::Memsync),
            2 => Some(Self::Async),
            _ => None,
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fullsync => "fullsync",
            Self::Memsync => "memsync",
            Self::Async => "async",
        })
    }
}

/// Top-level daemon configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct HastConfig {
    /// Daemon-wide settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Replicated resources, in file order.
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceConfig>,
}

/// Configuration for the daemon process itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Address of the operator control channel.
    #[serde(default = "default_control_addr")]
    pub control: String,

    /// Address peers connect to.
    #[serde(default = "default_listen_addr")]
    pub listen: String,

    /// Default replication mode for resources that don't set one.
    #[serde(default)]
    pub replication: ReplicationMode,

    /// Default I/O timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Default event hook program. Empty means none.
    #[serde(default)]
    pub exec: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            control: default_control_addr(),
            listen: default_listen_addr(),
            replication: ReplicationMode::default(),
            timeout: default_timeout(),
            exec: String::new(),
        }
    }
}

fn default_control_addr() -> String {
    "uds:///var/run/hastctl".to_string()
}

fn default_listen_addr() -> String {
    format!("tcp://0.0.0.0:{DEFAULT_PORT}")
}

fn default_timeout() -> u64 {
    20
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// A single replicated resource.
///
/// ## TOML Example
///
/// ```toml
/// [[resource]]
/// name = "r0"
/// local = "/dev/da0"
/// remote = "tcp://192.0.2.2:8457"
/// replication = "async"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Unique resource name.
    pub name: String,

    /// Path of the local storage backing this resource.
    pub local: String,

    /// Address of the peer node.
    pub remote: String,

    /// Name of the block device exposed to local consumers.
    /// Defaults to the resource name.
    #[serde(default)]
    pub provider: Option<String>,

    /// Replication mode; inherits `[daemon] replication` when omitted.
    #[serde(default)]
    pub replication: Option<ReplicationMode>,

    /// I/O timeout in seconds; inherits `[daemon] timeout` when omitted.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Event hook program; inherits `[daemon] exec` when omitted.
    #[serde(default)]
    pub exec: Option<String>,
}

impl ResourceConfig {
    /// Create a resource with only the mandatory fields set.
    pub fn new(name: &str, local: &str, remote: &str) -> Self {
        Self {
            name: name.to_string(),
            local: local.to_string(),
            remote: remote.to_string(),
            provider: None,
            replication: None,
            timeout: None,
            exec: None,
        }
    }

    pub fn provider(&self) -> &str {
        self.provider.as_deref().unwrap_or(&self.name)
    }

    pub fn replication(&self) -> ReplicationMode {
        self.replication.unwrap_or_default()
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or_else(default_timeout)
    }

    /// Event hook program, if one is configured.
    pub fn exec(&self) -> Option<&str> {
        self.exec.as_deref().filter(|e| !e.is_empty())
    }

    fn apply_defaults(&mut self, daemon: &DaemonConfig) {
        if self.provider.is_none() {
            self.provider = Some(self.name.clone());
        }
        if self.replication.is_none() {
            self.replication = Some(daemon.replication);
        }
        if self.timeout.is_none() {
            self.timeout = Some(daemon.timeout);
        }
        if self.exec.is_none() {
            self.exec = Some(daemon.exec.clone());
        }
    }
}

impl HastConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = Self::parse(&content)?;
        tracing::debug!(
            path = %path.display(),
            resources = config.resources.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let mut config: HastConfig = toml::from_str(s)?;
        config.validate()?;
        config.resolve();
        Ok(config)
    }

    /// Fill every resource's optional settings from the daemon defaults.
    pub fn resolve(&mut self) {
        let daemon = self.daemon.clone();
        for res in &mut self.resources {
            res.apply_defaults(&daemon);
        }
    }

    /// Look up a resource by name.
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.control.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.control must not be empty".to_string(),
            ));
        }
        if self.daemon.listen.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.listen must not be empty".to_string(),
            ));
        }
        if self.daemon.timeout == 0 {
            return Err(ConfigError::Validation(
                "daemon.timeout must be non-zero".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for (i, res) in self.resources.iter().enumerate() {
            if res.name.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "resource[{i}].name must not be empty"
                )));
            }
            if res.name.len() > MAX_RESOURCE_NAME_LEN {
                return Err(ConfigError::Validation(format!(
                    "resource[{i}].name is longer than {MAX_RESOURCE_NAME_LEN} bytes"
                )));
            }
            if !seen.insert(res.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "resource {:?} is defined more than once",
                    res.name
                )));
            }
            if res.local.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "resource {:?}: local must not be empty",
                    res.name
                )));
            }
            if res.remote.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "resource {:?}: remote must not be empty",
                    res.name
                )));
            }
            if res.timeout == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "resource {:?}: timeout must be non-zero",
                    res.name
                )));
            }
        }

        Ok(())
    }
}
