//! GridMesh Configuration
//!
//! This module provides configuration structures for the GridMesh
//! data grid coordination core.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main GridMesh configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridMeshConfig {
    /// Member-specific configuration
    pub member: MemberConfig,

    /// Partition layout configuration
    #[serde(default)]
    pub partition: PartitionConfig,

    /// Lock coordination configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Backup replication configuration
    #[serde(default)]
    pub backup: BackupConfig,

    /// Client invocation configuration
    #[serde(default)]
    pub invocation: InvocationSettings,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Member-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Unique member identifier
    pub id: String,

    /// Address to bind for cluster communication
    pub bind_address: String,

    /// Advertised address for other members to connect
    #[serde(default)]
    pub advertise_address: Option<String>,
}

/// Partition layout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Total number of partitions in the grid
    #[serde(default = "default_partition_count")]
    pub count: u32,

    /// Number of backup replicas per partition
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,
}

/// Lock coordination configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Hard cap on how long any acquire may stay parked, in milliseconds.
    /// Waits requested as unbounded are scheduled at this cap and surface
    /// a terminal error if they expire.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

/// Backup replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Attempts per backup replica before giving up
    #[serde(default = "default_backup_attempts")]
    pub attempts: u32,

    /// Timeout per backup attempt in milliseconds
    #[serde(default = "default_backup_timeout_ms")]
    pub timeout_ms: u64,
}

/// Client invocation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationSettings {
    /// Maximum attempts per logical submission
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed pause between retry attempts in milliseconds
    #[serde(default = "default_retry_pause_ms")]
    pub retry_pause_ms: u64,

    /// Per-attempt request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Connection establishment timeout in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClusterConfig {
    /// List of peer member addresses
    #[serde(default)]
    pub peers: Vec<String>,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_partition_count() -> u32 {
    271
}

fn default_backup_count() -> usize {
    1
}

fn default_max_wait_ms() -> u64 {
    300_000
}

fn default_backup_attempts() -> u32 {
    3
}

fn default_backup_timeout_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    120
}

fn default_retry_pause_ms() -> u64 {
    250
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_heartbeat_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            count: default_partition_count(),
            backup_count: default_backup_count(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            attempts: default_backup_attempts(),
            timeout_ms: default_backup_timeout_ms(),
        }
    }
}

impl Default for InvocationSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_pause_ms: default_retry_pause_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl GridMeshConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridMeshConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GridMeshConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.member.id.is_empty() {
            return Err(crate::Error::Config("member.id cannot be empty".into()));
        }

        if self.member.bind_address.is_empty() {
            return Err(crate::Error::Config(
                "member.bind_address cannot be empty".into(),
            ));
        }

        if self.partition.count == 0 {
            return Err(crate::Error::Config(
                "partition.count must be at least 1".into(),
            ));
        }

        if self.lock.max_wait_ms == 0 {
            return Err(crate::Error::Config(
                "lock.max_wait_ms must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Get the advertised address (or bind address if not set)
    pub fn advertise_address(&self) -> &str {
        self.member
            .advertise_address
            .as_deref()
            .unwrap_or(&self.member.bind_address)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get retry pause as Duration
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.invocation.retry_pause_ms)
    }

    /// Get per-attempt request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation.request_timeout_ms)
    }
}
