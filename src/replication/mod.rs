//! Replication Module
//!
//! Operation execution on the partition owner and primary-backup
//! replication to the partition's replicas.

pub mod operation;
pub mod protocol;
mod replicator;

pub use operation::{
    grid_registry, BackupOperation, GridPacket, Operation, Response, BACKUP_FACTORY_ID,
    OPERATION_FACTORY_ID,
};
pub use protocol::{ErrorCode, FrameHeader, Message, WireError};
pub use replicator::OperationReplicator;

/// Configuration for backup replication
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Attempts per backup replica before giving up
    pub backup_attempts: u32,
    /// Timeout per backup attempt in milliseconds
    pub backup_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            backup_attempts: 3,
            backup_timeout_ms: 1000,
        }
    }
}

impl From<&crate::config::BackupConfig> for ReplicationConfig {
    fn from(config: &crate::config::BackupConfig) -> Self {
        Self {
            backup_attempts: config.attempts,
            backup_timeout_ms: config.timeout_ms,
        }
    }
}
