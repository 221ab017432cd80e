//! GridMesh Error Types

use thiserror::Error;

/// Result type alias for GridMesh operations
pub type Result<T> = std::result::Result<T, Error>;

/// GridMesh error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown schema: factory {factory_id}, type {type_id}")]
    SchemaUnknown { factory_id: i32, type_id: i32 },

    // Routing errors
    #[error("Stale routing for partition {partition_id}: owner moved")]
    RoutingStale { partition_id: u32 },

    #[error("No owner known for partition {0}")]
    OwnerUnknown(u32),

    // Member errors
    #[error("Member unreachable: {0}")]
    MemberUnreachable(String),

    #[error("Member terminated: {0}")]
    MemberTerminated(String),

    #[error("Member shut down: {0}")]
    MemberShutdown(String),

    // Lock errors
    #[error("Invalid lock wait on {namespace}: requested timeout cannot be satisfied")]
    LockWaitInvalid { namespace: String },

    #[error("Lock on {namespace} not owned by caller {caller}")]
    LockOwnerMismatch { namespace: String, caller: String },

    // Security errors
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Invocation errors
    #[error("Invocation retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is transient and absorbed by the invocation retry loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RoutingStale { .. }
                | Error::OwnerUnknown(_)
                | Error::MemberUnreachable(_)
                | Error::MemberTerminated(_)
                | Error::MemberShutdown(_)
                | Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
        )
    }

    /// Check if this error indicates a caller-side protocol bug rather than
    /// a transient cluster condition
    pub fn is_protocol_bug(&self) -> bool {
        matches!(
            self,
            Error::LockOwnerMismatch { .. } | Error::SchemaUnknown { .. }
        )
    }
}
