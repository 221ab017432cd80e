//! Grid Wire Protocol
//!
//! Defines the messages exchanged between members and clients, and the
//! length-prefixed frame header that carries them over TCP.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::MemberId;
use crate::codec::Envelope;
use crate::error::Error;
use crate::routing::PartitionId;

use super::operation::Response;

/// Protocol messages for member/client communication
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // ========== Invocation ==========
    /// Execute an operation on the partition owner
    Request {
        correlation_id: u64,
        partition_id: PartitionId,
        caller: Uuid,
        op: Envelope,
    },

    /// Result of an executed operation
    Response {
        correlation_id: u64,
        result: std::result::Result<Response, WireError>,
    },

    /// The receiver does not own the partition; redirect hint for the
    /// sender when the current owner is known
    WrongMember {
        correlation_id: u64,
        known_owner: Option<MemberId>,
    },

    // ========== Backup Replication ==========
    /// Apply a derived backup operation on a replica
    Backup {
        partition_id: PartitionId,
        op: Envelope,
    },

    /// Backup applied
    BackupAck { partition_id: PartitionId },

    // ========== Membership ==========
    /// Periodic liveness signal
    Heartbeat { member_id: MemberId },

    /// Heartbeat response
    HeartbeatAck { member_id: MemberId },

    /// Graceful shutdown announcement
    Shutdown { member_id: MemberId },

    // ========== Status ==========
    /// Status request
    StatusRequest,

    /// Status response
    StatusResponse {
        member_id: MemberId,
        table_version: u64,
        owned_partitions: usize,
        live_locks: usize,
        entries: usize,
    },
}

impl Message {
    /// Serialize message to bytes
    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize message from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Get the message type name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Request { .. } => "Request",
            Message::Response { .. } => "Response",
            Message::WrongMember { .. } => "WrongMember",
            Message::Backup { .. } => "Backup",
            Message::BackupAck { .. } => "BackupAck",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Shutdown { .. } => "Shutdown",
            Message::StatusRequest => "StatusRequest",
            Message::StatusResponse { .. } => "StatusResponse",
        }
    }
}

/// Error codes carried across the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Payload schema not registered on the receiver
    SchemaUnknown { factory_id: i32, type_id: i32 },
    /// Caller not permitted to run the operation
    AuthorizationDenied,
    /// Lock released by a non-owner
    LockOwnerMismatch { namespace: String, caller: String },
    /// Unbounded wait expired at the policy cap
    LockWaitInvalid { namespace: String },
    /// Receiver is shutting down
    MemberShuttingDown,
    /// Unclassified execution failure
    Internal,
}

/// Wire representation of an execution error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl WireError {
    /// Build the wire form of a local error
    pub fn from_error(error: &Error) -> Self {
        let message = error.to_string();
        let code = match error {
            Error::SchemaUnknown {
                factory_id,
                type_id,
            } => ErrorCode::SchemaUnknown {
                factory_id: *factory_id,
                type_id: *type_id,
            },
            Error::AuthorizationDenied(_) => ErrorCode::AuthorizationDenied,
            Error::LockOwnerMismatch { namespace, caller } => ErrorCode::LockOwnerMismatch {
                namespace: namespace.clone(),
                caller: caller.clone(),
            },
            Error::LockWaitInvalid { namespace } => ErrorCode::LockWaitInvalid {
                namespace: namespace.clone(),
            },
            Error::ShuttingDown => ErrorCode::MemberShuttingDown,
            _ => ErrorCode::Internal,
        };
        Self { code, message }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        match wire.code {
            ErrorCode::SchemaUnknown {
                factory_id,
                type_id,
            } => Error::SchemaUnknown {
                factory_id,
                type_id,
            },
            ErrorCode::AuthorizationDenied => Error::AuthorizationDenied(wire.message),
            ErrorCode::LockOwnerMismatch { namespace, caller } => {
                Error::LockOwnerMismatch { namespace, caller }
            }
            ErrorCode::LockWaitInvalid { namespace } => Error::LockWaitInvalid { namespace },
            ErrorCode::MemberShuttingDown => Error::MemberShutdown(wire.message),
            ErrorCode::Internal => Error::Internal(wire.message),
        }
    }
}

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Message length
    pub length: u32,
    /// Message checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Self {
            length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
            checksum: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        }
    }
}
