//! Grid Operations
//!
//! Closed tagged variants over the operation kinds the grid executes,
//! plus the backup operations derived from committed primaries. Each
//! kind carries its own (factory id, type id) schema tag; decoders are
//! registered explicitly in [`grid_registry`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::{encode_tagged, CodecRegistry, Envelope, ResourceKey, TypeTag};
use crate::error::Result;

/// Factory id for client-visible operations
pub const OPERATION_FACTORY_ID: i32 = 1;
/// Factory id for backup operations
pub const BACKUP_FACTORY_ID: i32 = 2;

const OP_LOCK: i32 = 1;
const OP_UNLOCK: i32 = 2;
const OP_PUT: i32 = 3;
const OP_GET: i32 = 4;

const BACKUP_APPLY_LOCK: i32 = 1;
const BACKUP_CLEAR_LOCK: i32 = 2;
const BACKUP_APPLY_PUT: i32 = 3;

/// A request to mutate or query a keyed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Acquire a lock; `ttl_ms == 0` means no auto-expiry, and
    /// `wait_timeout_ms == 0` means deny immediately when contended
    Lock {
        namespace: String,
        key: ResourceKey,
        caller: Uuid,
        thread_id: u64,
        ttl_ms: u64,
        wait_timeout_ms: i64,
    },

    /// Release one reentrant level of a held lock
    Unlock {
        namespace: String,
        key: ResourceKey,
        caller: Uuid,
        thread_id: u64,
    },

    /// Store a value, returning the previous one
    Put {
        map: String,
        key: ResourceKey,
        value: Bytes,
    },

    /// Read a value
    Get { map: String, key: ResourceKey },
}

impl Operation {
    /// Operation kind name (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Lock { .. } => "lock",
            Operation::Unlock { .. } => "unlock",
            Operation::Put { .. } => "put",
            Operation::Get { .. } => "get",
        }
    }

    /// The routing key of this operation
    pub fn key(&self) -> &ResourceKey {
        match self {
            Operation::Lock { key, .. }
            | Operation::Unlock { key, .. }
            | Operation::Put { key, .. }
            | Operation::Get { key, .. } => key,
        }
    }

    /// True if executing this operation never changes state
    pub fn is_read_only(&self) -> bool {
        matches!(self, Operation::Get { .. })
    }

    /// Schema tag for this operation kind
    pub fn type_tag(&self) -> TypeTag {
        let type_id = match self {
            Operation::Lock { .. } => OP_LOCK,
            Operation::Unlock { .. } => OP_UNLOCK,
            Operation::Put { .. } => OP_PUT,
            Operation::Get { .. } => OP_GET,
        };
        TypeTag::new(OPERATION_FACTORY_ID, type_id)
    }

    /// Encode into a schema-tagged envelope
    pub fn encode(&self) -> Result<Envelope> {
        encode_tagged(self.type_tag(), self)
    }

    /// Decide whether an executed result must be pushed to backups:
    /// only state-changing results qualify (a lock grant backs up,
    /// a denial does not; reads never do).
    pub fn should_backup(&self, response: &Response) -> bool {
        match self {
            Operation::Lock { .. } | Operation::Unlock { .. } => {
                matches!(response, Response::Bool(true))
            }
            Operation::Put { .. } => true,
            Operation::Get { .. } => false,
        }
    }
}

/// Result of executing an operation on the partition owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Boolean outcome (lock granted/denied, unlock done)
    Bool(bool),
    /// Value outcome (get result, previous value on put)
    Value(Option<Bytes>),
    /// No payload
    Empty,
}

impl Response {
    /// Interpret as a boolean outcome; non-boolean responses are `false`
    pub fn as_bool(&self) -> bool {
        matches!(self, Response::Bool(true))
    }

    /// Interpret as a value outcome
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Response::Value(v) => v,
            _ => None,
        }
    }
}

/// Derived replica of a committed primary effect. Carries absolute state
/// so applying it more than once yields the same result, and never
/// re-evaluates routing or lock-acquisition decisions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackupOperation {
    /// Install the primary's lock image: owner, depth and remaining TTL
    ApplyLock {
        namespace: String,
        key: ResourceKey,
        caller: Uuid,
        thread_id: u64,
        count: u32,
        ttl_ms: u64,
    },

    /// Remove the lock image for the given owner
    ClearLock {
        namespace: String,
        key: ResourceKey,
        caller: Uuid,
        thread_id: u64,
    },

    /// Install the primary's value
    ApplyPut {
        map: String,
        key: ResourceKey,
        value: Bytes,
    },
}

impl BackupOperation {
    /// Backup kind name (for logging)
    pub fn kind(&self) -> &'static str {
        match self {
            BackupOperation::ApplyLock { .. } => "apply-lock",
            BackupOperation::ClearLock { .. } => "clear-lock",
            BackupOperation::ApplyPut { .. } => "apply-put",
        }
    }

    /// Schema tag for this backup kind
    pub fn type_tag(&self) -> TypeTag {
        let type_id = match self {
            BackupOperation::ApplyLock { .. } => BACKUP_APPLY_LOCK,
            BackupOperation::ClearLock { .. } => BACKUP_CLEAR_LOCK,
            BackupOperation::ApplyPut { .. } => BACKUP_APPLY_PUT,
        };
        TypeTag::new(BACKUP_FACTORY_ID, type_id)
    }

    /// Encode into a schema-tagged envelope
    pub fn encode(&self) -> Result<Envelope> {
        encode_tagged(self.type_tag(), self)
    }
}

/// Union of everything the grid registry can decode
#[derive(Debug, Clone, PartialEq)]
pub enum GridPacket {
    Operation(Operation),
    Backup(BackupOperation),
}

/// Build the decoder registry covering every operation and backup kind
pub fn grid_registry() -> CodecRegistry<GridPacket> {
    fn decode_operation(bytes: &[u8]) -> Result<GridPacket> {
        Ok(GridPacket::Operation(bincode::deserialize(bytes)?))
    }
    fn decode_backup(bytes: &[u8]) -> Result<GridPacket> {
        Ok(GridPacket::Backup(bincode::deserialize(bytes)?))
    }

    let mut registry = CodecRegistry::new();
    for type_id in [OP_LOCK, OP_UNLOCK, OP_PUT, OP_GET] {
        registry.register(
            TypeTag::new(OPERATION_FACTORY_ID, type_id),
            decode_operation,
        );
    }
    for type_id in [BACKUP_APPLY_LOCK, BACKUP_CLEAR_LOCK, BACKUP_APPLY_PUT] {
        registry.register(TypeTag::new(BACKUP_FACTORY_ID, type_id), decode_backup);
    }
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn key(s: &str) -> ResourceKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_operation_round_trip() {
        let registry = grid_registry();
        let ops = vec![
            Operation::Lock {
                namespace: "default".to_string(),
                key: key("a"),
                caller: Uuid::new_v4(),
                thread_id: 1,
                ttl_ms: 0,
                wait_timeout_ms: 500,
            },
            Operation::Unlock {
                namespace: "default".to_string(),
                key: key("a"),
                caller: Uuid::new_v4(),
                thread_id: 1,
            },
            Operation::Put {
                map: "users".to_string(),
                key: key("users/1"),
                value: Bytes::from_static(b"ada"),
            },
            Operation::Get {
                map: "users".to_string(),
                key: key("users/1"),
            },
        ];

        for op in ops {
            let envelope = op.encode().unwrap();
            match registry.decode(&envelope).unwrap() {
                GridPacket::Operation(decoded) => assert_eq!(decoded, op),
                other => panic!("expected operation, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_backup_round_trip() {
        let registry = grid_registry();
        let backup = BackupOperation::ApplyLock {
            namespace: "default".to_string(),
            key: key("a"),
            caller: Uuid::new_v4(),
            thread_id: 9,
            count: 2,
            ttl_ms: 5_000,
        };

        let envelope = backup.encode().unwrap();
        match registry.decode(&envelope).unwrap() {
            GridPacket::Backup(decoded) => assert_eq!(decoded, backup),
            other => panic!("expected backup, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let registry = grid_registry();
        let envelope = encode_tagged(TypeTag::new(OPERATION_FACTORY_ID, 77), &1u8).unwrap();
        assert!(matches!(
            registry.decode(&envelope),
            Err(Error::SchemaUnknown { .. })
        ));
    }

    #[test]
    fn test_should_backup() {
        let lock = Operation::Lock {
            namespace: "default".to_string(),
            key: key("a"),
            caller: Uuid::new_v4(),
            thread_id: 1,
            ttl_ms: 0,
            wait_timeout_ms: 0,
        };
        assert!(lock.should_backup(&Response::Bool(true)));
        assert!(!lock.should_backup(&Response::Bool(false)));

        let put = Operation::Put {
            map: "users".to_string(),
            key: key("users/1"),
            value: Bytes::from_static(b"v"),
        };
        assert!(put.should_backup(&Response::Value(None)));

        let get = Operation::Get {
            map: "users".to_string(),
            key: key("users/1"),
        };
        assert!(!get.should_backup(&Response::Value(None)));
    }
}
