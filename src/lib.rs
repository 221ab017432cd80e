//! GridMesh - Distributed In-Memory Data Grid Coordination Core
//!
//! The machinery that lets a client mutate or lock a keyed resource that
//! physically lives on one of many cluster members, survives member
//! failure, and stays consistent via synchronous primary-backup
//! replication.
//!
//! # Architecture
//!
//! Every resource key hashes to a partition; each partition has exactly
//! one owning member plus backup replicas, per an externally maintained
//! partition table. Clients submit operations through an invocation
//! gateway that resolves the owner, sends the request, and transparently
//! retries against a re-resolved owner when the target fails mid-flight.
//! The owner executes under per-partition serialization, consults the
//! lock coordinator for lock operations, and pushes derived idempotent
//! backup operations to the replicas before acknowledging.
//!
//! # Features
//!
//! - Partition-aware request routing with one-hop stale-route redirect
//! - Reentrant distributed locks with FIFO waiting, wait timeouts and
//!   TTL force-release
//! - Primary-backup replication with bounded backup retry
//! - Schema-versioned codec with an explicit decoder registry
//! - Client retry loop that absorbs member failure and shutdown

pub mod cluster;
pub mod codec;
pub mod config;
pub mod error;
pub mod invocation;
pub mod lock;
pub mod member;
pub mod network;
pub mod replication;
pub mod routing;
pub mod security;
pub mod storage;

pub use config::GridMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterMembership, MemberEvent, MemberId};
    pub use crate::codec::{Envelope, ResourceKey, TypeTag};
    pub use crate::config::GridMeshConfig;
    pub use crate::error::{Error, Result};
    pub use crate::invocation::{InvocationConfig, InvocationGateway, InvocationHandle};
    pub use crate::lock::{AcquireOutcome, LockCoordinator, LockReply};
    pub use crate::member::GridMember;
    pub use crate::replication::{BackupOperation, Message, Operation, Response};
    pub use crate::routing::{PartitionId, PartitionRouter, PartitionTable};
    pub use crate::storage::PartitionStore;
}
