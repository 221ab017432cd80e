//! Cluster Module
//!
//! In-process face of the membership/failure-detection collaborator:
//! member states, heartbeats, and membership events consumed by the
//! invocation gateway and the replicator.

mod membership;

pub use membership::{
    ClusterMembership, ClusterSummary, MemberEvent, MemberState, MemberStatus,
};

/// Cluster member identifier
pub type MemberId = String;
