//! Cluster Membership View
//!
//! Tracks member states, health, and liveness events. Partition table
//! computation stays with the external collaborator; this view only
//! reports who is alive and publishes termination/shutdown events.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use super::MemberId;
use crate::error::Result;

/// Member status in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    /// Member is joining the cluster
    Joining,
    /// Member is active and reachable
    Active,
    /// Member missed heartbeats and is suspected failed
    Suspected,
    /// Member has been declared terminated (failed)
    Terminated,
    /// Member left gracefully
    ShutDown,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Joining => write!(f, "JOINING"),
            MemberStatus::Active => write!(f, "ACTIVE"),
            MemberStatus::Suspected => write!(f, "SUSPECTED"),
            MemberStatus::Terminated => write!(f, "TERMINATED"),
            MemberStatus::ShutDown => write!(f, "SHUT_DOWN"),
        }
    }
}

/// Liveness events published to gateway and replicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member joined the cluster
    MemberAdded(MemberId),
    /// A member was declared failed
    MemberTerminated(MemberId),
    /// A member left gracefully
    MemberShutDown(MemberId),
}

/// State of a single member
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberState {
    /// Unique member identifier
    pub id: MemberId,
    /// Member address (host:port)
    pub address: String,
    /// Current status
    pub status: MemberStatus,
    /// Last heartbeat time (not serialized)
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    /// When the member joined
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl MemberState {
    /// Create a new member state
    pub fn new(id: MemberId, address: String) -> Self {
        Self {
            id,
            address,
            status: MemberStatus::Joining,
            last_heartbeat: None,
            joined_at: chrono::Utc::now(),
        }
    }

    /// Check if the member is healthy (received heartbeat recently)
    pub fn is_healthy(&self, timeout: Duration) -> bool {
        match self.last_heartbeat {
            Some(last) => last.elapsed() < timeout,
            None => false,
        }
    }

    /// Update heartbeat time
    pub fn touch(&mut self) {
        self.last_heartbeat = Some(Instant::now());
    }
}

/// Cluster membership tracker
pub struct ClusterMembership {
    /// This member's ID
    local_id: MemberId,
    /// All known members (including self)
    members: RwLock<HashMap<MemberId, MemberState>>,
    /// Heartbeat timeout before a member is suspected
    heartbeat_timeout: Duration,
    /// Liveness event publisher
    events: broadcast::Sender<MemberEvent>,
}

impl ClusterMembership {
    /// Create a new membership view seeded with the local member
    pub fn new(local_id: MemberId, address: String, heartbeat_timeout: Duration) -> Self {
        let mut members = HashMap::new();
        let mut self_member = MemberState::new(local_id.clone(), address);
        self_member.status = MemberStatus::Active;
        self_member.touch();
        members.insert(local_id.clone(), self_member);

        let (events, _) = broadcast::channel(64);

        Self {
            local_id,
            members: RwLock::new(members),
            heartbeat_timeout,
            events,
        }
    }

    /// Get this member's ID
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Subscribe to liveness events
    pub fn subscribe(&self) -> broadcast::Receiver<MemberEvent> {
        self.events.subscribe()
    }

    /// Add a member to the view
    pub async fn add_member(&self, id: MemberId, address: String) -> Result<()> {
        let mut members = self.members.write().await;
        if !members.contains_key(&id) {
            members.insert(id.clone(), MemberState::new(id.clone(), address));
            let _ = self.events.send(MemberEvent::MemberAdded(id));
        }
        Ok(())
    }

    /// Get a member's state
    pub async fn get_member(&self, id: &str) -> Option<MemberState> {
        let members = self.members.read().await;
        members.get(id).cloned()
    }

    /// Get a member's address
    pub async fn address_of(&self, id: &str) -> Option<String> {
        let members = self.members.read().await;
        members.get(id).map(|m| m.address.clone())
    }

    /// Record a heartbeat from a member
    pub async fn record_heartbeat(&self, id: &str) -> Result<()> {
        let mut members = self.members.write().await;
        if let Some(member) = members.get_mut(id) {
            member.touch();
            match member.status {
                MemberStatus::Joining | MemberStatus::Suspected => {
                    member.status = MemberStatus::Active;
                }
                _ => {}
            }
        } else {
            tracing::warn!("Heartbeat from unknown member '{}'", id);
        }
        Ok(())
    }

    /// Check for timed-out members. Suspected members that stay silent for
    /// another timeout window are declared terminated and an event fires.
    pub async fn check_timeouts(&self) -> Vec<MemberId> {
        let mut members = self.members.write().await;
        let mut newly_terminated = Vec::new();

        for (id, member) in members.iter_mut() {
            if id == &self.local_id {
                continue;
            }
            // Members we never heard from are left to the joining flow
            if member.last_heartbeat.is_none() {
                continue;
            }

            if !member.is_healthy(self.heartbeat_timeout) {
                match member.status {
                    MemberStatus::Active => {
                        member.status = MemberStatus::Suspected;
                        tracing::warn!("Member '{}' suspected (missed heartbeats)", id);
                    }
                    MemberStatus::Suspected => {
                        if !member.is_healthy(self.heartbeat_timeout * 2) {
                            member.status = MemberStatus::Terminated;
                            newly_terminated.push(id.clone());
                        }
                    }
                    _ => {}
                }
            }
        }

        for id in &newly_terminated {
            tracing::warn!("Member '{}' declared terminated", id);
            let _ = self.events.send(MemberEvent::MemberTerminated(id.clone()));
        }

        newly_terminated
    }

    /// Declare a member failed immediately (connection reset observed)
    pub async fn mark_terminated(&self, id: &str) {
        let mut members = self.members.write().await;
        if let Some(member) = members.get_mut(id) {
            if member.status != MemberStatus::Terminated {
                member.status = MemberStatus::Terminated;
                let _ = self
                    .events
                    .send(MemberEvent::MemberTerminated(id.to_string()));
            }
        }
    }

    /// Record a graceful shutdown announcement from a member
    pub async fn mark_shutdown(&self, id: &str) {
        let mut members = self.members.write().await;
        if let Some(member) = members.get_mut(id) {
            if member.status != MemberStatus::ShutDown {
                member.status = MemberStatus::ShutDown;
                let _ = self
                    .events
                    .send(MemberEvent::MemberShutDown(id.to_string()));
            }
        }
    }

    /// Check whether a member is currently usable as an operation target
    pub async fn is_alive(&self, id: &str) -> bool {
        let members = self.members.read().await;
        matches!(
            members.get(id).map(|m| m.status),
            Some(MemberStatus::Active) | Some(MemberStatus::Joining) | Some(MemberStatus::Suspected)
        )
    }

    /// Get all members (including self)
    pub async fn members(&self) -> Vec<MemberState> {
        let members = self.members.read().await;
        members.values().cloned().collect()
    }

    /// Get all peer members (excluding self)
    pub async fn peers(&self) -> Vec<MemberState> {
        let members = self.members.read().await;
        members
            .values()
            .filter(|m| m.id != self.local_id)
            .cloned()
            .collect()
    }

    /// Get all active members
    pub async fn active_members(&self) -> Vec<MemberState> {
        let members = self.members.read().await;
        members
            .values()
            .filter(|m| m.status == MemberStatus::Active)
            .cloned()
            .collect()
    }

    /// Get the cluster size (total known members)
    pub async fn size(&self) -> usize {
        self.members.read().await.len()
    }

    /// Get cluster summary
    pub async fn summary(&self) -> ClusterSummary {
        let members = self.members.read().await;
        let mut summary = ClusterSummary {
            total_members: members.len(),
            active_members: 0,
            suspected_members: 0,
            terminated_members: 0,
        };

        for member in members.values() {
            match member.status {
                MemberStatus::Active => summary.active_members += 1,
                MemberStatus::Suspected => summary.suspected_members += 1,
                MemberStatus::Terminated => summary.terminated_members += 1,
                _ => {}
            }
        }

        summary
    }
}

/// Cluster summary information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub total_members: usize,
    pub active_members: usize,
    pub suspected_members: usize,
    pub terminated_members: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_membership_basics() {
        let cluster = ClusterMembership::new(
            "member-1".to_string(),
            "localhost:7900".to_string(),
            Duration::from_secs(1),
        );

        cluster
            .add_member("member-2".to_string(), "localhost:7901".to_string())
            .await
            .unwrap();
        cluster
            .add_member("member-3".to_string(), "localhost:7902".to_string())
            .await
            .unwrap();

        assert_eq!(cluster.size().await, 3);
        assert_eq!(
            cluster.address_of("member-2").await.as_deref(),
            Some("localhost:7901")
        );
    }

    #[tokio::test]
    async fn test_heartbeat_and_timeout() {
        let cluster = ClusterMembership::new(
            "member-1".to_string(),
            "localhost:7900".to_string(),
            Duration::from_millis(50),
        );

        cluster
            .add_member("member-2".to_string(), "localhost:7901".to_string())
            .await
            .unwrap();
        cluster.record_heartbeat("member-2").await.unwrap();
        assert!(cluster.is_alive("member-2").await);

        tokio::time::sleep(Duration::from_millis(120)).await;

        // First sweep suspects, second declares terminated
        assert!(cluster.check_timeouts().await.is_empty());
        let terminated = cluster.check_timeouts().await;
        assert_eq!(terminated, vec!["member-2".to_string()]);
        assert!(!cluster.is_alive("member-2").await);
    }

    #[tokio::test]
    async fn test_termination_event_published() {
        let cluster = ClusterMembership::new(
            "member-1".to_string(),
            "localhost:7900".to_string(),
            Duration::from_secs(1),
        );
        cluster
            .add_member("member-2".to_string(), "localhost:7901".to_string())
            .await
            .unwrap();

        let mut events = cluster.subscribe();
        cluster.mark_terminated("member-2").await;

        // MemberAdded fired before we subscribed, so first event is the
        // termination
        let event = events.recv().await.unwrap();
        assert_eq!(event, MemberEvent::MemberTerminated("member-2".to_string()));
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let cluster = ClusterMembership::new(
            "member-1".to_string(),
            "localhost:7900".to_string(),
            Duration::from_secs(1),
        );
        cluster
            .add_member("member-2".to_string(), "localhost:7901".to_string())
            .await
            .unwrap();

        cluster.mark_shutdown("member-2").await;
        assert!(!cluster.is_alive("member-2").await);
        let member = cluster.get_member("member-2").await.unwrap();
        assert_eq!(member.status, MemberStatus::ShutDown);
    }
}
