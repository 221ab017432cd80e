//! Grid Member Runtime
//!
//! Wires storage, locks, router, membership and the replicator into one
//! cluster member and dispatches incoming protocol messages: requests
//! are authorized, ownership-checked and executed; backups are applied;
//! heartbeats feed the membership view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cluster::{ClusterMembership, MemberId};
use crate::codec::{CodecRegistry, Envelope};
use crate::error::{Error, Result};
use crate::lock::LockCoordinator;
use crate::network::{MemberChannel, MessageHandler};
use crate::replication::{
    grid_registry, GridPacket, Message, Operation, OperationReplicator, ReplicationConfig,
    Response, WireError,
};
use crate::routing::{PartitionId, PartitionRouter};
use crate::security::Authorizer;
use crate::storage::PartitionStore;

/// One grid member: partition-local state plus the dispatch surface the
/// network server and in-process peers call into
pub struct GridMember {
    id: MemberId,
    membership: Arc<ClusterMembership>,
    router: Arc<PartitionRouter>,
    storage: Arc<PartitionStore>,
    locks: Arc<LockCoordinator>,
    channel: Arc<dyn MemberChannel>,
    replicator: OperationReplicator,
    authorizer: Arc<dyn Authorizer>,
    registry: CodecRegistry<GridPacket>,
    shutting_down: AtomicBool,
}

impl GridMember {
    /// Assemble a member from its components
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: MemberId,
        membership: Arc<ClusterMembership>,
        router: Arc<PartitionRouter>,
        storage: Arc<PartitionStore>,
        locks: Arc<LockCoordinator>,
        channel: Arc<dyn MemberChannel>,
        authorizer: Arc<dyn Authorizer>,
        replication: ReplicationConfig,
    ) -> Arc<Self> {
        let replicator = OperationReplicator::new(
            id.clone(),
            Arc::clone(&storage),
            Arc::clone(&locks),
            Arc::clone(&router),
            Arc::clone(&channel),
            replication,
        );

        Arc::new(Self {
            id,
            membership,
            router,
            storage,
            locks,
            channel,
            replicator,
            authorizer,
            registry: grid_registry(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// This member's id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// This member's partition router
    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    /// This member's cluster view
    pub fn membership(&self) -> &Arc<ClusterMembership> {
        &self.membership
    }

    /// True once a graceful shutdown started
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Start a graceful shutdown: refuse new requests and announce the
    /// departure to every peer so clients re-route promptly
    pub async fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::Relaxed) {
            return;
        }
        tracing::info!("Member {} shutting down", self.id);

        for peer in self.membership.peers().await {
            let announce = Message::Shutdown {
                member_id: self.id.clone(),
            };
            if let Err(e) = self.channel.send(&peer.id, announce).await {
                tracing::debug!("Shutdown announcement to {} failed: {}", peer.id, e);
            }
        }
    }

    /// Build the handler closure the network server dispatches through
    pub fn handler(self: &Arc<Self>) -> MessageHandler {
        let member = Arc::clone(self);
        Arc::new(move |_peer, message| {
            let member = Arc::clone(&member);
            Box::pin(async move { member.handle_message(message).await })
        })
    }

    /// Dispatch one protocol message, producing the reply if the message
    /// type expects one
    pub async fn handle_message(&self, message: Message) -> Option<Message> {
        match message {
            Message::Request {
                correlation_id,
                partition_id,
                caller,
                op,
            } => Some(
                self.handle_request(correlation_id, partition_id, caller, op)
                    .await,
            ),

            Message::Backup { partition_id, op } => match self.registry.decode(&op) {
                Ok(GridPacket::Backup(backup)) => {
                    self.replicator.apply_backup(partition_id, backup).await;
                    Some(Message::BackupAck { partition_id })
                }
                Ok(GridPacket::Operation(op)) => {
                    tracing::error!(
                        "Primary operation {} arrived on the backup path",
                        op.kind()
                    );
                    None
                }
                Err(e) => {
                    tracing::error!("Undecodable backup operation: {}", e);
                    None
                }
            },

            Message::Heartbeat { member_id } => {
                let _ = self.membership.record_heartbeat(&member_id).await;
                Some(Message::HeartbeatAck {
                    member_id: self.id.clone(),
                })
            }

            Message::HeartbeatAck { member_id } => {
                let _ = self.membership.record_heartbeat(&member_id).await;
                None
            }

            Message::Shutdown { member_id } => {
                self.membership.mark_shutdown(&member_id).await;
                None
            }

            Message::StatusRequest => Some(self.status().await),

            // Replies never arrive unsolicited on the server path
            other => {
                tracing::trace!("Ignoring {} on server path", other.type_name());
                None
            }
        }
    }

    async fn handle_request(
        &self,
        correlation_id: u64,
        partition_id: PartitionId,
        caller: Uuid,
        op: Envelope,
    ) -> Message {
        if self.is_shutting_down() {
            return error_response(correlation_id, &Error::ShuttingDown);
        }

        let operation = match self.registry.decode(&op) {
            Ok(GridPacket::Operation(operation)) => operation,
            Ok(GridPacket::Backup(_)) => {
                return error_response(
                    correlation_id,
                    &Error::Internal("backup operation on the request path".into()),
                )
            }
            Err(e) => return error_response(correlation_id, &e),
        };

        if let Err(e) = self.authorizer.authorize(caller, &operation) {
            tracing::warn!("Denied {} from {}: {}", operation.kind(), caller, e);
            return error_response(correlation_id, &e);
        }

        // Stale-routed requests are redirected, not executed
        if !self.router.is_owner(partition_id, &self.id).await {
            return Message::WrongMember {
                correlation_id,
                known_owner: self.router.owner_of(partition_id).await,
            };
        }

        let result = self.replicator.execute(partition_id, operation).await;
        Message::Response {
            correlation_id,
            result: result.map_err(|e| WireError::from_error(&e)),
        }
    }

    /// Current member status
    pub async fn status(&self) -> Message {
        Message::StatusResponse {
            member_id: self.id.clone(),
            table_version: self.router.table_version().await,
            owned_partitions: self.router.owned_partitions(&self.id).await.len(),
            live_locks: self.locks.live_records().await,
            entries: self.storage.len().await,
        }
    }

    /// Execute a local operation without the network round trip. Still
    /// routed through the ownership check.
    pub async fn execute_local(&self, op: Operation) -> Result<Response> {
        let partition_id = self.router.partition_for(op.key());
        if !self.router.is_owner(partition_id, &self.id).await {
            return Err(Error::RoutingStale { partition_id });
        }
        self.replicator.execute(partition_id, op).await
    }

    /// Heartbeat/failure-sweep loop; runs until shutdown starts
    pub async fn run(&self, heartbeat_interval: Duration) {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if self.is_shutting_down() {
                break;
            }

            for peer in self.membership.peers().await {
                let heartbeat = Message::Heartbeat {
                    member_id: self.id.clone(),
                };
                if let Err(e) = self.channel.send(&peer.id, heartbeat).await {
                    tracing::debug!("Heartbeat to {} failed: {}", peer.id, e);
                }
            }

            self.membership.check_timeouts().await;
        }
    }
}

fn error_response(correlation_id: u64, error: &Error) -> Message {
    Message::Response {
        correlation_id,
        result: Err(WireError::from_error(error)),
    }
}
