//! Operation Replicator
//!
//! Executes operations against local partition state on the owning
//! member, then pushes derived backup operations to every backup replica
//! before the result is acknowledged. Lock acquires that cannot proceed
//! immediately are parked as continuations in the lock store; the
//! executing task suspends on the continuation instead of occupying an
//! execution slot.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use crate::cluster::MemberId;
use crate::error::{Error, Result};
use crate::lock::{AcquireOutcome, LockCoordinator, LockReply};
use crate::network::MemberChannel;
use crate::routing::{PartitionId, PartitionRouter};
use crate::storage::PartitionStore;

use super::operation::{BackupOperation, Operation, Response};
use super::protocol::Message;
use super::ReplicationConfig;

/// Owner-side operation execution and backup replication
pub struct OperationReplicator {
    local_id: MemberId,
    storage: Arc<PartitionStore>,
    locks: Arc<LockCoordinator>,
    router: Arc<PartitionRouter>,
    channel: Arc<dyn MemberChannel>,
    config: ReplicationConfig,
}

impl OperationReplicator {
    /// Create a replicator for the local member
    pub fn new(
        local_id: MemberId,
        storage: Arc<PartitionStore>,
        locks: Arc<LockCoordinator>,
        router: Arc<PartitionRouter>,
        channel: Arc<dyn MemberChannel>,
        config: ReplicationConfig,
    ) -> Self {
        Self {
            local_id,
            storage,
            locks,
            router,
            channel,
            config,
        }
    }

    /// The member this replicator executes for
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Execute an operation against local state. Replication-eligible
    /// results are pushed to every backup replica before this returns.
    pub async fn execute(&self, partition_id: PartitionId, op: Operation) -> Result<Response> {
        let (response, backup) = match &op {
            Operation::Lock {
                namespace,
                key,
                caller,
                thread_id,
                ttl_ms,
                wait_timeout_ms,
            } => {
                let outcome = self
                    .locks
                    .acquire(namespace, key, *caller, *thread_id, *ttl_ms, *wait_timeout_ms)
                    .await;
                let granted = match outcome {
                    AcquireOutcome::Granted { .. } => true,
                    AcquireOutcome::Denied => false,
                    AcquireOutcome::Parked { receiver, .. } => match receiver.await {
                        Ok(LockReply::Granted) => true,
                        Ok(LockReply::Denied) => false,
                        Ok(LockReply::WaitInvalid) => {
                            return Err(Error::LockWaitInvalid {
                                namespace: namespace.clone(),
                            })
                        }
                        Err(_) => {
                            return Err(Error::Internal(
                                "lock continuation dropped before wake-up".into(),
                            ))
                        }
                    },
                };

                let backup = if granted {
                    let count = self.locks.lock_count(namespace, key).await;
                    Some(BackupOperation::ApplyLock {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        caller: *caller,
                        thread_id: *thread_id,
                        count,
                        ttl_ms: *ttl_ms,
                    })
                } else {
                    None
                };
                (Response::Bool(granted), backup)
            }

            Operation::Unlock {
                namespace,
                key,
                caller,
                thread_id,
            } => {
                let fully_released = self
                    .locks
                    .release(namespace, key, *caller, *thread_id)
                    .await?;

                let backup = if fully_released {
                    Some(BackupOperation::ClearLock {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        caller: *caller,
                        thread_id: *thread_id,
                    })
                } else {
                    // Still held at a lower depth: replicate the new image
                    let count = self.locks.lock_count(namespace, key).await;
                    Some(BackupOperation::ApplyLock {
                        namespace: namespace.clone(),
                        key: key.clone(),
                        caller: *caller,
                        thread_id: *thread_id,
                        count,
                        ttl_ms: 0,
                    })
                };
                (Response::Bool(true), backup)
            }

            Operation::Put { map, key, value } => {
                let previous = self
                    .storage
                    .put(partition_id, map, key, value.clone())
                    .await;
                let backup = Some(BackupOperation::ApplyPut {
                    map: map.clone(),
                    key: key.clone(),
                    value: value.clone(),
                });
                (Response::Value(previous), backup)
            }

            Operation::Get { map, key } => {
                (Response::Value(self.storage.get(partition_id, map, key).await), None)
            }
        };

        if op.should_backup(&response) {
            if let Some(backup) = backup {
                self.replicate(partition_id, backup).await;
            }
        }

        Ok(response)
    }

    /// Apply a backup operation on this (replica) member. Applications
    /// are absolute-state and safe to repeat.
    pub async fn apply_backup(&self, partition_id: PartitionId, backup: BackupOperation) {
        tracing::trace!(
            "Applying backup {} for partition {}",
            backup.kind(),
            partition_id
        );
        match backup {
            BackupOperation::ApplyLock {
                namespace,
                key,
                caller,
                thread_id,
                count,
                ttl_ms,
            } => {
                self.locks
                    .apply_backup_lock(&namespace, &key, caller, thread_id, count, ttl_ms)
                    .await;
            }
            BackupOperation::ClearLock {
                namespace,
                key,
                caller,
                thread_id,
            } => {
                self.locks
                    .apply_backup_clear(&namespace, &key, caller, thread_id)
                    .await;
            }
            BackupOperation::ApplyPut { map, key, value } => {
                self.storage.put(partition_id, &map, &key, value).await;
            }
        }
    }

    /// Push a backup operation to every backup replica of a partition.
    /// Each replica gets a bounded number of attempts; exhaustion is
    /// logged and the primary proceeds with reduced redundancy until the
    /// next backup reassignment heals it.
    async fn replicate(&self, partition_id: PartitionId, backup: BackupOperation) {
        let backups = self.router.backups_of(partition_id).await;
        if backups.is_empty() {
            return;
        }

        let envelope = match backup.encode() {
            Ok(env) => env,
            Err(e) => {
                tracing::error!("Failed to encode backup operation: {}", e);
                return;
            }
        };
        let message = Message::Backup {
            partition_id,
            op: envelope,
        };

        join_all(
            backups
                .iter()
                .map(|member| self.push_backup(member, message.clone())),
        )
        .await;
    }

    /// Deliver one backup message to one replica with bounded retry
    async fn push_backup(&self, member: &MemberId, message: Message) {
        let attempt_timeout = Duration::from_millis(self.config.backup_timeout_ms);

        for attempt in 1..=self.config.backup_attempts {
            let send = self.channel.send(member, message.clone());
            match tokio::time::timeout(attempt_timeout, send).await {
                Ok(Ok(Message::BackupAck { .. })) => return,
                Ok(Ok(other)) => {
                    tracing::warn!(
                        "Unexpected backup reply {} from {} (attempt {})",
                        other.type_name(),
                        member,
                        attempt
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!("Backup to {} failed (attempt {}): {}", member, attempt, e);
                }
                Err(_) => {
                    tracing::warn!("Backup to {} timed out (attempt {})", member, attempt);
                }
            }
        }

        tracing::warn!(
            "Giving up on backup to {} after {} attempts; proceeding with reduced redundancy",
            member,
            self.config.backup_attempts
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::replication::operation::grid_registry;
    use crate::routing::{PartitionReplicas, PartitionTable};
    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::Mutex;
    use uuid::Uuid;

    /// Records every message and answers per a scripted policy
    struct ScriptedChannel {
        sent: Mutex<Vec<(MemberId, Message)>>,
        fail_sends: bool,
    }

    impl ScriptedChannel {
        fn new(fail_sends: bool) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_sends,
            }
        }
    }

    #[async_trait]
    impl MemberChannel for ScriptedChannel {
        async fn send(&self, member: &MemberId, message: Message) -> crate::error::Result<Message> {
            self.sent.lock().await.push((member.clone(), message));
            if self.fail_sends {
                return Err(Error::MemberUnreachable(member.clone()));
            }
            Ok(Message::BackupAck { partition_id: 0 })
        }
    }

    fn key(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn table_with_backup() -> PartitionTable {
        let mut table = PartitionTable::empty(8);
        table.version = 1;
        for entry in table.replicas.iter_mut() {
            *entry = Some(PartitionReplicas {
                owner: "member-1".to_string(),
                backups: vec!["member-2".to_string()],
            });
        }
        table
    }

    fn replicator(channel: Arc<ScriptedChannel>) -> OperationReplicator {
        OperationReplicator::new(
            "member-1".to_string(),
            Arc::new(PartitionStore::new(8)),
            Arc::new(LockCoordinator::new(&LockConfig { max_wait_ms: 5_000 })),
            Arc::new(PartitionRouter::with_table(8, table_with_backup())),
            channel,
            ReplicationConfig {
                backup_attempts: 3,
                backup_timeout_ms: 200,
            },
        )
    }

    #[tokio::test]
    async fn test_put_executes_and_backs_up() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));

        let op = Operation::Put {
            map: "users".to_string(),
            key: key("users/1"),
            value: Bytes::from_static(b"ada"),
        };
        let response = replicator.execute(2, op).await.unwrap();
        assert_eq!(response, Response::Value(None));

        let sent = channel.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "member-2");
        assert!(matches!(sent[0].1, Message::Backup { partition_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_get_does_not_back_up() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));

        let op = Operation::Get {
            map: "users".to_string(),
            key: key("users/1"),
        };
        let response = replicator.execute(2, op).await.unwrap();
        assert_eq!(response, Response::Value(None));
        assert!(channel.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_lock_grant_backs_up_denial_does_not() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));
        let holder = Uuid::new_v4();
        let contender = Uuid::new_v4();

        let grant = Operation::Lock {
            namespace: "default".to_string(),
            key: key("r"),
            caller: holder,
            thread_id: 1,
            ttl_ms: 0,
            wait_timeout_ms: 0,
        };
        let response = replicator.execute(1, grant).await.unwrap();
        assert_eq!(response, Response::Bool(true));
        assert_eq!(channel.sent.lock().await.len(), 1);

        let denied = Operation::Lock {
            namespace: "default".to_string(),
            key: key("r"),
            caller: contender,
            thread_id: 1,
            ttl_ms: 0,
            wait_timeout_ms: 0,
        };
        let response = replicator.execute(1, denied).await.unwrap();
        assert_eq!(response, Response::Bool(false));
        // No new backup for the denial
        assert_eq!(channel.sent.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unlock_by_non_owner_is_error() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));
        let holder = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let grant = Operation::Lock {
            namespace: "default".to_string(),
            key: key("r"),
            caller: holder,
            thread_id: 1,
            ttl_ms: 0,
            wait_timeout_ms: 0,
        };
        replicator.execute(1, grant).await.unwrap();

        let bad_unlock = Operation::Unlock {
            namespace: "default".to_string(),
            key: key("r"),
            caller: stranger,
            thread_id: 1,
        };
        assert!(matches!(
            replicator.execute(1, bad_unlock).await,
            Err(Error::LockOwnerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_backup_attempts_bounded() {
        let channel = Arc::new(ScriptedChannel::new(true));
        let replicator = replicator(Arc::clone(&channel));

        let op = Operation::Put {
            map: "users".to_string(),
            key: key("users/1"),
            value: Bytes::from_static(b"v"),
        };
        // Backup failures never fail the client-visible result
        let response = replicator.execute(0, op).await.unwrap();
        assert_eq!(response, Response::Value(None));

        // Exactly backup_attempts sends to the single replica
        assert_eq!(channel.sent.lock().await.len(), 3);
    }

    #[tokio::test]
    async fn test_backup_application_idempotent() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));

        let backup = BackupOperation::ApplyPut {
            map: "users".to_string(),
            key: key("users/1"),
            value: Bytes::from_static(b"ada"),
        };
        replicator.apply_backup(4, backup.clone()).await;
        replicator.apply_backup(4, backup).await;

        assert_eq!(
            replicator.storage.get(4, "users", &key("users/1")).await,
            Some(Bytes::from_static(b"ada"))
        );
        assert_eq!(replicator.storage.partition_len(4).await, 1);
    }

    #[tokio::test]
    async fn test_backup_envelope_decodes_with_registry() {
        let channel = Arc::new(ScriptedChannel::new(false));
        let replicator = replicator(Arc::clone(&channel));

        let op = Operation::Put {
            map: "users".to_string(),
            key: key("users/1"),
            value: Bytes::from_static(b"v"),
        };
        replicator.execute(0, op).await.unwrap();

        let sent = channel.sent.lock().await;
        let envelope = match &sent[0].1 {
            Message::Backup { op, .. } => op.clone(),
            other => panic!("expected backup, got {}", other.type_name()),
        };
        let registry = grid_registry();
        assert!(registry.decode(&envelope).is_ok());
    }
}
