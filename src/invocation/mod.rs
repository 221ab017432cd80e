//! Client Invocation Gateway
//!
//! Client-facing submission API. Each submission returns a handle backed
//! by a oneshot future; a driver task resolves the partition owner,
//! sends the request, and transparently retries against a re-resolved
//! owner when the target becomes unreachable, terminates, or shuts down
//! mid-flight. Transient routing and member-failure errors never reach
//! the caller; logic errors pass through unmodified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::sync::{oneshot, watch, Mutex};
use uuid::Uuid;

use crate::cluster::{ClusterMembership, MemberId};
use crate::codec::ResourceKey;
use crate::config::InvocationSettings;
use crate::error::{Error, Result};
use crate::network::MemberChannel;
use crate::replication::{Message, Operation, Response};
use crate::routing::PartitionRouter;

/// Configuration for the invocation retry loop
#[derive(Debug, Clone)]
pub struct InvocationConfig {
    /// Maximum attempts per logical submission
    pub max_attempts: u32,
    /// Fixed pause between retry attempts in milliseconds
    pub retry_pause_ms: u64,
}

impl Default for InvocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            retry_pause_ms: 250,
        }
    }
}

impl From<&InvocationSettings> for InvocationConfig {
    fn from(settings: &InvocationSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            retry_pause_ms: settings.retry_pause_ms,
        }
    }
}

/// Handle to one in-flight submission. Resolves exactly once: with the
/// operation's result, or with a terminal error.
pub struct InvocationHandle {
    correlation_id: u64,
    attempts: Arc<AtomicU32>,
    receiver: oneshot::Receiver<Result<Response>>,
}

impl InvocationHandle {
    /// Correlation id assigned to this submission
    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    /// Attempts driven so far (observability)
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Block until the submission resolves. Abandoning the handle instead
    /// stops the caller from waiting but does not cancel server-side
    /// execution.
    pub async fn wait(self) -> Result<Response> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(Error::ShuttingDown))
    }
}

struct GatewayShared {
    client_id: Uuid,
    router: Arc<PartitionRouter>,
    membership: Arc<ClusterMembership>,
    channel: Arc<dyn MemberChannel>,
    config: InvocationConfig,
    /// In-flight submissions: correlation id -> operation kind
    pending: Mutex<HashMap<u64, &'static str>>,
}

/// Client request gateway
pub struct InvocationGateway {
    shared: Arc<GatewayShared>,
    correlation_seq: AtomicU64,
    shutdown: watch::Sender<bool>,
}

impl InvocationGateway {
    /// Create a gateway with a fresh client identity
    pub fn new(
        router: Arc<PartitionRouter>,
        membership: Arc<ClusterMembership>,
        channel: Arc<dyn MemberChannel>,
        config: InvocationConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(GatewayShared {
                client_id: Uuid::new_v4(),
                router,
                membership,
                channel,
                config,
                pending: Mutex::new(HashMap::new()),
            }),
            correlation_seq: AtomicU64::new(1),
            shutdown,
        }
    }

    /// This gateway's caller identity
    pub fn client_id(&self) -> Uuid {
        self.shared.client_id
    }

    /// Submissions currently in flight
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    /// Resolve all pending and future submissions with a terminal
    /// shutdown error
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Submit an operation. Returns immediately with a handle the caller
    /// can block on or drop.
    pub fn submit(&self, op: Operation) -> InvocationHandle {
        let correlation_id = self.correlation_seq.fetch_add(1, Ordering::Relaxed);
        let attempts = Arc::new(AtomicU32::new(0));
        let (tx, rx) = oneshot::channel();

        let shared = Arc::clone(&self.shared);
        let attempt_counter = Arc::clone(&attempts);
        let shutdown_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            shared
                .pending
                .lock()
                .await
                .insert(correlation_id, op.kind());
            let result =
                drive(&shared, correlation_id, op, &attempt_counter, shutdown_rx).await;
            shared.pending.lock().await.remove(&correlation_id);
            let _ = tx.send(result);
        });

        InvocationHandle {
            correlation_id,
            attempts,
            receiver: rx,
        }
    }

    /// Acquire a distributed lock. `Ok(true)` when granted.
    pub async fn lock(
        &self,
        namespace: &str,
        key: ResourceKey,
        thread_id: u64,
        ttl_ms: u64,
        wait_timeout_ms: i64,
    ) -> Result<bool> {
        let response = self
            .submit(Operation::Lock {
                namespace: namespace.to_string(),
                key,
                caller: self.shared.client_id,
                thread_id,
                ttl_ms,
                wait_timeout_ms,
            })
            .wait()
            .await?;
        Ok(response.as_bool())
    }

    /// Release a distributed lock
    pub async fn unlock(
        &self,
        namespace: &str,
        key: ResourceKey,
        thread_id: u64,
    ) -> Result<()> {
        self.submit(Operation::Unlock {
            namespace: namespace.to_string(),
            key,
            caller: self.shared.client_id,
            thread_id,
        })
        .wait()
        .await?;
        Ok(())
    }

    /// Store a value, returning the previous one
    pub async fn put(
        &self,
        map: &str,
        key: ResourceKey,
        value: Bytes,
    ) -> Result<Option<Bytes>> {
        let response = self
            .submit(Operation::Put {
                map: map.to_string(),
                key,
                value,
            })
            .wait()
            .await?;
        Ok(response.into_value())
    }

    /// Read a value
    pub async fn get(&self, map: &str, key: ResourceKey) -> Result<Option<Bytes>> {
        let response = self
            .submit(Operation::Get {
                map: map.to_string(),
                key,
            })
            .wait()
            .await?;
        Ok(response.into_value())
    }
}

/// Drive one logical submission through bounded attempts
async fn drive(
    shared: &GatewayShared,
    correlation_id: u64,
    op: Operation,
    attempts: &AtomicU32,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<Response> {
    let partition_id = shared.router.partition_for(op.key());
    let envelope = op.encode()?;
    let mut redirect: Option<MemberId> = None;
    let mut last_error: Option<Error> = None;

    for attempt in 1..=shared.config.max_attempts {
        if *shutdown_rx.borrow() {
            return Err(Error::ShuttingDown);
        }
        attempts.store(attempt, Ordering::Relaxed);

        // A WrongMember redirect short-circuits table resolution once
        let target = match redirect.take() {
            Some(member) => member,
            None => match shared.router.owner_of(partition_id).await {
                Some(owner) => owner,
                None => {
                    last_error = Some(Error::OwnerUnknown(partition_id));
                    pause(shared, &mut shutdown_rx).await?;
                    continue;
                }
            },
        };

        if !shared.membership.is_alive(&target).await {
            last_error = Some(Error::MemberUnreachable(target));
            pause(shared, &mut shutdown_rx).await?;
            continue;
        }

        let request = Message::Request {
            correlation_id,
            partition_id,
            caller: shared.client_id,
            op: envelope.clone(),
        };

        match shared.channel.send(&target, request).await {
            Ok(Message::Response { result, .. }) => match result {
                Ok(response) => return Ok(response),
                Err(wire) => {
                    let error: Error = wire.into();
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    tracing::debug!(
                        "Invocation {} attempt {} rejected: {}",
                        correlation_id,
                        attempt,
                        error
                    );
                    last_error = Some(error);
                }
            },
            Ok(Message::WrongMember { known_owner, .. }) => {
                tracing::debug!(
                    "Invocation {} misrouted to {}; known owner {:?}",
                    correlation_id,
                    target,
                    known_owner
                );
                last_error = Some(Error::RoutingStale { partition_id });
                if let Some(owner) = known_owner {
                    // One-hop redirect, no pause
                    redirect = Some(owner);
                    continue;
                }
            }
            Ok(other) => {
                last_error = Some(Error::Network(format!(
                    "unexpected reply {}",
                    other.type_name()
                )));
            }
            Err(error) => {
                if !error.is_retryable() {
                    return Err(error);
                }
                tracing::debug!(
                    "Invocation {} attempt {} to {} failed: {}",
                    correlation_id,
                    attempt,
                    target,
                    error
                );
                last_error = Some(error);
            }
        }

        pause(shared, &mut shutdown_rx).await?;
    }

    Err(Error::RetriesExhausted {
        attempts: shared.config.max_attempts,
        last: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt completed".to_string()),
    })
}

/// Fixed short pause between attempts, with a little jitter so clients
/// re-reading a mid-update partition table don't stampede
async fn pause(shared: &GatewayShared, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
    let base = shared.config.retry_pause_ms;
    let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(base + jitter)) => Ok(()),
        changed = shutdown_rx.changed() => {
            if changed.is_err() || *shutdown_rx.borrow() {
                Err(Error::ShuttingDown)
            } else {
                Ok(())
            }
        }
    }
}
