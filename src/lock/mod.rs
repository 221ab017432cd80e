//! Lock Coordination Module
//!
//! Serializes access to a resource per (namespace, key) with reentrant
//! ownership, bounded FIFO waiting and TTL force-release. Parked acquire
//! attempts are continuation records woken by a release event or a timer,
//! never threads blocked on the lock table.

mod store;

pub use store::{AcquireOutcome, LockReply, LockStore, ReleaseEffect, TtlArm, WaitPolicy};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::ResourceKey;
use crate::config::LockConfig;
use crate::error::Result;

/// Wait timeout value meaning "do not wait"
pub const WAIT_NONE: i64 = 0;
/// Wait timeout value meaning "wait without bound"
pub const WAIT_UNBOUNDED: i64 = -1;

/// Lock coordinator: one [`LockStore`] per namespace plus the timer layer
/// that drives TTL force-release and wait-deadline expiry
pub struct LockCoordinator {
    stores: RwLock<HashMap<String, Arc<LockStore>>>,
    max_wait: Duration,
}

impl LockCoordinator {
    /// Create a coordinator with the given lock policy
    pub fn new(config: &LockConfig) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            max_wait: Duration::from_millis(config.max_wait_ms),
        }
    }

    /// Get or create the store for a namespace
    pub async fn store(&self, namespace: &str) -> Arc<LockStore> {
        {
            let stores = self.stores.read().await;
            if let Some(store) = stores.get(namespace) {
                return Arc::clone(store);
            }
        }
        let mut stores = self.stores.write().await;
        Arc::clone(
            stores
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(LockStore::new(namespace))),
        )
    }

    /// True if the caller could take the lock right now
    pub async fn can_acquire(
        &self,
        namespace: &str,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
    ) -> bool {
        self.store(namespace)
            .await
            .can_acquire(key, caller, thread_id)
            .await
    }

    /// Acquire or park.
    ///
    /// `ttl_ms == 0` means no auto-expiry. `wait_timeout_ms == 0` denies
    /// immediately when contended; a negative or `i64::MAX` wait is
    /// admitted but scheduled at the policy cap and resolves
    /// [`LockReply::WaitInvalid`] if it expires there. Bounded waits
    /// longer than the cap are clamped and expire as ordinary denials.
    pub async fn acquire(
        &self,
        namespace: &str,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
        ttl_ms: u64,
        wait_timeout_ms: i64,
    ) -> AcquireOutcome {
        let store = self.store(namespace).await;
        let ttl = (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms));

        let policy = if wait_timeout_ms == WAIT_NONE {
            WaitPolicy::NoWait
        } else {
            WaitPolicy::Park {
                invalid_on_expire: wait_timeout_ms < 0 || wait_timeout_ms == i64::MAX,
            }
        };

        let (outcome, arm) = store
            .acquire_or_park(key, caller, thread_id, ttl, policy)
            .await;
        if let Some(arm) = arm {
            Self::arm_ttl(Arc::clone(&store), arm);
        }

        if let AcquireOutcome::Parked { waiter_id, .. } = &outcome {
            let wait = if wait_timeout_ms < 0 || wait_timeout_ms == i64::MAX {
                self.max_wait
            } else {
                Duration::from_millis(wait_timeout_ms as u64).min(self.max_wait)
            };
            Self::arm_wait_deadline(store, key.clone(), *waiter_id, Instant::now() + wait);
        }

        outcome
    }

    /// Release one reentrant level. `Ok(true)` means the lock was fully
    /// released (and the next waiter, if any, was promoted).
    pub async fn release(
        &self,
        namespace: &str,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
    ) -> Result<bool> {
        let store = self.store(namespace).await;
        let effect = store.release(key, caller, thread_id).await?;
        if let Some(arm) = effect.arm {
            Self::arm_ttl(store, arm);
        }
        Ok(effect.released)
    }

    /// Reentrant depth currently held for a key
    pub async fn lock_count(&self, namespace: &str, key: &ResourceKey) -> u32 {
        self.store(namespace).await.lock_count(key).await
    }

    /// Apply a primary's lock image on a backup replica (idempotent)
    pub async fn apply_backup_lock(
        &self,
        namespace: &str,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
        count: u32,
        ttl_ms: u64,
    ) {
        let store = self.store(namespace).await;
        let ttl = (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms));
        if let Some(arm) = store.apply_backup(key, caller, thread_id, count, ttl).await {
            Self::arm_ttl(store, arm);
        }
    }

    /// Apply a primary's unlock on a backup replica (idempotent)
    pub async fn apply_backup_clear(
        &self,
        namespace: &str,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
    ) {
        self.store(namespace)
            .await
            .clear_backup(key, caller, thread_id)
            .await;
    }

    /// Total live lock records across namespaces
    pub async fn live_records(&self) -> usize {
        let stores = self.stores.read().await;
        let mut total = 0;
        for store in stores.values() {
            total += store.record_count().await;
        }
        total
    }

    /// Drive a TTL deadline; promotion chains re-arm through the loop
    fn arm_ttl(store: Arc<LockStore>, arm: TtlArm) {
        tokio::spawn(async move {
            let mut next = Some(arm);
            while let Some(arm) = next {
                tokio::time::sleep_until(arm.deadline).await;
                next = store.expire_ttl(&arm.key, arm.epoch).await;
            }
        });
    }

    /// Drive a parked waiter's deadline
    fn arm_wait_deadline(
        store: Arc<LockStore>,
        key: ResourceKey,
        waiter_id: u64,
        deadline: Instant,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            store.expire_waiter(&key, waiter_id).await;
        });
    }
}
