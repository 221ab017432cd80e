//! Per-Key Lock Records
//!
//! One [`LockStore`] serializes lock state for a single namespace. Each
//! record tracks the reentrant holder, an optional TTL deadline, and a
//! FIFO queue of parked acquire attempts. Records are created lazily on
//! first acquire and evicted once unlocked with an empty queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

use crate::codec::ResourceKey;
use crate::error::{Error, Result};

/// Reply delivered to a parked acquire attempt when it is woken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReply {
    /// The lock was granted to the waiter
    Granted,
    /// The wait deadline elapsed before the lock became available
    Denied,
    /// An unbounded wait expired at the policy cap; terminal for the caller
    WaitInvalid,
}

/// Outcome of an acquire attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    /// Granted immediately; `count` is the new reentrant depth
    Granted { count: u32 },
    /// Not acquirable and the caller asked not to wait
    Denied,
    /// Parked in the wait queue; the receiver resolves on grant or expiry
    Parked {
        waiter_id: u64,
        receiver: oneshot::Receiver<LockReply>,
    },
}

/// How an acquire attempt behaves when the lock is contended
#[derive(Debug, Clone, Copy)]
pub enum WaitPolicy {
    /// Deny immediately
    NoWait,
    /// Park until the wait deadline; `invalid_on_expire` marks waits whose
    /// requested timeout was unbounded and therefore must not expire as an
    /// ordinary denial
    Park { invalid_on_expire: bool },
}

/// A pending TTL deadline the async layer must arm a timer for
#[derive(Debug)]
pub struct TtlArm {
    pub key: ResourceKey,
    pub epoch: u64,
    pub deadline: Instant,
}

/// Effect of a release: whether the lock was fully released, and a TTL
/// timer to arm if a promoted waiter requested one
#[derive(Debug)]
pub struct ReleaseEffect {
    pub released: bool,
    pub arm: Option<TtlArm>,
}

struct Holder {
    caller: Uuid,
    thread_id: u64,
    count: u32,
    ttl_deadline: Option<Instant>,
}

struct Waiter {
    id: u64,
    caller: Uuid,
    thread_id: u64,
    /// TTL to arm if this waiter is eventually granted
    ttl: Option<Duration>,
    invalid_on_expire: bool,
    reply: oneshot::Sender<LockReply>,
}

struct LockRecord {
    holder: Option<Holder>,
    /// Bumped on every holder transition; lets TTL timers detect that the
    /// state they were armed against is gone
    epoch: u64,
    waiters: VecDeque<Waiter>,
}

impl LockRecord {
    fn empty() -> Self {
        Self {
            holder: None,
            epoch: 0,
            waiters: VecDeque::new(),
        }
    }

    fn is_evictable(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

/// Lock state for one namespace
pub struct LockStore {
    namespace: String,
    locks: Mutex<HashMap<ResourceKey, LockRecord>>,
    /// Store-wide epoch source; never reused across record incarnations
    epoch_seq: AtomicU64,
    waiter_seq: AtomicU64,
}

impl LockStore {
    /// Create a lock store for a namespace
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            locks: Mutex::new(HashMap::new()),
            epoch_seq: AtomicU64::new(1),
            waiter_seq: AtomicU64::new(1),
        }
    }

    /// The namespace this store serializes
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn next_epoch(&self) -> u64 {
        self.epoch_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// True if `caller`/`thread_id` could take the lock right now:
    /// unlocked, held by the same caller and thread, or TTL elapsed.
    pub async fn can_acquire(&self, key: &ResourceKey, caller: Uuid, thread_id: u64) -> bool {
        let locks = self.locks.lock().await;
        match locks.get(key).and_then(|r| r.holder.as_ref()) {
            None => true,
            Some(holder) => {
                (holder.caller == caller && holder.thread_id == thread_id)
                    || holder
                        .ttl_deadline
                        .map(|d| d <= Instant::now())
                        .unwrap_or(false)
            }
        }
    }

    /// Reentrant depth currently held on `key` (0 when unlocked)
    pub async fn lock_count(&self, key: &ResourceKey) -> u32 {
        let locks = self.locks.lock().await;
        locks
            .get(key)
            .and_then(|r| r.holder.as_ref())
            .map(|h| h.count)
            .unwrap_or(0)
    }

    /// Number of live lock records (held or with pending waiters)
    pub async fn record_count(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Attempt acquisition; park per `wait` policy when contended.
    ///
    /// Returns the outcome plus a TTL deadline the caller must arm when
    /// the grant carried one.
    pub async fn acquire_or_park(
        &self,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
        ttl: Option<Duration>,
        wait: WaitPolicy,
    ) -> (AcquireOutcome, Option<TtlArm>) {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        let record = locks.entry(key.clone()).or_insert_with(LockRecord::empty);

        // An elapsed TTL counts as an implicit release
        if let Some(holder) = &record.holder {
            let expired = holder.ttl_deadline.map(|d| d <= now).unwrap_or(false);
            if expired {
                tracing::debug!(
                    "Lock {}/{:?} TTL elapsed, treating as released",
                    self.namespace,
                    key
                );
                record.holder = None;
                record.epoch = self.next_epoch();
            }
        }

        match &mut record.holder {
            None => {
                let ttl_deadline = ttl.map(|d| now + d);
                record.holder = Some(Holder {
                    caller,
                    thread_id,
                    count: 1,
                    ttl_deadline,
                });
                record.epoch = self.next_epoch();
                let arm = ttl_deadline.map(|deadline| TtlArm {
                    key: key.clone(),
                    epoch: record.epoch,
                    deadline,
                });
                (AcquireOutcome::Granted { count: 1 }, arm)
            }
            Some(holder) if holder.caller == caller && holder.thread_id == thread_id => {
                // Reentrant acquire; a fresh TTL re-arms the deadline
                holder.count += 1;
                let count = holder.count;
                let mut arm = None;
                if let Some(d) = ttl {
                    holder.ttl_deadline = Some(now + d);
                    record.epoch = self.next_epoch();
                    arm = Some(TtlArm {
                        key: key.clone(),
                        epoch: record.epoch,
                        deadline: now + d,
                    });
                }
                (AcquireOutcome::Granted { count }, arm)
            }
            Some(_) => match wait {
                WaitPolicy::NoWait => (AcquireOutcome::Denied, None),
                WaitPolicy::Park { invalid_on_expire } => {
                    let (tx, rx) = oneshot::channel();
                    let waiter_id = self.waiter_seq.fetch_add(1, Ordering::Relaxed);
                    record.waiters.push_back(Waiter {
                        id: waiter_id,
                        caller,
                        thread_id,
                        ttl,
                        invalid_on_expire,
                        reply: tx,
                    });
                    (
                        AcquireOutcome::Parked {
                            waiter_id,
                            receiver: rx,
                        },
                        None,
                    )
                }
            },
        }
    }

    /// Release one reentrant level held by `caller`/`thread_id`.
    ///
    /// A release by a non-owner is a protocol bug and reports
    /// [`Error::LockOwnerMismatch`] without touching state.
    pub async fn release(
        &self,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
    ) -> Result<ReleaseEffect> {
        let mut locks = self.locks.lock().await;
        let record = match locks.get_mut(key) {
            Some(r) => r,
            None => {
                return Err(Error::LockOwnerMismatch {
                    namespace: self.namespace.clone(),
                    caller: caller.to_string(),
                })
            }
        };

        let holder = match &mut record.holder {
            Some(h) if h.caller == caller && h.thread_id == thread_id => h,
            _ => {
                return Err(Error::LockOwnerMismatch {
                    namespace: self.namespace.clone(),
                    caller: caller.to_string(),
                })
            }
        };

        holder.count -= 1;
        if holder.count > 0 {
            return Ok(ReleaseEffect {
                released: false,
                arm: None,
            });
        }

        record.holder = None;
        record.epoch = self.next_epoch();
        let arm = self.promote(key, record);
        if record.is_evictable() {
            locks.remove(key);
        }
        Ok(ReleaseEffect {
            released: true,
            arm,
        })
    }

    /// Force-release on TTL expiry. A no-op unless the record still sits at
    /// `epoch` — the explicit release or re-acquire that happened first is
    /// authoritative.
    pub async fn expire_ttl(&self, key: &ResourceKey, epoch: u64) -> Option<TtlArm> {
        let mut locks = self.locks.lock().await;
        let record = locks.get_mut(key)?;
        if record.epoch != epoch || record.holder.is_none() {
            return None;
        }

        tracing::warn!(
            "Lock {}/{:?} force-released on TTL expiry",
            self.namespace,
            key
        );
        record.holder = None;
        record.epoch = self.next_epoch();
        let arm = self.promote(key, record);
        if record.is_evictable() {
            locks.remove(key);
        }
        arm
    }

    /// Deny a parked waiter whose wait deadline elapsed. A no-op if the
    /// waiter was already granted or removed.
    pub async fn expire_waiter(&self, key: &ResourceKey, waiter_id: u64) {
        let mut locks = self.locks.lock().await;
        let record = match locks.get_mut(key) {
            Some(r) => r,
            None => return,
        };

        if let Some(pos) = record.waiters.iter().position(|w| w.id == waiter_id) {
            if let Some(waiter) = record.waiters.remove(pos) {
                let reply = if waiter.invalid_on_expire {
                    LockReply::WaitInvalid
                } else {
                    LockReply::Denied
                };
                let _ = waiter.reply.send(reply);
            }
        }

        if record.is_evictable() {
            locks.remove(key);
        }
    }

    /// Apply a backup image of a held lock: absolute owner, depth and
    /// remaining TTL. Safe to apply more than once.
    pub async fn apply_backup(
        &self,
        key: &ResourceKey,
        caller: Uuid,
        thread_id: u64,
        count: u32,
        ttl: Option<Duration>,
    ) -> Option<TtlArm> {
        let now = Instant::now();
        let mut locks = self.locks.lock().await;
        let record = locks.entry(key.clone()).or_insert_with(LockRecord::empty);

        let ttl_deadline = ttl.map(|d| now + d);
        record.holder = Some(Holder {
            caller,
            thread_id,
            count,
            ttl_deadline,
        });
        record.epoch = self.next_epoch();
        ttl_deadline.map(|deadline| TtlArm {
            key: key.clone(),
            epoch: record.epoch,
            deadline,
        })
    }

    /// Apply a backup clear: drop the record if it is held by
    /// `caller`/`thread_id`, otherwise leave state alone. Idempotent.
    pub async fn clear_backup(&self, key: &ResourceKey, caller: Uuid, thread_id: u64) {
        let mut locks = self.locks.lock().await;
        if let Some(record) = locks.get_mut(key) {
            let matches = record
                .holder
                .as_ref()
                .map(|h| h.caller == caller && h.thread_id == thread_id)
                .unwrap_or(false);
            if matches {
                record.holder = None;
                record.epoch = self.next_epoch();
            }
            if record.is_evictable() {
                locks.remove(key);
            }
        }
    }

    /// Grant to the head of the wait queue, skipping abandoned waiters
    fn promote(&self, key: &ResourceKey, record: &mut LockRecord) -> Option<TtlArm> {
        let now = Instant::now();
        while let Some(waiter) = record.waiters.pop_front() {
            let Waiter {
                caller,
                thread_id,
                ttl,
                reply,
                ..
            } = waiter;
            // A failed send means the waiter abandoned its future; fall
            // through to the next in line
            if reply.send(LockReply::Granted).is_err() {
                continue;
            }
            let ttl_deadline = ttl.map(|d| now + d);
            record.holder = Some(Holder {
                caller,
                thread_id,
                count: 1,
                ttl_deadline,
            });
            record.epoch = self.next_epoch();
            return ttl_deadline.map(|deadline| TtlArm {
                key: key.clone(),
                epoch: record.epoch,
                deadline,
            });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(s: &str) -> ResourceKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        let (outcome, _) = store
            .acquire_or_park(&k, c1, 1, None, WaitPolicy::NoWait)
            .await;
        assert!(matches!(outcome, AcquireOutcome::Granted { count: 1 }));

        // A different caller is denied while c1 holds
        let (outcome, _) = store
            .acquire_or_park(&k, c2, 1, None, WaitPolicy::NoWait)
            .await;
        assert!(matches!(outcome, AcquireOutcome::Denied));
        assert!(!store.can_acquire(&k, c2, 1).await);

        // Same caller, different thread is also denied
        let (outcome, _) = store
            .acquire_or_park(&k, c1, 2, None, WaitPolicy::NoWait)
            .await;
        assert!(matches!(outcome, AcquireOutcome::Denied));
    }

    #[tokio::test]
    async fn test_reentrant_depth() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();

        for expected in 1..=3u32 {
            let (outcome, _) = store
                .acquire_or_park(&k, c1, 7, None, WaitPolicy::NoWait)
                .await;
            match outcome {
                AcquireOutcome::Granted { count } => assert_eq!(count, expected),
                other => panic!("expected grant, got {:?}", other),
            }
        }
        assert_eq!(store.lock_count(&k).await, 3);

        // Release unwinds the depth; the record evicts at zero
        for _ in 0..2 {
            let effect = store.release(&k, c1, 7).await.unwrap();
            assert!(!effect.released);
        }
        let effect = store.release(&k, c1, 7).await.unwrap();
        assert!(effect.released);
        assert_eq!(store.record_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_by_non_owner_rejected() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        store
            .acquire_or_park(&k, c1, 1, None, WaitPolicy::NoWait)
            .await;

        assert!(matches!(
            store.release(&k, c2, 1).await,
            Err(Error::LockOwnerMismatch { .. })
        ));
        // Wrong thread id is also a mismatch
        assert!(matches!(
            store.release(&k, c1, 2).await,
            Err(Error::LockOwnerMismatch { .. })
        ));
        // State untouched
        assert_eq!(store.lock_count(&k).await, 1);
    }

    #[tokio::test]
    async fn test_waiters_granted_fifo() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let holder = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        store
            .acquire_or_park(&k, holder, 1, None, WaitPolicy::NoWait)
            .await;

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                first,
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        let mut rx_first = match outcome {
            AcquireOutcome::Parked { receiver, .. } => receiver,
            other => panic!("expected park, got {:?}", other),
        };

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                second,
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        let mut rx_second = match outcome {
            AcquireOutcome::Parked { receiver, .. } => receiver,
            other => panic!("expected park, got {:?}", other),
        };

        // First release grants the earliest waiter only
        store.release(&k, holder, 1).await.unwrap();
        assert_eq!(rx_first.try_recv().unwrap(), LockReply::Granted);
        assert!(rx_second.try_recv().is_err());

        // Second release moves down the queue
        store.release(&k, first, 1).await.unwrap();
        assert_eq!(rx_second.try_recv().unwrap(), LockReply::Granted);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_skipped() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let holder = Uuid::new_v4();
        let abandoned = Uuid::new_v4();
        let patient = Uuid::new_v4();

        store
            .acquire_or_park(&k, holder, 1, None, WaitPolicy::NoWait)
            .await;

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                abandoned,
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        match outcome {
            AcquireOutcome::Parked { receiver, .. } => drop(receiver),
            other => panic!("expected park, got {:?}", other),
        }

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                patient,
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        let mut rx = match outcome {
            AcquireOutcome::Parked { receiver, .. } => receiver,
            other => panic!("expected park, got {:?}", other),
        };

        store.release(&k, holder, 1).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), LockReply::Granted);
    }

    #[tokio::test]
    async fn test_wait_expiry_replies() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let holder = Uuid::new_v4();

        store
            .acquire_or_park(&k, holder, 1, None, WaitPolicy::NoWait)
            .await;

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                Uuid::new_v4(),
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        let (bounded_id, mut bounded_rx) = match outcome {
            AcquireOutcome::Parked {
                waiter_id,
                receiver,
            } => (waiter_id, receiver),
            other => panic!("expected park, got {:?}", other),
        };

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                Uuid::new_v4(),
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: true,
                },
            )
            .await;
        let (invalid_id, mut invalid_rx) = match outcome {
            AcquireOutcome::Parked {
                waiter_id,
                receiver,
            } => (waiter_id, receiver),
            other => panic!("expected park, got {:?}", other),
        };

        store.expire_waiter(&k, bounded_id).await;
        store.expire_waiter(&k, invalid_id).await;

        assert_eq!(bounded_rx.try_recv().unwrap(), LockReply::Denied);
        assert_eq!(invalid_rx.try_recv().unwrap(), LockReply::WaitInvalid);
    }

    #[tokio::test]
    async fn test_ttl_elapsed_allows_new_acquire() {
        tokio::time::pause();
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        store
            .acquire_or_park(
                &k,
                c1,
                1,
                Some(Duration::from_millis(100)),
                WaitPolicy::NoWait,
            )
            .await;
        assert!(!store.can_acquire(&k, c2, 1).await);

        tokio::time::advance(Duration::from_millis(150)).await;

        // TTL elapsed: implicitly released even without the timer firing
        assert!(store.can_acquire(&k, c2, 1).await);
        let (outcome, _) = store
            .acquire_or_park(&k, c2, 1, None, WaitPolicy::NoWait)
            .await;
        assert!(matches!(outcome, AcquireOutcome::Granted { count: 1 }));
    }

    #[tokio::test]
    async fn test_explicit_release_beats_ttl_expiry() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();
        let c2 = Uuid::new_v4();

        let (_, arm) = store
            .acquire_or_park(
                &k,
                c1,
                1,
                Some(Duration::from_secs(60)),
                WaitPolicy::NoWait,
            )
            .await;
        let arm = arm.expect("ttl must be armed");

        // Explicit release happens first; c2 takes the lock
        store.release(&k, c1, 1).await.unwrap();
        store
            .acquire_or_park(&k, c2, 1, None, WaitPolicy::NoWait)
            .await;

        // The stale expiry is a no-op: c2 still holds
        assert!(store.expire_ttl(&k, arm.epoch).await.is_none());
        assert_eq!(store.lock_count(&k).await, 1);
        assert!(!store.can_acquire(&k, c1, 1).await);
    }

    #[tokio::test]
    async fn test_ttl_expiry_promotes_waiter() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let holder = Uuid::new_v4();
        let waiter = Uuid::new_v4();

        let (_, arm) = store
            .acquire_or_park(
                &k,
                holder,
                1,
                Some(Duration::from_millis(10)),
                WaitPolicy::NoWait,
            )
            .await;
        let arm = arm.expect("ttl must be armed");

        let (outcome, _) = store
            .acquire_or_park(
                &k,
                waiter,
                1,
                None,
                WaitPolicy::Park {
                    invalid_on_expire: false,
                },
            )
            .await;
        let mut rx = match outcome {
            AcquireOutcome::Parked { receiver, .. } => receiver,
            other => panic!("expected park, got {:?}", other),
        };

        store.expire_ttl(&k, arm.epoch).await;
        assert_eq!(rx.try_recv().unwrap(), LockReply::Granted);
        assert!(!store.can_acquire(&k, holder, 1).await);
    }

    #[tokio::test]
    async fn test_backup_apply_idempotent() {
        let store = LockStore::new("default");
        let k = key("resource-a");
        let c1 = Uuid::new_v4();

        store.apply_backup(&k, c1, 5, 3, None).await;
        store.apply_backup(&k, c1, 5, 3, None).await;

        assert_eq!(store.lock_count(&k).await, 3);
        assert!(store.can_acquire(&k, c1, 5).await);

        store.clear_backup(&k, c1, 5).await;
        store.clear_backup(&k, c1, 5).await;
        assert_eq!(store.record_count().await, 0);
    }
}
