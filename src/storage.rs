//! Partition-Local Storage
//!
//! In-memory key/value state for the partitions a member owns or backs
//! up. Mutation is serialized per partition, which subsumes the per-key
//! serialization guarantee: no two state-changing operations touch the
//! same key concurrently.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::codec::ResourceKey;
use crate::routing::PartitionId;

type PartitionMap = HashMap<(String, ResourceKey), Bytes>;

/// Partition-local in-memory store
pub struct PartitionStore {
    partitions: Vec<Mutex<PartitionMap>>,
}

impl PartitionStore {
    /// Create a store covering `partition_count` partitions
    pub fn new(partition_count: u32) -> Self {
        let partitions = (0..partition_count)
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { partitions }
    }

    /// Total number of partitions
    pub fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn partition(&self, partition_id: PartitionId) -> &Mutex<PartitionMap> {
        &self.partitions[partition_id as usize % self.partitions.len()]
    }

    /// Store a value, returning the previous one
    pub async fn put(
        &self,
        partition_id: PartitionId,
        map: &str,
        key: &ResourceKey,
        value: Bytes,
    ) -> Option<Bytes> {
        let mut partition = self.partition(partition_id).lock().await;
        partition.insert((map.to_string(), key.clone()), value)
    }

    /// Read a value
    pub async fn get(
        &self,
        partition_id: PartitionId,
        map: &str,
        key: &ResourceKey,
    ) -> Option<Bytes> {
        let partition = self.partition(partition_id).lock().await;
        partition.get(&(map.to_string(), key.clone())).cloned()
    }

    /// Remove a value, returning it
    pub async fn remove(
        &self,
        partition_id: PartitionId,
        map: &str,
        key: &ResourceKey,
    ) -> Option<Bytes> {
        let mut partition = self.partition(partition_id).lock().await;
        partition.remove(&(map.to_string(), key.clone()))
    }

    /// Number of entries held for a partition
    pub async fn partition_len(&self, partition_id: PartitionId) -> usize {
        self.partition(partition_id).lock().await.len()
    }

    /// Total entries across all partitions
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for partition in &self.partitions {
            total += partition.lock().await.len();
        }
        total
    }

    /// True if no partition holds any entry
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = PartitionStore::new(16);
        let k = key("users/1");

        let prev = store.put(3, "users", &k, Bytes::from_static(b"ada")).await;
        assert!(prev.is_none());

        let prev = store.put(3, "users", &k, Bytes::from_static(b"grace")).await;
        assert_eq!(prev, Some(Bytes::from_static(b"ada")));

        assert_eq!(
            store.get(3, "users", &k).await,
            Some(Bytes::from_static(b"grace"))
        );

        let removed = store.remove(3, "users", &k).await;
        assert_eq!(removed, Some(Bytes::from_static(b"grace")));
        assert!(store.get(3, "users", &k).await.is_none());
    }

    #[tokio::test]
    async fn test_maps_are_disjoint() {
        let store = PartitionStore::new(4);
        let k = key("id-9");

        store.put(1, "left", &k, Bytes::from_static(b"a")).await;
        store.put(1, "right", &k, Bytes::from_static(b"b")).await;

        assert_eq!(store.get(1, "left", &k).await, Some(Bytes::from_static(b"a")));
        assert_eq!(
            store.get(1, "right", &k).await,
            Some(Bytes::from_static(b"b"))
        );
        assert_eq!(store.partition_len(1).await, 2);
    }
}
