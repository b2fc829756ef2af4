use crate::cluster::{CacheStore, PartitionId};
use crate::error::StoreError;
use ahash::AHashSet;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory partition storage for one simulated node.
///
/// Until [`set_owned`](Self::set_owned) is called the store owns every
/// partition.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<HashMap<Bytes, (PartitionId, Bytes)>>,
    owned: RwLock<Option<AHashSet<PartitionId>>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_owned(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        *self.owned.write() = Some(partitions.into_iter().collect());
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.read().get(key).map(|(_, v)| v.clone())
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Successful puts and removes so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Makes every write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub(crate) fn partition_entries(&self, partition: PartitionId) -> Vec<(Bytes, Bytes)> {
        self.data
            .read()
            .iter()
            .filter(|(_, (p, _))| *p == partition)
            .map(|(k, (_, v))| (k.clone(), v.clone()))
            .collect()
    }

    /// Copies migrated entries in without overwriting newer ones.
    pub(crate) fn import(&self, partition: PartitionId, entries: Vec<(Bytes, Bytes)>) {
        let mut data = self.data.write();
        for (key, value) in entries {
            data.entry(key).or_insert((partition, value));
        }
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(StoreError::Failed("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl CacheStore for MemoryStore {
    fn owns_partition(&self, partition: PartitionId) -> bool {
        match &*self.owned.read() {
            Some(owned) => owned.contains(&partition),
            None => true,
        }
    }

    fn put_if_absent(
        &self,
        partition: PartitionId,
        key: &Bytes,
        value: &Bytes,
        _skip_store: bool,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let mut data = self.data.write();
        if data.contains_key(key) {
            return Ok(false);
        }
        data.insert(key.clone(), (partition, value.clone()));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn put(
        &self,
        partition: PartitionId,
        key: &Bytes,
        value: &Bytes,
        _skip_store: bool,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        self.data
            .write()
            .insert(key.clone(), (partition, value.clone()));
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn remove(
        &self,
        _partition: PartitionId,
        key: &Bytes,
        _skip_store: bool,
    ) -> Result<bool, StoreError> {
        self.check_writable()?;
        let removed = self.data.write().remove(key).is_some();
        if removed {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }
}
