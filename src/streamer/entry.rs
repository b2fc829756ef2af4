use crate::cluster::PartitionId;
use ahash::AHashSet;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A key with an optional value. No value means removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamerEntry {
    pub key: Bytes,
    pub value: Option<Bytes>,
    /// Resolved by routing.
    pub partition: Option<PartitionId>,
}

impl StreamerEntry {
    pub fn put(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        StreamerEntry {
            key: key.into(),
            value: Some(value.into()),
            partition: None,
        }
    }

    pub fn remove(key: impl Into<Bytes>) -> Self {
        StreamerEntry {
            key: key.into(),
            value: None,
            partition: None,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.value.is_none()
    }

    pub(crate) fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }
}

/// Keys of one load that no node has acknowledged yet.
///
/// An entry routed to several owners counts as done on the first
/// acknowledgment; the load resolves when the set drains.
#[derive(Debug, Default)]
pub(crate) struct PendingKeys {
    keys: Mutex<AHashSet<Bytes>>,
}

impl PendingKeys {
    pub(crate) fn new(entries: &[StreamerEntry]) -> Self {
        PendingKeys {
            keys: Mutex::new(entries.iter().map(|e| e.key.clone()).collect()),
        }
    }

    /// Removes acknowledged keys. Returns true on the call that drains the set.
    pub(crate) fn acknowledge(&self, entries: &[StreamerEntry]) -> bool {
        let mut keys = self.keys.lock();
        if keys.is_empty() {
            return false;
        }
        for entry in entries {
            keys.remove(&entry.key);
        }
        keys.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_keys_drain_once() {
        let entries = vec![
            StreamerEntry::put("a", "1"),
            StreamerEntry::put("b", "2"),
            StreamerEntry::remove("c"),
        ];
        let pending = PendingKeys::new(&entries);
        assert_eq!(pending.len(), 3);

        assert!(!pending.acknowledge(&entries[..1]));
        // A second owner acknowledging the same key changes nothing
        assert!(!pending.acknowledge(&entries[..1]));
        assert!(pending.acknowledge(&entries[1..]));
        // Already drained
        assert!(!pending.acknowledge(&entries));
    }

    #[test]
    fn test_entry_kinds() {
        assert!(!StreamerEntry::put("k", "v").is_removal());
        assert!(StreamerEntry::remove("k").is_removal());
        assert_eq!(StreamerEntry::remove("k").with_partition(3).partition, Some(3));
    }
}
