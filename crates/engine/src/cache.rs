use std::collections::BTreeSet;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use draftq_storage::EntryData;

const BROADCAST_CAPACITY: usize = 256;

/// The live normalized cache the UI reads from.
pub trait RecordCache: Send + Sync {
    fn put(&self, key: &str, data: EntryData);

    fn get(&self, key: &str) -> Option<EntryData>;

    fn evict(&self, key: &str);

    /// Publish every key touched since the previous broadcast.
    fn broadcast(&self) -> usize;
}

pub struct InMemoryCache {
    entries: DashMap<String, EntryData>,
    dirty: Mutex<BTreeSet<String>>,
    tx: broadcast::Sender<Vec<String>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            entries: DashMap::new(),
            dirty: Mutex::new(BTreeSet::new()),
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordCache for InMemoryCache {
    fn put(&self, key: &str, data: EntryData) {
        self.entries.insert(key.to_string(), data);
        self.dirty.lock().insert(key.to_string());
    }

    fn get(&self, key: &str) -> Option<EntryData> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    fn evict(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty.lock().insert(key.to_string());
        }
    }

    fn broadcast(&self) -> usize {
        let keys: Vec<String> = std::mem::take(&mut *self.dirty.lock()).into_iter().collect();
        let count = keys.len();
        if count > 0 {
            let _ = self.tx.send(keys);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use draftq_core::FieldValueRepresentation;

    #[test]
    fn broadcast_reports_dirty_keys_once() {
        let cache = InMemoryCache::new();
        let mut rx = cache.subscribe();
        cache.put("b", EntryData::Field(FieldValueRepresentation::plain("x")));
        cache.put("a", EntryData::Field(FieldValueRepresentation::plain("y")));
        cache.evict("missing");

        assert_eq!(cache.broadcast(), 2);
        assert_eq!(rx.try_recv().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cache.broadcast(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn evict_removes() {
        let cache = InMemoryCache::new();
        cache.put("a", EntryData::Field(FieldValueRepresentation::plain(1i64)));
        assert!(cache.get("a").is_some());
        cache.evict("a");
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }
}
