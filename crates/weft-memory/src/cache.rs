//! Bounded record cache with LRU eviction and a time-to-live

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use weft_core::MemoryRecord;

struct CacheEntry {
    record: MemoryRecord,
    inserted_at: Instant,
}

/// In-process cache of recently written or read records
///
/// `order` holds ids from least to most recently used. Only ever touched
/// under the store's state lock.
pub struct RecordCache {
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
    capacity: usize,
    ttl: Duration,
    hits: u64,
    misses: u64,
}

impl RecordCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl,
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (hits, misses) since creation
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Look up a record, refreshing its recency. Expired entries are dropped.
    pub fn get(&mut self, id: &str) -> Option<MemoryRecord> {
        let expired = match self.entries.get(id) {
            Some(entry) => entry.inserted_at.elapsed() > self.ttl,
            None => {
                self.misses += 1;
                return None;
            }
        };

        if expired {
            self.remove(id);
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        self.touch(id);
        self.entries.get(id).map(|entry| entry.record.clone())
    }

    pub fn put(&mut self, record: MemoryRecord) {
        let id = record.id.clone();
        self.entries.insert(
            id.clone(),
            CacheEntry {
                record,
                inserted_at: Instant::now(),
            },
        );
        self.touch(&id);
        self.evict_if_needed();
    }

    pub fn remove(&mut self, id: &str) -> Option<MemoryRecord> {
        let removed = self.entries.remove(id)?;
        self.remove_from_order(id);
        Some(removed.record)
    }

    /// Drop every expired entry
    pub fn purge_expired(&mut self) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
        before - self.entries.len()
    }

    fn touch(&mut self, id: &str) {
        self.remove_from_order(id);
        self.order.push_back(id.to_string());
    }

    fn remove_from_order(&mut self, id: &str) {
        if let Some(pos) = self.order.iter().position(|existing| existing == id) {
            self.order.remove(pos);
        }
    }

    fn evict_if_needed(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(n: u32) -> MemoryRecord {
        MemoryRecord::episodic("test", json!({ "n": n }))
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = RecordCache::new(2, Duration::from_secs(60));
        let a = record(1);
        let b = record(2);
        let c = record(3);

        cache.put(a.clone());
        cache.put(b.clone());
        // a becomes most recent, b is evicted next
        assert!(cache.get(&a.id).is_some());
        cache.put(c.clone());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&b.id).is_none());
        assert!(cache.get(&a.id).is_some());
        assert!(cache.get(&c.id).is_some());
    }

    #[test]
    fn test_expired_entries_miss() {
        let mut cache = RecordCache::new(4, Duration::from_millis(10));
        let a = record(1);
        cache.put(a.clone());
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get(&a.id).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.hit_stats(), (0, 1));
    }

    #[test]
    fn test_purge_expired() {
        let mut cache = RecordCache::new(4, Duration::from_millis(10));
        cache.put(record(1));
        cache.put(record(2));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.purge_expired(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_reinsert_does_not_grow() {
        let mut cache = RecordCache::new(2, Duration::from_secs(60));
        let a = record(1);
        cache.put(a.clone());
        cache.put(a.clone());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.remove(&a.id).map(|r| r.id), Some(a.id));
    }
}
