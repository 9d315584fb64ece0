//! In-memory read cache for conversation records.
//!
//! A small fixed-capacity LRU keyed by `(space_id, conversation_id)`.
//! The store writes through on every mutation, so a cached record is
//! always as fresh as the file behind it within this process.

use parley_core::conversation::Conversation;
use std::collections::VecDeque;

/// Cache key: `(space_id, conversation_id)`.
pub type CacheKey = (String, String);

/// Least-recently-used conversation cache.
///
/// Capacity is small by design. Conversations are read whole and the hot
/// set is the handful the user has open, so anything fancier than a
/// scan over a deque is wasted machinery.
pub struct LruCache {
    capacity: usize,
    entries: VecDeque<(CacheKey, Conversation)>,
}

impl LruCache {
    /// Default capacity used by the store.
    pub const DEFAULT_CAPACITY: usize = 8;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Returns a clone of the cached record and marks it most recent.
    pub fn get(&mut self, key: &CacheKey) -> Option<Conversation> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        let entry = self.entries.remove(pos)?;
        let conversation = entry.1.clone();
        self.entries.push_front(entry);
        Some(conversation)
    }

    /// Inserts or replaces a record as most recent, evicting the oldest
    /// entry when over capacity.
    pub fn put(&mut self, key: CacheKey, conversation: Conversation) {
        self.entries.retain(|(k, _)| k != &key);
        self.entries.push_front((key, conversation));
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
    }

    /// Drops a record from the cache.
    pub fn remove(&mut self, key: &CacheKey) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> CacheKey {
        ("space".to_string(), id.to_string())
    }

    fn conv(id: &str) -> Conversation {
        let mut c = Conversation::new("space", None);
        c.id = id.to_string();
        c
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put(key("a"), conv("a"));
        cache.put(key("b"), conv("b"));

        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.get(&key("a")).is_some());

        cache.put(key("c"), conv("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_put_replaces_existing_entry() {
        let mut cache = LruCache::new(2);
        cache.put(key("a"), conv("a"));

        let mut updated = conv("a");
        updated.title = "renamed".to_string();
        cache.put(key("a"), updated);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("a")).unwrap().title, "renamed");
    }

    #[test]
    fn test_remove() {
        let mut cache = LruCache::new(2);
        cache.put(key("a"), conv("a"));
        cache.remove(&key("a"));
        assert!(cache.is_empty());
        assert!(cache.get(&key("a")).is_none());
    }
}
