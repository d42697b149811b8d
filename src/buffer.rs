use std::collections::VecDeque;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// A fixed-capacity window of recent items, newest first.
///
/// Items are inserted at the front via [`RecentBuffer::push_front`]; once the buffer holds more
/// than `capacity` items the oldest ones are evicted from the back.
#[derive(Debug, Clone)]
pub struct RecentBuffer<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> RecentBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Prepends `item` and returns how many entries were evicted to stay within capacity.
    pub fn push_front(&mut self, item: T) -> usize {
        self.entries.push_front(item);
        let evicted = self.entries.len().saturating_sub(self.capacity);
        self.entries.truncate(self.capacity);
        evicted
    }

    pub fn contains_by(&self, mut predicate: impl FnMut(&T) -> bool) -> bool {
        self.entries.iter().any(|entry| predicate(entry))
    }

    /// The most recently inserted item.
    pub fn newest(&self) -> Option<&T> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> RecentBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

/// Set of already-processed identifiers with a bound on how many are remembered.
///
/// When the bound is reached the identifier inserted first is forgotten. Lookups never
/// promote, so eviction follows insertion order.
#[derive(Debug)]
pub struct SeenSet<K: Hash + Eq> {
    keys: LruCache<K, ()>,
}

impl<K: Hash + Eq> SeenSet<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            keys: LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)),
        }
    }

    /// Records `key`, returning `false` if it had already been seen.
    pub fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            return false;
        }
        self.keys.put(key, ());
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn clear(&mut self) {
        self.keys.clear();
    }
}

/// Rolling diagnostic log that keeps the last `limit` entries, oldest first.
#[derive(Debug, Clone)]
pub struct RollingLog {
    limit: usize,
    entries: VecDeque<String>,
}

impl RollingLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: VecDeque::with_capacity(limit),
        }
    }

    pub fn push(&mut self, entry: impl Into<String>) {
        if self.limit == 0 {
            return;
        }
        if self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_front_evicts_oldest() {
        let mut buf = RecentBuffer::new(3);
        assert_eq!(buf.push_front(1), 0);
        assert_eq!(buf.push_front(2), 0);
        assert_eq!(buf.push_front(3), 0);
        assert_eq!(buf.push_front(4), 1);

        assert_eq!(buf.to_vec(), vec![4, 3, 2]);
        assert_eq!(buf.newest(), Some(&4));
        assert!(!buf.contains_by(|v| *v == 1));
    }

    #[test]
    fn zero_capacity_buffer_stays_empty() {
        let mut buf = RecentBuffer::new(0);
        assert_eq!(buf.push_front("a"), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn seen_set_rejects_repeats() {
        let mut seen = SeenSet::new(4);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.contains(&"a"));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn seen_set_forgets_oldest_at_capacity() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert(1));
        assert!(seen.insert(2));
        assert!(seen.insert(3));

        assert!(!seen.contains(&1));
        assert!(seen.contains(&2));
        assert!(seen.contains(&3));
        assert_eq!(seen.len(), 2);

        seen.clear();
        assert!(seen.is_empty());
        assert!(seen.insert(2));
    }

    #[test]
    fn seen_set_lookups_do_not_refresh_age() {
        let mut seen = SeenSet::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));

        // a repeat of the oldest key must not save it from eviction
        assert!(!seen.insert("a"));
        assert!(seen.contains(&"a"));
        assert!(seen.insert("c"));

        assert!(!seen.contains(&"a"));
        assert!(seen.contains(&"b"));
        assert!(seen.contains(&"c"));
    }

    #[test]
    fn rolling_log_keeps_last_entries() {
        let mut log = RollingLog::new(5);
        for i in 0..8 {
            log.push(format!("error {i}"));
        }
        assert_eq!(
            log.entries(),
            vec!["error 3", "error 4", "error 5", "error 6", "error 7"]
        );

        log.clear();
        assert!(log.is_empty());
    }
}
