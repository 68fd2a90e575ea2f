//! In-memory tier: an LRU map with per-entry cost and the same limit triple
//! (cost, count, age) as the disk tier. All operations are synchronous and
//! lock a single mutex; eviction pops from the LRU tail.

use std::borrow::Borrow;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::model::CacheLimits;

struct Entry<V> {
    value: V,
    cost: u64,
    stored_at: Instant,
}

struct Inner<K: Hash + Eq, V> {
    map: LruCache<K, Entry<V>>,
    total_cost: u64,
    limits: CacheLimits,
}

/// Bounded in-memory LRU cache.
pub struct MemoryCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K: Hash + Eq + Clone, V> MemoryCache<K, V> {
    #[must_use]
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: LruCache::unbounded(),
                total_cost: 0,
                limits,
            }),
        }
    }

    /// Insert with a zero cost. Entries inserted this way only count against
    /// the count and age limits.
    pub fn set(&self, key: K, value: V) {
        self.set_with_cost(key, value, 0);
    }

    /// Insert with an explicit cost and enforce the count/cost limits.
    pub fn set_with_cost(&self, key: K, value: V, cost: u64) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let entry = Entry {
            value,
            cost,
            stored_at: Instant::now(),
        };
        if let Some(previous) = inner.map.put(key, entry) {
            inner.total_cost = inner.total_cost.saturating_sub(previous.cost);
        }
        inner.total_cost += cost;
        evict_to_limits(inner);
    }

    /// Fetch a clone of the value and promote the entry to most recently
    /// used. An entry past the age limit is removed and reported as a miss.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let expired = {
            let entry = inner.map.get(key)?;
            is_expired(entry, inner.limits.age)
        };
        if expired {
            if let Some(entry) = inner.map.pop(key) {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
            }
            return None;
        }
        inner.map.get(key).map(|entry| entry.value.clone())
    }

    /// Presence check without promoting the entry.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.lock();
        guard
            .map
            .peek(key)
            .is_some_and(|entry| !is_expired(entry, guard.limits.age))
    }

    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(entry) = inner.map.pop(key) {
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }

    pub fn clear(&self) {
        let mut guard = self.lock();
        guard.map.clear();
        guard.total_cost = 0;
    }

    #[must_use]
    pub fn total_cost(&self) -> u64 {
        self.lock().total_cost
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.lock().map.len()
    }

    /// Evict from the LRU tail until total cost is at most `max`.
    pub fn trim_to_cost(&self, max: u64) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        while inner.total_cost > max {
            let Some((_, entry)) = inner.map.pop_lru() else {
                break;
            };
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }

    /// Evict from the LRU tail until at most `max` entries remain.
    pub fn trim_to_count(&self, max: usize) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        while inner.map.len() > max {
            let Some((_, entry)) = inner.map.pop_lru() else {
                break;
            };
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }

    /// Remove every entry stored longer ago than `age`.
    pub fn trim_to_age(&self, age: Duration) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let stale: Vec<K> = inner
            .map
            .iter()
            .filter(|(_, entry)| entry.stored_at.elapsed() > age)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(entry) = inner.map.pop(&key) {
                inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn is_expired<V>(entry: &Entry<V>, age_limit: Option<Duration>) -> bool {
    age_limit.is_some_and(|age| entry.stored_at.elapsed() > age)
}

fn evict_to_limits<K: Hash + Eq, V>(inner: &mut Inner<K, V>) {
    if let Some(count) = inner.limits.count {
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        while inner.map.len() > count {
            let Some((_, entry)) = inner.map.pop_lru() else {
                break;
            };
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }
    if let Some(cost) = inner.limits.cost {
        while inner.total_cost > cost {
            let Some((_, entry)) = inner.map.pop_lru() else {
                break;
            };
            inner.total_cost = inner.total_cost.saturating_sub(entry.cost);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread::sleep;
    use std::time::Duration;

    use super::MemoryCache;
    use crate::model::CacheLimits;

    #[test]
    fn count_limit_evicts_least_recently_used() {
        let cache: MemoryCache<String, i32> = MemoryCache::new(CacheLimits::default().with_count(2));
        cache.set("a".into(), 1);
        cache.set("b".into(), 2);
        // Touch "a" so "b" becomes the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c".into(), 3);
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn cost_accounting_tracks_replacements_and_removals() {
        let cache: MemoryCache<String, Vec<u8>> = MemoryCache::new(CacheLimits::default());
        cache.set_with_cost("a".into(), vec![0; 8], 8);
        cache.set_with_cost("b".into(), vec![0; 4], 4);
        assert_eq!(cache.total_cost(), 12);
        cache.set_with_cost("a".into(), vec![0; 2], 2);
        assert_eq!(cache.total_cost(), 6);
        cache.remove("b");
        assert_eq!(cache.total_cost(), 2);
        cache.clear();
        assert_eq!(cache.total_cost(), 0);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn cost_limit_evicts_until_under_budget() {
        let cache: MemoryCache<String, ()> = MemoryCache::new(CacheLimits::default().with_cost(10));
        cache.set_with_cost("a".into(), (), 6);
        cache.set_with_cost("b".into(), (), 6);
        // "a" is the LRU tail and must go to fit the budget.
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert_eq!(cache.total_cost(), 6);
    }

    #[test]
    fn age_limit_expires_entries_on_read() {
        let cache: MemoryCache<String, i32> =
            MemoryCache::new(CacheLimits::default().with_age(Duration::from_millis(20)));
        cache.set("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        sleep(Duration::from_millis(40));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.total_count(), 0);
    }

    #[test]
    fn trim_to_age_sweeps_stale_entries() {
        let cache: MemoryCache<String, i32> = MemoryCache::new(CacheLimits::default());
        cache.set("old".into(), 1);
        sleep(Duration::from_millis(40));
        cache.set("new".into(), 2);
        cache.trim_to_age(Duration::from_millis(20));
        assert!(!cache.contains("old"));
        assert!(cache.contains("new"));
    }
}
