//! Number to display-name cache
//!
//! Feedback often carries a remote number before the display name arrives.
//! The cache remembers the last name seen for a number so a record can be
//! filled in as soon as its number is known.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Time source for cache expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
struct CachedName {
    name: String,
    stored_at: Instant,
}

/// Bounded number → name cache with expiry
pub struct NameCache {
    entries: HashMap<String, CachedName>,
    ttl: Duration,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl NameCache {
    /// Create a cache on the wall clock
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self::with_clock(ttl, capacity, Arc::new(SystemClock))
    }

    /// Create a cache on a custom clock
    pub fn with_clock(ttl: Duration, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
            clock,
        }
    }

    fn normalize(number: &str) -> Option<String> {
        let number = number.trim().to_lowercase();
        (!number.is_empty()).then_some(number)
    }

    /// Remember `name` for `number`; the oldest entry goes when full
    pub fn insert(&mut self, number: &str, name: &str) {
        let (Some(number), name) = (Self::normalize(number), name.trim()) else {
            return;
        };
        if name.is_empty() {
            return;
        }

        let now = self.clock.now();
        if !self.entries.contains_key(&number) && self.entries.len() >= self.capacity {
            self.purge_expired(now);
            if self.entries.len() >= self.capacity {
                let oldest = self
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.stored_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    self.entries.remove(&oldest);
                }
            }
        }

        self.entries.insert(
            number,
            CachedName {
                name: name.to_string(),
                stored_at: now,
            },
        );
    }

    /// Last known name for `number`, if not expired
    pub fn get(&mut self, number: &str) -> Option<String> {
        let number = Self::normalize(number)?;
        let now = self.clock.now();
        match self.entries.get(&number) {
            Some(entry) if now.duration_since(entry.stored_at) < self.ttl => Some(entry.name.clone()),
            Some(_) => {
                self.entries.remove(&number);
                None
            }
            None => None,
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.duration_since(e.stored_at) < ttl);
    }

    /// Number of cached entries, expired ones included
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

impl std::fmt::Debug for NameCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCache")
            .field("entries", &self.entries.len())
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64, capacity: usize) -> (NameCache, ManualClock) {
        let clock = ManualClock::new();
        let cache = NameCache::with_clock(
            Duration::from_secs(ttl_secs),
            capacity,
            Arc::new(clock.clone()),
        );
        (cache, clock)
    }

    #[test]
    fn test_lookup_normalizes_number() {
        let (mut cache, _) = cache(60, 8);
        cache.insert(" SIP:Alice@Example.com ", "Alice");
        assert_eq!(cache.get("sip:alice@example.com"), Some("Alice".to_string()));
        assert_eq!(cache.get("bob"), None);
    }

    #[test]
    fn test_blank_values_ignored() {
        let (mut cache, _) = cache(60, 8);
        cache.insert("", "Nobody");
        cache.insert("1234", "  ");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let (mut cache, clock) = cache(60, 8);
        cache.insert("1234", "Alice");

        clock.advance(Duration::from_secs(59));
        assert_eq!(cache.get("1234"), Some("Alice".to_string()));

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get("1234"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (mut cache, clock) = cache(600, 2);
        cache.insert("1", "One");
        clock.advance(Duration::from_secs(1));
        cache.insert("2", "Two");
        clock.advance(Duration::from_secs(1));
        cache.insert("3", "Three");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("1"), None);
        assert_eq!(cache.get("2"), Some("Two".to_string()));
        assert_eq!(cache.get("3"), Some("Three".to_string()));
    }

    #[test]
    fn test_update_existing_does_not_evict() {
        let (mut cache, _) = cache(600, 2);
        cache.insert("1", "One");
        cache.insert("2", "Two");
        cache.insert("2", "Deux");
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("1"), Some("One".to_string()));
        assert_eq!(cache.get("2"), Some("Deux".to_string()));
    }
}
