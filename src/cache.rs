//! Keyed memoization with a fixed wall-clock time-to-live.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Local, TimeDelta};

struct Entry<V> {
    value: V,
    /// `None` when the TTL overflows the calendar: never expires.
    expires_at: Option<DateTime<Local>>,
}

/// key -> (value, expiry). Entries expire on their own schedule; there is no
/// explicit invalidation.
pub struct TtlCache<K, V> {
    ttl: TimeDelta,
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            entries: HashMap::new(),
        }
    }

    /// Returns the cached value when it has not yet expired at `now`.
    pub fn get(&mut self, key: &K, now: DateTime<Local>) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at.map_or(true, |at| now < at) => {
                return Some(entry.value.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Stores `value` and drops every entry already expired at `now`, so keys
    /// that are never read again do not pile up.
    pub fn insert(&mut self, key: K, value: V, now: DateTime<Local>) {
        self.entries
            .retain(|_, entry| entry.expires_at.map_or(true, |at| now < at));
        let expires_at = now.checked_add_signed(self.ttl);
        self.entries.insert(key, Entry { value, expires_at });
    }

    /// Serves from cache or runs `load`; only successful loads are cached.
    pub fn get_or_try_insert<E, F>(&mut self, key: K, now: DateTime<Local>, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.get(&key, now) {
            return Ok(value);
        }
        let value = load()?;
        self.insert(key, value.clone(), now);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
