//! In-memory [`KeyValueMap`] and [`KeyLongMap`] behind one reader/writer lock.
//!
//! Reads take the read lock and re-check expiry against the injected clock.
//! Writes, compare-and-set and the maintenance sweep take the write lock, so
//! `compare_and_set` on this backend is linearizable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use stackstore_core::{ClockSource, Result};
use tracing::debug;

use crate::storage::backend::Backend;
use crate::storage::key_value::{validate_key, Entry, KeyLongMap, KeyValueMap};

/// Key-value map held in process memory.
pub struct MemoryKeyValueMap<V> {
    name: String,
    entries: RwLock<HashMap<String, Entry<V>>>,
    clock: Arc<dyn ClockSource>,
}

impl<V> MemoryKeyValueMap<V> {
    #[must_use]
    pub fn new(name: impl Into<String>, clock: Arc<dyn ClockSource>) -> Self {
        Self::with_capacity(name, clock, 0)
    }

    /// Pre-sizes the underlying table.
    #[must_use]
    pub fn with_capacity(
        name: impl Into<String>,
        clock: Arc<dyn ClockSource>,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            clock,
        }
    }

    /// Physically stored entries, expired or not.
    #[must_use]
    pub fn stored_len(&self) -> usize {
        self.entries.read().len()
    }
}

impl<V> Backend for MemoryKeyValueMap<V>
where
    V: Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn system_destroy(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn maintenance(&self) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(store = %self.name, removed, "purged expired entries");
        }
        Ok(())
    }
}

impl<V> KeyValueMap<V> for MemoryKeyValueMap<V>
where
    V: Clone + PartialEq + Send + Sync,
{
    fn get_entry(&self, key: &str) -> Result<Option<Entry<V>>> {
        validate_key(key)?;
        let now = self.clock.now();
        Ok(self
            .entries
            .read()
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned())
    }

    fn put(&self, key: &str, value: Option<V>, ttl_ms: u64) -> Result<()> {
        validate_key(key)?;
        let mut entries = self.entries.write();
        match value {
            Some(value) => {
                let entry = Entry::with_ttl(value, ttl_ms, self.clock.now());
                entries.insert(key.to_string(), entry);
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(())
    }

    fn set_expiry(&self, key: &str, expires_at: i64) -> Result<()> {
        validate_key(key)?;
        let now = self.clock.now();
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired(now) {
                entries.remove(key);
            } else {
                entry.expires_at = expires_at;
            }
        }
        Ok(())
    }

    fn keys_with_value(&self, value: Option<&V>) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .filter(|(_, entry)| value.is_none_or(|v| &entry.value == v))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }
}

impl KeyLongMap for MemoryKeyValueMap<i64> {
    fn compare_and_set(&self, key: &str, expect: Option<i64>, update: i64) -> Result<bool> {
        validate_key(key)?;
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let live = entries.get_mut(key).filter(|entry| !entry.is_expired(now));
        match (live, expect) {
            (Some(entry), Some(expected)) if entry.value == expected => {
                entry.value = update;
                Ok(true)
            }
            (None, None) => {
                entries.insert(key.to_string(), Entry::new(update));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use stackstore_core::{ManualClock, StoreError};

    use super::*;

    fn longs(clock: &ManualClock) -> MemoryKeyValueMap<i64> {
        MemoryKeyValueMap::new("counters", Arc::new(clock.clone()))
    }

    #[test]
    fn put_get_remove() {
        let clock = ManualClock::new(1_000);
        let map: MemoryKeyValueMap<String> = MemoryKeyValueMap::new("kv", Arc::new(clock));
        map.put("k", Some("v".to_string()), 0).unwrap();
        assert_eq!(map.get("k").unwrap().as_deref(), Some("v"));
        assert!(map.contains("k").unwrap());

        map.remove("k").unwrap();
        assert_eq!(map.get("k").unwrap(), None);
        map.remove("missing").unwrap();
    }

    #[test]
    fn empty_key_is_rejected_everywhere() {
        let map = longs(&ManualClock::new(0));
        assert!(matches!(map.get(""), Err(StoreError::InvalidKey)));
        assert!(matches!(map.put("", Some(1), 0), Err(StoreError::InvalidKey)));
        assert!(matches!(map.set_expiry("", 5), Err(StoreError::InvalidKey)));
        assert!(matches!(
            map.compare_and_set("", None, 1),
            Err(StoreError::InvalidKey)
        ));
    }

    #[test]
    fn expired_entry_is_absent_before_maintenance() {
        let clock = ManualClock::new(1_000);
        let map = longs(&clock);
        map.put("k", Some(7), 50).unwrap();

        clock.advance(50);
        assert_eq!(map.get("k").unwrap(), None);
        assert!(map.keys_with_value(None).unwrap().is_empty());
        assert_eq!(map.stored_len(), 1, "not yet physically purged");

        map.maintenance().unwrap();
        assert_eq!(map.stored_len(), 0);
    }

    #[test]
    fn set_expiry_on_live_and_missing_keys() {
        let clock = ManualClock::new(1_000);
        let map = longs(&clock);
        map.put("k", Some(1), 0).unwrap();
        map.set_expiry("k", 1_500).unwrap();
        assert_eq!(map.get_entry("k").unwrap().unwrap().expires_at, 1_500);

        map.set_expiry("missing", 1_500).unwrap();
        assert!(!map.contains("missing").unwrap());

        clock.set(1_500);
        assert!(!map.contains("k").unwrap());
        map.set_expiry("k", 0).unwrap();
        assert!(!map.contains("k").unwrap(), "expired entries stay expired");
    }

    #[test]
    fn keys_with_value_filters() {
        let map = longs(&ManualClock::new(0));
        map.put("b", Some(1), 0).unwrap();
        map.put("a", Some(1), 0).unwrap();
        map.put("c", Some(2), 0).unwrap();
        assert_eq!(map.keys_with_value(Some(&1)).unwrap(), vec!["a", "b"]);
        assert_eq!(map.keys_with_value(None).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn compare_and_set_is_sound() {
        let clock = ManualClock::new(0);
        let map = longs(&clock);
        assert!(!map.compare_and_set("k", Some(0), 1).unwrap());
        assert!(map.compare_and_set("k", None, 1).unwrap());
        assert!(!map.compare_and_set("k", None, 2).unwrap());
        assert!(!map.compare_and_set("k", Some(5), 2).unwrap());
        assert_eq!(map.get("k").unwrap(), Some(1));
        assert!(map.compare_and_set("k", Some(1), 2).unwrap());
        assert_eq!(map.get("k").unwrap(), Some(2));
    }

    #[test]
    fn compare_and_set_keeps_expiry_and_treats_expired_as_absent() {
        let clock = ManualClock::new(100);
        let map = longs(&clock);
        map.put("k", Some(1), 100).unwrap();
        assert!(map.compare_and_set("k", Some(1), 2).unwrap());
        assert_eq!(map.get_entry("k").unwrap().unwrap().expires_at, 200);

        clock.set(200);
        assert!(!map.compare_and_set("k", Some(2), 3).unwrap());
        assert!(map.compare_and_set("k", None, 9).unwrap());
        assert_eq!(map.get_entry("k").unwrap().unwrap(), Entry::new(9));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let map = longs(&ManualClock::new(0));
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        map.increment("hits", 1).unwrap();
                    }
                });
            }
        });
        assert_eq!(map.get("hits").unwrap(), Some(2_000));
    }

    proptest! {
        #[test]
        fn ttl_visibility(value in any::<i64>(), start in 0_i64..1_000_000, ttl in 1_u64..10_000, probe in 0_u64..20_000) {
            let clock = ManualClock::new(start);
            let map = longs(&clock);
            map.put("k", Some(value), ttl).unwrap();

            clock.advance(i64::try_from(probe).unwrap());
            let expected = if probe < ttl { Some(value) } else { None };
            prop_assert_eq!(map.get("k").unwrap(), expected);
        }

        #[test]
        fn sequential_cas_with_correct_expect_succeeds(updates in prop::collection::vec(any::<i64>(), 1..20)) {
            let map = longs(&ManualClock::new(0));
            let mut current = None;
            for update in updates {
                prop_assert!(map.compare_and_set("k", current, update).unwrap());
                current = Some(update);
            }
            prop_assert_eq!(map.get("k").unwrap(), current);
        }
    }
}
