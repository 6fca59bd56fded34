//! Key-value and key-long contracts with TTL and compare-and-set.
//!
//! Expiry is re-validated on every read: an entry whose `expires_at` is
//! non-zero and not after "now" behaves as absent whether or not
//! [`Backend::maintenance`] has purged it yet.

use stackstore_core::{Result, StoreError};

use super::backend::Backend;

/// A stored value with its absolute expiry (epoch ms, 0 = never).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry<V> {
    pub value: V,
    pub expires_at: i64,
}

impl<V> Entry<V> {
    /// Entry that never expires.
    pub fn new(value: V) -> Self {
        Self {
            value,
            expires_at: 0,
        }
    }

    /// Entry expiring `ttl_ms` after `now` (`ttl_ms == 0` never expires).
    pub fn with_ttl(value: V, ttl_ms: u64, now: i64) -> Self {
        Self {
            value,
            expires_at: expiry_from_ttl(ttl_ms, now),
        }
    }

    /// Whether the entry must be treated as absent at `now`.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at != 0 && self.expires_at <= now
    }
}

/// Absolute expiry for a relative TTL. 0 means "never".
#[must_use]
pub fn expiry_from_ttl(ttl_ms: u64, now: i64) -> i64 {
    if ttl_ms == 0 {
        0
    } else {
        now.saturating_add(i64::try_from(ttl_ms).unwrap_or(i64::MAX))
    }
}

/// Rejects empty keys.
///
/// # Errors
///
/// Returns [`StoreError::InvalidKey`] for an empty key.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        Err(StoreError::InvalidKey)
    } else {
        Ok(())
    }
}

/// Single-value map with per-entry expiry.
///
/// Every method rejects an empty key with [`StoreError::InvalidKey`]; a
/// merely missing key is never an error.
pub trait KeyValueMap<V>: Backend
where
    V: Clone + PartialEq + Send + Sync,
{
    /// Value and expiry for a live entry.
    fn get_entry(&self, key: &str) -> Result<Option<Entry<V>>>;

    /// Value for a live entry.
    fn get(&self, key: &str) -> Result<Option<V>> {
        Ok(self.get_entry(key)?.map(|e| e.value))
    }

    /// Whether a live entry exists.
    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get_entry(key)?.is_some())
    }

    /// Stores `value` for `ttl_ms` milliseconds (0 = forever).
    /// `None` deletes the entry.
    fn put(&self, key: &str, value: Option<V>, ttl_ms: u64) -> Result<()>;

    /// Deletes the entry. Equivalent to `put(key, None, 0)`.
    fn remove(&self, key: &str) -> Result<()> {
        self.put(key, None, 0)
    }

    /// Sets an absolute expiry (epoch ms, 0 = never) on a live entry.
    /// No-op when the key is absent.
    fn set_expiry(&self, key: &str, expires_at: i64) -> Result<()>;

    /// Every live key, optionally only those currently holding `value`.
    ///
    /// Unbounded: enumerates the whole map.
    fn keys_with_value(&self, value: Option<&V>) -> Result<Vec<String>>;
}

/// Key -> integer map adding compare-and-set.
pub trait KeyLongMap: KeyValueMap<i64> {
    /// Sets `key` to `update` if it currently holds `expect`
    /// (`None` = absent or expired).
    ///
    /// Never reports success when the stored value differs from `expect`.
    /// May report failure under contention even when it matched, so callers
    /// must retry; the strength of this guarantee is backend-defined. On
    /// success an existing entry keeps its expiry and a new one never
    /// expires.
    fn compare_and_set(&self, key: &str, expect: Option<i64>, update: i64) -> Result<bool>;

    /// Adds `delta` to the stored value (absent counts as 0) and returns
    /// the new value, retrying [`compare_and_set`](Self::compare_and_set)
    /// until it succeeds.
    fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        loop {
            let current = self.get(key)?;
            let next = current.unwrap_or(0).wrapping_add(delta);
            if self.compare_and_set(key, current, next)? {
                return Ok(next);
            }
            std::hint::spin_loop();
        }
    }
}
