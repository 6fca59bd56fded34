//! Ordered multi-layer composition of one contract.
//!
//! A [`Stack`] exposes N backends of the same contract as one. Layer 0 is
//! the primary (fastest) layer and the last layer the most durable fallback.
//!
//! - **Reads** (`get`, `get_entry`, `query`, `keys`, `keys_with_value`) walk
//!   the layers in order and return the first hit. A miss everywhere is a
//!   miss. Errors are not skipped: a failing layer fails the read.
//! - **Writes** (`apply`/`save`, `put`, `remove`, `set_expiry`) go to every
//!   layer in order. The first failure aborts and propagates; layers already
//!   written keep the write.
//! - **Lifecycle** (`system_setup`, `system_destroy`, `clear`,
//!   `maintenance`) fans out the same way.
//!
//! Reads never copy a lower-layer hit into the layers above it.

use std::sync::Arc;

use stackstore_core::{Oid, Query, Result, StoreError};
use tracing::{debug, info, warn};

use super::backend::Backend;
use super::data_object_map::DataObjectMap;
use super::key_value::{Entry, KeyLongMap, KeyValueMap};
use super::record::{Record, RecordUpdate};

/// Several backends of one contract acting as one.
pub struct Stack<T: ?Sized> {
    name: String,
    layers: Vec<Arc<T>>,
}

impl<T: ?Sized> std::fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl<T: Backend + ?Sized> Stack<T> {
    /// Builds a stack over `layers`, index 0 first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] when `layers` is empty.
    pub fn new(name: impl Into<String>, layers: Vec<Arc<T>>) -> Result<Self> {
        let name = name.into();
        if layers.is_empty() {
            return Err(StoreError::Configuration(format!(
                "stack {name:?} needs at least one layer"
            )));
        }
        debug!(
            stack = %name,
            layers = ?layers.iter().map(|l| l.name()).collect::<Vec<_>>(),
            "built stack"
        );
        Ok(Self { name, layers })
    }

    /// Layers in precedence order.
    #[must_use]
    pub fn layers(&self) -> &[Arc<T>] {
        &self.layers
    }

    /// Number of layers. Never zero.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Layer 0.
    #[must_use]
    pub fn primary(&self) -> &Arc<T> {
        &self.layers[0]
    }

    fn fan_out(&self, op: &'static str, f: impl Fn(&T) -> Result<()>) -> Result<()> {
        for (index, layer) in self.layers.iter().enumerate() {
            if let Err(err) = f(layer.as_ref()) {
                warn!(
                    stack = %self.name,
                    layer = index,
                    backend = layer.name(),
                    op,
                    error = %err,
                    "layer failed, aborting"
                );
                return Err(err);
            }
        }
        Ok(())
    }

    fn read_first<R>(&self, f: impl Fn(&T) -> Result<Option<R>>) -> Result<Option<R>> {
        for layer in &self.layers {
            if let Some(hit) = f(layer.as_ref())? {
                return Ok(Some(hit));
            }
        }
        Ok(None)
    }

    fn read_first_non_empty<R>(&self, f: impl Fn(&T) -> Result<Vec<R>>) -> Result<Vec<R>> {
        self.read_first(|layer| {
            let found = f(layer)?;
            Ok((!found.is_empty()).then_some(found))
        })
        .map(Option::unwrap_or_default)
    }
}

impl<T: Backend + ?Sized> Backend for Stack<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn system_setup(&self) -> Result<()> {
        self.fan_out("system_setup", Backend::system_setup)?;
        info!(stack = %self.name, layers = self.layers.len(), "stack set up");
        Ok(())
    }

    fn system_destroy(&self) -> Result<()> {
        self.fan_out("system_destroy", Backend::system_destroy)?;
        info!(stack = %self.name, layers = self.layers.len(), "stack destroyed");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.fan_out("clear", Backend::clear)
    }

    fn maintenance(&self) -> Result<()> {
        self.fan_out("maintenance", Backend::maintenance)
    }
}

impl<T: DataObjectMap + ?Sized> DataObjectMap for Stack<T> {
    fn get(&self, oid: &Oid) -> Result<Option<Record>> {
        self.read_first(|layer| layer.get(oid))
    }

    fn apply(&self, update: &RecordUpdate) -> Result<()> {
        self.fan_out("apply", |layer| layer.apply(update))
    }

    fn remove(&self, oid: &Oid) -> Result<()> {
        self.fan_out("remove", |layer| layer.remove(oid))
    }

    fn keys(&self) -> Result<Vec<Oid>> {
        self.read_first_non_empty(DataObjectMap::keys)
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>> {
        self.read_first_non_empty(|layer| layer.query(query))
    }
}

impl<V, T> KeyValueMap<V> for Stack<T>
where
    V: Clone + PartialEq + Send + Sync,
    T: KeyValueMap<V> + ?Sized,
{
    fn get_entry(&self, key: &str) -> Result<Option<Entry<V>>> {
        self.read_first(|layer| layer.get_entry(key))
    }

    fn put(&self, key: &str, value: Option<V>, ttl_ms: u64) -> Result<()> {
        self.fan_out("put", |layer| layer.put(key, value.clone(), ttl_ms))
    }

    fn set_expiry(&self, key: &str, expires_at: i64) -> Result<()> {
        self.fan_out("set_expiry", |layer| layer.set_expiry(key, expires_at))
    }

    fn keys_with_value(&self, value: Option<&V>) -> Result<Vec<String>> {
        self.read_first_non_empty(|layer| layer.keys_with_value(value))
    }
}

/// Compare-and-set against the stack's visible value.
///
/// Layer 0 decides. When it holds the key, its own compare-and-set runs
/// with `expect`. When it does not, the visible value comes from the lower
/// layers and layer 0 is set only if it is still absent, so a concurrent
/// writer that reaches layer 0 first makes this call fail. On success the
/// new value is written through to the lower layers; that write-through is
/// not atomic with the layer 0 step.
impl<T: KeyLongMap + ?Sized> KeyLongMap for Stack<T> {
    fn compare_and_set(&self, key: &str, expect: Option<i64>, update: i64) -> Result<bool> {
        let primary = self.primary();
        let primary_entry = primary.get_entry(key)?;
        let visible = match &primary_entry {
            Some(entry) => Some(entry.clone()),
            None => {
                let mut found = None;
                for layer in &self.layers[1..] {
                    if let Some(entry) = layer.get_entry(key)? {
                        found = Some(entry);
                        break;
                    }
                }
                found
            }
        };
        if visible.as_ref().map(|e| e.value) != expect {
            return Ok(false);
        }

        let primary_expect = primary_entry.map(|e| e.value);
        if !primary.compare_and_set(key, primary_expect, update)? {
            return Ok(false);
        }

        let expires_at = visible.map_or(0, |e| e.expires_at);
        for layer in &self.layers[1..] {
            layer.put(key, Some(update), 0)?;
        }
        if expires_at != 0 {
            KeyValueMap::<i64>::set_expiry(self, key, expires_at)?;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stackstore_core::{ManualClock, Predicate, Value};

    use super::*;
    use crate::storage::engines::{MemoryDataObjectMap, MemoryKeyValueMap};

    fn object_stack() -> (
        Stack<dyn DataObjectMap>,
        Arc<MemoryDataObjectMap>,
        Arc<MemoryDataObjectMap>,
    ) {
        let top = Arc::new(MemoryDataObjectMap::new("top"));
        let bottom = Arc::new(MemoryDataObjectMap::new("bottom"));
        let layers: Vec<Arc<dyn DataObjectMap>> = vec![top.clone(), bottom.clone()];
        (Stack::new("objects", layers).unwrap(), top, bottom)
    }

    #[test]
    fn empty_stack_is_a_configuration_error() {
        let layers: Vec<Arc<dyn DataObjectMap>> = Vec::new();
        assert!(matches!(
            Stack::new("empty", layers),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn write_through_and_fallback_read() {
        let (stack, top, bottom) = object_stack();
        let mut record = stack.new_entry();
        record.put("v", "one").unwrap();
        record.save(&stack).unwrap();
        assert!(top.contains(record.oid()).unwrap());
        assert!(bottom.contains(record.oid()).unwrap());

        top.clear().unwrap();
        let found = stack.get(record.oid()).unwrap().unwrap();
        assert_eq!(found.get_str("v"), Some("one"));
        assert!(top.get(record.oid()).unwrap().is_none(), "no read promotion");

        let mut found = found;
        found.put("v", "two").unwrap();
        found.save(&stack).unwrap();
        assert_eq!(
            top.get(record.oid()).unwrap().unwrap().get_str("v"),
            Some("two")
        );
        assert_eq!(
            bottom.get(record.oid()).unwrap().unwrap().get_str("v"),
            Some("two")
        );
    }

    #[test]
    fn top_layer_wins_on_conflict() {
        let (stack, top, bottom) = object_stack();
        let oid = Oid::parse("shared").unwrap();
        for (layer, value) in [(&top, "fresh"), (&bottom, "stale")] {
            let mut record = Record::new(oid.clone());
            record.put("v", value).unwrap();
            record.save(layer.as_ref()).unwrap();
        }
        assert_eq!(stack.get(&oid).unwrap().unwrap().get_str("v"), Some("fresh"));
    }

    #[test]
    fn query_and_keys_use_first_non_empty_layer() {
        let (stack, top, bottom) = object_stack();
        let mut seed = Record::new(Oid::parse("seed").unwrap());
        seed.put("n", 1).unwrap();
        seed.save(bottom.as_ref()).unwrap();

        let query = Query::filter(Predicate::eq("n", 1));
        assert_eq!(stack.query(&query).unwrap().len(), 1);
        assert_eq!(stack.keys().unwrap().len(), 1);

        let mut other = Record::new(Oid::parse("other").unwrap());
        other.put("n", 2).unwrap();
        other.save(top.as_ref()).unwrap();
        assert_eq!(stack.keys().unwrap(), vec![Oid::parse("other").unwrap()]);
    }

    #[test]
    fn remove_reaches_every_layer() {
        let (stack, top, bottom) = object_stack();
        let mut record = stack.new_entry();
        record.put("n", Value::Int(1)).unwrap();
        record.save(&stack).unwrap();
        stack.remove(record.oid()).unwrap();
        assert!(top.is_empty());
        assert!(bottom.is_empty());
        assert!(stack.get(record.oid()).unwrap().is_none());
    }

    struct Tracked {
        name: &'static str,
        fail: bool,
        calls: AtomicUsize,
    }

    impl Tracked {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                calls: AtomicUsize::new(0),
            })
        }

        fn hit(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(StoreError::backend(anyhow::anyhow!("{} is down", self.name)))
            } else {
                Ok(())
            }
        }
    }

    impl Backend for Tracked {
        fn name(&self) -> &str {
            self.name
        }

        fn system_setup(&self) -> Result<()> {
            self.hit()
        }

        fn system_destroy(&self) -> Result<()> {
            self.hit()
        }

        fn clear(&self) -> Result<()> {
            self.hit()
        }
    }

    #[test]
    fn lifecycle_aborts_on_first_failure() {
        crate::test_support::init_tracing();
        let first = Tracked::new("first", false);
        let broken = Tracked::new("broken", true);
        let last = Tracked::new("last", false);
        let stack = Stack::new("tracked", vec![first.clone(), broken.clone(), last.clone()]).unwrap();

        let err = stack.system_setup().unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(broken.calls.load(Ordering::SeqCst), 1);
        assert_eq!(last.calls.load(Ordering::SeqCst), 0);

        assert!(stack.maintenance().is_ok(), "default maintenance is a no-op");
    }

    fn long_stack(
        clock: &ManualClock,
    ) -> (
        Stack<dyn KeyLongMap>,
        Arc<MemoryKeyValueMap<i64>>,
        Arc<MemoryKeyValueMap<i64>>,
    ) {
        let top = Arc::new(MemoryKeyValueMap::new("top", Arc::new(clock.clone())));
        let bottom = Arc::new(MemoryKeyValueMap::new("bottom", Arc::new(clock.clone())));
        let layers: Vec<Arc<dyn KeyLongMap>> = vec![top.clone(), bottom.clone()];
        (Stack::new("longs", layers).unwrap(), top, bottom)
    }

    #[test]
    fn key_value_precedence() {
        let clock = ManualClock::new(0);
        let (stack, top, bottom) = long_stack(&clock);
        stack.put("k", Some(1), 0).unwrap();
        assert_eq!(top.get("k").unwrap(), Some(1));
        assert_eq!(bottom.get("k").unwrap(), Some(1));

        top.clear().unwrap();
        assert_eq!(stack.get("k").unwrap(), Some(1));
        assert_eq!(stack.keys_with_value(Some(&1)).unwrap(), vec!["k"]);

        stack.put("k", Some(2), 0).unwrap();
        assert_eq!(top.get("k").unwrap(), Some(2));
        stack.remove("k").unwrap();
        assert_eq!(bottom.get("k").unwrap(), None);
    }

    #[test]
    fn expiry_fans_out() {
        let clock = ManualClock::new(1_000);
        let (stack, top, bottom) = long_stack(&clock);
        stack.put("k", Some(1), 100).unwrap();
        assert_eq!(top.get_entry("k").unwrap().unwrap().expires_at, 1_100);
        assert_eq!(bottom.get_entry("k").unwrap().unwrap().expires_at, 1_100);
        clock.set(1_100);
        assert_eq!(stack.get("k").unwrap(), None);
    }

    #[test]
    fn compare_and_set_uses_visible_value() {
        let clock = ManualClock::new(0);
        let (stack, top, bottom) = long_stack(&clock);
        bottom.put("k", Some(5), 0).unwrap();

        assert!(!stack.compare_and_set("k", None, 1).unwrap());
        assert!(!stack.compare_and_set("k", Some(4), 1).unwrap());
        assert!(stack.compare_and_set("k", Some(5), 6).unwrap());
        assert_eq!(top.get("k").unwrap(), Some(6));
        assert_eq!(bottom.get("k").unwrap(), Some(6));

        assert_eq!(stack.increment("k", 4).unwrap(), 10);
        assert_eq!(bottom.get("k").unwrap(), Some(10));
    }

    #[test]
    fn compare_and_set_keeps_visible_expiry() {
        let clock = ManualClock::new(0);
        let (stack, top, bottom) = long_stack(&clock);
        bottom.put("k", Some(1), 500).unwrap();
        assert!(stack.compare_and_set("k", Some(1), 2).unwrap());
        assert_eq!(top.get_entry("k").unwrap().unwrap().expires_at, 500);
        assert_eq!(bottom.get_entry("k").unwrap().unwrap().expires_at, 500);
    }

    /// Lets a rival writer change the key right before the first
    /// compare-and-set reaches the wrapped map.
    struct Contended {
        inner: MemoryKeyValueMap<i64>,
        rival: i64,
        raced: std::sync::atomic::AtomicBool,
    }

    impl Backend for Contended {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn system_destroy(&self) -> Result<()> {
            self.inner.system_destroy()
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
    }

    impl KeyValueMap<i64> for Contended {
        fn get_entry(&self, key: &str) -> Result<Option<Entry<i64>>> {
            self.inner.get_entry(key)
        }

        fn put(&self, key: &str, value: Option<i64>, ttl_ms: u64) -> Result<()> {
            self.inner.put(key, value, ttl_ms)
        }

        fn set_expiry(&self, key: &str, expires_at: i64) -> Result<()> {
            self.inner.set_expiry(key, expires_at)
        }

        fn keys_with_value(&self, value: Option<&i64>) -> Result<Vec<String>> {
            self.inner.keys_with_value(value)
        }
    }

    impl KeyLongMap for Contended {
        fn compare_and_set(&self, key: &str, expect: Option<i64>, update: i64) -> Result<bool> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                self.inner.put(key, Some(self.rival), 0)?;
            }
            self.inner.compare_and_set(key, expect, update)
        }
    }

    #[test]
    fn compare_and_set_fails_when_primary_changes_underneath() {
        let clock = ManualClock::new(0);
        let primary = Arc::new(Contended {
            inner: MemoryKeyValueMap::new("contended", Arc::new(clock.clone())),
            rival: 7,
            raced: std::sync::atomic::AtomicBool::new(false),
        });
        primary.put("k", Some(5), 0).unwrap();
        let layers: Vec<Arc<dyn KeyLongMap>> = vec![primary.clone()];
        let stack = Stack::new("longs", layers).unwrap();

        assert!(!stack.compare_and_set("k", Some(5), 6).unwrap());
        assert_eq!(stack.get("k").unwrap(), Some(7));
        assert!(stack.compare_and_set("k", Some(7), 8).unwrap());
        assert_eq!(primary.get("k").unwrap(), Some(8));
    }

    #[test]
    fn compare_and_set_on_cold_primary_requires_it_still_absent() {
        let clock = ManualClock::new(0);
        let primary = Arc::new(Contended {
            inner: MemoryKeyValueMap::new("contended", Arc::new(clock.clone())),
            rival: 9,
            raced: std::sync::atomic::AtomicBool::new(false),
        });
        let bottom = Arc::new(MemoryKeyValueMap::new("bottom", Arc::new(clock.clone())));
        bottom.put("k", Some(5), 0).unwrap();
        let layers: Vec<Arc<dyn KeyLongMap>> = vec![primary, bottom.clone()];
        let stack = Stack::new("longs", layers).unwrap();

        assert!(!stack.compare_and_set("k", Some(5), 6).unwrap());
        assert_eq!(stack.get("k").unwrap(), Some(9));
        assert_eq!(bottom.get("k").unwrap(), Some(5));
    }

    #[test]
    fn concurrent_increments_through_stack_are_not_lost() {
        let clock = ManualClock::new(0);
        let (stack, top, _bottom) = long_stack(&clock);
        let stack = &stack;

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(move || {
                    for _ in 0..500 {
                        stack.increment("hits", 1).unwrap();
                    }
                });
            }
        });

        assert_eq!(stack.get("hits").unwrap(), Some(4_000));
        assert_eq!(top.get("hits").unwrap(), Some(4_000));
    }
}
