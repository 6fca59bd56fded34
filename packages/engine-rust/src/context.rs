//! Store context: opens stacks by logical store name and owns their shared resources.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use stackstore_core::{system_clock, ClockSource, Result, StoreError};
use tracing::{debug, info};

use crate::config::{StackConfig, StackResolver};
use crate::membership::Membership;
use crate::registry::ConnectionRegistry;
use crate::storage::factory::{BackendProvider, MemoryProvider, ProviderContext};
use crate::storage::{Backend, DataObjectMap, KeyLongMap, KeyValueMap, Stack};

type ObjectStack = Stack<dyn DataObjectMap>;
type ValueStack = Stack<dyn KeyValueMap<String>>;
type LongStack = Stack<dyn KeyLongMap>;

// ---------------------------------------------------------------------------
// StoreContext
// ---------------------------------------------------------------------------

/// Entry point that turns logical store names into ready-to-use stacks.
///
/// Owns the validated configuration, one [`BackendProvider`] per backend
/// type, the clock handed to TTL-aware backends, and the
/// [`ConnectionRegistry`]. Opened stacks are cached per store name, so two
/// lookups of the same store share state.
pub struct StoreContext {
    resolver: StackResolver,
    providers: HashMap<String, Arc<dyn BackendProvider>>,
    clock: Arc<dyn ClockSource>,
    connections: ConnectionRegistry,
    objects: DashMap<String, Arc<ObjectStack>>,
    values: DashMap<String, Arc<ValueStack>>,
    longs: DashMap<String, Arc<LongStack>>,
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.providers.keys().collect();
        types.sort();
        f.debug_struct("StoreContext")
            .field("provider_types", &types)
            .field("connections", &self.connections)
            .field("data_object_maps", &self.objects.len())
            .field("key_value_maps", &self.values.len())
            .field("key_long_maps", &self.longs.len())
            .finish_non_exhaustive()
    }
}

impl StoreContext {
    /// Creates a context with the system clock and the built-in providers
    /// (`memory`, plus `sqlite` when that feature is enabled).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if `config` does not validate.
    pub fn new(config: StackConfig) -> Result<Self> {
        let mut context = Self {
            resolver: StackResolver::new(config)?,
            providers: HashMap::new(),
            clock: system_clock(),
            connections: ConnectionRegistry::new(),
            objects: DashMap::new(),
            values: DashMap::new(),
            longs: DashMap::new(),
        };
        context.register(Arc::new(MemoryProvider));
        #[cfg(feature = "sqlite")]
        context.register(Arc::new(crate::storage::factory::SqliteProvider));
        Ok(context)
    }

    /// Replaces the clock used by TTL-aware backends opened afterwards.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    /// Registers a provider for an additional backend type, replacing any
    /// provider already registered for that type.
    #[must_use]
    pub fn with_provider(mut self, provider: impl BackendProvider + 'static) -> Self {
        self.register(Arc::new(provider));
        self
    }

    fn register(&mut self, provider: Arc<dyn BackendProvider>) {
        self.providers
            .insert(provider.type_name().to_string(), provider);
    }

    #[must_use]
    pub fn config(&self) -> &StackConfig {
        self.resolver.config()
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    /// Builds one adapter per configured layer of `store` and composes them.
    fn build<T>(
        &self,
        store: &str,
        make: impl Fn(&dyn BackendProvider, &ProviderContext<'_>) -> Result<Arc<T>>,
    ) -> Result<Stack<T>>
    where
        T: Backend + ?Sized,
    {
        let configs = self.resolver.resolve(store)?;
        let mut layers = Vec::with_capacity(configs.len());
        for provider in configs {
            let backend = self.providers.get(&provider.kind).ok_or_else(|| {
                StoreError::Configuration(format!(
                    "provider {:?} has unknown type {:?}",
                    provider.name, provider.kind
                ))
            })?;
            let ctx = ProviderContext {
                store,
                provider,
                clock: &self.clock,
                connections: &self.connections,
            };
            layers.push(make(backend.as_ref(), &ctx)?);
        }

        let stack = Stack::new(store, layers)?;
        stack.system_setup()?;
        debug!(store, layers = stack.len(), "opened stack");
        Ok(stack)
    }

    /// The record store for `store`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] when no rule matches or a
    /// provider type is unknown, [`StoreError::Unsupported`] when a layer's
    /// backend has no record store, and propagates setup failures.
    pub fn data_object_map(&self, store: &str) -> Result<Arc<dyn DataObjectMap>> {
        let stack = self
            .objects
            .entry(store.to_string())
            .or_try_insert_with(|| {
                self.build(store, |p, ctx| p.data_object_map(ctx))
                    .map(Arc::new)
            })?;
        Ok(Arc::clone(stack.value()) as Arc<dyn DataObjectMap>)
    }

    /// The string key-value map for `store`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Same as [`data_object_map`](Self::data_object_map).
    pub fn key_value_map(&self, store: &str) -> Result<Arc<dyn KeyValueMap<String>>> {
        let stack = self
            .values
            .entry(store.to_string())
            .or_try_insert_with(|| {
                self.build(store, |p, ctx| p.key_value_map(ctx))
                    .map(Arc::new)
            })?;
        Ok(Arc::clone(stack.value()) as Arc<dyn KeyValueMap<String>>)
    }

    /// The counter map for `store`, opening it on first use.
    ///
    /// # Errors
    ///
    /// Same as [`data_object_map`](Self::data_object_map).
    pub fn key_long_map(&self, store: &str) -> Result<Arc<dyn KeyLongMap>> {
        let stack = self
            .longs
            .entry(store.to_string())
            .or_try_insert_with(|| {
                self.build(store, |p, ctx| p.key_long_map(ctx))
                    .map(Arc::new)
            })?;
        Ok(Arc::clone(stack.value()) as Arc<dyn KeyLongMap>)
    }

    /// Membership over three record stores.
    ///
    /// # Errors
    ///
    /// Same as [`data_object_map`](Self::data_object_map).
    pub fn membership(&self, groups: &str, members: &str, relations: &str) -> Result<Membership> {
        Ok(Membership::new(
            self.data_object_map(groups)?,
            self.data_object_map(members)?,
            self.data_object_map(relations)?,
        ))
    }

    /// Runs the maintenance sweep of every opened stack.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first failure.
    pub fn maintenance(&self) -> Result<()> {
        let stacks: Vec<Arc<dyn Backend>> = self
            .objects
            .iter()
            .map(|e| Arc::clone(e.value()) as Arc<dyn Backend>)
            .chain(self.values.iter().map(|e| Arc::clone(e.value()) as Arc<dyn Backend>))
            .chain(self.longs.iter().map(|e| Arc::clone(e.value()) as Arc<dyn Backend>))
            .collect();
        for stack in &stacks {
            stack.maintenance()?;
        }
        debug!(stacks = stacks.len(), "maintenance complete");
        Ok(())
    }

    /// Destroys the data of every opened stack of `store` and forgets them.
    /// Returns whether anything was open under that name.
    ///
    /// # Errors
    ///
    /// Propagates the first `system_destroy` failure. Stacks are forgotten
    /// before they are destroyed, so a failed destroy is not retried by a
    /// later call.
    pub fn destroy(&self, store: &str) -> Result<bool> {
        let mut opened: Vec<Arc<dyn Backend>> = Vec::new();
        if let Some((_, stack)) = self.objects.remove(store) {
            opened.push(stack);
        }
        if let Some((_, stack)) = self.values.remove(store) {
            opened.push(stack);
        }
        if let Some((_, stack)) = self.longs.remove(store) {
            opened.push(stack);
        }
        for stack in &opened {
            stack.system_destroy()?;
        }
        if !opened.is_empty() {
            info!(store, stacks = opened.len(), "destroyed store");
        }
        Ok(!opened.is_empty())
    }

    /// Forgets every opened stack and closes every connection. Stored data
    /// is kept; adapters still held by callers stay usable until dropped.
    pub fn shutdown(&self) {
        let forgotten = self.objects.len() + self.values.len() + self.longs.len();
        self.objects.clear();
        self.values.clear();
        self.longs.clear();
        self.connections.close_all();
        info!(stacks = forgotten, "store context shut down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use stackstore_core::{ManualClock, Oid, Value};

    use super::*;
    use crate::config::{NamespaceRule, ProviderConfig};
    use crate::storage::engines::MemoryDataObjectMap;
    use crate::test_support::init_tracing;

    fn two_memory_layers() -> StackConfig {
        StackConfig::default()
            .with_provider(ProviderConfig::new("hot", "memory"))
            .with_provider(ProviderConfig::new("cold", "memory"))
            .with_namespace(NamespaceRule::new("session_.*", ["hot"]))
            .with_namespace(NamespaceRule::new(".*", ["hot", "cold"]))
    }

    #[test]
    fn same_store_shares_state() {
        let ctx = StoreContext::new(two_memory_layers()).unwrap();
        let first = ctx.data_object_map("users").unwrap();
        let mut record = first.new_entry();
        record.put("name", "ada").unwrap();
        first.save(&mut record).unwrap();

        let second = ctx.data_object_map("users").unwrap();
        assert!(second.contains(record.oid()).unwrap());
        assert!(!ctx.data_object_map("teams").unwrap().contains(record.oid()).unwrap());
    }

    #[test]
    fn namespace_rules_pick_layers() {
        let ctx = StoreContext::new(two_memory_layers()).unwrap();
        assert_eq!(ctx.data_object_map("session_1").unwrap().name(), "session_1");
        ctx.data_object_map("users").unwrap();
        let stack = ctx.objects.get("users").unwrap();
        let names: Vec<_> = stack.layers().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["hot:users", "cold:users"]);
        assert_eq!(ctx.objects.get("session_1").unwrap().len(), 1);
    }

    #[test]
    fn unmatched_store_and_unknown_type_are_configuration_errors() {
        let config = StackConfig::default()
            .with_provider(ProviderConfig::new("remote", "cassandra"))
            .with_namespace(NamespaceRule::new("users", ["remote"]));
        let ctx = StoreContext::new(config).unwrap();
        assert!(matches!(
            ctx.data_object_map("users"),
            Err(StoreError::Configuration(_))
        ));
        assert!(matches!(
            ctx.key_value_map("teams"),
            Err(StoreError::Configuration(_))
        ));
        assert!(ctx.objects.is_empty(), "failed opens are not cached");
    }

    #[test]
    fn custom_provider_is_used() {
        struct Tagged;
        impl BackendProvider for Tagged {
            fn type_name(&self) -> &str {
                "tagged"
            }

            fn data_object_map(&self, ctx: &ProviderContext<'_>) -> Result<Arc<dyn DataObjectMap>> {
                Ok(Arc::new(MemoryDataObjectMap::new(format!("tagged-{}", ctx.store))))
            }
        }

        let config = StackConfig::default()
            .with_provider(ProviderConfig::new("t", "tagged"))
            .with_namespace(NamespaceRule::new(".*", ["t"]));
        let ctx = StoreContext::new(config).unwrap().with_provider(Tagged);
        ctx.data_object_map("users").unwrap();
        assert_eq!(
            ctx.objects.get("users").unwrap().primary().name(),
            "tagged-users"
        );
        assert!(matches!(
            ctx.key_long_map("users"),
            Err(StoreError::Unsupported { .. })
        ));
    }

    #[test]
    fn key_value_ttl_follows_context_clock() {
        let clock = ManualClock::new(1_000);
        let ctx = StoreContext::new(two_memory_layers())
            .unwrap()
            .with_clock(Arc::new(clock.clone()));

        let kv = ctx.key_value_map("tokens").unwrap();
        kv.put("t", Some("abc".to_string()), 500).unwrap();
        assert_eq!(kv.get("t").unwrap().as_deref(), Some("abc"));
        clock.advance(500);
        assert_eq!(kv.get("t").unwrap(), None);

        let counters = ctx.key_long_map("hits").unwrap();
        assert_eq!(counters.increment("page", 2).unwrap(), 2);
        assert_eq!(counters.increment("page", 3).unwrap(), 5);
        ctx.maintenance().unwrap();
    }

    #[test]
    fn destroy_drops_data_and_forgets_stack() {
        init_tracing();
        let ctx = StoreContext::new(StackConfig::memory_only()).unwrap();
        let map = ctx.data_object_map("users").unwrap();
        let mut record = map.new_entry();
        record.put("n", 1).unwrap();
        map.save(&mut record).unwrap();

        assert!(ctx.destroy("users").unwrap());
        assert!(!ctx.destroy("users").unwrap());
        assert!(map.get(record.oid()).unwrap().is_none());
        let reopened = ctx.data_object_map("users").unwrap();
        assert!(reopened.keys().unwrap().is_empty());
    }

    #[test]
    fn membership_through_context() {
        let ctx = StoreContext::new(StackConfig::memory_only()).unwrap();
        let m = ctx.membership("groups", "people", "links").unwrap();
        let mut group = m.groups().new_entry();
        m.groups().save(&mut group).unwrap();
        let mut person = m.members().new_entry();
        person.put("name", Value::from("ada")).unwrap();
        m.members().save(&mut person).unwrap();

        let rel = m.add_membership(group.oid(), person.oid()).unwrap().unwrap();
        let links = ctx.data_object_map("links").unwrap();
        assert!(links.contains(rel.oid()).unwrap());
        assert!(m.add_membership(group.oid(), &Oid::generate()).unwrap().is_none());
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_layers_share_one_connection_and_survive_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let config = StackConfig::default()
            .with_provider(ProviderConfig::new("cache", "memory"))
            .with_provider(
                ProviderConfig::new("db", "sqlite")
                    .with_option("path", path.to_string_lossy().into_owned()),
            )
            .with_namespace(NamespaceRule::new(".*", ["cache", "db"]));

        let ctx = StoreContext::new(config.clone()).unwrap();
        let users = ctx.data_object_map("users").unwrap();
        ctx.data_object_map("teams").unwrap();
        assert_eq!(ctx.connections().len(), 1);

        let mut record = users.new_entry();
        record.put("name", "ada").unwrap();
        users.save(&mut record).unwrap();
        ctx.shutdown();
        assert!(ctx.connections().is_empty());
        drop(users);

        let reopened = StoreContext::new(config).unwrap();
        let users = reopened.data_object_map("users").unwrap();
        let loaded = users.get(record.oid()).unwrap().unwrap();
        assert_eq!(loaded.get("name"), Some(&Value::from("ada")));
    }
}
