//! Per-type providers that build backend adapters from configuration.
//!
//! A [`BackendProvider`] exists for each backend type named in a
//! [`ProviderConfig`]. The [`StoreContext`](crate::StoreContext) asks the
//! provider of every layer for an adapter of the contract it needs and
//! composes the results into a [`Stack`](super::Stack).

use std::sync::Arc;

use stackstore_core::{ClockSource, Result, StoreError};

use crate::config::{MemoryOptions, ProviderConfig};
use crate::registry::ConnectionRegistry;
use crate::storage::data_object_map::DataObjectMap;
use crate::storage::engines::{MemoryDataObjectMap, MemoryKeyValueMap};
use crate::storage::key_value::{KeyLongMap, KeyValueMap};

/// Everything a provider may need to build one adapter.
pub struct ProviderContext<'a> {
    /// Logical store name the adapter will serve.
    pub store: &'a str,
    pub provider: &'a ProviderConfig,
    pub clock: &'a Arc<dyn ClockSource>,
    pub connections: &'a ConnectionRegistry,
}

impl ProviderContext<'_> {
    /// Layer name used in logs: `provider:store`.
    #[must_use]
    pub fn layer_name(&self) -> String {
        format!("{}:{}", self.provider.name, self.store)
    }
}

fn unsupported(backend: &str, contract: &'static str) -> StoreError {
    StoreError::Unsupported {
        backend: backend.to_string(),
        contract,
    }
}

/// Builds adapters for one backend type.
///
/// Contracts a backend cannot serve keep the default implementation, which
/// returns [`StoreError::Unsupported`].
pub trait BackendProvider: Send + Sync {
    /// The `type` value this provider handles.
    fn type_name(&self) -> &str;

    fn data_object_map(&self, _ctx: &ProviderContext<'_>) -> Result<Arc<dyn DataObjectMap>> {
        Err(unsupported(self.type_name(), "data object maps"))
    }

    fn key_value_map(&self, _ctx: &ProviderContext<'_>) -> Result<Arc<dyn KeyValueMap<String>>> {
        Err(unsupported(self.type_name(), "key-value maps"))
    }

    fn key_long_map(&self, _ctx: &ProviderContext<'_>) -> Result<Arc<dyn KeyLongMap>> {
        Err(unsupported(self.type_name(), "key-long maps"))
    }
}

/// `type = "memory"`: process-local maps for every contract.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryProvider;

impl BackendProvider for MemoryProvider {
    fn type_name(&self) -> &str {
        "memory"
    }

    fn data_object_map(&self, ctx: &ProviderContext<'_>) -> Result<Arc<dyn DataObjectMap>> {
        ctx.provider.options_as::<MemoryOptions>()?;
        Ok(Arc::new(MemoryDataObjectMap::new(ctx.layer_name())))
    }

    fn key_value_map(&self, ctx: &ProviderContext<'_>) -> Result<Arc<dyn KeyValueMap<String>>> {
        let options: MemoryOptions = ctx.provider.options_as()?;
        Ok(Arc::new(MemoryKeyValueMap::<String>::with_capacity(
            ctx.layer_name(),
            Arc::clone(ctx.clock),
            options.initial_capacity,
        )))
    }

    fn key_long_map(&self, ctx: &ProviderContext<'_>) -> Result<Arc<dyn KeyLongMap>> {
        let options: MemoryOptions = ctx.provider.options_as()?;
        Ok(Arc::new(MemoryKeyValueMap::<i64>::with_capacity(
            ctx.layer_name(),
            Arc::clone(ctx.clock),
            options.initial_capacity,
        )))
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_provider::SqliteProvider;

#[cfg(feature = "sqlite")]
mod sqlite_provider {
    use std::sync::Arc;

    use stackstore_core::Result;

    use super::{BackendProvider, ProviderContext};
    use crate::config::SqliteOptions;
    use crate::storage::data_object_map::DataObjectMap;
    use crate::storage::datastores::{open_connection, SqliteConnection, SqliteDataObjectMap};

    /// `type = "sqlite"`: durable data-object maps.
    ///
    /// Providers pointing at the same file share one connection through the
    /// context's registry.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SqliteProvider;

    impl SqliteProvider {
        fn connection_key(ctx: &ProviderContext<'_>, options: &SqliteOptions) -> String {
            match (&options.connection, &options.path) {
                (Some(key), _) => key.clone(),
                (None, Some(path)) => format!("sqlite:{}", path.display()),
                (None, None) => format!("sqlite:memory:{}", ctx.provider.name),
            }
        }
    }

    impl BackendProvider for SqliteProvider {
        fn type_name(&self) -> &str {
            "sqlite"
        }

        fn data_object_map(&self, ctx: &ProviderContext<'_>) -> Result<Arc<dyn DataObjectMap>> {
            let options: SqliteOptions = ctx.provider.options_as()?;
            let key = Self::connection_key(ctx, &options);
            let conn = ctx
                .connections
                .get_or_connect::<SqliteConnection, _>(&key, || {
                    open_connection(options.path.as_deref())
                })?;
            Ok(Arc::new(SqliteDataObjectMap::new(ctx.store, conn)))
        }
    }
}

#[cfg(test)]
mod tests {
    use stackstore_core::system_clock;

    use super::*;
    use crate::storage::backend::Backend;

    fn build<R>(
        provider: &ProviderConfig,
        registry: &ConnectionRegistry,
        f: impl FnOnce(&ProviderContext<'_>) -> R,
    ) -> R {
        let clock = system_clock();
        let ctx = ProviderContext {
            store: "users",
            provider,
            clock: &clock,
            connections: registry,
        };
        f(&ctx)
    }

    #[test]
    fn memory_provider_serves_every_contract() {
        let registry = ConnectionRegistry::new();
        let config = ProviderConfig::new("cache", "memory").with_option("initialCapacity", 16);
        build(&config, &registry, |ctx| {
            assert_eq!(MemoryProvider.data_object_map(ctx).unwrap().name(), "cache:users");
            let kv = MemoryProvider.key_value_map(ctx).unwrap();
            kv.put("k", Some("v".to_string()), 0).unwrap();
            assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));
            assert!(MemoryProvider.key_long_map(ctx).is_ok());
        });
        assert!(registry.is_empty(), "memory adapters hold no connections");
    }

    #[test]
    fn memory_provider_rejects_unknown_options() {
        let registry = ConnectionRegistry::new();
        let config = ProviderConfig::new("cache", "memory").with_option("size", 1);
        build(&config, &registry, |ctx| {
            assert!(matches!(
                MemoryProvider.data_object_map(ctx),
                Err(StoreError::Configuration(_))
            ));
        });
    }

    #[cfg(feature = "sqlite")]
    #[test]
    fn sqlite_provider_shares_connections_and_rejects_key_value() {
        let registry = ConnectionRegistry::new();
        let config = ProviderConfig::new("db", "sqlite");
        build(&config, &registry, |ctx| {
            let first = SqliteProvider.data_object_map(ctx).unwrap();
            first.system_setup().unwrap();
            let _second = SqliteProvider.data_object_map(ctx).unwrap();
            assert!(matches!(
                SqliteProvider.key_value_map(ctx),
                Err(StoreError::Unsupported { .. })
            ));
            assert!(matches!(
                SqliteProvider.key_long_map(ctx),
                Err(StoreError::Unsupported { .. })
            ));
        });
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("sqlite:memory:db"));
    }
}
