//! Explicit registry of native client handles.
//!
//! Adapters that talk to the same database or cluster share one handle by
//! asking the registry for it by name. The registry is owned by the
//! [`StoreContext`](crate::StoreContext) and torn down with it; there is no
//! process-global connection state.

use std::any::Any;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use stackstore_core::{Result, StoreError};
use tracing::{debug, info};

/// Type-erased connection cache keyed by connection name.
#[derive(Default)]
pub struct ConnectionRegistry {
    handles: DashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.handles.len())
            .finish()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle registered under `name`, running `connect` to
    /// create it on first use.
    ///
    /// `connect` runs at most once per name while the entry is held, so two
    /// callers racing on the same name end up sharing one handle.
    ///
    /// # Errors
    ///
    /// Propagates `connect`'s error, and returns
    /// [`StoreError::Configuration`] when `name` already holds a handle of a
    /// different type.
    pub fn get_or_connect<T, F>(&self, name: &str, connect: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<Arc<T>>,
    {
        let handle = match self.handles.entry(name.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let created = connect()?;
                debug!(connection = name, "opened connection");
                let erased: Arc<dyn Any + Send + Sync> = created;
                entry.insert(Arc::clone(&erased));
                erased
            }
        };
        handle.downcast::<T>().map_err(|_| {
            StoreError::Configuration(format!(
                "connection {name:?} is registered with a different client type"
            ))
        })
    }

    /// The handle under `name`, if one is registered with type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.handles
            .get(name)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<T>().ok())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handles.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Drops the registry's reference to one handle. Adapters still holding
    /// it keep it alive until they are dropped.
    pub fn close(&self, name: &str) -> bool {
        self.handles.remove(name).is_some()
    }

    /// Drops every handle.
    pub fn close_all(&self) {
        let closed = self.handles.len();
        self.handles.clear();
        if closed > 0 {
            info!(closed, "closed connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Client(&'static str);

    #[test]
    fn connects_once_per_name() {
        let registry = ConnectionRegistry::new();
        let opened = AtomicUsize::new(0);
        let connect = || {
            opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Client("db")))
        };

        let first = registry.get_or_connect("db", connect).unwrap();
        let second = registry.get_or_connect("db", connect).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get::<Client>("db").unwrap().0, "db");
    }

    #[test]
    fn type_mismatch_is_a_configuration_error() {
        let registry = ConnectionRegistry::new();
        registry
            .get_or_connect("db", || Ok(Arc::new(Client("db"))))
            .unwrap();
        let err = registry
            .get_or_connect("db", || Ok(Arc::new(42_u32)))
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(registry.get::<u32>("db").is_none());
    }

    #[test]
    fn failed_connect_registers_nothing() {
        let registry = ConnectionRegistry::new();
        let result: Result<Arc<Client>> = registry.get_or_connect("db", || {
            Err(StoreError::backend(anyhow::anyhow!("refused")))
        });
        assert!(result.is_err());
        assert!(!registry.contains("db"));
    }

    #[test]
    fn close_releases_handles() {
        let registry = ConnectionRegistry::new();
        let handle = registry
            .get_or_connect("a", || Ok(Arc::new(Client("a"))))
            .unwrap();
        registry
            .get_or_connect("b", || Ok(Arc::new(Client("b"))))
            .unwrap();

        assert!(registry.close("a"));
        assert!(!registry.close("a"));
        assert_eq!(handle.0, "a", "callers keep their handle");

        registry.close_all();
        assert!(registry.is_empty());
    }
}
