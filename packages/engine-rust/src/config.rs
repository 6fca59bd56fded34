//! Stack configuration: named providers and namespace routing.
//!
//! ```json
//! {
//!   "providers": [
//!     { "name": "cache", "type": "memory" },
//!     { "name": "db", "type": "sqlite", "options": { "path": "data.db" } }
//!   ],
//!   "namespaces": [
//!     { "pattern": "session_.*", "providers": ["cache"] },
//!     { "pattern": ".*", "providers": ["cache", "db"] }
//!   ]
//! }
//! ```
//!
//! The first namespace rule whose pattern matches the whole store name
//! decides which providers, in order, make up that store's stack.

use std::collections::HashSet;
use std::path::PathBuf;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stackstore_core::{Result, StoreError};

/// Options map carried by a provider entry.
pub type ProviderOptions = serde_json::Map<String, serde_json::Value>;

/// One named backend instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique name referenced by namespace rules.
    pub name: String,
    /// Backend type discriminator (e.g. `"memory"`, `"sqlite"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Backend-specific options, decoded by the provider.
    #[serde(default)]
    pub options: ProviderOptions,
}

impl ProviderConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            options: ProviderOptions::new(),
        }
    }

    /// Adds one option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Decodes the options map into a backend's typed option struct.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for unknown option names or
    /// values of the wrong type.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.options.clone())).map_err(|e| {
            StoreError::Configuration(format!("provider {:?} ({}): {e}", self.name, self.kind))
        })
    }
}

/// Routes store names matching `pattern` to `providers`, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceRule {
    pub pattern: String,
    pub providers: Vec<String>,
}

impl NamespaceRule {
    pub fn new<I, S>(pattern: impl Into<String>, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pattern: pattern.into(),
            providers: providers.into_iter().map(Into::into).collect(),
        }
    }
}

/// Providers plus namespace routing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub namespaces: Vec<NamespaceRule>,
}

impl StackConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] on malformed JSON or any
    /// problem [`validate`](Self::validate) reports.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StoreError::Configuration(format!("invalid stack config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// One in-memory provider serving every store.
    #[must_use]
    pub fn memory_only() -> Self {
        Self {
            providers: vec![ProviderConfig::new("memory", "memory")],
            namespaces: vec![NamespaceRule::new(".*", ["memory"])],
        }
    }

    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.providers.push(provider);
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, rule: NamespaceRule) -> Self {
        self.namespaces.push(rule);
        self
    }

    /// Looks up a provider entry by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Checks provider names are unique, every rule lists at least one
    /// known provider, and every pattern compiles.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(StoreError::Configuration("provider with empty name".into()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(StoreError::Configuration(format!(
                    "duplicate provider name {:?}",
                    provider.name
                )));
            }
        }
        for rule in &self.namespaces {
            compile(&rule.pattern)?;
            if rule.providers.is_empty() {
                return Err(StoreError::Configuration(format!(
                    "namespace {:?} lists no providers",
                    rule.pattern
                )));
            }
            if let Some(unknown) = rule.providers.iter().find(|n| !seen.contains(n.as_str())) {
                return Err(StoreError::Configuration(format!(
                    "namespace {:?} references unknown provider {unknown:?}",
                    rule.pattern
                )));
            }
        }
        Ok(())
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})$")).map_err(|e| {
        StoreError::Configuration(format!("invalid namespace pattern {pattern:?}: {e}"))
    })
}

/// Validated [`StackConfig`] with compiled namespace patterns.
#[derive(Debug, Clone)]
pub struct StackResolver {
    config: StackConfig,
    rules: Vec<Regex>,
}

impl StackResolver {
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the config does not validate.
    pub fn new(config: StackConfig) -> Result<Self> {
        config.validate()?;
        let rules = config
            .namespaces
            .iter()
            .map(|rule| compile(&rule.pattern))
            .collect::<Result<_>>()?;
        Ok(Self { config, rules })
    }

    #[must_use]
    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    /// Providers making up `store`'s stack, in layer order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] when no namespace rule matches.
    pub fn resolve(&self, store: &str) -> Result<Vec<&ProviderConfig>> {
        let index = self
            .rules
            .iter()
            .position(|re| re.is_match(store))
            .ok_or_else(|| {
                StoreError::Configuration(format!("no namespace rule matches store {store:?}"))
            })?;
        self.config.namespaces[index]
            .providers
            .iter()
            .map(|name| {
                self.config.provider(name).ok_or_else(|| {
                    StoreError::Configuration(format!("unknown provider {name:?}"))
                })
            })
            .collect()
    }
}

/// Options recognised by the `memory` provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct MemoryOptions {
    /// Pre-sized entry capacity for key-value maps.
    pub initial_capacity: usize,
}

/// Options recognised by the `sqlite` provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SqliteOptions {
    /// Database file. `None` opens an in-memory database.
    pub path: Option<PathBuf>,
    /// Registry key for sharing the connection. Defaults to one key per
    /// file, or one per provider for in-memory databases.
    pub connection: Option<String>,
}
