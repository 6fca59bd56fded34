//! Error type shared by every storage contract.
//!
//! Only [`StoreError::Configuration`] and the validation variants are meant to
//! reach an end user. Orphaned or duplicated relationship rows are repaired
//! silently and never surface here.

/// Errors returned by storage contracts, backends, stacks and the store context.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A required setting is missing or invalid. Fatal, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// An OID failed validation (empty, too long, or not alphanumeric).
    #[error("invalid oid: {0:?}")]
    InvalidOid(String),
    /// A key-value key was empty.
    #[error("invalid key: key must not be empty")]
    InvalidKey,
    /// A field name is not a plain identifier.
    #[error("invalid field name: {0:?}")]
    InvalidField(String),
    /// Attempt to modify a field that is fixed after creation.
    #[error("field {field:?} is protected and cannot be modified")]
    ProtectedField { field: String },
    /// A query string failed to parse or its arguments did not line up.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The backend does not implement the requested contract.
    #[error("backend {backend:?} does not support {contract}")]
    Unsupported {
        backend: String,
        contract: &'static str,
    },
    /// Adapter-native failure (I/O, network, driver). Not retried here.
    #[error("backend failure: {0}")]
    Backend(#[source] anyhow::Error),
}

impl StoreError {
    /// Wraps any adapter-native error as [`StoreError::Backend`].
    pub fn backend<E>(err: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Backend(err.into())
    }

    /// Returns `true` for errors the caller caused synchronously
    /// (bad OID, key, field, query, or a protected-field write).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidOid(_)
                | Self::InvalidKey
                | Self::InvalidField(_)
                | Self::ProtectedField { .. }
                | Self::InvalidQuery(_)
        )
    }
}

/// Result alias used throughout the storage contracts.
pub type Result<T> = std::result::Result<T, StoreError>;
