//! Object identifiers for records.
//!
//! An [`Oid`] is opaque to callers but constrained to ASCII alphanumerics so
//! adapters can use it verbatim as a filesystem path segment or SQL value.
//! Generated OIDs are UUID v7 in simple (hex, no dashes) form, which makes
//! lexicographic order follow creation time.

use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// Upper bound on OID length accepted by [`Oid::parse`].
pub const MAX_OID_LEN: usize = 64;

/// Validated record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    /// Generates a fresh, time-ordered OID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// Validates `raw` and wraps it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidOid`] if `raw` is empty, longer than
    /// [`MAX_OID_LEN`], or contains anything but ASCII letters and digits.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty()
            || raw.len() > MAX_OID_LEN
            || !raw.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return Err(StoreError::InvalidOid(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// The OID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Oid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Oid {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Oid {
    type Error = StoreError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl TryFrom<&str> for Oid {
    type Error = StoreError;

    fn try_from(raw: &str) -> Result<Self> {
        Self::parse(raw)
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_oids_are_alphanumeric_and_valid() {
        let oid = Oid::generate();
        assert_eq!(oid.as_str().len(), 32);
        assert!(Oid::parse(oid.as_str()).is_ok());
    }

    #[test]
    fn generated_oids_are_unique() {
        let mut oids: Vec<Oid> = (0..200).map(|_| Oid::generate()).collect();
        oids.sort();
        oids.dedup();
        assert_eq!(oids.len(), 200);
    }

    #[test]
    fn generated_oids_follow_creation_order() {
        let first = Oid::generate();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = Oid::generate();
        assert!(first < second, "{first} should sort before {second}");
    }

    #[test]
    fn parse_rejects_traversal_and_injection() {
        for raw in ["", "../etc", "a/b", "a b", "x'; --", "ключ", "a.b"] {
            assert!(
                matches!(Oid::parse(raw), Err(StoreError::InvalidOid(_))),
                "{raw:?} should be rejected"
            );
        }
        let too_long = "a".repeat(MAX_OID_LEN + 1);
        assert!(Oid::parse(&too_long).is_err());
    }

    #[test]
    fn serde_validates_on_deserialize() {
        let oid: Oid = serde_json::from_str("\"abc123\"").unwrap();
        assert_eq!(oid.as_str(), "abc123");
        assert!(serde_json::from_str::<Oid>("\"../x\"").is_err());
        assert_eq!(serde_json::to_string(&oid).unwrap(), "\"abc123\"");
    }
}
