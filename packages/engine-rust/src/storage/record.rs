//! Record types for the data-object contract.
//!
//! A [`Record`] is a disconnected copy: it owns its fields and a staged
//! delta, and nothing it does touches backend state until
//! [`Record::save`] hands a [`RecordUpdate`] to a
//! [`DataObjectMap`](super::DataObjectMap).

use std::collections::BTreeMap;

use stackstore_core::{validate_field_name, FieldMap, Oid, Result, Row, Value};

use super::data_object_map::DataObjectMap;

/// Staged field changes. `Value::Null` marks a delete.
pub type Delta = BTreeMap<String, Value>;

/// What a backend receives on save.
///
/// Carries both the full post-save field set and the delta, so a backend can
/// choose between full overwrite and partial update. Either choice must
/// leave the backend's copy equal to `fields`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub oid: Oid,
    /// Complete field set after the update.
    pub fields: FieldMap,
    /// Fields changed since the record was loaded or last saved.
    pub delta: Delta,
    /// `true` when the record has never been saved.
    pub is_new: bool,
}

impl RecordUpdate {
    /// Applies the delta to an existing field set.
    pub fn apply_delta(&self, target: &mut FieldMap) {
        for (field, value) in &self.delta {
            if value.is_null() {
                target.remove(field);
            } else {
                target.insert(field.clone(), value.clone());
            }
        }
    }
}

/// A flat record: OID, current fields, and changes staged since last save.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    oid: Oid,
    fields: FieldMap,
    staged: Delta,
    persisted: bool,
}

impl Record {
    /// A fresh, unsaved record.
    #[must_use]
    pub fn new(oid: Oid) -> Self {
        Self {
            oid,
            fields: FieldMap::new(),
            staged: Delta::new(),
            persisted: false,
        }
    }

    /// A record as read from a backend: persisted, nothing staged.
    #[must_use]
    pub fn loaded(oid: Oid, mut fields: FieldMap) -> Self {
        fields.retain(|_, v| !v.is_null());
        Self {
            oid,
            fields,
            staged: Delta::new(),
            persisted: true,
        }
    }

    #[must_use]
    pub fn oid(&self) -> &Oid {
        &self.oid
    }

    /// Current value of `field`, including staged changes.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String value of `field`, if it holds one.
    #[must_use]
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// All current fields, including staged changes.
    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Stages `field = value`. A null value stages a delete.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidField`](stackstore_core::StoreError::InvalidField)
    /// if `field` is not a plain identifier.
    pub fn put(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        validate_field_name(field)?;
        let value = value.into();
        if value.is_null() {
            self.fields.remove(field);
        } else {
            self.fields.insert(field.to_string(), value.clone());
        }
        self.staged.insert(field.to_string(), value);
        Ok(())
    }

    /// Stages deletion of `field`.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn remove(&mut self, field: &str) -> Result<()> {
        self.put(field, Value::Null)
    }

    /// Changes staged since load or the last save.
    #[must_use]
    pub fn staged(&self) -> &Delta {
        &self.staged
    }

    /// Never saved.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    /// Has anything to write: new, or with staged changes.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.persisted || !self.staged.is_empty()
    }

    /// The update a backend must apply to persist this record.
    #[must_use]
    pub fn pending_update(&self) -> RecordUpdate {
        RecordUpdate {
            oid: self.oid.clone(),
            fields: self.fields.clone(),
            delta: self.staged.clone(),
            is_new: !self.persisted,
        }
    }

    /// Marks the staged changes as persisted.
    pub fn mark_saved(&mut self) {
        self.staged.clear();
        self.persisted = true;
    }

    /// Flushes staged changes to `store`. See [`DataObjectMap::save`].
    ///
    /// # Errors
    ///
    /// Propagates the backend's failure; staged changes are kept so the
    /// save can be retried.
    pub fn save(&mut self, store: &dyn DataObjectMap) -> Result<()> {
        store.save(self)
    }

    /// Consumes the record, returning its fields.
    #[must_use]
    pub fn into_fields(self) -> FieldMap {
        self.fields
    }
}

impl Row for Record {
    fn oid(&self) -> &Oid {
        &self.oid
    }

    fn fields(&self) -> &FieldMap {
        &self.fields
    }
}
