use std::fmt;
use std::sync::Arc;

use stackstore_core::{FieldMap, Oid, Result, StoreError, Value};
use tracing::debug;

use super::{GROUP_ID, MEMBER_ID};
use crate::storage::{DataObjectMap, Record};

/// A live relationship row linking one group to one member.
///
/// The link itself is fixed: `groupID` and `memberID` cannot be changed
/// through this handle. Any other field can carry relationship data
/// (a role, a join date) and is persisted with [`save`](Self::save).
pub struct Relationship {
    record: Record,
    group_id: Oid,
    member_id: Oid,
    relations: Arc<dyn DataObjectMap>,
}

impl fmt::Debug for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationship")
            .field("oid", self.record.oid())
            .field("group_id", &self.group_id)
            .field("member_id", &self.member_id)
            .field("fields", self.record.fields())
            .finish()
    }
}

/// Reads the group and member OIDs of a relationship row.
pub(super) fn link_of(record: &Record) -> Option<(Oid, Oid)> {
    let group = Oid::parse(record.get_str(GROUP_ID)?).ok()?;
    let member = Oid::parse(record.get_str(MEMBER_ID)?).ok()?;
    Some((group, member))
}

impl Relationship {
    /// Wraps a stored row. `None` if the row does not carry a valid link.
    pub(super) fn from_record(record: Record, relations: Arc<dyn DataObjectMap>) -> Option<Self> {
        let (group_id, member_id) = link_of(&record)?;
        Some(Self {
            record,
            group_id,
            member_id,
            relations,
        })
    }

    #[must_use]
    pub fn oid(&self) -> &Oid {
        self.record.oid()
    }

    #[must_use]
    pub fn group_id(&self) -> &Oid {
        &self.group_id
    }

    #[must_use]
    pub fn member_id(&self) -> &Oid {
        &self.member_id
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.record.get(field)
    }

    #[must_use]
    pub fn fields(&self) -> &FieldMap {
        self.record.fields()
    }

    /// Stages a change to a relationship field.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ProtectedField`] for `groupID` and `memberID`,
    /// and [`StoreError::InvalidField`] for names that are not identifiers.
    pub fn put(&mut self, field: &str, value: impl Into<Value>) -> Result<()> {
        if field == GROUP_ID || field == MEMBER_ID {
            return Err(StoreError::ProtectedField {
                field: field.to_string(),
            });
        }
        self.record.put(field, value)
    }

    /// Stages deletion of a relationship field.
    ///
    /// # Errors
    ///
    /// Same as [`put`](Self::put).
    pub fn remove(&mut self, field: &str) -> Result<()> {
        self.put(field, Value::Null)
    }

    /// Persists staged changes to the relationship table.
    ///
    /// Returns `false` without writing when the row has been deleted since
    /// this handle was loaded (an orphan purge, a duplicate collapse or
    /// `remove_membership`), so a stale handle cannot bring it back. The
    /// check and the write are separate calls; a delete landing between
    /// them is repaired by the next access to either side.
    ///
    /// # Errors
    ///
    /// Propagates the backend's failure.
    pub fn save(&mut self) -> Result<bool> {
        if !self.relations.contains(self.record.oid())? {
            debug!(oid = %self.record.oid(), "relationship gone, not saving");
            return Ok(false);
        }
        self.relations.save(&mut self.record)?;
        Ok(true)
    }

    #[must_use]
    pub fn record(&self) -> &Record {
        &self.record
    }

    #[must_use]
    pub fn into_record(self) -> Record {
        self.record
    }
}
