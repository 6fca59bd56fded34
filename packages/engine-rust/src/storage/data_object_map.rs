//! Flat-record store addressed by OID, with backend-agnostic queries.

use stackstore_core::{Oid, Query, Result};

use super::backend::Backend;
use super::record::{Record, RecordUpdate};

/// Map from [`Oid`] to a flat record of scalar fields.
///
/// Used as `Arc<dyn DataObjectMap>`. Implementations only need the storage
/// primitives ([`get`](Self::get), [`apply`](Self::apply),
/// [`remove`](Self::remove), [`keys`](Self::keys), [`query`](Self::query));
/// record lifecycle is handled by the provided methods.
pub trait DataObjectMap: Backend {
    /// A fresh, unsaved record with a newly generated OID.
    ///
    /// Nothing is written until the record is saved.
    fn new_entry(&self) -> Record {
        Record::new(Oid::generate())
    }

    /// Loads the record stored under `oid`.
    fn get(&self, oid: &Oid) -> Result<Option<Record>>;

    /// Persists a pending update. After success the stored field set must
    /// equal `update.fields`.
    fn apply(&self, update: &RecordUpdate) -> Result<()>;

    /// Writes the record's staged changes and clears them on success.
    /// A record with nothing staged is left untouched.
    fn save(&self, record: &mut Record) -> Result<()> {
        if !record.is_dirty() {
            return Ok(());
        }
        self.apply(&record.pending_update())?;
        record.mark_saved();
        Ok(())
    }

    /// Deletes the record. Removing a missing OID is not an error.
    fn remove(&self, oid: &Oid) -> Result<()>;

    /// Every stored OID.
    ///
    /// Unbounded: enumerates the whole map.
    fn keys(&self) -> Result<Vec<Oid>>;

    /// Records matching `query`, ordered and paged as requested.
    fn query(&self, query: &Query) -> Result<Vec<Record>>;

    fn contains(&self, oid: &Oid) -> Result<bool> {
        Ok(self.get(oid)?.is_some())
    }

    /// Loads several records, skipping missing ones. Order follows `oids`.
    fn get_many(&self, oids: &[Oid]) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(oids.len());
        for oid in oids {
            if let Some(record) = self.get(oid)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// First record of `query` after ordering and offset.
    fn query_one(&self, query: &Query) -> Result<Option<Record>> {
        let limited = query.clone().limit(1);
        Ok(self.query(&limited)?.into_iter().next())
    }
}
