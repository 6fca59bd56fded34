//! In-memory [`DataObjectMap`] evaluating queries record by record.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use stackstore_core::{FieldMap, Oid, Query, Result};

use crate::storage::backend::Backend;
use crate::storage::data_object_map::DataObjectMap;
use crate::storage::record::{Record, RecordUpdate};

/// Data-object map held in process memory.
///
/// Every update to an OID happens under the write lock, so a concurrent
/// reader sees either the old or the new field set, never a mix.
pub struct MemoryDataObjectMap {
    name: String,
    records: RwLock<BTreeMap<Oid, FieldMap>>,
}

impl MemoryDataObjectMap {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Backend for MemoryDataObjectMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn system_destroy(&self) -> Result<()> {
        self.records.write().clear();
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.records.write().clear();
        Ok(())
    }
}

impl DataObjectMap for MemoryDataObjectMap {
    fn get(&self, oid: &Oid) -> Result<Option<Record>> {
        Ok(self
            .records
            .read()
            .get(oid)
            .map(|fields| Record::loaded(oid.clone(), fields.clone())))
    }

    fn apply(&self, update: &RecordUpdate) -> Result<()> {
        let mut records = self.records.write();
        match records.get_mut(&update.oid) {
            Some(existing) if !update.is_new => update.apply_delta(existing),
            _ => {
                records.insert(update.oid.clone(), update.fields.clone());
            }
        }
        Ok(())
    }

    fn remove(&self, oid: &Oid) -> Result<()> {
        self.records.write().remove(oid);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<Oid>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>> {
        query.validate()?;
        let candidates: Vec<Record> = self
            .records
            .read()
            .iter()
            .filter(|(_, fields)| query.matches(fields))
            .map(|(oid, fields)| Record::loaded(oid.clone(), fields.clone()))
            .collect();
        Ok(query.order_and_page(candidates))
    }
}
