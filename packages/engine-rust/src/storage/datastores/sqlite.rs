//! `SQLite`-backed [`DataObjectMap`] with predicate push-down.
//!
//! Records are stored one attribute row per field, so any flat record fits
//! without schema changes:
//!
//! - `stackstore_records(store, oid)` lists the OIDs of each logical store.
//! - `stackstore_fields(store, oid, field, kind, txt, num)` holds one field.
//!   `txt` is the value's text form, `num` its numeric form (or `NULL` when
//!   the value is not numeric), and `kind` restores the original type.
//!
//! Predicates are translated into correlated `EXISTS` sub-queries whose
//! comparisons follow [`CompareOp::test`] exactly: numeric when both sides
//! have a numeric form, text otherwise. Ordering and paging then go through
//! [`Query::order_and_page`] like every other backend.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};
use stackstore_core::{CompareOp, FieldMap, Oid, Predicate, Query, Result, StoreError, Value};
use tracing::{debug, info};

use crate::storage::backend::Backend;
use crate::storage::data_object_map::DataObjectMap;
use crate::storage::record::{Record, RecordUpdate};

/// Shared handle to one `SQLite` database. Stores on the same database
/// share a handle through the connection registry.
pub type SqliteConnection = Mutex<Connection>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stackstore_records (
    store TEXT NOT NULL,
    oid   TEXT NOT NULL,
    PRIMARY KEY (store, oid)
);
CREATE TABLE IF NOT EXISTS stackstore_fields (
    store TEXT NOT NULL,
    oid   TEXT NOT NULL,
    field TEXT NOT NULL,
    kind  TEXT NOT NULL,
    txt   TEXT NOT NULL,
    num   REAL,
    PRIMARY KEY (store, oid, field)
);
CREATE INDEX IF NOT EXISTS stackstore_fields_by_field
    ON stackstore_fields (store, field);
";

const SELECT_ROWS: &str = "
SELECT r.oid, f.field, f.kind, f.txt
FROM stackstore_records r
LEFT JOIN stackstore_fields f ON f.store = r.store AND f.oid = r.oid
WHERE r.store = ?";

/// Opens a database file, or a private in-memory database for `None`.
///
/// # Errors
///
/// Returns [`StoreError::Backend`] if the database cannot be opened.
pub fn open_connection(path: Option<&Path>) -> Result<Arc<SqliteConnection>> {
    let conn = match path {
        Some(path) => Connection::open(path),
        None => Connection::open_in_memory(),
    }
    .map_err(StoreError::backend)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Data-object map persisted in `SQLite`.
///
/// Every statement runs under the connection mutex and multi-statement
/// writes run in a transaction, so updates to one OID are atomic.
pub struct SqliteDataObjectMap {
    name: String,
    conn: Arc<SqliteConnection>,
}

impl SqliteDataObjectMap {
    #[must_use]
    pub fn new(name: impl Into<String>, conn: Arc<SqliteConnection>) -> Self {
        Self {
            name: name.into(),
            conn,
        }
    }

    fn load(&self, filter: &str, params: Vec<SqlValue>) -> Result<BTreeMap<Oid, FieldMap>> {
        let sql = format!("{SELECT_ROWS} AND ({filter})");
        let mut all_params = Vec::with_capacity(params.len() + 1);
        all_params.push(SqlValue::Text(self.name.clone()));
        all_params.extend(params);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql).map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params_from_iter(all_params), |row| {
                Ok(RawRow {
                    oid: row.get(0)?,
                    field: row.get(1)?,
                    kind: row.get(2)?,
                    txt: row.get(3)?,
                })
            })
            .map_err(StoreError::backend)?;

        let mut out: BTreeMap<Oid, FieldMap> = BTreeMap::new();
        for row in rows {
            let row = row.map_err(StoreError::backend)?;
            let fields = out.entry(Oid::parse(&row.oid)?).or_default();
            if let (Some(field), Some(kind), Some(txt)) = (row.field, row.kind, row.txt) {
                let value = decode(&kind, txt)?;
                fields.insert(field, value);
            }
        }
        Ok(out)
    }
}

struct RawRow {
    oid: String,
    field: Option<String>,
    kind: Option<String>,
    txt: Option<String>,
}

fn encode(value: &Value) -> Option<(&'static str, String, Option<f64>)> {
    let kind = match value {
        Value::Null => return None,
        Value::Bool(_) => "b",
        Value::Int(_) => "i",
        Value::Float(_) => "f",
        Value::String(_) => "s",
    };
    Some((kind, value.as_text()?, value.as_number()))
}

fn decode(kind: &str, txt: String) -> Result<Value> {
    let parsed = match kind {
        "s" => return Ok(Value::String(txt)),
        "b" => Some(Value::Bool(txt == "true")),
        "i" => txt.parse().ok().map(Value::Int),
        "f" => txt.parse().ok().map(Value::Float),
        _ => None,
    };
    parsed.ok_or_else(|| {
        StoreError::backend(anyhow::anyhow!("corrupt {kind:?} field value {txt:?}"))
    })
}

const FIELD_ROW: &str = "SELECT 1 FROM stackstore_fields x \
     WHERE x.store = r.store AND x.oid = r.oid AND x.field = ?";

/// Appends the SQL form of `predicate` to `sql`, pushing bound values onto
/// `params` in placeholder order.
fn push_down(predicate: &Predicate, sql: &mut String, params: &mut Vec<SqlValue>) {
    match predicate {
        Predicate::And(children) | Predicate::Or(children) if children.is_empty() => {
            sql.push_str(if matches!(predicate, Predicate::And(_)) { "1" } else { "0" });
        }
        Predicate::And(children) | Predicate::Or(children) => {
            let sep = if matches!(predicate, Predicate::And(_)) { " AND " } else { " OR " };
            sql.push('(');
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    sql.push_str(sep);
                }
                push_down(child, sql, params);
            }
            sql.push(')');
        }
        Predicate::Compare { field, op, arg } => {
            let Some(text) = arg.as_text() else {
                // Null argument: only presence of the field matters.
                match op {
                    CompareOp::Eq => sql.push_str("NOT EXISTS ("),
                    CompareOp::Ne => sql.push_str("EXISTS ("),
                    _ => {
                        sql.push('0');
                        return;
                    }
                }
                sql.push_str(FIELD_ROW);
                sql.push(')');
                params.push(SqlValue::Text(field.clone()));
                return;
            };

            // A missing field satisfies only `!=`, so that case negates `=`.
            let (negate, op) = match op {
                CompareOp::Ne => (true, CompareOp::Eq),
                other => (false, *other),
            };
            sql.push_str(if negate { "NOT EXISTS (" } else { "EXISTS (" });
            sql.push_str(FIELD_ROW);
            params.push(SqlValue::Text(field.clone()));

            let symbol = op.symbol();
            match arg.as_number() {
                Some(num) => {
                    sql.push_str(&format!(
                        " AND (CASE WHEN x.num IS NOT NULL THEN x.num {symbol} ? \
                         ELSE x.txt {symbol} ? END))"
                    ));
                    params.push(SqlValue::Real(num));
                    params.push(SqlValue::Text(text));
                }
                None => {
                    sql.push_str(&format!(" AND x.txt {symbol} ?)"));
                    params.push(SqlValue::Text(text));
                }
            }
        }
    }
}

impl Backend for SqliteDataObjectMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn system_setup(&self) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(SCHEMA)
            .map_err(StoreError::backend)
    }

    fn system_destroy(&self) -> Result<()> {
        self.clear()?;
        info!(store = %self.name, "destroyed sqlite store");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        tx.execute("DELETE FROM stackstore_fields WHERE store = ?1", params![self.name])
            .map_err(StoreError::backend)?;
        tx.execute("DELETE FROM stackstore_records WHERE store = ?1", params![self.name])
            .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)
    }
}

impl DataObjectMap for SqliteDataObjectMap {
    fn get(&self, oid: &Oid) -> Result<Option<Record>> {
        let mut rows = self.load("r.oid = ?", vec![SqlValue::Text(oid.to_string())])?;
        Ok(rows
            .remove(oid)
            .map(|fields| Record::loaded(oid.clone(), fields)))
    }

    fn apply(&self, update: &RecordUpdate) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        let oid = update.oid.as_str();

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO stackstore_records (store, oid) VALUES (?1, ?2)",
                params![self.name, oid],
            )
            .map_err(StoreError::backend)?
            == 1;

        // Existing rows take the delta; anything else gets the full snapshot.
        let (changes, full) = if inserted || update.is_new {
            tx.execute(
                "DELETE FROM stackstore_fields WHERE store = ?1 AND oid = ?2",
                params![self.name, oid],
            )
            .map_err(StoreError::backend)?;
            (&update.fields, true)
        } else {
            (&update.delta, false)
        };

        {
            let mut upsert = tx
                .prepare(
                    "INSERT OR REPLACE INTO stackstore_fields (store, oid, field, kind, txt, num) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(StoreError::backend)?;
            let mut delete = tx
                .prepare("DELETE FROM stackstore_fields WHERE store = ?1 AND oid = ?2 AND field = ?3")
                .map_err(StoreError::backend)?;
            for (field, value) in changes {
                match encode(value) {
                    Some((kind, txt, num)) => {
                        upsert
                            .execute(params![self.name, oid, field, kind, txt, num])
                            .map_err(StoreError::backend)?;
                    }
                    None => {
                        delete
                            .execute(params![self.name, oid, field])
                            .map_err(StoreError::backend)?;
                    }
                }
            }
        }

        tx.commit().map_err(StoreError::backend)?;
        debug!(store = %self.name, %oid, full, fields = changes.len(), "applied record update");
        Ok(())
    }

    fn remove(&self, oid: &Oid) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(StoreError::backend)?;
        tx.execute(
            "DELETE FROM stackstore_fields WHERE store = ?1 AND oid = ?2",
            params![self.name, oid.as_str()],
        )
        .map_err(StoreError::backend)?;
        tx.execute(
            "DELETE FROM stackstore_records WHERE store = ?1 AND oid = ?2",
            params![self.name, oid.as_str()],
        )
        .map_err(StoreError::backend)?;
        tx.commit().map_err(StoreError::backend)
    }

    fn keys(&self) -> Result<Vec<Oid>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT oid FROM stackstore_records WHERE store = ?1 ORDER BY oid")
            .map_err(StoreError::backend)?;
        let rows = stmt
            .query_map(params![self.name], |row| row.get::<_, String>(0))
            .map_err(StoreError::backend)?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(Oid::parse(&raw.map_err(StoreError::backend)?)?);
        }
        Ok(out)
    }

    fn query(&self, query: &Query) -> Result<Vec<Record>> {
        query.validate()?;
        let mut filter = String::new();
        let mut params = Vec::new();
        match &query.predicate {
            Some(predicate) => push_down(predicate, &mut filter, &mut params),
            None => filter.push('1'),
        }
        debug!(store = %self.name, %filter, "pushing down query");

        let records = self
            .load(&filter, params)?
            .into_iter()
            .map(|(oid, fields)| Record::loaded(oid, fields))
            .collect();
        Ok(query.order_and_page(records))
    }
}
