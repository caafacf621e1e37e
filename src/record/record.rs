//! Live record representatives
//!
//! A [`Record`] is a cheap handle on one row. The identity cache guarantees
//! at most one representative per (type, id), so every caller holding a
//! handle for the same row sees the same field map. Reads are served from
//! the map, loading the row on first use; writes go to storage first and
//! only touch the map once the statement has committed.

use std::sync::{Arc, Weak};

use parking_lot::{RwLock, RwLockWriteGuard};
use rusqlite::types::Value as SqlValue;
use tracing::{debug, warn};

use super::forget;
use super::links::LinkedSet;
use crate::database::Shared;
use crate::error::{SchemaError, StorageError};
use crate::lob::{LargeObject, LobId, LobStore};
use crate::schema::table::quote;
use crate::schema::{ColumnKind, SchemaColumn, SchemaTable};
use crate::storage::{Lease, Row};
use crate::value::{FromValue, Value};
use crate::{Error, Result};

/// Lifecycle of a representative. No transition leaves `Forgotten`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    /// Row inserted, representative not yet cached
    Unsaved,
    Persisted,
    /// Deleted, or the whole store was erased
    Forgotten,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Unsaved => "unsaved",
            RecordStatus::Persisted => "persisted",
            RecordStatus::Forgotten => "forgotten",
        }
    }
}

impl std::fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct RecordState {
    /// Aligned with the table's selectable columns; `None` is not loaded yet
    fields: Vec<Option<Value>>,
    status: RecordStatus,
}

pub(crate) struct RecordCell {
    table: Arc<SchemaTable>,
    id: i64,
    epoch: u64,
    db: Weak<Shared>,
    state: RwLock<RecordState>,
}

/// Exclusive access to a record's cached fields.
pub(crate) struct FieldsGuard<'a>(RwLockWriteGuard<'a, RecordState>);

impl FieldsGuard<'_> {
    pub(crate) fn is_forgotten(&self) -> bool {
        self.0.status == RecordStatus::Forgotten
    }

    pub(crate) fn apply(&mut self, slot: usize, value: Value) {
        if let Some(field) = self.0.fields.get_mut(slot) {
            *field = Some(value);
        }
    }
}

/// Handle on the live representative of one row.
#[derive(Clone)]
pub struct Record(Arc<RecordCell>);

impl Record {
    pub(crate) fn from_cell(cell: Arc<RecordCell>) -> Self {
        Record(cell)
    }

    pub(crate) fn downgrade(&self) -> Weak<RecordCell> {
        Arc::downgrade(&self.0)
    }

    fn build(db: &Arc<Shared>, table: Arc<SchemaTable>, id: i64, fields: Vec<Option<Value>>) -> Self {
        Record(Arc::new(RecordCell {
            table,
            id,
            epoch: db.epoch(),
            db: Arc::downgrade(db),
            state: RwLock::new(RecordState {
                fields,
                status: RecordStatus::Unsaved,
            }),
        }))
    }

    /// Representative for a freshly inserted row: only the id is known.
    pub(crate) fn new_bare(db: &Arc<Shared>, table: Arc<SchemaTable>, id: i64) -> Self {
        let mut fields = vec![None; table.selectable_len()];
        if let Some(slot) = table.id_column().slot {
            fields[slot] = Some(Value::Long(id));
        }
        Self::build(db, table, id, fields)
    }

    /// Representative built from a full select-list row.
    pub(crate) fn from_row(db: &Arc<Shared>, table: Arc<SchemaTable>, row: Row) -> Result<Self> {
        let id = row_id(&table, &row)?;
        let fields = decode_row(&db.lobs, &table, row)?.into_iter().map(Some).collect();
        Ok(Self::build(db, table, id, fields))
    }

    #[cfg(test)]
    pub(crate) fn detached_for_tests(id: i64) -> Self {
        use crate::schema::{ColumnDef, TableDef};
        static PROBE: TableDef = TableDef::new("Probe", &[ColumnDef::id("id")]);
        let table = Arc::new(SchemaTable::derive(&PROBE).unwrap());
        Record(Arc::new(RecordCell {
            table,
            id,
            epoch: 0,
            db: Weak::new(),
            state: RwLock::new(RecordState {
                fields: vec![Some(Value::Long(id))],
                status: RecordStatus::Persisted,
            }),
        }))
    }

    pub fn id(&self) -> i64 {
        self.0.id
    }

    pub fn table(&self) -> &Arc<SchemaTable> {
        &self.0.table
    }

    pub fn table_name(&self) -> &str {
        self.0.table.name()
    }

    /// Whether two handles share one representative.
    pub fn ptr_eq(a: &Record, b: &Record) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn status(&self) -> RecordStatus {
        let status = self.0.state.read().status;
        match self.0.db.upgrade() {
            Some(db) if db.epoch() != self.0.epoch => RecordStatus::Forgotten,
            _ => status,
        }
    }

    pub fn is_forgotten(&self) -> bool {
        self.status() == RecordStatus::Forgotten
    }

    pub(crate) fn mark_persisted(&self) {
        let mut state = self.0.state.write();
        if state.status == RecordStatus::Unsaved {
            state.status = RecordStatus::Persisted;
        }
    }

    pub(crate) fn mark_forgotten(&self) {
        self.0.state.write().status = RecordStatus::Forgotten;
    }

    /// Cached value of a slot without loading or checks.
    pub(crate) fn slot_value(&self, slot: usize) -> Option<Value> {
        self.0.state.read().fields.get(slot).cloned().flatten()
    }

    /// Overwrite a slot in memory. Used when another operation changed the
    /// stored value on this record's behalf.
    pub(crate) fn apply(&self, slot: usize, value: Value) {
        let mut state = self.0.state.write();
        if let Some(field) = state.fields.get_mut(slot) {
            *field = Some(value);
        }
    }

    /// Hold this record's cached fields for a write made on its behalf.
    pub(crate) fn lock_fields(&self) -> FieldsGuard<'_> {
        FieldsGuard(self.0.state.write())
    }

    pub(crate) fn db(&self) -> Result<Arc<Shared>> {
        let db = self.0.db.upgrade().ok_or(Error::Closed)?;
        db.check_open()?;
        Ok(db)
    }

    pub(crate) fn stale(&self) -> Error {
        Error::StaleRecord {
            table: self.table_name().to_string(),
            id: self.id(),
        }
    }

    pub(crate) fn belongs_to(&self, db: &Arc<Shared>) -> bool {
        std::ptr::eq(self.0.db.as_ptr(), Arc::as_ptr(db))
    }

    pub(crate) fn check(&self, db: &Shared) -> Result<()> {
        if self.0.epoch != db.epoch() || self.0.state.read().status == RecordStatus::Forgotten {
            return Err(self.stale());
        }
        Ok(())
    }

    /// Database handle after the liveness checks every access performs.
    fn live(&self) -> Result<Arc<Shared>> {
        let db = self.db()?;
        self.check(&db)?;
        Ok(db)
    }

    /// Read a stored column. Forward links read as the related id.
    pub fn get(&self, column: &str) -> Result<Value> {
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        if col.kind == ColumnKind::Id {
            return Ok(Value::Long(self.id()));
        }
        let slot = col.slot.ok_or_else(|| SchemaError::InvalidLink {
            table: self.table_name().to_string(),
            column: column.to_string(),
            reason: "mapped links have no stored value; use link() or links()".to_string(),
        })?;
        if let Some(value) = self.slot_value(slot) {
            return Ok(value);
        }
        self.load(&db, false)?;
        self.slot_value(slot).ok_or_else(|| self.stale())
    }

    /// Typed read.
    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        T::from_value(column, self.get(column)?)
    }

    /// Reload the row, replacing every cached field.
    pub fn refresh(&self) -> Result<()> {
        let db = self.live()?;
        self.load(&db, true)
    }

    fn load(&self, db: &Shared, overwrite: bool) -> Result<()> {
        let table = &self.0.table;
        let row = {
            let mut lease = db.pool.poll()?;
            let row = lease.query_row(&table.statements().select_by_id, &[Value::Long(self.id())])?;
            lease.release()?;
            row
        };
        let row = row.ok_or_else(|| Error::NotFound {
            table: self.table_name().to_string(),
            id: self.id(),
        })?;
        let values = decode_row(&db.lobs, table, row)?;

        let mut state = self.0.state.write();
        for (field, value) in state.fields.iter_mut().zip(values) {
            if overwrite || field.is_none() {
                *field = Some(value);
            }
        }
        Ok(())
    }

    /// Write a column through to storage.
    ///
    /// Leaf values are checked against the column type, nullability and
    /// length limit. Stream columns take a [`Value::Lob`] or null and adjust
    /// reference counts; forward links take the related id or null.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        match col.kind {
            ColumnKind::Id | ColumnKind::LinkOneToMany => Err(self.read_only(column)),
            ColumnKind::LinkOneToOne if col.mapped_by.is_some() => Err(self.read_only(column)),
            ColumnKind::Stream => match value {
                Value::Lob(lob) => self.write_lob(&db, col, Some(&lob)),
                Value::Null => self.write_lob(&db, col, None),
                other => Err(Error::TypeMismatch {
                    column: column.to_string(),
                    expected: "lob".to_string(),
                    found: other.type_name(),
                }),
            },
            ColumnKind::LinkOneToOne | ColumnKind::LinkManyToOne => match value {
                Value::Null => self.write_forward(&db, col, None),
                other => match other.as_i64() {
                    Some(id) => self.write_forward(&db, col, Some(id)),
                    None => Err(Error::TypeMismatch {
                        column: column.to_string(),
                        expected: "related id".to_string(),
                        found: other.type_name(),
                    }),
                },
            },
            ColumnKind::Leaf => {
                let value = value.coerce(column, col.ty)?;
                if value.is_null() && !col.nullable {
                    return Err(Error::TypeMismatch {
                        column: column.to_string(),
                        expected: format!("non-null {}", col.ty),
                        found: "null".to_string(),
                    });
                }
                if let (Some(max), Value::Text(text)) = (col.max_length, &value) {
                    let len = text.chars().count();
                    if len > max as usize {
                        return Err(Error::ValueTooLong {
                            column: column.to_string(),
                            len,
                            max,
                        });
                    }
                }
                self.write_through(&db, col, value, |_| Ok(()))
            }
        }
    }

    fn read_only(&self, column: &str) -> Error {
        Error::ReadOnlyColumn {
            table: self.table_name().to_string(),
            column: column.to_string(),
        }
    }

    /// Run the column's update statement, then store `value` in the map.
    /// `before` runs in the same lease ahead of the update.
    fn write_through<F>(&self, db: &Shared, col: &SchemaColumn, value: Value, before: F) -> Result<()>
    where
        F: FnOnce(&mut Lease<'_>) -> Result<()>,
    {
        let slot = col.slot.ok_or_else(|| self.read_only(&col.name))?;
        let sql = self
            .0
            .table
            .statements()
            .update
            .get(&col.name)
            .ok_or_else(|| self.read_only(&col.name))?;

        // Writers on one record are serialized; readers wait for the commit.
        let mut state = self.0.state.write();
        if state.status == RecordStatus::Forgotten {
            return Err(self.stale());
        }
        let mut lease = db.pool.poll()?;
        before(&mut lease)?;
        let changed = lease.execute(sql, &[value.clone(), Value::Long(self.id())])?;
        if changed == 0 {
            return Err(Error::NotFound {
                table: self.table_name().to_string(),
                id: self.id(),
            });
        }
        lease.release()?;
        state.fields[slot] = Some(value);
        Ok(())
    }

    fn write_forward(&self, db: &Shared, col: &SchemaColumn, target: Option<i64>) -> Result<()> {
        let related = db.table(col.related.as_deref().unwrap_or_default())?;
        match target {
            None if !col.nullable => Err(Error::TypeMismatch {
                column: col.name.clone(),
                expected: format!("{} (required link)", related.name()),
                found: "null".to_string(),
            }),
            None => self.write_through(db, col, Value::Null, |_| Ok(())),
            Some(id) => self.write_through(db, col, Value::Long(id), |lease| {
                let exists = lease.query_row(&related.statements().exists, &[Value::Long(id)])?;
                match exists {
                    Some(_) => Ok(()),
                    None => Err(Error::NotFound {
                        table: related.name().to_string(),
                        id,
                    }),
                }
            }),
        }
    }

    /// Point a one-to-one or many-to-one link at `target`, or clear it.
    pub fn set_link(&self, column: &str, target: Option<&Record>) -> Result<()> {
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        if !col.kind.is_link() {
            return Err(SchemaError::InvalidLink {
                table: self.table_name().to_string(),
                column: column.to_string(),
                reason: "not a link column".to_string(),
            }
            .into());
        }
        let related = col.related.as_deref().unwrap_or_default();
        if let Some(target) = target {
            if target.table_name() != related {
                return Err(Error::TypeMismatch {
                    column: column.to_string(),
                    expected: related.to_string(),
                    found: target.table_name().to_string(),
                });
            }
            target.check(&db)?;
        }

        match (col.kind, col.mapped_by.as_deref()) {
            (ColumnKind::LinkOneToMany, _) => Err(self.read_only(column)),
            (ColumnKind::LinkOneToOne, Some(mapped_by)) => self.set_mapped(&db, related, mapped_by, target),
            _ => self.write_forward(&db, col, target.map(Record::id)),
        }
    }

    /// Move the inverse side of a one-to-one link: clear the foreign key of
    /// the current holder, then point the target's at this record.
    fn set_mapped(&self, db: &Shared, related: &str, mapped_by: &str, target: Option<&Record>) -> Result<()> {
        let related = db.table(related)?;
        let fk = related.column(mapped_by)?;
        let fk_slot = fk.slot.ok_or_else(|| self.read_only(mapped_by))?;
        let stmts = related.link_statements(mapped_by)?;
        let update = related
            .statements()
            .update
            .get(mapped_by)
            .ok_or_else(|| self.read_only(mapped_by))?;
        let me = Value::Long(self.id());

        let mut lease = db.pool.poll()?;
        let previous = ids_of(lease.query(&stmts.select_ids, &[me.clone()])?);
        let target_id = target.map(Record::id);
        if !fk.nullable {
            if let Some(&holder) = previous.iter().find(|&&id| Some(id) != target_id) {
                debug!("{}#{} would lose its required link", related.name(), holder);
                return Err(Error::StillReferenced {
                    table: self.table_name().to_string(),
                    id: self.id(),
                    referrer: related.name().to_string(),
                    column: mapped_by.to_string(),
                });
            }
        }
        lease.execute(&stmts.remove, &[me.clone()])?;
        if let Some(id) = target_id {
            let changed = lease.execute(update, &[me.clone(), Value::Long(id)])?;
            if changed == 0 {
                return Err(Error::NotFound {
                    table: related.name().to_string(),
                    id,
                });
            }
        }
        lease.release()?;

        let cache = db.cache(related.name());
        for id in previous {
            if let Some(holder) = cache.peek(id) {
                holder.apply(fk_slot, Value::Null);
            }
        }
        if let Some(target) = target {
            target.apply(fk_slot, me);
        }
        Ok(())
    }

    /// Resolve a one-to-one or many-to-one link.
    pub fn link(&self, column: &str) -> Result<Option<Record>> {
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        let related = db.table(col.related.as_deref().unwrap_or_default())?;
        match (col.kind, col.mapped_by.as_deref()) {
            (ColumnKind::LinkManyToOne, _) | (ColumnKind::LinkOneToOne, None) => {
                match self.get(column)?.as_i64() {
                    Some(id) => db.fetch(&related, id).map(Some),
                    None => Ok(None),
                }
            }
            (ColumnKind::LinkOneToOne, Some(mapped_by)) => {
                let stmts = related.link_statements(mapped_by)?;
                let ids = {
                    let mut lease = db.pool.poll()?;
                    let rows = lease.query(&stmts.select_ids, &[Value::Long(self.id())])?;
                    lease.release()?;
                    ids_of(rows)
                };
                match ids.first() {
                    Some(&id) => db.fetch(&related, id).map(Some),
                    None => Ok(None),
                }
            }
            _ => Err(SchemaError::InvalidLink {
                table: self.table_name().to_string(),
                column: column.to_string(),
                reason: "not a single-valued link; use links()".to_string(),
            }
            .into()),
        }
    }

    /// The windowed collection behind a one-to-many link.
    pub fn links(&self, column: &str) -> Result<LinkedSet> {
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        match (col.kind, col.mapped_by.as_deref()) {
            (ColumnKind::LinkOneToMany, Some(mapped_by)) => {
                let related = db.table(col.related.as_deref().unwrap_or_default())?;
                Ok(LinkedSet::new(&db, self.clone(), related, mapped_by.to_string()))
            }
            _ => Err(SchemaError::InvalidLink {
                table: self.table_name().to_string(),
                column: column.to_string(),
                reason: "not a one-to-many link".to_string(),
            }
            .into()),
        }
    }

    /// Large object held by a stream column.
    pub fn lob(&self, column: &str) -> Result<Option<LargeObject>> {
        self.get_as::<Option<LargeObject>>(column)
    }

    /// Attach `lob` to a stream column (or clear it), adjusting reference
    /// counts in the same transaction. A blob left without references is
    /// erased once the change commits.
    pub fn set_lob(&self, column: &str, lob: Option<&LargeObject>) -> Result<()> {
        let db = self.live()?;
        let col = self.0.table.column(column)?;
        if col.kind != ColumnKind::Stream {
            return Err(Error::TypeMismatch {
                column: column.to_string(),
                expected: col.kind.to_string(),
                found: "lob".to_string(),
            });
        }
        self.write_lob(&db, col, lob)
    }

    fn write_lob(&self, db: &Shared, col: &SchemaColumn, lob: Option<&LargeObject>) -> Result<()> {
        let slot = col.slot.ok_or_else(|| self.read_only(&col.name))?;
        let table = &self.0.table;
        let update = table
            .statements()
            .update
            .get(&col.name)
            .ok_or_else(|| self.read_only(&col.name))?;
        let owner = table.name();
        let id = self.id();

        let mut state = self.0.state.write();
        if state.status == RecordStatus::Forgotten {
            return Err(self.stale());
        }
        let mut lease = db.pool.poll()?;
        let old = match &state.fields[slot] {
            Some(Value::Lob(old)) => Some(old.id()),
            Some(_) => None,
            None => {
                let sql = format!(
                    "SELECT {} FROM {} WHERE {} = ?",
                    quote(&col.name),
                    quote(owner),
                    quote(&table.id_column().name)
                );
                lease.query_i64(&sql, &[Value::Long(id)])?.map(LobId::from_i64)
            }
        };
        let new = lob.map(LargeObject::id);
        if old == new {
            lease.release()?;
            state.fields[slot] = Some(Value::from(lob));
            return Ok(());
        }

        if let Some(new) = new {
            db.lobs.add_ref(&mut lease, new, owner, id)?;
        }
        let value = Value::from(lob);
        if lease.execute(update, &[value.clone(), Value::Long(id)])? == 0 {
            return Err(Error::NotFound {
                table: owner.to_string(),
                id,
            });
        }
        let mut pending = None;
        if let Some(old) = old {
            if db.lobs.del_ref(&mut lease, old, owner, id)? {
                pending = Some(db.lobs.begin_deletion(old)?);
            }
        }
        if let Err(e) = lease.release() {
            if let Some(pending) = pending {
                if let Err(journal_err) = db.lobs.abandon_deletion(pending) {
                    warn!("could not clear journaled deletion: {}", journal_err);
                }
            }
            return Err(e);
        }
        if let Some(pending) = pending {
            if let Err(e) = db.lobs.complete_deletion(pending) {
                warn!("deferred erase of large object {}: {}", pending.id, e);
            }
        }
        state.fields[slot] = Some(value);
        Ok(())
    }

    /// Delete this record. See [`Database::forget`](crate::Database::forget).
    pub fn forget(&self) -> Result<()> {
        let db = self.live()?;
        forget::forget(&db, self)
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        Record::ptr_eq(self, other)
    }
}

impl Eq for Record {}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Record")
            .field("table", &self.table_name())
            .field("id", &self.id())
            .field("status", &self.0.state.read().status)
            .finish()
    }
}

impl std::fmt::Display for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.table_name(), self.id())
    }
}

impl From<&Record> for Value {
    fn from(record: &Record) -> Self {
        Value::Long(record.id())
    }
}

/// First-column integers of a result set.
pub(crate) fn ids_of(rows: Vec<Row>) -> Vec<i64> {
    rows.into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(SqlValue::Integer(id)) => Some(id),
            _ => None,
        })
        .collect()
}

/// The id in a select-list row.
pub(crate) fn row_id(table: &SchemaTable, row: &Row) -> Result<i64> {
    let slot = table.id_column().slot.unwrap_or(0);
    match row.get(slot) {
        Some(SqlValue::Integer(id)) => Ok(*id),
        other => Err(StorageError::Decode {
            column: format!("{}.{}", table.name(), table.id_column().name),
            reason: format!("expected integer id, found {:?}", other.map(SqlValue::data_type)),
        }
        .into()),
    }
}

/// Decode a select-list row into slot values.
pub(crate) fn decode_row(lobs: &LobStore, table: &SchemaTable, row: Row) -> Result<Vec<Value>> {
    if row.len() != table.selectable_len() {
        return Err(StorageError::Decode {
            column: table.name().to_string(),
            reason: format!("expected {} columns, found {}", table.selectable_len(), row.len()),
        }
        .into());
    }
    table
        .selectable()
        .zip(row)
        .map(|(col, raw)| match col.kind {
            ColumnKind::Leaf => Value::from_sql(&col.name, col.ty, raw),
            _ => match raw {
                SqlValue::Null => Ok(Value::Null),
                SqlValue::Integer(v) => Ok(match col.kind {
                    ColumnKind::Stream => Value::Lob(lobs.handle(LobId::from_i64(v))),
                    _ => Value::Long(v),
                }),
                other => Err(StorageError::Decode {
                    column: col.name.clone(),
                    reason: format!("expected integer, found {:?}", other.data_type()),
                }
                .into()),
            },
        })
        .collect()
}
