//! Typed access over records
//!
//! An [`Entity`] is a hand-written struct wrapping a [`Record`] and exposing
//! typed getters and setters that call the write-through path. A
//! [`Repository`] offers the collaborator surface for one entity type.
//!
//! ```no_run
//! use holdfast::{ColumnDef, Database, Entity, FieldType, Record, Result, TableDef};
//!
//! static WIDGET: TableDef = TableDef::new("Widget", &[
//!     ColumnDef::id("id"),
//!     ColumnDef::leaf("name", FieldType::TEXT),
//! ]);
//!
//! struct Widget(Record);
//!
//! impl Entity for Widget {
//!     fn table() -> &'static TableDef { &WIDGET }
//!     fn from_record(record: Record) -> Self { Widget(record) }
//!     fn record(&self) -> &Record { &self.0 }
//! }
//!
//! impl Widget {
//!     fn name(&self) -> Result<Option<String>> { self.0.get_as("name") }
//!     fn set_name(&self, name: &str) -> Result<()> { self.0.set("name", name) }
//! }
//!
//! # fn demo(db: &Database) -> Result<()> {
//! db.register::<Widget>()?;
//! let w: Widget = db.create()?;
//! w.set_name("a")?;
//! # Ok(()) }
//! ```

use std::marker::PhantomData;

use super::record::Record;
use crate::database::Database;
use crate::query::{Cursor, Expr, QueryBuilder};
use crate::schema::TableDef;
use crate::Result;

/// A typed wrapper over the records of one descriptor.
pub trait Entity: Sized + 'static {
    fn table() -> &'static TableDef;

    fn from_record(record: Record) -> Self;

    fn record(&self) -> &Record;

    fn id(&self) -> i64 {
        self.record().id()
    }
}

/// Create/fetch/forget/search for one entity type.
pub struct Repository<'db, T: Entity> {
    db: &'db Database,
    _marker: PhantomData<fn() -> T>,
}

impl<'db, T: Entity> Repository<'db, T> {
    pub(crate) fn new(db: &'db Database) -> Self {
        Self {
            db,
            _marker: PhantomData,
        }
    }

    pub fn create(&self) -> Result<T> {
        self.db.create::<T>()
    }

    pub fn fetch(&self, id: i64) -> Result<T> {
        self.db.fetch_as::<T>(id)
    }

    pub fn forget(&self, entity: &T) -> Result<()> {
        self.db.forget(entity.record())
    }

    /// Ids matching `filter`, wrapped lazily.
    pub fn search(&self, filter: Expr, descending: bool) -> Result<impl Iterator<Item = Result<T>>> {
        let cursor: Cursor = self.db.search(T::table().name, filter, descending)?;
        Ok(cursor.map(|record| record.map(T::from_record)))
    }

    pub fn query(&self) -> Result<QueryBuilder> {
        self.db.query(T::table().name)
    }

    pub fn count(&self) -> Result<usize> {
        self.db.query(T::table().name)?.build()?.len()
    }
}
