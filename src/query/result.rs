//! Query builder and windowed results

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::compiler::{compile, Catalog, CompiledQuery};
use super::expr::{Direction, Expr};
use super::window::{PageSource, Window};
use crate::database::Shared;
use crate::record::record::ids_of;
use crate::record::Record;
use crate::schema::SchemaTable;
use crate::value::Value;
use crate::{Error, Result};

/// Builds a query over one record type. Nothing touches storage until the
/// built result is read.
pub struct QueryBuilder {
    db: Weak<Shared>,
    table: Arc<SchemaTable>,
    filter: Option<Expr>,
    order: Vec<(String, Direction)>,
    descending: bool,
    scale: usize,
}

impl QueryBuilder {
    pub(crate) fn new(db: &Arc<Shared>, table: Arc<SchemaTable>) -> Self {
        Self {
            db: Arc::downgrade(db),
            table,
            filter: None,
            order: Vec::new(),
            descending: false,
            scale: db.config.fetch_scale,
        }
    }

    /// Add a filter; repeated calls are combined with `AND`.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Add an order key. The id is always the last key.
    pub fn order_by(mut self, path: impl Into<String>, direction: Direction) -> Self {
        self.order.push((path.into(), direction));
        self
    }

    /// Order the id tie-break descending.
    pub fn descending(mut self, descending: bool) -> Self {
        self.descending = descending;
        self
    }

    /// Rows per window fetch.
    pub fn fetch_scale(mut self, scale: usize) -> Self {
        self.scale = scale.max(1);
        self
    }

    pub fn build(self) -> Result<QueryResult> {
        let db = self.db.upgrade().ok_or(Error::Closed)?;
        db.check_open()?;
        let catalog: Catalog = db
            .registry
            .read()
            .tables()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();
        let compiled = compile(&catalog, &self.table, self.filter.as_ref(), &self.order, self.descending)?;
        debug!("compiled query: {}", compiled.select_sql);
        Ok(QueryResult {
            db: self.db,
            table: self.table,
            compiled,
            bindings: HashMap::new(),
            window: Mutex::new(Window::new(self.scale)),
        })
    }
}

/// A compiled query read through a sliding window.
pub struct QueryResult {
    db: Weak<Shared>,
    table: Arc<SchemaTable>,
    compiled: CompiledQuery,
    bindings: HashMap<String, Value>,
    window: Mutex<Window>,
}

struct Pages<'a> {
    db: &'a Arc<Shared>,
    result: &'a QueryResult,
}

impl PageSource for Pages<'_> {
    fn fetch_page(&self, first: usize, count: usize) -> Result<Vec<Record>> {
        let params = self.result.params()?;
        let rows = {
            let mut lease = self.db.pool.poll()?;
            let rows = lease.query_window(&self.result.compiled.select_sql, &params, first, count)?;
            lease.release()?;
            rows
        };
        self.db.materialize(&self.result.table, rows)
    }

    fn count(&self) -> Result<usize> {
        let params = self.result.params()?;
        let mut lease = self.db.pool.poll()?;
        let count = lease.query_i64(&self.result.compiled.count_sql, &params)?.unwrap_or(0);
        lease.release()?;
        Ok(count.max(0) as usize)
    }
}

impl QueryResult {
    fn live(&self) -> Result<Arc<Shared>> {
        let db = self.db.upgrade().ok_or(Error::Closed)?;
        db.check_open()?;
        Ok(db)
    }

    fn params(&self) -> Result<Vec<Value>> {
        self.compiled.bind(&self.bindings)
    }

    pub fn table(&self) -> &SchemaTable {
        &self.table
    }

    /// The generated statements.
    pub fn compiled(&self) -> &CompiledQuery {
        &self.compiled
    }

    /// Bind a named placeholder. Drops the cached window and size.
    pub fn bind(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        if !self.compiled.param_names().contains(&name) {
            return Err(Error::InvalidQuery(format!("query has no parameter {:?}", name)));
        }
        self.bindings.insert(name.to_string(), value.into());
        self.window.get_mut().invalidate();
        Ok(self)
    }

    pub fn len(&self) -> Result<usize> {
        let db = self.live()?;
        let mut window = self.window.lock();
        window.len(&Pages { db: &db, result: self })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Record at `index`, or `None` past the end.
    pub fn get(&self, index: usize) -> Result<Option<Record>> {
        let db = self.live()?;
        let mut window = self.window.lock();
        window.get(&Pages { db: &db, result: self }, index)
    }

    /// Number of backing page fetches so far
    pub fn fetch_count(&self) -> u64 {
        self.window.lock().fetch_count()
    }

    /// Ids at `offset .. offset + limit`, read directly without the window.
    pub fn ids_in_range(&self, offset: usize, limit: usize) -> Result<Vec<i64>> {
        let db = self.live()?;
        let params = self.params()?;
        let mut lease = db.pool.poll()?;
        let rows = lease.query_window(&self.compiled.ids_sql, &params, offset, limit)?;
        lease.release()?;
        Ok(ids_of(rows))
    }

    pub fn iter(&self) -> ResultIter<'_> {
        ResultIter {
            result: self,
            next: 0,
            done: false,
        }
    }

    pub fn into_cursor(self) -> Cursor {
        Cursor {
            result: self,
            next: 0,
            done: false,
        }
    }
}

impl std::fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult")
            .field("table", &self.table.name())
            .field("select", &self.compiled.select_sql)
            .field("bindings", &self.bindings)
            .finish()
    }
}

fn step(result: &QueryResult, next: &mut usize, done: &mut bool) -> Option<Result<Record>> {
    if *done {
        return None;
    }
    match result.get(*next) {
        Ok(Some(record)) => {
            *next += 1;
            Some(Ok(record))
        }
        Ok(None) => {
            *done = true;
            None
        }
        Err(e) => {
            *done = true;
            Some(Err(e))
        }
    }
}

/// Borrowing iterator over a [`QueryResult`].
pub struct ResultIter<'a> {
    result: &'a QueryResult,
    next: usize,
    done: bool,
}

impl Iterator for ResultIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        step(self.result, &mut self.next, &mut self.done)
    }
}

/// Forward-only, finite cursor returned by search. Restart by searching
/// again.
pub struct Cursor {
    result: QueryResult,
    next: usize,
    done: bool,
}

impl Cursor {
    /// Records yielded so far
    pub fn position(&self) -> usize {
        self.next
    }
}

impl Iterator for Cursor {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        step(&self.result, &mut self.next, &mut self.done)
    }
}
