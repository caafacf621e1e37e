//! One-to-many collections
//!
//! A [`LinkedSet`] is the many side of a one-to-many link seen from the
//! owner. Membership lives in the children's foreign key, so the set never
//! holds the collection: it pages through it with the same sliding window
//! query results use, and every mutation invalidates the window.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::record::{ids_of, Record};
use crate::database::Shared;
use crate::error::StorageError;
use crate::query::window::{PageSource, Window};
use crate::schema::table::quote;
use crate::schema::SchemaTable;
use crate::value::Value;
use crate::{Error, Result};

pub struct LinkedSet {
    db: Weak<Shared>,
    owner: Record,
    related: Arc<SchemaTable>,
    /// Foreign key column in the related table
    column: String,
    window: Mutex<Window>,
}

struct Pages<'a> {
    db: &'a Arc<Shared>,
    set: &'a LinkedSet,
}

impl PageSource for Pages<'_> {
    fn fetch_page(&self, first: usize, count: usize) -> Result<Vec<Record>> {
        let stmts = self.set.related.link_statements(&self.set.column)?;
        let rows = {
            let mut lease = self.db.pool.poll()?;
            let rows = lease.query_window(&stmts.select_window, &[self.set.owner_id()], first, count)?;
            lease.release()?;
            rows
        };
        self.db.materialize(&self.set.related, rows)
    }

    fn count(&self) -> Result<usize> {
        let stmts = self.set.related.link_statements(&self.set.column)?;
        let mut lease = self.db.pool.poll()?;
        let count = lease.query_i64(&stmts.count, &[self.set.owner_id()])?.unwrap_or(0);
        lease.release()?;
        Ok(count.max(0) as usize)
    }
}

impl LinkedSet {
    pub(crate) fn new(db: &Arc<Shared>, owner: Record, related: Arc<SchemaTable>, column: String) -> Self {
        Self {
            db: Arc::downgrade(db),
            owner,
            related,
            column,
            window: Mutex::new(Window::new(db.config.fetch_scale)),
        }
    }

    pub fn owner(&self) -> &Record {
        &self.owner
    }

    pub fn related(&self) -> &SchemaTable {
        &self.related
    }

    fn owner_id(&self) -> Value {
        Value::Long(self.owner.id())
    }

    fn live(&self) -> Result<Arc<Shared>> {
        let db = self.db.upgrade().ok_or(Error::Closed)?;
        db.check_open()?;
        self.owner.check(&db)?;
        Ok(db)
    }

    fn check_member_type(&self, child: &Record) -> Result<()> {
        if child.table_name() != self.related.name() {
            return Err(Error::TypeMismatch {
                column: self.column.clone(),
                expected: self.related.name().to_string(),
                found: child.table_name().to_string(),
            });
        }
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let db = self.live()?;
        let mut window = self.window.lock();
        window.len(&Pages { db: &db, set: self })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Member at `index` in id order.
    pub fn get(&self, index: usize) -> Result<Option<Record>> {
        let db = self.live()?;
        let mut window = self.window.lock();
        window.get(&Pages { db: &db, set: self }, index)
    }

    pub fn iter(&self) -> LinkedIter<'_> {
        LinkedIter {
            set: self,
            next: 0,
            done: false,
        }
    }

    /// Number of page fetches so far
    pub fn fetch_count(&self) -> u64 {
        self.window.lock().fetch_count()
    }

    pub fn contains(&self, child: &Record) -> Result<bool> {
        let db = self.live()?;
        if child.table_name() != self.related.name() {
            return Ok(false);
        }
        let stmts = self.related.link_statements(&self.column)?;
        let mut lease = db.pool.poll()?;
        let found = lease.query_row(&stmts.contains, &[self.owner_id(), Value::Long(child.id())])?;
        lease.release()?;
        Ok(found.is_some())
    }

    /// Point `child` at the owner.
    pub fn add(&self, child: &Record) -> Result<()> {
        self.live()?;
        self.check_member_type(child)?;
        child.set_link(&self.column, Some(&self.owner))?;
        self.window.lock().invalidate();
        Ok(())
    }

    /// Point every child at the owner with one bulk statement. Fails with
    /// [`Error::NotFound`] and attaches nothing when a child's row is gone.
    /// Returns the number of distinct children attached.
    pub fn add_all(&self, children: &[Record]) -> Result<usize> {
        let db = self.live()?;
        for child in children {
            self.check_member_type(child)?;
            child.check(&db)?;
        }
        let mut distinct: Vec<&Record> = children.iter().collect();
        distinct.sort_by_key(|child| child.id());
        distinct.dedup_by(|a, b| Record::ptr_eq(a, b));
        let mut ids: Vec<i64> = distinct.iter().map(|child| child.id()).collect();
        ids.dedup();

        // Id order keeps concurrent bulk attaches from deadlocking.
        let mut guards: Vec<_> = distinct.iter().map(|child| child.lock_fields()).collect();
        if let Some(pos) = guards.iter().position(|g| g.is_forgotten()) {
            return Err(distinct[pos].stale());
        }

        let list = Value::Text(serde_json::to_string(&ids).map_err(|e| StorageError::Decode {
            column: self.column.clone(),
            reason: e.to_string(),
        })?);
        let stmts = self.related.link_statements(&self.column)?;
        let mut lease = db.pool.poll()?;
        let changed = lease.execute(&stmts.attach, &[self.owner_id(), list.clone()])?;
        if changed != ids.len() {
            let present = ids_of(lease.query(&self.existing_ids_sql(), &[list])?);
            let missing = ids.iter().copied().find(|id| !present.contains(id)).unwrap_or_default();
            return Err(Error::NotFound {
                table: self.related.name().to_string(),
                id: missing,
            });
        }
        lease.release()?;

        if let Some(slot) = self.related.column(&self.column)?.slot {
            for guard in &mut guards {
                guard.apply(slot, self.owner_id());
            }
        }
        drop(guards);
        self.window.lock().invalidate();
        Ok(changed)
    }

    fn existing_ids_sql(&self) -> String {
        let id = quote(&self.related.id_column().name);
        format!(
            "SELECT {} FROM {} WHERE {} IN (SELECT value FROM json_each(?))",
            id,
            quote(self.related.name()),
            id
        )
    }

    /// Detach `child` from the owner. Returns whether it was a member.
    pub fn remove(&self, child: &Record) -> Result<bool> {
        if !self.contains(child)? {
            return Ok(false);
        }
        child.set_link(&self.column, None)?;
        self.window.lock().invalidate();
        Ok(true)
    }

    /// Detach every member. Fails when the link is required.
    pub fn clear(&self) -> Result<usize> {
        let db = self.live()?;
        let fk = self.related.column(&self.column)?;
        let stmts = self.related.link_statements(&self.column)?;
        let members = {
            let mut lease = db.pool.poll()?;
            let members = ids_of(lease.query(&stmts.select_ids, &[self.owner_id()])?);
            if !fk.nullable && !members.is_empty() {
                return Err(Error::StillReferenced {
                    table: self.owner.table_name().to_string(),
                    id: self.owner.id(),
                    referrer: self.related.name().to_string(),
                    column: self.column.clone(),
                });
            }
            lease.execute(&stmts.remove, &[self.owner_id()])?;
            lease.release()?;
            members
        };

        if let Some(slot) = fk.slot {
            let cache = db.cache(self.related.name());
            for id in &members {
                if let Some(child) = cache.peek(*id) {
                    child.apply(slot, Value::Null);
                }
            }
        }
        self.window.lock().invalidate();
        Ok(members.len())
    }
}

impl std::fmt::Debug for LinkedSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedSet")
            .field("owner", &self.owner)
            .field("related", &self.related.name())
            .field("column", &self.column)
            .finish()
    }
}

/// Forward iterator over a [`LinkedSet`].
pub struct LinkedIter<'a> {
    set: &'a LinkedSet,
    next: usize,
    done: bool,
}

impl Iterator for LinkedIter<'_> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.set.get(self.next) {
            Ok(Some(record)) => {
                self.next += 1;
                Some(Ok(record))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
