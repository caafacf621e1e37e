//! Leased connection with a lazily opened transaction
//!
//! The first statement issued through a [`Lease`] opens an immediate
//! transaction; [`Lease::release`] commits it and hands the connection back to
//! the pool. Dropping a lease without releasing rolls the transaction back.
//!
//! Writes queued with [`Lease::batch`] and [`Lease::add_batch`] are deferred
//! until the next read, an explicit [`Lease::flush`], or release. Parameterized
//! statements are grouped by SQL text and executed in first-use order, each
//! group under its own savepoint.

use std::collections::HashMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use tracing::{trace, warn};

use super::pool::ConnectionPool;
use crate::error::StorageError;
use crate::value::Value;
use crate::{Error, Result};

/// One stored row, as raw SQLite values.
pub type Row = Vec<SqlValue>;

struct BatchGroup {
    sql: String,
    rows: Vec<Vec<SqlValue>>,
}

/// A connection borrowed from a [`ConnectionPool`].
pub struct Lease<'p> {
    pool: &'p ConnectionPool,
    conn: Option<Connection>,
    in_transaction: bool,
    valid: bool,
    scripts: Vec<String>,
    groups: Vec<BatchGroup>,
    group_index: HashMap<String, usize>,
    savepoints: u64,
}

impl<'p> Lease<'p> {
    pub(crate) fn new(pool: &'p ConnectionPool, conn: Connection) -> Self {
        Self {
            pool,
            conn: Some(conn),
            in_transaction: false,
            valid: true,
            scripts: Vec::new(),
            groups: Vec::new(),
            group_index: HashMap::new(),
            savepoints: 0,
        }
    }

    /// Whether the underlying connection is still trusted for reuse.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Mark the connection as unusable; it is discarded on return.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        let conn = self.conn.as_ref().ok_or(Error::Closed)?;
        if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
            self.valid = false;
            return Err(StorageError::sql("BEGIN IMMEDIATE", e).into());
        }
        self.in_transaction = true;
        Ok(())
    }

    /// Run `f` under a fresh savepoint. On failure the savepoint is rolled
    /// back, leaving earlier work in the transaction intact, and the lease
    /// is invalidated.
    fn guarded<T>(
        &mut self,
        label: &str,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> Result<T> {
        self.begin()?;
        self.savepoints += 1;
        let name = format!("hf_sp{}", self.savepoints);
        let conn = self.conn.as_ref().ok_or(Error::Closed)?;

        if let Err(e) = conn.execute_batch(&format!("SAVEPOINT {}", name)) {
            self.valid = false;
            return Err(StorageError::sql(label, e).into());
        }
        match f(conn) {
            Ok(value) => match conn.execute_batch(&format!("RELEASE {}", name)) {
                Ok(()) => Ok(value),
                Err(e) => {
                    self.valid = false;
                    Err(StorageError::sql(label, e).into())
                }
            },
            Err(e) => {
                if let Err(rollback) =
                    conn.execute_batch(&format!("ROLLBACK TO {0}; RELEASE {0}", name))
                {
                    warn!("failed to roll back savepoint {}: {}", name, rollback);
                }
                self.valid = false;
                Err(StorageError::sql(label, e).into())
            }
        }
    }

    /// Execute one parameterized write, returning the number of affected rows.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let params = encode(params)?;
        self.flush()?;
        trace!("execute: {}", sql);
        self.guarded(sql, |conn| {
            conn.prepare_cached(sql)?
                .execute(params_from_iter(params.iter()))
        })
    }

    /// Execute one or more non-parameterized statements immediately.
    pub fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.flush()?;
        trace!("execute batch: {}", sql);
        self.guarded(sql, |conn| conn.execute_batch(sql))
    }

    /// Queue a non-parameterized statement.
    pub fn batch(&mut self, sql: impl Into<String>) {
        self.scripts.push(sql.into());
    }

    /// Queue a parameterized statement. Statements with identical SQL text
    /// share one group.
    pub fn add_batch(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        let row = encode(params)?;
        match self.group_index.get(sql) {
            Some(&i) => self.groups[i].rows.push(row),
            None => {
                self.group_index.insert(sql.to_string(), self.groups.len());
                self.groups.push(BatchGroup {
                    sql: sql.to_string(),
                    rows: vec![row],
                });
            }
        }
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.scripts.is_empty() || !self.groups.is_empty()
    }

    /// Execute every queued statement.
    pub fn flush(&mut self) -> Result<()> {
        if !self.has_pending() {
            return Ok(());
        }
        let scripts = std::mem::take(&mut self.scripts);
        let groups = std::mem::take(&mut self.groups);
        self.group_index.clear();

        for script in scripts {
            self.guarded(&script, |conn| conn.execute_batch(&script))?;
        }
        for group in groups {
            trace!("flush batch of {} x {}", group.rows.len(), group.sql);
            self.guarded(&group.sql, |conn| {
                let mut stmt = conn.prepare_cached(&group.sql)?;
                for row in &group.rows {
                    stmt.execute(params_from_iter(row.iter()))?;
                }
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Run a query and collect every row.
    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let params = encode(params)?;
        self.query_raw(sql, params)
    }

    /// Run a query and return its first row, if any.
    pub fn query_row(&mut self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Run a query whose first column is an integer (counts, ids).
    pub fn query_i64(&mut self, sql: &str, params: &[Value]) -> Result<Option<i64>> {
        match self.query_row(sql, params)? {
            Some(row) => match row.into_iter().next() {
                Some(SqlValue::Integer(v)) => Ok(Some(v)),
                Some(SqlValue::Null) | None => Ok(None),
                Some(other) => Err(StorageError::Decode {
                    column: sql.to_string(),
                    reason: format!("expected integer, found {:?}", other.data_type()),
                }
                .into()),
            },
            None => Ok(None),
        }
    }

    /// Run a windowed query. `sql` must end with `LIMIT ? OFFSET ?`; the row
    /// count and the index of the first row are appended to `params`.
    pub fn query_window(
        &mut self,
        sql: &str,
        params: &[Value],
        first_row: usize,
        row_count: usize,
    ) -> Result<Vec<Row>> {
        let mut raw = encode(params)?;
        raw.push(SqlValue::Integer(row_count as i64));
        raw.push(SqlValue::Integer(first_row as i64));
        self.query_raw(sql, raw)
    }

    fn query_raw(&mut self, sql: &str, params: Vec<SqlValue>) -> Result<Vec<Row>> {
        self.flush()?;
        self.begin()?;
        trace!("query: {}", sql);
        let conn = self.conn.as_ref().ok_or(Error::Closed)?;
        let result = (|| {
            let mut stmt = conn.prepare_cached(sql)?;
            let width = stmt.column_count();
            let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
                (0..width).map(|i| row.get::<_, SqlValue>(i)).collect()
            })?;
            rows.collect::<rusqlite::Result<Vec<Row>>>()
        })();
        result.map_err(|e| {
            self.valid = false;
            StorageError::sql(sql, e).into()
        })
    }

    /// Rowid of the most recent successful insert on this connection.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        Ok(self.conn.as_ref().ok_or(Error::Closed)?.last_insert_rowid())
    }

    /// Commit any open transaction, then run `sql` in autocommit mode.
    /// Needed for statements such as `VACUUM` that refuse to run inside a
    /// transaction.
    pub fn execute_outside_transaction(&mut self, sql: &str) -> Result<()> {
        self.commit()?;
        let conn = self.conn.as_ref().ok_or(Error::Closed)?;
        conn.execute_batch(sql).map_err(|e| {
            self.valid = false;
            StorageError::sql(sql, e).into()
        })
    }

    /// Flush and commit without releasing the connection.
    pub fn commit(&mut self) -> Result<()> {
        self.flush()?;
        if !self.in_transaction {
            return Ok(());
        }
        let conn = self.conn.as_ref().ok_or(Error::Closed)?;
        match conn.execute_batch("COMMIT") {
            Ok(()) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                self.valid = false;
                Err(StorageError::sql("COMMIT", e).into())
            }
        }
    }

    fn rollback(&mut self) {
        self.scripts.clear();
        self.groups.clear();
        self.group_index.clear();
        if !self.in_transaction {
            return;
        }
        self.in_transaction = false;
        if let Some(conn) = self.conn.as_ref() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!("rollback failed: {}", e);
                self.valid = false;
            }
        }
    }

    fn give_back(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.restore(conn, self.valid);
        }
    }

    /// Flush, commit and return the connection to the pool. On failure the
    /// transaction is rolled back and the connection discarded.
    pub fn release(mut self) -> Result<()> {
        let result = self.commit();
        if result.is_err() {
            self.rollback();
            self.valid = false;
        }
        self.give_back();
        result
    }

    /// Discard queued statements, roll back and return the connection.
    pub fn release_rollback(mut self) -> Result<()> {
        self.rollback();
        self.give_back();
        Ok(())
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if self.conn.is_some() {
            self.rollback();
            self.give_back();
        }
    }
}

fn encode(params: &[Value]) -> Result<Vec<SqlValue>> {
    params.iter().map(Value::to_sql).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pool::PoolConfig;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConnectionPool) {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("lease.db"), PoolConfig::new()).unwrap();
        let mut lease = pool.poll().unwrap();
        lease
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT)")
            .unwrap();
        lease.release().unwrap();
        (dir, pool)
    }

    fn count(pool: &ConnectionPool) -> i64 {
        let mut lease = pool.poll().unwrap();
        let n = lease.query_i64("SELECT COUNT(*) FROM t", &[]).unwrap().unwrap();
        lease.release().unwrap();
        n
    }

    #[test]
    fn test_release_commits() {
        let (_dir, pool) = setup();
        let mut lease = pool.poll().unwrap();
        lease.execute("INSERT INTO t (v) VALUES (?)", &["a".into()]).unwrap();
        assert!(lease.last_insert_rowid().unwrap() > 0);
        lease.release().unwrap();
        assert_eq!(count(&pool), 1);
    }

    #[test]
    fn test_drop_rolls_back() {
        let (_dir, pool) = setup();
        {
            let mut lease = pool.poll().unwrap();
            lease.execute("INSERT INTO t (v) VALUES (?)", &["a".into()]).unwrap();
        }
        assert_eq!(count(&pool), 0);
    }

    #[test]
    fn test_batches_flush_before_reads() {
        let (_dir, pool) = setup();
        let mut lease = pool.poll().unwrap();
        for v in ["a", "b", "c"] {
            lease.add_batch("INSERT INTO t (v) VALUES (?)", &[v.into()]).unwrap();
        }
        lease.batch("INSERT INTO t (v) VALUES ('d')");
        assert!(lease.has_pending());
        let n = lease.query_i64("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(n, Some(4));
        lease.release().unwrap();
    }

    #[test]
    fn test_failed_statement_invalidates_lease() {
        let (_dir, pool) = setup();
        let mut lease = pool.poll().unwrap();
        lease.execute("INSERT INTO t (v) VALUES (?)", &["kept".into()]).unwrap();
        assert!(lease.execute("INSERT INTO missing (v) VALUES (?)", &["x".into()]).is_err());
        assert!(!lease.is_valid());
        // The savepoint rollback leaves earlier work intact.
        assert_eq!(lease.query_i64("SELECT COUNT(*) FROM t", &[]).unwrap(), Some(1));
        lease.release().unwrap();
        assert_eq!(pool.stats().discarded, 1);
    }

    #[test]
    fn test_query_window_appends_limit_and_offset() {
        let (_dir, pool) = setup();
        let mut lease = pool.poll().unwrap();
        for i in 0..10 {
            lease
                .add_batch("INSERT INTO t (v) VALUES (?)", &[format!("v{}", i).into()])
                .unwrap();
        }
        let rows = lease
            .query_window("SELECT v FROM t ORDER BY id LIMIT ? OFFSET ?", &[], 3, 2)
            .unwrap();
        assert_eq!(
            rows,
            vec![
                vec![SqlValue::Text("v3".into())],
                vec![SqlValue::Text("v4".into())]
            ]
        );
        lease.release_rollback().unwrap();
        assert_eq!(count(&pool), 0);
    }
}
