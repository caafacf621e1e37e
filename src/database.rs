//! Database facade
//!
//! [`Database`] owns the connection pool, the schema registry, the per-type
//! identity caches and the large-object store. Records keep a weak handle to
//! the shared state, so dropping the database makes every outstanding record
//! report [`Error::Closed`].
//!
//! Lock order, outermost first: registry, cache map, one cache, a pooled
//! lease. A record's state lock may be held while taking a lease. Leases are
//! released before records are materialized into a cache.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::types::Value as SqlValue;
use tracing::{debug, info, warn};

use crate::config::{self, HoldfastConfig};
use crate::error::StorageError;
use crate::lob::{LargeObject, LobId, LobStore, RecoveryReport};
use crate::maintenance::{self, CompactionMarker, CompactionReport, Compactor};
use crate::query::{Cursor, Expr, QueryBuilder};
use crate::record::cache::CacheStats;
use crate::record::record::row_id;
use crate::record::{Entity, IdentityCache, Record, Repository};
use crate::schema::table::quote;
use crate::schema::{validate_name, SchemaRegistry, SchemaTable, TableDef};
use crate::storage::{ConnectionPool, PoolStats, Row};
use crate::value::Value;
use crate::{Error, Result};

const USER_TABLES: &str =
    "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name";

/// State shared between the facade, its records and the background
/// compactor.
pub(crate) struct Shared {
    pub(crate) config: HoldfastConfig,
    pub(crate) root: PathBuf,
    pub(crate) pool: ConnectionPool,
    pub(crate) lobs: LobStore,
    pub(crate) registry: RwLock<SchemaRegistry>,
    caches: RwLock<HashMap<String, Arc<IdentityCache>>>,
    epoch: AtomicU64,
    closed: AtomicBool,
    marker: Mutex<CompactionMarker>,
}

impl Shared {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Bumped by erase; records from an older epoch are stale.
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn table(&self, name: &str) -> Result<Arc<SchemaTable>> {
        Ok(self.registry.read().get(name)?)
    }

    /// Identity cache for a table, created on first use.
    pub(crate) fn cache(&self, name: &str) -> Arc<IdentityCache> {
        if let Some(cache) = self.caches.read().get(name) {
            return Arc::clone(cache);
        }
        let mut caches = self.caches.write();
        Arc::clone(
            caches
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(IdentityCache::new(self.config.cache_capacity))),
        )
    }

    /// The cached representative for `id`, loading it when absent.
    pub(crate) fn fetch(self: &Arc<Self>, table: &Arc<SchemaTable>, id: i64) -> Result<Record> {
        self.check_open()?;
        let cache = self.cache(table.name());
        let record = cache.get_or_load(id, || {
            let row = {
                let mut lease = self.pool.poll()?;
                let row = lease.query_row(&table.statements().select_by_id, &[Value::Long(id)])?;
                lease.release()?;
                row
            };
            row.map(|row| Record::from_row(self, Arc::clone(table), row)).transpose()
        })?;
        record.ok_or_else(|| Error::NotFound {
            table: table.name().to_string(),
            id,
        })
    }

    /// Representatives for rows already read; cached ones win over the row.
    pub(crate) fn materialize(self: &Arc<Self>, table: &Arc<SchemaTable>, rows: Vec<Row>) -> Result<Vec<Record>> {
        let cache = self.cache(table.name());
        rows.into_iter()
            .map(|row| {
                let id = row_id(table, &row)?;
                cache.get_or_insert_with(id, || Record::from_row(self, Arc::clone(table), row))
            })
            .collect()
    }

    /// Compact when the interval has elapsed, or unconditionally if forced.
    pub(crate) fn compact(&self, force: bool) -> Result<Option<CompactionReport>> {
        self.check_open()?;
        let mut marker = self.marker.lock();
        if !marker.is_due(self.config.compaction_interval_days, force) {
            return Ok(None);
        }
        let report = maintenance::compact(&self.pool)?;
        marker.touch()?;
        Ok(Some(report))
    }
}

/// Row counts and blob totals for one database.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub tables: Vec<(String, i64)>,
    pub lob_files: usize,
    pub referenced_lobs: i64,
    pub pending_deletions: usize,
    pub pool: PoolStats,
}

impl fmt::Display for DbStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, rows) in &self.tables {
            writeln!(f, "{}: {} rows", name, rows)?;
        }
        writeln!(
            f,
            "large objects: {} files, {} referenced, {} pending deletion",
            self.lob_files, self.referenced_lobs, self.pending_deletions
        )?;
        write!(f, "pool: {}", self.pool)
    }
}

/// An open database directory.
pub struct Database {
    shared: Arc<Shared>,
    compactor: Mutex<Option<Compactor>>,
    recovery: RecoveryReport,
    opening_compaction: Option<CompactionReport>,
}

impl Database {
    /// Open (or create) the database under `root`: start the pool, replay
    /// the deletion journal, compact if due and start the background
    /// compactor when configured.
    pub fn open(root: impl AsRef<Path>, config: HoldfastConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let lob_dir = config::lob_dir(&root);
        std::fs::create_dir_all(&lob_dir).map_err(|e| StorageError::io(&lob_dir, e))?;

        let pool = ConnectionPool::open(&config::database_path(&root), config.pool_config())?;
        let lobs = LobStore::open(&lob_dir, &config::journal_path(&root))?;
        let recovery = {
            let mut lease = pool.poll()?;
            lobs.ensure_schema(&mut lease)?;
            let report = lobs.recover(&mut lease)?;
            lease.release()?;
            report
        };
        let marker = CompactionMarker::load_or_create(&config::marker_path(&root))?;

        let shared = Arc::new(Shared {
            config,
            root,
            pool,
            lobs,
            registry: RwLock::new(SchemaRegistry::new()),
            caches: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            marker: Mutex::new(marker),
        });

        let opening_compaction = match shared.compact(shared.config.force_compaction) {
            Ok(report) => report,
            Err(e) => {
                warn!("compaction at open failed: {}", e);
                None
            }
        };
        let compactor = match shared.config.background_period() {
            Some(period) => Some(Compactor::start(Arc::downgrade(&shared), period)?),
            None => None,
        };
        info!("opened database at {}", shared.root.display());

        Ok(Self {
            shared,
            compactor: Mutex::new(compactor),
            recovery,
            opening_compaction,
        })
    }

    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    pub fn config(&self) -> &HoldfastConfig {
        &self.shared.config
    }

    /// Journal recovery performed when the database was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Compaction run by [`Database::open`] because one was due.
    pub fn compaction_at_open(&self) -> Option<CompactionReport> {
        self.opening_compaction
    }

    pub fn is_closed(&self) -> bool {
        self.shared.check_open().is_err()
    }

    /// Register an entity type and every type reachable through its links.
    pub fn register<T: Entity>(&self) -> Result<Arc<SchemaTable>> {
        let table = self.register_table(T::table())?;
        self.shared
            .registry
            .write()
            .bind_type(TypeId::of::<T>(), table.name());
        Ok(table)
    }

    /// Register a descriptor without a typed wrapper.
    pub fn register_table(&self, def: &'static TableDef) -> Result<Arc<SchemaTable>> {
        self.shared.check_open()?;
        let mut registry = self.shared.registry.write();
        let mut lease = self.shared.pool.poll()?;
        let (table, _reports) =
            registry.register(def, &mut lease, self.shared.config.drop_unknown_columns)?;
        lease.release()?;
        Ok(table)
    }

    pub fn table(&self, name: &str) -> Result<Arc<SchemaTable>> {
        self.shared.table(name)
    }

    /// Registered tables in registration order.
    pub fn tables(&self) -> Vec<Arc<SchemaTable>> {
        self.shared.registry.read().tables().cloned().collect()
    }

    fn table_for<T: Entity>(&self) -> Result<Arc<SchemaTable>> {
        let registry = self.shared.registry.read();
        match registry.by_type(TypeId::of::<T>()) {
            Some(table) => Ok(table),
            None => Ok(registry.get(T::table().name)?),
        }
    }

    /// Insert a row holding only defaults and return its representative.
    pub fn new_record(&self, name: &str) -> Result<Record> {
        self.shared.check_open()?;
        let table = self.shared.table(name)?;
        self.insert_bare(table)
    }

    fn insert_bare(&self, table: Arc<SchemaTable>) -> Result<Record> {
        let id = {
            let mut lease = self.shared.pool.poll()?;
            lease.execute(&table.statements().insert_bare, &[])?;
            let id = lease.last_insert_rowid()?;
            lease.release()?;
            id
        };
        debug!("created {}#{}", table.name(), id);
        let cache = self.shared.cache(table.name());
        let record = Record::new_bare(&self.shared, table, id);
        cache.insert(&record);
        Ok(record)
    }

    pub fn create<T: Entity>(&self) -> Result<T> {
        self.shared.check_open()?;
        let table = self.table_for::<T>()?;
        self.insert_bare(table).map(T::from_record)
    }

    /// The live representative of `name#id`.
    pub fn fetch(&self, name: &str, id: i64) -> Result<Record> {
        let table = self.shared.table(name)?;
        self.shared.fetch(&table, id)
    }

    pub fn fetch_as<T: Entity>(&self, id: i64) -> Result<T> {
        let table = self.table_for::<T>()?;
        self.shared.fetch(&table, id).map(T::from_record)
    }

    /// Delete a record, cascading along cascade links and nulling optional
    /// references to it.
    pub fn forget(&self, record: &Record) -> Result<()> {
        self.shared.check_open()?;
        if !record.belongs_to(&self.shared) {
            return Err(Error::StaleRecord {
                table: record.table_name().to_string(),
                id: record.id(),
            });
        }
        record.forget()
    }

    pub fn query(&self, name: &str) -> Result<QueryBuilder> {
        self.shared.check_open()?;
        let table = self.shared.table(name)?;
        Ok(QueryBuilder::new(&self.shared, table))
    }

    /// Forward-only cursor over the records of `name` matching `filter`,
    /// ordered by id.
    pub fn search(&self, name: &str, filter: Expr, descending: bool) -> Result<Cursor> {
        Ok(self
            .query(name)?
            .filter(filter)
            .descending(descending)
            .build()?
            .into_cursor())
    }

    pub fn repo<T: Entity>(&self) -> Repository<'_, T> {
        Repository::new(self)
    }

    /// A fresh, unreferenced large object. Attach it to a stream column or
    /// hand it back with [`Database::release_lob`].
    pub fn create_lob(&self) -> Result<LargeObject> {
        self.shared.check_open()?;
        self.shared.lobs.create()
    }

    /// Erase a large object nothing references. Returns false when it is
    /// still referenced.
    pub fn release_lob(&self, lob: &LargeObject) -> Result<bool> {
        self.shared.check_open()?;
        let mut lease = self.shared.pool.poll()?;
        let erased = self.shared.lobs.release(&mut lease, lob)?;
        lease.release()?;
        Ok(erased)
    }

    pub fn lob(&self, id: LobId) -> LargeObject {
        self.shared.lobs.handle(id)
    }

    /// Drop a record from its cache. Outstanding handles stay usable but a
    /// later fetch builds a new representative.
    pub fn evict(&self, name: &str, id: i64) -> bool {
        self.shared.cache(name).evict(id).is_some()
    }

    pub fn clear_cache(&self) {
        for cache in self.shared.caches.read().values() {
            cache.clear();
        }
    }

    pub fn cache_stats(&self, name: &str) -> CacheStats {
        self.shared.cache(name).stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Compact now if due, or regardless when `force` is set.
    pub fn compact(&self, force: bool) -> Result<Option<CompactionReport>> {
        self.shared.compact(force)
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.shared.check_open()?;
        let mut lease = self.shared.pool.poll()?;
        let mut tables = Vec::new();
        for name in user_tables(lease.query(USER_TABLES, &[])?) {
            let rows = lease
                .query_i64(&format!("SELECT COUNT(*) FROM {}", quote(&name)), &[])?
                .unwrap_or(0);
            tables.push((name, rows));
        }
        let referenced_lobs = self.shared.lobs.referenced_count(&mut lease)?;
        lease.release()?;
        Ok(DbStats {
            tables,
            lob_files: self.shared.lobs.list()?.len(),
            referenced_lobs,
            pending_deletions: self.shared.lobs.pending_count(),
            pool: self.shared.pool.stats(),
        })
    }

    /// Drop every stored table and blob, forget all registrations and make
    /// every outstanding record stale.
    pub fn erase(&self) -> Result<()> {
        self.shared.check_open()?;
        let mut registry = self.shared.registry.write();
        let mut caches = self.shared.caches.write();

        let mut lease = self.shared.pool.poll()?;
        let names = user_tables(lease.query(USER_TABLES, &[])?);
        for name in &names {
            lease.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(name)))?;
        }
        self.shared.lobs.ensure_schema(&mut lease)?;
        lease.release()?;
        let blobs = self.shared.lobs.erase_all()?;

        registry.clear();
        for cache in caches.values() {
            cache.clear();
        }
        caches.clear();
        self.shared.epoch.fetch_add(1, Ordering::AcqRel);
        info!("erased {} tables and {} large objects", names.len(), blobs);
        Ok(())
    }

    /// Flush pending deletions, close the pool and compact if due. Later
    /// calls are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(compactor) = self.compactor.lock().take() {
            compactor.stop();
        }
        if let Err(e) = self.shared.lobs.flush_pending() {
            warn!("pending large-object deletions not flushed: {}", e);
        }
        self.shared.pool.close();

        let config = &self.shared.config;
        let mut marker = self.shared.marker.lock();
        if config.compact_on_close && marker.is_due(config.compaction_interval_days, config.force_compaction) {
            let conn = self.shared.pool.open_standalone()?;
            conn.execute_batch("VACUUM; PRAGMA wal_checkpoint(TRUNCATE);")
                .map_err(|e| StorageError::sql("VACUUM", e))?;
            marker.touch()?;
            info!("compacted {} on close", self.shared.root.display());
        }
        debug!("closed database at {}", self.shared.root.display());
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("error closing database: {}", e);
        }
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("root", &self.shared.root)
            .field("tables", &self.shared.registry.read().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Table names from a `sqlite_master` listing that are safe to quote.
fn user_tables(rows: Vec<Row>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(SqlValue::Text(name)) if validate_name(&name).is_ok() => Some(name),
            _ => None,
        })
        .collect()
}
