//! Per-type identity cache
//!
//! Two layers: an identity map of weak references guaranteeing at most one
//! live representative per id, and a bounded LRU of strong references that
//! keeps recently used records alive when no caller holds them. A record
//! evicted from the LRU stays identical for as long as any caller holds it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::record::{Record, RecordCell};
use crate::Result;

/// Bounded least-recently-used set of strong references, ordered by a
/// monotonically increasing access tick.
struct Lru {
    capacity: usize,
    tick: u64,
    entries: HashMap<i64, (u64, Record)>,
    order: BTreeMap<u64, i64>,
}

impl Lru {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn touch(&mut self, record: &Record) {
        if self.capacity == 0 {
            return;
        }
        self.tick += 1;
        let id = record.id();
        if let Some((old_tick, _)) = self.entries.insert(id, (self.tick, record.clone())) {
            self.order.remove(&old_tick);
        }
        self.order.insert(self.tick, id);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, id: i64) {
        if let Some((tick, _)) = self.entries.remove(&id) {
            self.order.remove(&tick);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct CacheInner {
    live: HashMap<i64, Weak<RecordCell>>,
    lru: Lru,
    hits: u64,
    misses: u64,
}

impl CacheInner {
    fn lookup(&mut self, id: i64) -> Option<Record> {
        let record = self.live.get(&id).and_then(Weak::upgrade).map(Record::from_cell)?;
        self.lru.touch(&record);
        Some(record)
    }

    fn insert(&mut self, record: &Record) {
        self.live.insert(record.id(), record.downgrade());
        self.lru.touch(record);
        // Drop identity entries whose records are gone.
        if self.live.len() > 2 * self.lru.capacity.max(64) {
            self.live.retain(|_, weak| weak.strong_count() > 0);
        }
    }
}

/// Cache counters for one type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub live: usize,
    pub retained: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Identity map and LRU for one record type.
pub struct IdentityCache {
    inner: Mutex<CacheInner>,
}

impl IdentityCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                live: HashMap::new(),
                lru: Lru::new(capacity),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Return the live representative for `id`, or run `load` and cache
    /// what it produces. The check, the load and the insert form one
    /// critical section, so concurrent callers never create two
    /// representatives for the same id.
    pub fn get_or_load<F>(&self, id: i64, load: F) -> Result<Option<Record>>
    where
        F: FnOnce() -> Result<Option<Record>>,
    {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.lookup(id) {
            inner.hits += 1;
            return Ok(Some(record));
        }
        inner.misses += 1;
        let loaded = load()?;
        if let Some(record) = &loaded {
            record.mark_persisted();
            inner.insert(record);
        }
        Ok(loaded)
    }

    /// Return the live representative for `id`, or cache the one `build`
    /// produces. Used when materializing rows that were already read.
    pub fn get_or_insert_with<F>(&self, id: i64, build: F) -> Result<Record>
    where
        F: FnOnce() -> Result<Record>,
    {
        let mut inner = self.inner.lock();
        if let Some(record) = inner.lookup(id) {
            inner.hits += 1;
            return Ok(record);
        }
        inner.misses += 1;
        let record = build()?;
        record.mark_persisted();
        inner.insert(&record);
        Ok(record)
    }

    /// Cache a freshly created record.
    pub fn insert(&self, record: &Record) {
        record.mark_persisted();
        self.inner.lock().insert(record);
    }

    /// The live representative, if any, without loading.
    pub fn peek(&self, id: i64) -> Option<Record> {
        let inner = self.inner.lock();
        inner.live.get(&id).and_then(Weak::upgrade).map(Record::from_cell)
    }

    /// Forget the representative for `id`. A later fetch builds a new one.
    pub fn evict(&self, id: i64) -> Option<Record> {
        let mut inner = self.inner.lock();
        inner.lru.remove(id);
        inner
            .live
            .remove(&id)
            .and_then(|weak| weak.upgrade())
            .map(Record::from_cell)
    }

    /// Every live representative.
    pub fn records(&self) -> Vec<Record> {
        let inner = self.inner.lock();
        inner
            .live
            .values()
            .filter_map(Weak::upgrade)
            .map(Record::from_cell)
            .collect()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.live.clear();
        inner.lru.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            live: inner.live.values().filter(|w| w.strong_count() > 0).count(),
            retained: inner.lru.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

impl std::fmt::Debug for IdentityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCache").field("stats", &self.stats()).finish()
    }
}

/// Shared handle type stored in the database's cache map.
pub type SharedCache = Arc<IdentityCache>;
