//! Reference-counted blob store
//!
//! Blob files live in one directory, named by id. Reference counts live in
//! the `holdfast_lob_refs` table keyed by (owner type, owner id, blob id) and
//! change inside the caller's lease, so they commit or roll back with the
//! owning write. A blob whose aggregate count drops below one is erased in
//! two phases: the id is journaled before the owning transaction commits, and
//! the file is removed (and the journal record cleared) after it commits.
//! Recovery replays journaled ids whose blobs are still unreferenced.

use std::collections::{BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::journal::Journal;
use super::object::{LargeObject, LobId};
use crate::error::StorageError;
use crate::storage::Lease;
use crate::value::Value;
use crate::{Error, Result};

/// Reference table DDL
pub const CREATE_LOB_REFS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS holdfast_lob_refs (
    owner_type TEXT NOT NULL,
    owner_id INTEGER NOT NULL,
    lob_id INTEGER NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (owner_type, owner_id, lob_id)
);
CREATE INDEX IF NOT EXISTS ix_holdfast_lob_refs_lob ON holdfast_lob_refs(lob_id);
"#;

const ADD_REF: &str = "INSERT INTO holdfast_lob_refs (owner_type, owner_id, lob_id, count) VALUES (?, ?, ?, 1) \
     ON CONFLICT(owner_type, owner_id, lob_id) DO UPDATE SET count = count + 1";
const OWNER_COUNT: &str =
    "SELECT count FROM holdfast_lob_refs WHERE owner_type = ? AND owner_id = ? AND lob_id = ?";
const DECREMENT: &str =
    "UPDATE holdfast_lob_refs SET count = count - 1 WHERE owner_type = ? AND owner_id = ? AND lob_id = ?";
const DELETE_OWNER_ROW: &str =
    "DELETE FROM holdfast_lob_refs WHERE owner_type = ? AND owner_id = ? AND lob_id = ?";
const TOTAL_COUNT: &str = "SELECT COALESCE(SUM(count), 0) FROM holdfast_lob_refs WHERE lob_id = ?";
const DELETE_LOB_ROWS: &str = "DELETE FROM holdfast_lob_refs WHERE lob_id = ?";
const REFERENCED_COUNT: &str = "SELECT COUNT(DISTINCT lob_id) FROM holdfast_lob_refs WHERE count > 0";

/// A journaled deletion whose file has not been removed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingDeletion {
    pub id: LobId,
    offset: u64,
}

/// Outcome of journal recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Deletions completed from the journal
    pub replayed: usize,
    /// Journaled ids still referenced (their transaction never committed)
    pub discarded: usize,
    /// Corrupt records skipped
    pub skipped: usize,
}

struct JournalState {
    journal: Journal,
    live: BTreeSet<u64>,
    retry: Vec<PendingDeletion>,
    /// Ids with a journaled deletion whose file may not be removed yet
    doomed: HashMap<LobId, usize>,
}

impl JournalState {
    fn doom(&mut self, id: LobId) {
        *self.doomed.entry(id).or_insert(0) += 1;
    }

    fn spare(&mut self, id: LobId) {
        if let Some(n) = self.doomed.get_mut(&id) {
            *n -= 1;
            if *n == 0 {
                self.doomed.remove(&id);
            }
        }
    }
}

/// The blob directory, its journal and the reference table operations.
pub struct LobStore {
    dir: PathBuf,
    state: Mutex<JournalState>,
}

impl LobStore {
    /// Open the store, creating the blob directory if needed. Call
    /// [`LobStore::recover`] before normal operation.
    pub fn open(dir: &Path, journal_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;
        let journal = Journal::open(journal_path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            state: Mutex::new(JournalState {
                journal,
                live: BTreeSet::new(),
                retry: Vec::new(),
                doomed: HashMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the reference table.
    pub fn ensure_schema(&self, lease: &mut Lease<'_>) -> Result<()> {
        lease.execute_batch(CREATE_LOB_REFS_TABLE)
    }

    pub fn path_for(&self, id: LobId) -> PathBuf {
        self.dir.join(id.file_name())
    }

    /// Handle for an existing id. The file may not exist.
    pub fn handle(&self, id: LobId) -> LargeObject {
        LargeObject::new(id, self.path_for(id))
    }

    /// Allocate a fresh id and an empty placeholder file.
    pub fn create(&self) -> Result<LargeObject> {
        loop {
            let id = LobId::generate();
            let path = self.path_for(id);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!("created large object {}", id);
                    return Ok(LargeObject::new(id, path));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::io(path, e).into()),
            }
        }
    }

    /// Add one reference. Fails with [`Error::LobErased`] when the blob is
    /// gone or a deletion of it is in flight; the caller's lease must then
    /// roll back.
    pub fn add_ref(
        &self,
        lease: &mut Lease<'_>,
        id: LobId,
        owner_type: &str,
        owner_id: i64,
    ) -> Result<()> {
        lease.execute(ADD_REF, &owner_key(id, owner_type, owner_id))?;
        // The lease now holds the write lock, so any deletion that saw this
        // blob unreferenced has committed and journaled its id already.
        let state = self.state.lock();
        if state.doomed.contains_key(&id) || !self.path_for(id).exists() {
            return Err(Error::LobErased(id));
        }
        Ok(())
    }

    /// Drop one reference. Returns whether the blob is now unreferenced by
    /// every owner.
    pub fn del_ref(
        &self,
        lease: &mut Lease<'_>,
        id: LobId,
        owner_type: &str,
        owner_id: i64,
    ) -> Result<bool> {
        let key = owner_key(id, owner_type, owner_id);
        match lease.query_i64(OWNER_COUNT, &key)? {
            Some(count) if count > 1 => {
                lease.execute(DECREMENT, &key)?;
            }
            Some(count) if count == 1 => {
                lease.execute(DELETE_OWNER_ROW, &key)?;
            }
            _ => {
                return Err(Error::RefCountUnderflow {
                    lob: id,
                    owner_type: owner_type.to_string(),
                    owner_id,
                })
            }
        }
        Ok(self.ref_count(lease, id)? < 1)
    }

    /// Aggregate reference count across all owners.
    pub fn ref_count(&self, lease: &mut Lease<'_>, id: LobId) -> Result<i64> {
        Ok(lease
            .query_i64(TOTAL_COUNT, &[Value::Long(id.as_i64())])?
            .unwrap_or(0))
    }

    /// Number of distinct blobs with at least one reference.
    pub fn referenced_count(&self, lease: &mut Lease<'_>) -> Result<i64> {
        Ok(lease.query_i64(REFERENCED_COUNT, &[])?.unwrap_or(0))
    }

    /// Journal phase: record the intent to delete `id`. Must run before the
    /// transaction that orphaned the blob commits.
    pub fn begin_deletion(&self, id: LobId) -> Result<PendingDeletion> {
        let mut state = self.state.lock();
        let offset = state.journal.append(id)?;
        state.live.insert(offset);
        state.doom(id);
        debug!("journaled deletion of {} at offset {}", id, offset);
        Ok(PendingDeletion { id, offset })
    }

    /// Delete phase: remove the file, then clear the journal record. A failed
    /// removal keeps the deletion for [`LobStore::flush_pending`].
    pub fn complete_deletion(&self, pending: PendingDeletion) -> Result<()> {
        let mut state = self.state.lock();
        if let Err(e) = self.remove_file(pending.id) {
            state.retry.push(pending);
            return Err(e);
        }
        Self::clear_entry(&mut state, pending)
    }

    /// Drop a journaled deletion whose transaction rolled back. The blob
    /// stays.
    pub fn abandon_deletion(&self, pending: PendingDeletion) -> Result<()> {
        let mut state = self.state.lock();
        Self::clear_entry(&mut state, pending)
    }

    fn clear_entry(state: &mut JournalState, pending: PendingDeletion) -> Result<()> {
        state.journal.clear(pending.offset)?;
        state.live.remove(&pending.offset);
        state.spare(pending.id);
        if state.live.is_empty() && state.retry.is_empty() {
            state.journal.truncate()?;
        }
        Ok(())
    }

    fn remove_file(&self, id: LobId) -> Result<()> {
        let path = self.path_for(id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(path, e).into()),
        }
    }

    /// Retry deletions whose file removal failed earlier. Returns the number
    /// completed.
    pub fn flush_pending(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let retry = std::mem::take(&mut state.retry);
        let mut done = 0;
        let mut first_err = None;
        for pending in retry {
            match self.remove_file(pending.id) {
                Ok(()) => {
                    state.journal.clear(pending.offset)?;
                    state.live.remove(&pending.offset);
                    state.spare(pending.id);
                    done += 1;
                }
                Err(e) => {
                    warn!("could not remove large object {}: {}", pending.id, e);
                    state.retry.push(pending);
                    first_err.get_or_insert(e);
                }
            }
        }
        if state.live.is_empty() && state.retry.is_empty() {
            state.journal.truncate()?;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(done),
        }
    }

    /// Number of journal records not yet completed.
    pub fn pending_count(&self) -> usize {
        self.state.lock().live.len()
    }

    /// Erase a handle that never gained a reference. Referenced blobs are
    /// left alone; returns whether the file was erased.
    pub fn release(&self, lease: &mut Lease<'_>, lob: &LargeObject) -> Result<bool> {
        if self.ref_count(lease, lob.id())? > 0 {
            return Ok(false);
        }
        let pending = self.begin_deletion(lob.id())?;
        self.complete_deletion(pending)?;
        Ok(true)
    }

    /// Replay the journal: delete blobs whose ids are journaled and whose
    /// aggregate count is below one, then truncate the journal.
    pub fn recover(&self, lease: &mut Lease<'_>) -> Result<RecoveryReport> {
        let mut state = self.state.lock();
        let scan = state.journal.scan()?;
        let mut report = RecoveryReport {
            skipped: scan.corrupt,
            ..Default::default()
        };

        for entry in &scan.live {
            let total = lease
                .query_i64(TOTAL_COUNT, &[Value::Long(entry.id.as_i64())])?
                .unwrap_or(0);
            if total >= 1 {
                debug!("discarding journaled deletion of referenced {}", entry.id);
                report.discarded += 1;
                continue;
            }
            self.remove_file(entry.id)?;
            lease.execute(DELETE_LOB_ROWS, &[Value::Long(entry.id.as_i64())])?;
            report.replayed += 1;
        }

        state.journal.truncate()?;
        state.live.clear();
        state.doomed.clear();
        if report.replayed + report.discarded + report.skipped > 0 {
            info!(
                "journal recovery: {} replayed, {} discarded, {} skipped",
                report.replayed, report.discarded, report.skipped
            );
        }
        Ok(report)
    }

    /// Ids of every blob file in the directory.
    pub fn list(&self) -> Result<Vec<LobId>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StorageError::io(&self.dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&self.dir, e))?;
            if let Some(id) = entry.file_name().to_str().and_then(LobId::from_file_name) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete every blob file and reset the journal.
    pub fn erase_all(&self) -> Result<usize> {
        let mut state = self.state.lock();
        let ids = self.list()?;
        for id in &ids {
            self.remove_file(*id)?;
        }
        state.retry.clear();
        state.live.clear();
        state.doomed.clear();
        state.journal.truncate()?;
        Ok(ids.len())
    }
}

fn owner_key(id: LobId, owner_type: &str, owner_id: i64) -> [Value; 3] {
    [
        Value::Text(owner_type.to_string()),
        Value::Long(owner_id),
        Value::Long(id.as_i64()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ConnectionPool, PoolConfig};
    use proptest::prelude::*;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        pool: ConnectionPool,
        store: LobStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("lob.db"), PoolConfig::new()).unwrap();
        let store = open_store(dir.path());
        let mut lease = pool.poll().unwrap();
        store.ensure_schema(&mut lease).unwrap();
        lease.release().unwrap();
        Fixture { dir, pool, store }
    }

    fn open_store(root: &Path) -> LobStore {
        LobStore::open(&root.join("lobs"), &root.join("lobs").join("pending.journal")).unwrap()
    }

    #[test]
    fn test_add_del_erases_at_zero() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        lob.write_all(b"payload").unwrap();

        let mut lease = fx.pool.poll().unwrap();
        fx.store.add_ref(&mut lease, lob.id(), "Widget", 1).unwrap();
        fx.store.add_ref(&mut lease, lob.id(), "Widget", 2).unwrap();
        assert!(!fx.store.del_ref(&mut lease, lob.id(), "Widget", 1).unwrap());
        assert!(fx.store.del_ref(&mut lease, lob.id(), "Widget", 2).unwrap());
        let pending = fx.store.begin_deletion(lob.id()).unwrap();
        lease.release().unwrap();
        fx.store.complete_deletion(pending).unwrap();

        assert!(!lob.exists());
        assert_eq!(fx.store.pending_count(), 0);
    }

    #[test]
    fn test_del_without_add_underflows() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        let mut lease = fx.pool.poll().unwrap();
        let err = fx.store.del_ref(&mut lease, lob.id(), "Widget", 1).unwrap_err();
        assert!(matches!(err, Error::RefCountUnderflow { .. }));
    }

    #[test]
    fn test_crash_between_journal_and_delete_is_replayed() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        lob.write_all(b"doomed").unwrap();

        let mut lease = fx.pool.poll().unwrap();
        fx.store.add_ref(&mut lease, lob.id(), "Widget", 1).unwrap();
        lease.release().unwrap();

        let mut lease = fx.pool.poll().unwrap();
        assert!(fx.store.del_ref(&mut lease, lob.id(), "Widget", 1).unwrap());
        let _pending = fx.store.begin_deletion(lob.id()).unwrap();
        lease.release().unwrap();
        // The process dies here: the file is never removed.
        let Fixture { dir, pool, store } = fx;
        drop(store);
        assert!(lob.exists());

        let store = open_store(dir.path());
        let mut lease = pool.poll().unwrap();
        let report = store.recover(&mut lease).unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(store.ref_count(&mut lease, lob.id()).unwrap(), 0);
        lease.release().unwrap();

        assert!(!lob.exists());
        let journal_len = std::fs::metadata(dir.path().join("lobs").join("pending.journal"))
            .unwrap()
            .len();
        assert_eq!(journal_len, 0);

        // A second recovery has nothing left to do.
        let mut lease = pool.poll().unwrap();
        assert_eq!(store.recover(&mut lease).unwrap(), RecoveryReport::default());
        lease.release().unwrap();
    }

    #[test]
    fn test_rolled_back_deletion_is_discarded() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();

        let mut lease = fx.pool.poll().unwrap();
        fx.store.add_ref(&mut lease, lob.id(), "Widget", 1).unwrap();
        lease.release().unwrap();

        {
            let mut lease = fx.pool.poll().unwrap();
            assert!(fx.store.del_ref(&mut lease, lob.id(), "Widget", 1).unwrap());
            fx.store.begin_deletion(lob.id()).unwrap();
            // Dropped without release: the decrement rolls back.
        }

        let store = open_store(fx.dir.path());
        let mut lease = fx.pool.poll().unwrap();
        let report = store.recover(&mut lease).unwrap();
        assert_eq!(report.discarded, 1);
        assert_eq!(report.replayed, 0);
        lease.release().unwrap();
        assert!(lob.exists());
    }

    #[test]
    fn test_attach_during_deletion_is_refused() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        lob.write_all(b"shared").unwrap();

        // Another writer has committed the last decrement and journaled the id.
        let pending = fx.store.begin_deletion(lob.id()).unwrap();
        let mut lease = fx.pool.poll().unwrap();
        let err = fx.store.add_ref(&mut lease, lob.id(), "Widget", 7).unwrap_err();
        assert!(matches!(err, Error::LobErased(id) if id == lob.id()));
        drop(lease);

        let mut lease = fx.pool.poll().unwrap();
        assert_eq!(fx.store.ref_count(&mut lease, lob.id()).unwrap(), 0);
        lease.release().unwrap();

        // A rolled back deletion makes the blob attachable again.
        fx.store.abandon_deletion(pending).unwrap();
        let mut lease = fx.pool.poll().unwrap();
        fx.store.add_ref(&mut lease, lob.id(), "Widget", 7).unwrap();
        lease.release().unwrap();
        assert!(lob.exists());
    }

    #[test]
    fn test_attach_after_erase_is_refused() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        let pending = fx.store.begin_deletion(lob.id()).unwrap();
        fx.store.complete_deletion(pending).unwrap();

        let mut lease = fx.pool.poll().unwrap();
        assert!(matches!(
            fx.store.add_ref(&mut lease, lob.id(), "Widget", 1),
            Err(Error::LobErased(_))
        ));
    }

    #[test]
    fn test_release_unreferenced_handle() {
        let fx = fixture();
        let lob = fx.store.create().unwrap();
        let mut lease = fx.pool.poll().unwrap();
        assert!(fx.store.release(&mut lease, &lob).unwrap());
        lease.release().unwrap();
        assert!(!lob.exists());
        assert!(fx.store.list().unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_blob_erased_iff_net_count_reaches_zero(
            ops in proptest::collection::vec((0usize..3, any::<bool>()), 1..24)
        ) {
            let fx = fixture();
            let lob = fx.store.create().unwrap();
            let mut model = [0i64; 3];
            let mut erased = false;

            for (owner, add) in ops {
                if erased {
                    break;
                }
                let mut lease = fx.pool.poll().unwrap();
                if add {
                    fx.store.add_ref(&mut lease, lob.id(), "Owner", owner as i64).unwrap();
                    model[owner] += 1;
                    lease.release().unwrap();
                    continue;
                }
                match fx.store.del_ref(&mut lease, lob.id(), "Owner", owner as i64) {
                    Ok(orphaned) => {
                        model[owner] -= 1;
                        prop_assert_eq!(orphaned, model.iter().sum::<i64>() == 0);
                        if orphaned {
                            let pending = fx.store.begin_deletion(lob.id()).unwrap();
                            lease.release().unwrap();
                            fx.store.complete_deletion(pending).unwrap();
                            erased = true;
                        } else {
                            lease.release().unwrap();
                        }
                    }
                    Err(Error::RefCountUnderflow { .. }) => {
                        prop_assert_eq!(model[owner], 0);
                        lease.release_rollback().unwrap();
                    }
                    Err(e) => panic!("unexpected error: {}", e),
                }
            }

            prop_assert_eq!(lob.exists(), !erased);
        }
    }
}
