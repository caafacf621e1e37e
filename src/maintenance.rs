//! Storage compaction
//!
//! Compaction rewrites the database file (`VACUUM`) and truncates the
//! write-ahead log. It runs at open when the interval since the last run
//! has elapsed, on request, periodically from a background thread, and at
//! close. The time of the last run lives in a small marker file next to
//! the database.

use std::path::{Path, PathBuf};
use std::sync::Weak;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Sender};
use tracing::{debug, info, warn};

use crate::database::Shared;
use crate::error::StorageError;
use crate::storage::ConnectionPool;
use crate::Result;

/// Records when compaction last ran.
#[derive(Debug)]
pub struct CompactionMarker {
    path: PathBuf,
    last: DateTime<Utc>,
}

impl CompactionMarker {
    /// Read the marker, creating it with the current time when missing or
    /// unreadable.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        let parsed = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok());
        match parsed {
            Some(last) => Ok(Self {
                path: path.to_path_buf(),
                last: last.with_timezone(&Utc),
            }),
            None => {
                if path.exists() {
                    warn!("unreadable compaction marker {}, resetting", path.display());
                }
                let mut marker = Self {
                    path: path.to_path_buf(),
                    last: Utc::now(),
                };
                marker.touch()?;
                Ok(marker)
            }
        }
    }

    pub fn last(&self) -> DateTime<Utc> {
        self.last
    }

    /// Whole days since the last compaction.
    pub fn days_since(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last).num_days()
    }

    /// An interval of zero never makes compaction due on its own.
    pub fn is_due(&self, interval_days: u32, force: bool) -> bool {
        force || (interval_days > 0 && self.days_since(Utc::now()) >= i64::from(interval_days))
    }

    pub fn touch(&mut self) -> Result<()> {
        self.last = Utc::now();
        std::fs::write(&self.path, self.last.to_rfc3339())
            .map_err(|e| StorageError::io(&self.path, e))?;
        Ok(())
    }
}

/// Outcome of one compaction run.
#[derive(Debug, Clone, Copy)]
pub struct CompactionReport {
    pub size_before: u64,
    pub size_after: u64,
    pub elapsed: Duration,
}

impl CompactionReport {
    pub fn reclaimed(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

/// Database file plus its write-ahead log.
fn storage_size(db_path: &Path) -> u64 {
    let mut wal = db_path.as_os_str().to_owned();
    wal.push("-wal");
    [db_path.to_path_buf(), PathBuf::from(wal)]
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}

/// Rewrite the database file through a pooled connection.
pub fn compact(pool: &ConnectionPool) -> Result<CompactionReport> {
    let started = Instant::now();
    let size_before = storage_size(pool.path());
    let mut lease = pool.poll()?;
    lease.execute_outside_transaction("VACUUM")?;
    lease.execute_outside_transaction("PRAGMA wal_checkpoint(TRUNCATE)")?;
    lease.release()?;
    let report = CompactionReport {
        size_before,
        size_after: storage_size(pool.path()),
        elapsed: started.elapsed(),
    };
    info!(
        "compacted {} ({} -> {} bytes) in {:?}",
        pool.path().display(),
        report.size_before,
        report.size_after,
        report.elapsed
    );
    Ok(report)
}

/// Background thread that compacts whenever the interval has elapsed.
pub struct Compactor {
    stop: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Compactor {
    pub(crate) fn start(shared: Weak<Shared>, period: Duration) -> Result<Self> {
        let (stop, stopped) = channel::bounded::<()>(1);
        let ticker = channel::tick(period);
        let handle = std::thread::Builder::new()
            .name("holdfast-compactor".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        let Some(db) = shared.upgrade() else { break };
                        if db.check_open().is_err() {
                            break;
                        }
                        if let Err(e) = db.compact(false) {
                            warn!("background compaction failed: {}", e);
                        }
                    }
                    recv(stopped) -> _ => break,
                }
            })
            .map_err(|e| StorageError::io("holdfast-compactor", e))?;
        debug!("background compactor running every {:?}", period);
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for a run in progress to finish.
    pub fn stop(mut self) {
        let _ = self.stop.try_send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("background compactor panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PoolConfig;
    use tempfile::TempDir;

    #[test]
    fn test_marker_created_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compacted");
        let marker = CompactionMarker::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert!(!marker.is_due(7, false));
        assert!(marker.is_due(7, true));
        assert!(!marker.is_due(0, false));
    }

    #[test]
    fn test_marker_due_after_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compacted");
        let old = Utc::now() - chrono::Duration::days(10);
        std::fs::write(&path, old.to_rfc3339()).unwrap();

        let mut marker = CompactionMarker::load_or_create(&path).unwrap();
        assert_eq!(marker.days_since(Utc::now()), 10);
        assert!(marker.is_due(7, false));
        assert!(!marker.is_due(30, false));

        marker.touch().unwrap();
        assert!(!marker.is_due(7, false));
        let reread = CompactionMarker::load_or_create(&path).unwrap();
        assert_eq!(reread.days_since(Utc::now()), 0);
    }

    #[test]
    fn test_garbage_marker_resets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("compacted");
        std::fs::write(&path, "not a date").unwrap();
        let marker = CompactionMarker::load_or_create(&path).unwrap();
        assert!(!marker.is_due(1, false));
    }

    #[test]
    fn test_compact_shrinks_after_delete() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(&dir.path().join("c.db"), PoolConfig::new()).unwrap();
        let mut lease = pool.poll().unwrap();
        lease.execute_batch("CREATE TABLE t (x TEXT)").unwrap();
        let blob = crate::value::Value::Text("x".repeat(4096));
        for _ in 0..64 {
            lease.execute("INSERT INTO t (x) VALUES (?)", &[blob.clone()]).unwrap();
        }
        lease.execute("DELETE FROM t", &[]).unwrap();
        lease.release().unwrap();

        let report = compact(&pool).unwrap();
        assert!(report.size_after <= report.size_before);
    }
}
