//! Bounded pool of transactional SQLite connections
//!
//! Connections are opened lazily up to `max_connections`. `poll` blocks the
//! calling thread until a connection is idle, a new one may be opened, the
//! pool is closed, or the optional acquire timeout elapses.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use tracing::{debug, warn};

use super::lease::Lease;
use crate::error::PoolError;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of connections, leased or idle.
    pub max_connections: usize,
    /// How long `poll` may block; `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
    /// SQLite busy handler timeout for lock contention between connections.
    pub busy_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout: None,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Pool counters.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
    pub acquisitions: u64,
    pub discarded: u64,
    pub waits: u64,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} open ({} idle, {} leased), {} acquisitions, {} waits, {} discarded",
            self.open, self.idle, self.leased, self.acquisitions, self.waits, self.discarded
        )
    }
}

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
    closed: bool,
    acquisitions: u64,
    discarded: u64,
    waits: u64,
}

/// Bounded pool of connections to one database file.
pub struct ConnectionPool {
    path: PathBuf,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Open a pool on a database file (created if it doesn't exist). One
    /// connection is opened eagerly so configuration errors surface here.
    pub fn open(path: &Path, config: PoolConfig) -> Result<Self, PoolError> {
        let config = PoolConfig {
            max_connections: config.max_connections.max(1),
            ..config
        };
        let first = open_connection(path, &config)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            state: Mutex::new(PoolState {
                idle: vec![first],
                open: 1,
                closed: false,
                acquisitions: 0,
                discarded: 0,
                waits: 0,
            }),
            available: Condvar::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Lease a connection, blocking until one is available.
    pub fn poll(&self) -> Result<Lease<'_>, PoolError> {
        let deadline = self.config.acquire_timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(conn) = state.idle.pop() {
                // A connection left inside a transaction cannot be reused.
                if conn.is_autocommit() {
                    state.acquisitions += 1;
                    return Ok(Lease::new(self, conn));
                }
                state.open -= 1;
                state.discarded += 1;
                warn!("discarding idle connection left inside a transaction");
                continue;
            }

            if state.open < self.config.max_connections {
                state.open += 1;
                drop(state);
                return match open_connection(&self.path, &self.config) {
                    Ok(conn) => {
                        self.state.lock().acquisitions += 1;
                        debug!("opened pooled connection to {}", self.path.display());
                        Ok(Lease::new(self, conn))
                    }
                    Err(e) => {
                        let mut state = self.state.lock();
                        state.open -= 1;
                        self.available.notify_one();
                        Err(e)
                    }
                };
            }

            state.waits += 1;
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && !state.closed
                        && state.idle.is_empty()
                        && state.open >= self.config.max_connections
                    {
                        return Err(PoolError::Timeout(
                            self.config.acquire_timeout.unwrap_or_default(),
                        ));
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Return a connection from a finished lease. Invalid connections and
    /// connections returned after close are discarded.
    pub(crate) fn restore(&self, conn: Connection, valid: bool) {
        let discarded = {
            let mut state = self.state.lock();
            if state.closed || !valid {
                state.open -= 1;
                if !valid {
                    state.discarded += 1;
                }
                Some(conn)
            } else {
                state.idle.push(conn);
                None
            }
        };
        self.available.notify_one();
        if let Some(conn) = discarded {
            if !valid {
                debug!("discarding invalidated connection");
            }
            if let Err((_, e)) = conn.close() {
                warn!("error closing discarded connection: {}", e);
            }
        }
    }

    /// Reject further leases, drop idle connections and wake every waiter.
    /// Leased connections are closed as their leases finish.
    pub fn close(&self) {
        let idle = {
            let mut state = self.state.lock();
            state.closed = true;
            state.open -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();
        for conn in idle {
            if let Err((_, e)) = conn.close() {
                warn!("error closing idle connection: {}", e);
            }
        }
        debug!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            leased: state.open - state.idle.len(),
            acquisitions: state.acquisitions,
            discarded: state.discarded,
            waits: state.waits,
        }
    }

    /// A connection outside the pool, used for shutdown-time maintenance
    /// after the pool has been closed.
    pub fn open_standalone(&self) -> Result<Connection, PoolError> {
        open_connection(&self.path, &self.config)
    }
}

fn open_connection(path: &Path, config: &PoolConfig) -> Result<Connection, PoolError> {
    let open_err = |source| PoolError::Open {
        path: path.to_path_buf(),
        source,
    };
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(open_err)?;
    conn.busy_timeout(config.busy_timeout).map_err(open_err)?;
    conn.pragma_update(None, "journal_mode", "WAL").map_err(open_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(open_err)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use tempfile::TempDir;

    fn pool_with(max: usize, dir: &TempDir) -> ConnectionPool {
        ConnectionPool::open(&dir.path().join("pool.db"), PoolConfig::new().max_connections(max)).unwrap()
    }

    #[test]
    fn test_single_connection_blocks_second_poller() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(pool_with(1, &dir));

        let lease = pool.poll().unwrap();
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let pool = Arc::clone(&pool);
            let tx = tx.clone();
            thread::spawn(move || {
                let lease = pool.poll().unwrap();
                tx.send(("second", Instant::now())).unwrap();
                lease.release().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(100));
        let released_at = Instant::now();
        tx.send(("first", released_at)).unwrap();
        lease.release().unwrap();
        waiter.join().unwrap();

        let first = rx.recv().unwrap();
        let second = rx.recv().unwrap();
        assert_eq!(first.0, "first");
        assert_eq!(second.0, "second");
        assert!(second.1 >= first.1);
    }

    #[test]
    fn test_closed_pool_fails_fast() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(2, &dir);
        pool.close();
        assert!(matches!(pool.poll(), Err(PoolError::Closed)));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(pool_with(1, &dir));
        let lease = pool.poll().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.poll().map(|l| l.release_rollback()).err())
        };
        thread::sleep(Duration::from_millis(50));
        pool.close();
        let err = waiter.join().unwrap();
        assert!(matches!(err, Some(PoolError::Closed)));
        lease.release().unwrap();
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn test_acquire_timeout() {
        let dir = TempDir::new().unwrap();
        let pool = ConnectionPool::open(
            &dir.path().join("pool.db"),
            PoolConfig::new()
                .max_connections(1)
                .acquire_timeout(Some(Duration::from_millis(50))),
        )
        .unwrap();
        let _held = pool.poll().unwrap();
        assert!(matches!(pool.poll(), Err(PoolError::Timeout(_))));
    }

    #[test]
    fn test_connections_are_reused() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with(4, &dir);
        for _ in 0..10 {
            pool.poll().unwrap().release().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.open, 1);
        assert_eq!(stats.acquisitions, 10);
    }
}
