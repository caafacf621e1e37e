//! Large-object handles
//!
//! A [`LargeObject`] names one blob file by its [`LobId`]. Content is never
//! loaded wholesale; callers stream it through a [`LobView`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;

use crate::error::StorageError;
use crate::Result;

/// Numeric name of a blob file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LobId(u64);

static LAST_ID: AtomicU64 = AtomicU64::new(0);

impl LobId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Ids are allocated below `i64::MAX`, so they round-trip through
    /// integer columns.
    pub fn as_i64(&self) -> i64 {
        self.0 as i64
    }

    pub fn from_i64(value: i64) -> Self {
        Self(value as u64)
    }

    pub fn file_name(&self) -> String {
        format!("{:016x}.lob", self.0)
    }

    /// Parse a blob file name back into its id.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let hex = name.strip_suffix(".lob")?;
        if hex.len() != 16 {
            return None;
        }
        u64::from_str_radix(hex, 16).ok().map(Self)
    }

    /// Next time-derived id: wall-clock nanoseconds, bumped past the last id
    /// handed out by this process.
    pub(crate) fn generate() -> Self {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(1) as u64;
        let mut last = LAST_ID.load(Ordering::Relaxed);
        loop {
            let next = now.max(last + 1);
            match LAST_ID.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }
}

impl std::fmt::Display for LobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Shareable handle to one blob. Clones refer to the same blob; equality
/// is by id.
#[derive(Debug, Clone)]
pub struct LargeObject {
    id: LobId,
    path: Arc<PathBuf>,
}

impl PartialEq for LargeObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LargeObject {}

impl std::hash::Hash for LargeObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl LargeObject {
    pub(crate) fn new(id: LobId, path: PathBuf) -> Self {
        Self {
            id,
            path: Arc::new(path),
        }
    }

    pub fn id(&self) -> LobId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Current size of the blob in bytes
    pub fn len(&self) -> Result<u64> {
        std::fs::metadata(self.path.as_path())
            .map(|m| m.len())
            .map_err(|e| StorageError::io(self.path.as_path(), e).into())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Open a random-access view of the blob's bytes.
    pub fn view(&self) -> Result<LobView> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path.as_path())
            .map_err(|e| StorageError::io(self.path.as_path(), e))?;
        Ok(LobView {
            file,
            path: self.path.to_path_buf(),
        })
    }

    /// Read the whole blob. Intended for small objects and tests.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.view()?
            .read_to_end(&mut buf)
            .map_err(|e| StorageError::io(self.path.as_path(), e))?;
        Ok(buf)
    }

    /// Replace the blob's content.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut view = self.view()?;
        view.set_len(0)?;
        view.write_all(bytes)
            .and_then(|_| view.file.sync_data())
            .map_err(|e| StorageError::io(self.path.as_path(), e))?;
        Ok(())
    }
}

/// Read/write/seek view over one blob file.
#[derive(Debug)]
pub struct LobView {
    file: File,
    path: PathBuf,
}

impl LobView {
    fn io_err(&self, e: io::Error) -> crate::Error {
        StorageError::io(&self.path, e).into()
    }

    pub fn len(&self) -> Result<u64> {
        self.file.metadata().map(|m| m.len()).map_err(|e| self.io_err(e))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncate or extend the blob. The cursor is left where it was.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len).map_err(|e| self.io_err(e))
    }

    /// Read up to `buf.len()` bytes starting at `offset`. Moves the cursor.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| {
                let mut filled = 0;
                while filled < buf.len() {
                    match self.file.read(&mut buf[filled..])? {
                        0 => break,
                        n => filled += n,
                    }
                }
                Ok(filled)
            })
            .map_err(|e| self.io_err(e))
    }

    /// Write all of `buf` starting at `offset`. Moves the cursor.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(buf))
            .map_err(|e| self.io_err(e))
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data().map_err(|e| self.io_err(e))
    }
}

impl Read for LobView {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for LobView {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for LobView {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_ids_increase() {
        let a = LobId::generate();
        let b = LobId::generate();
        assert!(b > a);
        assert!(a.as_i64() > 0);
    }

    #[test]
    fn test_file_name_round_trips() {
        let id = LobId::new(0x1234_abcd);
        assert_eq!(id.file_name(), "000000001234abcd.lob");
        assert_eq!(LobId::from_file_name(&id.file_name()), Some(id));
        assert_eq!(LobId::from_file_name("pending.journal"), None);
    }

    #[test]
    fn test_view_random_access() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(LobId::new(7).file_name());
        std::fs::File::create(&path).unwrap();
        let lob = LargeObject::new(LobId::new(7), path);

        lob.write_all(b"hello world").unwrap();
        let mut view = lob.view().unwrap();
        view.write_at(6, b"there").unwrap();
        let mut buf = [0u8; 5];
        assert_eq!(view.read_at(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        view.set_len(5).unwrap();
        assert_eq!(lob.read_all().unwrap(), b"hello");
        assert_eq!(lob, lob.clone());
    }
}
