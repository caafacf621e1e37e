//! Pending-deletion journal
//!
//! An append-only file of fixed 16-byte records: the blob id followed by its
//! bit reversal, both big-endian. A record is live while its id is non-zero;
//! completing a deletion zeroes the record in place. Once no record is live
//! the file is truncated to zero length.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::object::LobId;
use crate::error::RecoveryError;

/// Size of one journal record
pub const RECORD_LEN: u64 = 16;

/// A live journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEntry {
    pub offset: u64,
    pub id: LobId,
}

/// Result of scanning the journal.
#[derive(Debug, Default)]
pub struct JournalScan {
    pub live: Vec<JournalEntry>,
    /// Records already zeroed by a completed deletion
    pub cleared: usize,
    /// Records whose check word does not match
    pub corrupt: usize,
    /// Bytes after the last whole record
    pub trailing_bytes: u64,
}

fn encode(id: LobId) -> [u8; RECORD_LEN as usize] {
    let mut buf = [0u8; RECORD_LEN as usize];
    buf[..8].copy_from_slice(&id.raw().to_be_bytes());
    buf[8..].copy_from_slice(&id.raw().reverse_bits().to_be_bytes());
    buf
}

fn word(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(buf)
}

/// Handle on the journal file. Callers serialize access.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: File,
}

impl Journal {
    /// Open the journal, creating it if absent. Existing records are kept.
    pub fn open(path: &Path) -> Result<Self, RecoveryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| io_err(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64, RecoveryError> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| io_err(&self.path, e))
    }

    pub fn is_empty(&self) -> Result<bool, RecoveryError> {
        Ok(self.len()? == 0)
    }

    /// Append a record and sync it to disk, returning its offset.
    pub fn append(&mut self, id: LobId) -> Result<u64, RecoveryError> {
        let path = self.path.clone();
        let len = self.len()?;
        // Align past any torn trailing record.
        let offset = len - len % RECORD_LEN + if len % RECORD_LEN == 0 { 0 } else { RECORD_LEN };
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&encode(id)))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| io_err(&path, e))?;
        Ok(offset)
    }

    /// Zero the record at `offset`.
    pub fn clear(&mut self, offset: u64) -> Result<(), RecoveryError> {
        let path = self.path.clone();
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(&[0u8; RECORD_LEN as usize]))
            .and_then(|_| self.file.sync_data())
            .map_err(|e| io_err(&path, e))
    }

    pub fn truncate(&mut self) -> Result<(), RecoveryError> {
        let path = self.path.clone();
        self.file
            .set_len(0)
            .and_then(|_| self.file.sync_all())
            .map_err(|e| io_err(&path, e))
    }

    /// Read every record. Corrupt records and a torn tail are logged and
    /// skipped.
    pub fn scan(&mut self) -> Result<JournalScan, RecoveryError> {
        let path = self.path.clone();
        let mut bytes = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut bytes))
            .map_err(|e| io_err(&path, e))?;

        let mut scan = JournalScan::default();
        let chunks = bytes.chunks_exact(RECORD_LEN as usize);
        scan.trailing_bytes = chunks.remainder().len() as u64;
        for (index, record) in chunks.enumerate() {
            let offset = index as u64 * RECORD_LEN;
            let id = word(&record[..8]);
            let check = word(&record[8..]);
            if id == 0 {
                scan.cleared += 1;
            } else if check == id.reverse_bits() {
                scan.live.push(JournalEntry {
                    offset,
                    id: LobId::new(id),
                });
            } else {
                let err = RecoveryError::Corrupt { offset, id, check };
                warn!("skipping journal record: {}", err);
                scan.corrupt += 1;
            }
        }
        if scan.trailing_bytes > 0 {
            warn!(
                "ignoring {} trailing bytes in {}",
                scan.trailing_bytes,
                self.path.display()
            );
        }
        Ok(scan)
    }
}

fn io_err(path: &Path, source: std::io::Error) -> RecoveryError {
    RecoveryError::Io {
        path: path.to_path_buf(),
        source,
    }
}
