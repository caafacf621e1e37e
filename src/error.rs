//! Component error types
//!
//! Each engine component reports failures through its own enum; the crate-level
//! [`Error`](crate::Error) wraps them and adds record/query level failures.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::value::FieldType;

/// Failures while acquiring a pooled connection.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed; no further leases are handed out.
    #[error("connection pool is closed")]
    Closed,

    /// No connection became available within the acquire timeout.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    Timeout(Duration),

    /// A fresh connection could not be opened.
    #[error("failed to open connection to {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
}

/// Descriptor and registration failures. These are never retryable.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("record type {0} is already registered")]
    AlreadyRegistered(String),

    #[error("record type {0} is not registered")]
    NotRegistered(String),

    #[error("record type {0} declares no id column")]
    MissingId(String),

    #[error("record type {table} declares more than one id column ({first}, {second})")]
    DuplicateId {
        table: String,
        first: String,
        second: String,
    },

    #[error("column {table}.{column} declares the same name twice")]
    DuplicateColumn { table: String, column: String },

    #[error("column {table}.{column} uses unsupported type {ty}")]
    UnsupportedType {
        table: String,
        column: String,
        ty: FieldType,
    },

    #[error("invalid identifier {0:?}")]
    InvalidName(String),

    #[error("column {table}.{column}: {reason}")]
    InvalidColumn {
        table: String,
        column: String,
        reason: String,
    },

    #[error("link {table}.{column}: {reason}")]
    InvalidLink {
        table: String,
        column: String,
        reason: String,
    },

    #[error("record type {table} has no column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("two different descriptors share the table name {0}")]
    ConflictingDescriptor(String),
}

/// Failures talking to the relational store or the blob directory.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQL error in `{sql}`: {source}")]
    Sql {
        sql: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("SQL error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored value in {column} could not be decoded: {reason}")]
    Decode { column: String, reason: String },
}

impl StorageError {
    pub(crate) fn sql(sql: &str, source: rusqlite::Error) -> Self {
        StorageError::Sql {
            sql: sql.trim().to_string(),
            source,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failures while reading or rewriting the pending-deletion journal.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("journal I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal record at offset {offset} is corrupt: id {id:#018x}, check {check:#018x}")]
    Corrupt { offset: u64, id: u64, check: u64 },
}
