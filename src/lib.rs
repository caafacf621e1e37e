//! # Holdfast - embedded object-relational persistence
//!
//! Holdfast maps declarative record schemas onto SQLite tables and hands out
//! identity-cached live records.
//!
//! Holdfast provides:
//! - Static schema descriptors with DDL reconciliation at registration
//! - A bounded pool of transactional connections
//! - Write-through records with lazy link navigation
//! - A composable filter/order builder with windowed result caching
//! - A reference-counted large-object store with a crash-safe deletion journal

pub mod error;
pub mod value;
pub mod schema;
pub mod storage;
pub mod lob;
pub mod record;
pub mod query;
pub mod database;
pub mod maintenance;
pub mod config;
pub mod ui;

// Re-exports for convenient access
pub use config::HoldfastConfig;
pub use database::{Database, DbStats};
pub use error::{PoolError, RecoveryError, SchemaError, StorageError};
pub use lob::{LargeObject, LobId, LobView};
pub use query::{exists, field, lit, not_exists, outer, param, Cursor, Direction, Expr, QueryBuilder, QueryResult, Select};
pub use record::{Entity, LinkedSet, Record, RecordStatus, Repository};
pub use schema::{ColumnDef, ColumnKind, SchemaColumn, SchemaTable, TableDef};
pub use value::{ArrayValue, FieldType, FromValue, ScalarType, Value};

/// Result type alias for Holdfast operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error types for Holdfast operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Record not found: {table}#{id}")]
    NotFound { table: String, id: i64 },

    #[error("Record {table}#{id} has been erased")]
    StaleRecord { table: String, id: i64 },

    #[error("Column {table}.{column} cannot be written")]
    ReadOnlyColumn { table: String, column: String },

    #[error("Type mismatch on {column}: expected {expected}, found {found}")]
    TypeMismatch {
        column: String,
        expected: String,
        found: String,
    },

    #[error("Value for {column} is {len} characters, limit is {max}")]
    ValueTooLong { column: String, len: usize, max: u32 },

    #[error("Reference count underflow for large object {lob} owned by {owner_type}#{owner_id}")]
    RefCountUnderflow {
        lob: LobId,
        owner_type: String,
        owner_id: i64,
    },

    #[error("Record {table}#{id} is still referenced by {referrer}.{column}")]
    StillReferenced {
        table: String,
        id: i64,
        referrer: String,
        column: String,
    },

    #[error("Large object {0} has been erased")]
    LobErased(LobId),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Database has been closed")]
    Closed,
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(StorageError::Sqlite(err))
    }
}
