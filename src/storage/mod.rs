//! Relational storage layer
//!
//! A bounded [`ConnectionPool`] of SQLite connections and the transactional
//! [`Lease`] through which every statement is issued.

pub mod lease;
pub mod pool;

pub use lease::{Lease, Row};
pub use pool::{ConnectionPool, PoolConfig, PoolStats};
