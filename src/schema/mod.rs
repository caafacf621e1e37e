//! Record schemas
//!
//! Static descriptors ([`TableDef`], [`ColumnDef`]), the shapes derived from
//! them ([`SchemaTable`]) and the registry that reconciles them with storage.

pub mod descriptor;
pub mod registry;
pub mod table;

pub use descriptor::{ColumnDef, ColumnKind, TableDef};
pub use registry::{reconcile, ReconcileReport, Referrer, SchemaRegistry};
pub use table::{validate_name, LinkStatements, SchemaColumn, SchemaTable, TableStatements};
