//! Filter expressions, SQL compilation and windowed results

pub mod compiler;
pub mod expr;
pub mod result;
pub mod window;

pub use compiler::{compile, Catalog, CompiledQuery, ParamSlot};
pub use expr::{exists, field, lit, not_exists, outer, param, CompareOp, Direction, Expr, Select};
pub use result::{Cursor, QueryBuilder, QueryResult, ResultIter};
pub use window::{PageSource, Window};
