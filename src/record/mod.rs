//! Live records, the identity cache and typed entities

pub mod cache;
pub mod entity;
mod forget;
pub mod links;
#[allow(clippy::module_inception)]
pub mod record;

pub use cache::{CacheStats, IdentityCache};
pub use entity::{Entity, Repository};
pub use links::{LinkedIter, LinkedSet};
pub use record::{Record, RecordStatus};
