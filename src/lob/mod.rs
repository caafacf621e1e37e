//! Large-object storage
//!
//! Blob handles, the pending-deletion journal and the reference-counted
//! store that ties them to owning records.

pub mod journal;
pub mod object;
pub mod store;

pub use journal::{Journal, JournalEntry, JournalScan};
pub use object::{LargeObject, LobId, LobView};
pub use store::{LobStore, PendingDeletion, RecoveryReport};
