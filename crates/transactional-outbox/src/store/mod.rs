//! Persistence contracts and their PostgreSQL implementations.
//!
//! Each table gets its own narrow repository trait, mirroring the teacher library's
//! `OutboxRepository` split: the engine depends only on these traits, never on `sqlx` types
//! directly outside this module, so an alternative backend is a matter of implementing three
//! traits.

mod instance_store;
mod partition_store;
mod record_store;

pub use instance_store::{InstanceStore, SqlxInstanceStore};
pub use partition_store::{PartitionStore, SqlxPartitionStore};
pub use record_store::{RecordStore, SqlxRecordStore};
