//! SQLite storage backend.
//!
//! The engine never calls this module directly: it queues [`StorageOp`](crate::sync::StorageOp)s
//! and the host hands them to [`Database::apply_ops`] in batches.

mod feeds;
mod items;
mod schema;
mod types;

pub use schema::Database;
pub use types::DatabaseError;
