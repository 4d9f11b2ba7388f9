//! Storage backends for requests, steps and the audit log.

mod memory;
mod sqlite;

pub use memory::MemoryWorkflowStore;
pub use sqlite::{SqliteStoreError, SqliteWorkflowStore};
