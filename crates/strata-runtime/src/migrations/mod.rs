//! Migration discovery, tracking and execution.

pub mod drift;
mod memory;
mod postgres;
mod runner;
mod source;
pub mod sql;

pub use memory::{MemorySession, MemoryStore};
pub use postgres::{lock_key, MigrationLock, PgRecordStore, PgSession};
pub use runner::Migrator;
pub use source::{CodeSource, DirectorySource, MultiSource};
pub use sql::{split_sql_statements, SqlScript};
