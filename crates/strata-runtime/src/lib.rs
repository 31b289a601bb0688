pub mod db;
pub mod migrations;

pub use db::Database;
pub use migrations::{
    CodeSource, DirectorySource, MemoryStore, MigrationLock, Migrator, MultiSource,
    PgRecordStore, PgSession, SqlScript,
};
