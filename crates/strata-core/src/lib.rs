pub mod config;
pub mod error;
pub mod events;
pub mod migration;
pub mod record;
pub mod store;

pub use config::StrataConfig;
pub use error::{Result, StrataError};
pub use events::{CollectingSink, EventSink, MigrationEvent, TracingSink};
pub use migration::{
    BoxFuture, Catalog, Direction, Location, MigrationId, MigrationScript, MigrationSource,
    MigrationUnit,
};
pub use record::{
    AppliedRecord, AppliedStatus, ExecuteOptions, ExecutionResult, MigrationStatus, RevertTarget,
};
pub use store::{RecordStore, SqlExecutor};
