//! PostgreSQL schema migrations.
//!
//! ```no_run
//! # async fn run() -> strata::Result<()> {
//! let config = strata::StrataConfig::from_file("strata.toml")?;
//! let strata = strata::Strata::builder().config(config).connect().await?;
//! let result = strata.up().await?;
//! println!("applied {} migrations", result.len());
//! # Ok(())
//! # }
//! ```

mod logging;
mod runtime;

pub use logging::init_tracing;
pub use runtime::{Strata, StrataBuilder};

pub use strata_core::{
    AppliedStatus, Direction, EventSink, ExecuteOptions, ExecutionResult, MigrationEvent,
    MigrationId, MigrationScript, MigrationStatus, Result, RevertTarget, StrataConfig,
    StrataError,
};
pub use strata_runtime::migrations::{PgSession, SqlScript};
