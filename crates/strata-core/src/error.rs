use std::time::Duration;

use thiserror::Error;

use crate::migration::{Direction, MigrationId};

/// Core error type for STRATA operations.
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Applied records whose migration can no longer be found in the catalog.
    #[error(
        "There are recorded migrations but the corresponding files were not found. \
         You probably need to downgrade! Missing migrations: [{}]",
        join_ids(.missing)
    )]
    Drift { missing: Vec<MigrationId> },

    /// A unit's action failed. `completed` lists the units finished earlier in the same run.
    #[error("Migration '{id}' failed while running {direction}: {source}")]
    Migration {
        id: MigrationId,
        direction: Direction,
        completed: Vec<MigrationId>,
        #[source]
        source: Box<StrataError>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    /// A statement inside a migration body was rejected by the database.
    #[error("SQL error: {0}")]
    Sql(String),

    #[error("Unknown revert target: migration '{0}' is not applied")]
    UnknownTarget(MigrationId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout: migration run did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Identifiers that were completed before the failure, if the run got that far.
    pub fn completed(&self) -> &[MigrationId] {
        match self {
            StrataError::Migration { completed, .. } => completed,
            _ => &[],
        }
    }

    /// Whether the error was caused by drift between the catalog and the record table.
    pub fn is_drift(&self) -> bool {
        matches!(self, StrataError::Drift { .. })
    }
}

impl From<sqlx::Error> for StrataError {
    fn from(e: sqlx::Error) -> Self {
        StrataError::Storage(e.to_string())
    }
}

fn join_ids(ids: &[MigrationId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias using StrataError.
pub type Result<T> = std::result::Result<T, StrataError>;
