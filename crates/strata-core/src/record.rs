use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::migration::{Direction, MigrationId};

/// A migration recorded as applied in the tracking table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    pub id: MigrationId,
    pub applied_at: DateTime<Utc>,
}

impl AppliedRecord {
    pub fn new(id: impl Into<MigrationId>, applied_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            applied_at,
        }
    }
}

/// Outcome of a successful run: the units applied (or reverted), in execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub direction: Direction,
    pub migrations: Vec<MigrationId>,
}

impl ExecutionResult {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            migrations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }
}

/// Options for an `up` run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Skip the drift check. For recovery workflows only.
    pub ignore_missing_migrations: bool,
}

/// How far a revert goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertTarget {
    /// The N most recently applied units.
    Steps(usize),
    /// Every applied unit with an identifier at or after this one.
    Through(MigrationId),
    /// Every applied unit.
    All,
}

/// An applied migration as shown by `status`.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedStatus {
    pub id: MigrationId,
    pub applied_at: DateTime<Utc>,
    /// Whether the unit can be reverted.
    pub has_down: bool,
    /// Whether the unit is still present in the catalog.
    pub present: bool,
}

/// Full picture of catalog versus tracking table.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub applied: Vec<AppliedStatus>,
    pub pending: Vec<MigrationId>,
    pub missing: Vec<MigrationId>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty() && self.missing.is_empty()
    }
}
