//! Structured progress events emitted by the migration runner.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::migration::{Direction, MigrationId};

/// A progress event from a migration run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    RunStarted {
        direction: Direction,
        pending: usize,
    },
    DriftDetected {
        missing: Vec<MigrationId>,
        ignored: bool,
    },
    UnitStarted {
        id: MigrationId,
        direction: Direction,
    },
    UnitFinished {
        id: MigrationId,
        direction: Direction,
        elapsed: Duration,
    },
    UnitFailed {
        id: MigrationId,
        direction: Direction,
        error: String,
    },
    RunCompleted {
        direction: Direction,
        count: usize,
    },
    RunAborted {
        direction: Direction,
        reason: String,
    },
}

/// Receives run events. The engine never writes to a fixed output stream.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: MigrationEvent);
}

/// Default sink forwarding events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: MigrationEvent) {
        match event {
            MigrationEvent::RunStarted { direction, pending } => {
                info!(%direction, pending, "Migration run started");
            }
            MigrationEvent::DriftDetected { missing, ignored } => {
                let missing: Vec<&str> = missing.iter().map(|m| m.as_str()).collect();
                warn!(?missing, ignored, "Applied migrations missing from catalog");
            }
            MigrationEvent::UnitStarted { id, direction } => {
                debug!(migration = %id, %direction, "Running migration");
            }
            MigrationEvent::UnitFinished {
                id,
                direction,
                elapsed,
            } => {
                info!(
                    migration = %id,
                    %direction,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Migration finished"
                );
            }
            MigrationEvent::UnitFailed {
                id,
                direction,
                error,
            } => {
                warn!(migration = %id, %direction, %error, "Migration failed");
            }
            MigrationEvent::RunCompleted { direction, count } => {
                info!(%direction, count, "Migration run completed");
            }
            MigrationEvent::RunAborted { direction, reason } => {
                warn!(%direction, %reason, "Migration run aborted");
            }
        }
    }
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<MigrationEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MigrationEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: MigrationEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
