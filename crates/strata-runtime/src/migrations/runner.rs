//! Migration runner.
//!
//! Computes what is pending against the record store and applies or reverts units
//! one at a time, each in its own store session. A failed unit stops the run;
//! units finished before it stay applied.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use strata_core::error::{Result, StrataError};
use strata_core::events::{EventSink, MigrationEvent, TracingSink};
use strata_core::migration::{Catalog, Direction, MigrationId, MigrationSource, MigrationUnit};
use strata_core::record::{
    AppliedRecord, AppliedStatus, ExecuteOptions, ExecutionResult, MigrationStatus, RevertTarget,
};
use strata_core::store::RecordStore;

use super::drift;

/// Internal phase of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    ComputingPending,
    DriftDetected,
    Applying,
    Completed,
    Aborted,
}

impl RunState {
    fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, ComputingPending)
                | (ComputingPending, DriftDetected)
                | (ComputingPending, Applying)
                | (ComputingPending, Aborted)
                | (DriftDetected, Aborted)
                | (Applying, Completed)
                | (Applying, Aborted)
        )
    }

    fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

struct Run<'a> {
    state: RunState,
    direction: Direction,
    events: &'a dyn EventSink,
}

impl<'a> Run<'a> {
    fn start(direction: Direction, events: &'a dyn EventSink) -> Result<Self> {
        let mut run = Self {
            state: RunState::Idle,
            direction,
            events,
        };
        run.advance(RunState::ComputingPending)?;
        Ok(run)
    }

    fn advance(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(StrataError::Internal(format!(
                "invalid run transition {:?} -> {:?}",
                self.state, next
            )));
        }
        debug!(direction = %self.direction, "Run state {:?} -> {:?}", self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to `Aborted`, report it and hand the error back.
    fn abort<T>(&mut self, error: StrataError) -> Result<T> {
        if !self.state.is_terminal() {
            self.advance(RunState::Aborted)?;
        }
        self.events.emit(MigrationEvent::RunAborted {
            direction: self.direction,
            reason: error.to_string(),
        });
        Err(error)
    }
}

enum UnitFailure {
    /// The unit's own up/down action failed.
    Action(StrataError),
    /// Session handling or bookkeeping failed.
    Store(StrataError),
}

/// Applies and reverts migrations from a source against a record store.
pub struct Migrator<St: RecordStore> {
    source: Box<dyn MigrationSource<St::Session>>,
    store: St,
    events: Arc<dyn EventSink>,
}

impl<St: RecordStore> Migrator<St>
where
    St::Session: 'static,
{
    pub fn new(source: impl MigrationSource<St::Session> + 'static, store: St) -> Self {
        Self {
            source: Box::new(source),
            store,
            events: Arc::new(TracingSink),
        }
    }

    /// Replace the default tracing sink.
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    /// Apply every pending migration in identifier order.
    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecutionResult> {
        let mut run = Run::start(Direction::Up, self.events.as_ref())?;

        let (catalog, applied) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => return run.abort(e),
        };

        let missing = drift::check(applied.iter().map(|r| &r.id), &catalog.id_set());
        if !missing.is_empty() {
            self.events.emit(MigrationEvent::DriftDetected {
                missing: missing.clone(),
                ignored: options.ignore_missing_migrations,
            });
            if !options.ignore_missing_migrations {
                run.advance(RunState::DriftDetected)?;
                return run.abort(StrataError::Drift { missing });
            }
        }

        let units = pending_units(&catalog, &applied);
        self.run_units(&mut run, units).await
    }

    /// Revert applied migrations, newest first.
    pub async fn revert(&self, target: RevertTarget) -> Result<ExecutionResult> {
        let mut run = Run::start(Direction::Down, self.events.as_ref())?;

        let (catalog, applied) = match self.load().await {
            Ok(loaded) => loaded,
            Err(e) => return run.abort(e),
        };

        let selected = match select_for_revert(&applied, &target) {
            Ok(selected) => selected,
            Err(e) => return run.abort(e),
        };

        let missing = drift::check(selected.iter().copied(), &catalog.id_set());
        if !missing.is_empty() {
            self.events.emit(MigrationEvent::DriftDetected {
                missing: missing.clone(),
                ignored: false,
            });
            run.advance(RunState::DriftDetected)?;
            return run.abort(StrataError::Drift { missing });
        }

        let mut units = Vec::with_capacity(selected.len());
        for id in selected {
            let Some(unit) = catalog.get(id) else {
                return run.abort(StrataError::Internal(format!(
                    "migration '{}' vanished from catalog",
                    id
                )));
            };
            if !unit.has_down() {
                return run.abort(StrataError::Configuration(format!(
                    "Migration '{}' has no down action and cannot be reverted",
                    id
                )));
            }
            units.push(unit);
        }

        self.run_units(&mut run, units).await
    }

    /// Identifiers `execute` would apply, in order. Applies nothing.
    pub async fn pending(&self) -> Result<Vec<MigrationId>> {
        let (catalog, applied) = self.inspect().await?;
        Ok(pending_units(&catalog, &applied)
            .into_iter()
            .map(|u| u.id.clone())
            .collect())
    }

    /// Applied identifiers no source provides, ascending.
    pub async fn check_drift(&self) -> Result<Vec<MigrationId>> {
        let (catalog, applied) = self.inspect().await?;
        Ok(drift::check(
            applied.iter().map(|r| &r.id),
            &catalog.id_set(),
        ))
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        let (catalog, applied) = self.inspect().await?;

        let missing = drift::check(applied.iter().map(|r| &r.id), &catalog.id_set());
        let pending = pending_units(&catalog, &applied)
            .into_iter()
            .map(|u| u.id.clone())
            .collect();
        let applied = applied
            .into_iter()
            .map(|record| {
                let unit = catalog.get(&record.id);
                AppliedStatus {
                    has_down: unit.is_some_and(|u| u.has_down()),
                    present: unit.is_some(),
                    id: record.id,
                    applied_at: record.applied_at,
                }
            })
            .collect();

        Ok(MigrationStatus {
            applied,
            pending,
            missing,
        })
    }

    /// Catalog first so discovery errors surface before any store I/O.
    async fn load(&self) -> Result<(Catalog<St::Session>, Vec<AppliedRecord>)> {
        let catalog = self.source.list_all()?;
        self.store.ensure_table().await?;
        let applied = self.store.load_applied().await?;
        debug!(
            known = catalog.len(),
            applied = applied.len(),
            "Loaded migration state"
        );
        Ok((catalog, applied))
    }

    /// Read-only variant of [`load`](Self::load): a missing table means nothing is applied.
    async fn inspect(&self) -> Result<(Catalog<St::Session>, Vec<AppliedRecord>)> {
        let catalog = self.source.list_all()?;
        let applied = if self.store.table_exists().await? {
            self.store.load_applied().await?
        } else {
            Vec::new()
        };
        debug!(
            known = catalog.len(),
            applied = applied.len(),
            "Loaded migration state"
        );
        Ok((catalog, applied))
    }

    async fn run_units(
        &self,
        run: &mut Run<'_>,
        units: Vec<&MigrationUnit<St::Session>>,
    ) -> Result<ExecutionResult> {
        let direction = run.direction;
        run.advance(RunState::Applying)?;
        self.events.emit(MigrationEvent::RunStarted {
            direction,
            pending: units.len(),
        });

        let mut result = ExecutionResult::new(direction);
        for unit in units {
            self.events.emit(MigrationEvent::UnitStarted {
                id: unit.id.clone(),
                direction,
            });
            let started = Instant::now();

            if let Err(failure) = self.run_unit(unit, direction).await {
                let (UnitFailure::Action(cause) | UnitFailure::Store(cause)) = &failure;
                self.events.emit(MigrationEvent::UnitFailed {
                    id: unit.id.clone(),
                    direction,
                    error: cause.to_string(),
                });
                let error = match failure {
                    UnitFailure::Action(source) => StrataError::Migration {
                        id: unit.id.clone(),
                        direction,
                        completed: result.migrations,
                        source: Box::new(source),
                    },
                    UnitFailure::Store(e) => e,
                };
                return run.abort(error);
            }

            self.events.emit(MigrationEvent::UnitFinished {
                id: unit.id.clone(),
                direction,
                elapsed: started.elapsed(),
            });
            result.migrations.push(unit.id.clone());
        }

        run.advance(RunState::Completed)?;
        self.events.emit(MigrationEvent::RunCompleted {
            direction,
            count: result.len(),
        });
        Ok(result)
    }

    /// One unit in one session: action, bookkeeping, commit.
    async fn run_unit(
        &self,
        unit: &MigrationUnit<St::Session>,
        direction: Direction,
    ) -> std::result::Result<(), UnitFailure> {
        let mut session = self.store.begin().await.map_err(UnitFailure::Store)?;

        let action = match direction {
            Direction::Up => unit.script.up(&mut session).await,
            Direction::Down => unit.script.down(&mut session).await,
        };
        if let Err(e) = action {
            self.discard(session, &unit.id).await;
            return Err(UnitFailure::Action(e));
        }

        let bookkeeping = match direction {
            Direction::Up => self.store.record_applied(&mut session, &unit.id).await,
            Direction::Down => self.store.remove_applied(&mut session, &unit.id).await,
        };
        if let Err(e) = bookkeeping {
            self.discard(session, &unit.id).await;
            return Err(UnitFailure::Store(e));
        }

        self.store.commit(session).await.map_err(UnitFailure::Store)
    }

    async fn discard(&self, session: St::Session, id: &MigrationId) {
        if let Err(e) = self.store.rollback(session).await {
            warn!(migration = %id, "Failed to roll back migration session: {}", e);
        }
    }
}

fn pending_units<'c, S>(
    catalog: &'c Catalog<S>,
    applied: &[AppliedRecord],
) -> Vec<&'c MigrationUnit<S>> {
    catalog
        .iter()
        .filter(|unit| {
            applied
                .binary_search_by(|record| record.id.cmp(&unit.id))
                .is_err()
        })
        .collect()
}

/// Applied identifiers a revert touches, newest first.
fn select_for_revert<'a>(
    applied: &'a [AppliedRecord],
    target: &RevertTarget,
) -> Result<Vec<&'a MigrationId>> {
    let newest_first = applied.iter().rev().map(|r| &r.id);
    match target {
        RevertTarget::Steps(n) => Ok(newest_first.take(*n).collect()),
        RevertTarget::All => Ok(newest_first.collect()),
        RevertTarget::Through(target) => {
            if !applied.iter().any(|r| &r.id == target) {
                return Err(StrataError::UnknownTarget(target.clone()));
            }
            Ok(newest_first.filter(|id| *id >= target).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::memory::{MemorySession, MemoryStore};
    use crate::migrations::source::CodeSource;
    use strata_core::events::CollectingSink;
    use strata_core::migration::{BoxFuture, MigrationScript};
    use strata_core::store::SqlExecutor;

    struct Failing;

    impl MigrationScript<MemorySession> for Failing {
        fn up<'a>(&'a self, session: &'a mut MemorySession) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                session.execute_sql("CREATE TABLE half_done (id INT)").await?;
                Err(StrataError::Sql("relation \"missing\" does not exist".to_string()))
            })
        }
    }

    fn ids(raw: &[&str]) -> Vec<MigrationId> {
        raw.iter().map(|s| MigrationId::new(*s)).collect()
    }

    fn source(names: &[&str]) -> CodeSource<MemorySession> {
        names.iter().fold(CodeSource::new(), |source, name| {
            source
                .register_sql(
                    *name,
                    &format!("CREATE TABLE t{} (id INT)", name),
                    Some(&format!("DROP TABLE t{}", name)),
                )
                .unwrap()
        })
    }

    fn migrator(
        source: CodeSource<MemorySession>,
        store: &MemoryStore,
    ) -> (Migrator<MemoryStore>, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::new());
        let migrator = Migrator::new(source, store.clone()).with_events(sink.clone());
        (migrator, sink)
    }

    #[test]
    fn test_run_state_transitions() {
        use RunState::*;
        assert!(Idle.can_transition_to(ComputingPending));
        assert!(ComputingPending.can_transition_to(DriftDetected));
        assert!(DriftDetected.can_transition_to(Aborted));
        assert!(Applying.can_transition_to(Completed));

        assert!(!Idle.can_transition_to(Applying));
        assert!(!DriftDetected.can_transition_to(Applying));
        assert!(!Completed.can_transition_to(Aborted));
        assert!(Completed.is_terminal());
        assert!(!Applying.is_terminal());
    }

    #[tokio::test]
    async fn test_pending_in_identifier_order() {
        let store = MemoryStore::new();
        let (migrator, _) = migrator(source(&["3", "1", "2"]), &store);

        assert_eq!(migrator.pending().await.unwrap(), ids(&["1", "2", "3"]));
        assert!(store.applied_ids().is_empty());
    }

    #[tokio::test]
    async fn test_execute_applies_pending_then_is_idempotent() {
        let store = MemoryStore::new();
        let (migrator, sink) = migrator(source(&["1", "2"]), &store);

        let result = migrator.execute(ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.direction, Direction::Up);
        assert_eq!(result.migrations, ids(&["1", "2"]));
        assert_eq!(store.applied_ids(), ids(&["1", "2"]));
        assert_eq!(
            store.executed_statements(),
            vec!["CREATE TABLE t1 (id INT)", "CREATE TABLE t2 (id INT)"]
        );

        let again = migrator.execute(ExecuteOptions::default()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.applied_ids(), ids(&["1", "2"]));

        let events = sink.events();
        assert_eq!(
            events[0],
            MigrationEvent::RunStarted {
                direction: Direction::Up,
                pending: 2
            }
        );
        assert!(matches!(
            events.last(),
            Some(MigrationEvent::RunCompleted { count: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_execute_only_applies_unrecorded_units() {
        let store = MemoryStore::with_applied(["1"]);
        let (migrator, _) = migrator(source(&["1", "2"]), &store);

        let result = migrator.execute(ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.migrations, ids(&["2"]));
        assert_eq!(store.executed_statements(), vec!["CREATE TABLE t2 (id INT)"]);
    }

    #[tokio::test]
    async fn test_drift_aborts_before_applying() {
        let store = MemoryStore::with_applied(["1", "2", "5"]);
        let (migrator, sink) = migrator(source(&["1", "2", "3"]), &store);

        assert_eq!(migrator.check_drift().await.unwrap(), ids(&["5"]));

        let err = migrator
            .execute(ExecuteOptions::default())
            .await
            .unwrap_err();
        match &err {
            StrataError::Drift { missing } => assert_eq!(missing, &ids(&["5"])),
            other => panic!("expected drift, got {other:?}"),
        }
        assert!(err.to_string().contains("probably need to downgrade"));
        assert_eq!(store.applied_ids(), ids(&["1", "2", "5"]));
        assert!(store.executed_statements().is_empty());

        let events = sink.events();
        assert!(events.contains(&MigrationEvent::DriftDetected {
            missing: ids(&["5"]),
            ignored: false,
        }));
        assert!(matches!(
            events.last(),
            Some(MigrationEvent::RunAborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_drift_can_be_ignored() {
        let store = MemoryStore::with_applied(["1", "5"]);
        let (migrator, sink) = migrator(source(&["1", "2"]), &store);

        let options = ExecuteOptions {
            ignore_missing_migrations: true,
        };
        let result = migrator.execute(options).await.unwrap();
        assert_eq!(result.migrations, ids(&["2"]));
        assert_eq!(store.applied_ids(), ids(&["1", "2", "5"]));
        assert!(sink.events().contains(&MigrationEvent::DriftDetected {
            missing: ids(&["5"]),
            ignored: true,
        }));
    }

    #[tokio::test]
    async fn test_failed_unit_keeps_earlier_units() {
        let store = MemoryStore::new();
        let code = source(&["1"]).register("2", Failing);
        let code = code
            .register_sql("3", "CREATE TABLE t3 (id INT)", None)
            .unwrap();
        let (migrator, sink) = migrator(code, &store);

        let err = migrator
            .execute(ExecuteOptions::default())
            .await
            .unwrap_err();
        match &err {
            StrataError::Migration {
                id,
                direction,
                completed,
                source,
            } => {
                assert_eq!(id.as_str(), "2");
                assert_eq!(*direction, Direction::Up);
                assert_eq!(completed, &ids(&["1"]));
                assert!(matches!(**source, StrataError::Sql(_)));
            }
            other => panic!("expected migration failure, got {other:?}"),
        }

        assert_eq!(store.applied_ids(), ids(&["1"]));
        // Statements of the failed unit were rolled back with its session.
        assert_eq!(store.executed_statements(), vec!["CREATE TABLE t1 (id INT)"]);

        let events = sink.events();
        assert!(events
            .iter()
            .any(|e| matches!(e, MigrationEvent::UnitFailed { id, .. } if id.as_str() == "2")));
        assert!(!events
            .iter()
            .any(|e| matches!(e, MigrationEvent::UnitStarted { id, .. } if id.as_str() == "3")));
    }

    #[tokio::test]
    async fn test_duplicate_identifier_fails_without_io() {
        let store = MemoryStore::new();
        let code = source(&["1"]).register_sql("1", "SELECT 1", None).unwrap();
        let (migrator, _) = migrator(code, &store);

        let err = migrator
            .execute(ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Configuration(_)));
        assert!(err.to_string().contains("Duplicate migration identifier '1'"));
        assert_eq!(store.io_calls(), 0);
        assert!(!store.table_created());
    }

    #[tokio::test]
    async fn test_storage_failure_is_fatal() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let (migrator, sink) = migrator(source(&["1"]), &store);

        let err = migrator
            .execute(ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Storage(_)));
        assert!(matches!(
            sink.events().last(),
            Some(MigrationEvent::RunAborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_revert_through_is_inclusive_and_descending() {
        let store = MemoryStore::new();
        let (migrator, _) = migrator(source(&["1", "2"]), &store);
        migrator.execute(ExecuteOptions::default()).await.unwrap();

        let result = migrator
            .revert(RevertTarget::Through(MigrationId::new("1")))
            .await
            .unwrap();
        assert_eq!(result.direction, Direction::Down);
        assert_eq!(result.migrations, ids(&["2", "1"]));
        assert!(store.applied_ids().is_empty());
        assert_eq!(
            store.executed_statements()[2..],
            ["DROP TABLE t2", "DROP TABLE t1"]
        );
    }

    #[tokio::test]
    async fn test_revert_steps_and_all() {
        let store = MemoryStore::with_applied(["1", "2", "3"]);
        let (migrator, _) = migrator(source(&["1", "2", "3"]), &store);

        let result = migrator.revert(RevertTarget::Steps(1)).await.unwrap();
        assert_eq!(result.migrations, ids(&["3"]));
        assert_eq!(store.applied_ids(), ids(&["1", "2"]));

        let result = migrator.revert(RevertTarget::Steps(0)).await.unwrap();
        assert!(result.is_empty());

        let result = migrator.revert(RevertTarget::All).await.unwrap();
        assert_eq!(result.migrations, ids(&["2", "1"]));
        assert!(store.applied_ids().is_empty());
    }

    #[tokio::test]
    async fn test_revert_unknown_target() {
        let store = MemoryStore::with_applied(["1"]);
        let (migrator, _) = migrator(source(&["1", "2"]), &store);

        let err = migrator
            .revert(RevertTarget::Through(MigrationId::new("2")))
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::UnknownTarget(id) if id.as_str() == "2"));
        assert_eq!(store.applied_ids(), ids(&["1"]));
    }

    #[tokio::test]
    async fn test_revert_validates_before_running() {
        let store = MemoryStore::with_applied(["1", "2"]);
        let code = source(&["1"])
            .register_sql("2", "CREATE TABLE t2 (id INT)", None)
            .unwrap();
        let (migrator, _) = migrator(code, &store);

        let err = migrator.revert(RevertTarget::All).await.unwrap_err();
        assert!(matches!(err, StrataError::Configuration(_)));
        assert!(err.to_string().contains("'2'"));
        assert_eq!(store.applied_ids(), ids(&["1", "2"]));
        assert!(store.executed_statements().is_empty());
    }

    #[tokio::test]
    async fn test_revert_of_missing_unit_is_drift() {
        let store = MemoryStore::with_applied(["1", "9"]);
        let (migrator, _) = migrator(source(&["1"]), &store);

        let err = migrator.revert(RevertTarget::Steps(1)).await.unwrap_err();
        assert!(err.is_drift());
        assert_eq!(store.applied_ids(), ids(&["1", "9"]));
    }

    #[tokio::test]
    async fn test_status() {
        let store = MemoryStore::with_applied(["1", "7"]);
        let code = source(&["1"])
            .register_sql("2", "CREATE TABLE t2 (id INT)", None)
            .unwrap();
        let (migrator, _) = migrator(code, &store);

        let status = migrator.status().await.unwrap();
        assert_eq!(status.pending, ids(&["2"]));
        assert_eq!(status.missing, ids(&["7"]));
        assert_eq!(status.applied.len(), 2);
        assert!(status.applied[0].present && status.applied[0].has_down);
        assert!(!status.applied[1].present && !status.applied[1].has_down);
        assert!(!status.is_up_to_date());
    }

    #[tokio::test]
    async fn test_read_paths_do_not_create_table() {
        let store = MemoryStore::new();
        let (migrator, _) = migrator(source(&["1", "2"]), &store);

        assert_eq!(migrator.pending().await.unwrap(), ids(&["1", "2"]));
        assert!(migrator.check_drift().await.unwrap().is_empty());
        let status = migrator.status().await.unwrap();
        assert!(status.applied.is_empty());
        assert_eq!(status.pending, ids(&["1", "2"]));

        assert!(!store.table_created());
        assert!(store.executed_statements().is_empty());
    }
}

