//! In-process record store, for embedding and tests.

use std::collections::BTreeMap;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use strata_core::error::{Result, StrataError};
use strata_core::migration::{BoxFuture, MigrationId};
use strata_core::record::AppliedRecord;
use strata_core::store::{RecordStore, SqlExecutor};

#[derive(Debug, Default)]
struct MemoryState {
    table_created: bool,
    records: BTreeMap<MigrationId, DateTime<Utc>>,
    executed: Vec<String>,
    unavailable: bool,
    io_calls: usize,
}

#[derive(Debug)]
enum Change {
    Insert(MigrationId),
    Remove(MigrationId),
}

/// Pending changes of one unit; nothing is visible until commit.
#[derive(Debug, Default)]
pub struct MemorySession {
    changes: Vec<Change>,
    statements: Vec<String>,
}

impl SqlExecutor for MemorySession {
    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        self.statements.push(sql.to_string());
        Box::pin(ready(Ok(())))
    }
}

/// Record store kept in memory. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store with the given identifiers already recorded as applied.
    pub fn with_applied<I, T>(ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<MigrationId>,
    {
        let store = Self::new();
        {
            let mut state = store.lock();
            state.table_created = true;
            let now = Utc::now();
            for id in ids {
                state.records.insert(id.into(), now);
            }
        }
        store
    }

    /// Simulate a backend that refuses every operation.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    pub fn applied_ids(&self) -> Vec<MigrationId> {
        self.lock().records.keys().cloned().collect()
    }

    /// Statements committed by SQL migrations, in execution order.
    pub fn executed_statements(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    /// Number of store operations attempted so far.
    pub fn io_calls(&self) -> usize {
        self.lock().io_calls
    }

    pub fn table_created(&self) -> bool {
        self.lock().table_created
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count the call and fail if the backend is unavailable.
    fn access(&self) -> Result<MutexGuard<'_, MemoryState>> {
        let mut state = self.lock();
        state.io_calls += 1;
        if state.unavailable {
            return Err(StrataError::Storage(
                "memory store is unavailable".to_string(),
            ));
        }
        Ok(state)
    }

    fn stage(&self, session: &mut MemorySession, change: Change) -> Result<()> {
        let state = self.access()?;
        if !state.table_created {
            return Err(StrataError::Storage(
                "tracking table does not exist".to_string(),
            ));
        }
        let staged_insert = |id: &MigrationId| {
            session
                .changes
                .iter()
                .any(|c| matches!(c, Change::Insert(staged) if staged == id))
        };
        match &change {
            Change::Insert(id) if state.records.contains_key(id) || staged_insert(id) => {
                return Err(StrataError::Storage(format!(
                    "migration '{}' is already recorded",
                    id
                )));
            }
            Change::Remove(id) if !state.records.contains_key(id) => {
                return Err(StrataError::Storage(format!(
                    "migration '{}' is not recorded",
                    id
                )));
            }
            _ => {}
        }
        drop(state);
        session.changes.push(change);
        Ok(())
    }
}

impl RecordStore for MemoryStore {
    type Session = MemorySession;

    fn ensure_table(&self) -> BoxFuture<'_, Result<()>> {
        let result = self.access().map(|mut state| {
            state.table_created = true;
        });
        Box::pin(ready(result))
    }

    fn table_exists(&self) -> BoxFuture<'_, Result<bool>> {
        let result = self.access().map(|state| state.table_created);
        Box::pin(ready(result))
    }

    fn load_applied(&self) -> BoxFuture<'_, Result<Vec<AppliedRecord>>> {
        let result = self.access().map(|state| {
            state
                .records
                .iter()
                .map(|(id, at)| AppliedRecord::new(id.clone(), *at))
                .collect()
        });
        Box::pin(ready(result))
    }

    fn begin(&self) -> BoxFuture<'_, Result<MemorySession>> {
        let result = self.access().map(|_| MemorySession::default());
        Box::pin(ready(result))
    }

    fn commit(&self, session: MemorySession) -> BoxFuture<'_, Result<()>> {
        let result = self.access().map(|mut state| {
            let now = Utc::now();
            for change in session.changes {
                match change {
                    Change::Insert(id) => {
                        state.records.insert(id, now);
                    }
                    Change::Remove(id) => {
                        state.records.remove(&id);
                    }
                }
            }
            state.executed.extend(session.statements);
        });
        Box::pin(ready(result))
    }

    fn rollback(&self, _session: MemorySession) -> BoxFuture<'_, Result<()>> {
        let result = self.access().map(|_| ());
        Box::pin(ready(result))
    }

    fn record_applied<'a>(
        &'a self,
        session: &'a mut MemorySession,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(ready(self.stage(session, Change::Insert(id.clone()))))
    }

    fn remove_applied<'a>(
        &'a self,
        session: &'a mut MemorySession,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(ready(self.stage(session, Change::Remove(id.clone()))))
    }
}
