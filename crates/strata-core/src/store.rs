use crate::error::{Result, StrataError};
use crate::migration::{BoxFuture, MigrationId};
use crate::record::AppliedRecord;

/// Persists which migrations have been applied, inside the target database.
///
/// Writes go through a [`Session`](Self::Session) so a unit's action and its
/// bookkeeping commit or roll back together.
pub trait RecordStore: Send + Sync {
    /// Transaction handle shared by migration actions and record writes.
    type Session: Send;

    /// Create the tracking table if it does not exist. Never alters an existing table.
    fn ensure_table(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether the tracking table exists. Issues no DDL.
    fn table_exists(&self) -> BoxFuture<'_, Result<bool>>;

    /// All applied records, ascending by identifier.
    fn load_applied(&self) -> BoxFuture<'_, Result<Vec<AppliedRecord>>>;

    fn begin(&self) -> BoxFuture<'_, Result<Self::Session>>;

    fn commit(&self, session: Self::Session) -> BoxFuture<'_, Result<()>>;

    fn rollback(&self, session: Self::Session) -> BoxFuture<'_, Result<()>>;

    fn record_applied<'a>(
        &'a self,
        session: &'a mut Self::Session,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>>;

    fn remove_applied<'a>(
        &'a self,
        session: &'a mut Self::Session,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>>;
}

/// A session able to run raw SQL. File-based migrations run through this.
pub trait SqlExecutor: Send {
    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>>;
}

impl SqlExecutor for sqlx::Transaction<'static, sqlx::Postgres> {
    fn execute_sql<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(sql)
                .persistent(false)
                .execute(&mut **self)
                .await
                .map_err(|e| StrataError::Sql(e.to_string()))?;
            Ok(())
        })
    }
}
