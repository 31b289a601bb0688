//! PostgreSQL record store and advisory lock.

use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::debug;

use strata_core::config::validate_table_name;
use strata_core::error::{Result, StrataError};
use strata_core::migration::{BoxFuture, MigrationId};
use strata_core::record::AppliedRecord;
use strata_core::store::RecordStore;

/// Transaction a unit and its record run in.
pub type PgSession = Transaction<'static, Postgres>;

/// Lock ID base for the migration advisory lock ("STRATA" in hex).
const MIGRATION_LOCK_BASE: i64 = 0x5354_5241_5441;

/// Tracks applied migrations in a table of the target database.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    table: String,
    quoted_table: String,
}

impl PgRecordStore {
    /// Create a store writing to `table` (optionally `schema.table`).
    pub fn new(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            quoted_table: quote_table(table),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Advisory lock key for this store's table.
    pub fn lock_key(&self) -> i64 {
        lock_key(&self.table)
    }
}

fn quote_table(table: &str) -> String {
    table
        .split('.')
        .map(|part| format!("\"{}\"", part))
        .collect::<Vec<_>>()
        .join(".")
}

/// Stable key so runs against the same tracking table contend for the same lock.
pub fn lock_key(table: &str) -> i64 {
    // FNV-1a
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in table.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    MIGRATION_LOCK_BASE ^ ((hash >> 16) as i64)
}

fn storage(action: &str, e: sqlx::Error) -> StrataError {
    StrataError::Storage(format!("Failed to {}: {}", action, e))
}

impl RecordStore for PgRecordStore {
    type Session = PgSession;

    fn ensure_table(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let sql = format!(
                r#"
                CREATE TABLE IF NOT EXISTS {} (
                    name VARCHAR(255) PRIMARY KEY,
                    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
                self.quoted_table
            );
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| storage("create migrations table", e))?;
            Ok(())
        })
    }

    fn table_exists(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(&self.quoted_table)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage("look up migrations table", e))?;
            Ok(exists)
        })
    }

    fn load_applied(&self) -> BoxFuture<'_, Result<Vec<AppliedRecord>>> {
        Box::pin(async move {
            let sql = format!("SELECT name, applied_at FROM {}", self.quoted_table);
            let rows = sqlx::query(&sql)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| storage("get applied migrations", e))?;

            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let name: String = row
                    .try_get("name")
                    .map_err(|e| storage("read migration name", e))?;
                let applied_at: DateTime<Utc> = row
                    .try_get("applied_at")
                    .map_err(|e| storage("read migration timestamp", e))?;
                records.push(AppliedRecord::new(name, applied_at));
            }

            // Database collation may differ from identifier order.
            records.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(records)
        })
    }

    fn begin(&self) -> BoxFuture<'_, Result<PgSession>> {
        Box::pin(async move {
            self.pool
                .begin()
                .await
                .map_err(|e| storage("begin transaction", e))
        })
    }

    fn commit(&self, session: PgSession) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            session
                .commit()
                .await
                .map_err(|e| storage("commit transaction", e))
        })
    }

    fn rollback(&self, session: PgSession) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            session
                .rollback()
                .await
                .map_err(|e| storage("roll back transaction", e))
        })
    }

    fn record_applied<'a>(
        &'a self,
        session: &'a mut PgSession,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!("INSERT INTO {} (name) VALUES ($1)", self.quoted_table);
            sqlx::query(&sql)
                .bind(id.as_str())
                .execute(&mut **session)
                .await
                .map_err(|e| storage(&format!("record migration '{}'", id), e))?;
            Ok(())
        })
    }

    fn remove_applied<'a>(
        &'a self,
        session: &'a mut PgSession,
        id: &'a MigrationId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let sql = format!("DELETE FROM {} WHERE name = $1", self.quoted_table);
            let result = sqlx::query(&sql)
                .bind(id.as_str())
                .execute(&mut **session)
                .await
                .map_err(|e| storage(&format!("remove migration record '{}'", id), e))?;

            if result.rows_affected() == 0 {
                return Err(StrataError::Storage(format!(
                    "No migration record for '{}'",
                    id
                )));
            }
            Ok(())
        })
    }
}

/// Session-scoped PostgreSQL advisory lock.
///
/// Held on its own connection opened outside the pool, so it never takes a pool
/// slot from the run it guards. Dropping the lock without `release` closes that
/// connection, and the server frees the lock with the session.
pub struct MigrationLock {
    conn: PgConnection,
    key: i64,
}

impl MigrationLock {
    /// Block until the lock is acquired.
    pub async fn acquire(pool: &PgPool, key: i64) -> Result<Self> {
        debug!("Acquiring migration lock...");
        let options = pool.connect_options();
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| storage("open lock connection", e))?;

        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut conn)
            .await
            .map_err(|e| storage("acquire migration lock", e))?;

        debug!("Migration lock acquired");
        Ok(Self { conn, key })
    }

    pub async fn release(mut self) -> Result<()> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut self.conn)
            .await
            .map_err(|e| storage("release migration lock", e))?;
        self.conn
            .close()
            .await
            .map_err(|e| storage("close lock connection", e))?;
        debug!("Migration lock released");
        Ok(())
    }
}
