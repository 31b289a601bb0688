use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tracing::{debug, warn};

use strata_core::config::StrataConfig;
use strata_core::error::{Result, StrataError};
use strata_core::events::EventSink;
use strata_core::migration::{MigrationId, MigrationScript};
use strata_core::record::{ExecuteOptions, ExecutionResult, MigrationStatus, RevertTarget};
use strata_runtime::migrations::{
    CodeSource, DirectorySource, MigrationLock, Migrator, MultiSource, PgRecordStore, PgSession,
};
use strata_runtime::Database;

/// Migration engine bound to one PostgreSQL database.
///
/// Runs that change the schema (`up`, `execute`, `revert`) take an advisory lock on
/// the tracking table and honour the configured run timeout.
pub struct Strata {
    config: StrataConfig,
    db: Database,
    migrator: Migrator<PgRecordStore>,
}

impl Strata {
    pub fn builder() -> StrataBuilder {
        StrataBuilder::new()
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn migrator(&self) -> &Migrator<PgRecordStore> {
        &self.migrator
    }

    /// Apply pending migrations using the configured options.
    pub async fn up(&self) -> Result<ExecutionResult> {
        self.execute(ExecuteOptions {
            ignore_missing_migrations: self.config.migrations.ignore_missing_migrations,
        })
        .await
    }

    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecutionResult> {
        self.guarded(self.migrator.execute(options)).await
    }

    pub async fn revert(&self, target: RevertTarget) -> Result<ExecutionResult> {
        self.guarded(self.migrator.revert(target)).await
    }

    pub async fn pending(&self) -> Result<Vec<MigrationId>> {
        self.migrator.pending().await
    }

    pub async fn check_drift(&self) -> Result<Vec<MigrationId>> {
        self.migrator.check_drift().await
    }

    pub async fn status(&self) -> Result<MigrationStatus> {
        self.migrator.status().await
    }

    pub async fn close(&self) {
        self.db.close().await;
    }

    fn run_timeout(&self) -> Option<Duration> {
        self.config
            .migrations
            .run_timeout_secs
            .map(Duration::from_secs)
    }

    /// Lock wait, run and unlock all count against the run timeout.
    async fn guarded<T>(&self, run: impl Future<Output = Result<T>>) -> Result<T> {
        let locked = async {
            let lock = if self.config.migrations.lock {
                let key = self.migrator.store().lock_key();
                Some(MigrationLock::acquire(self.db.pool(), key).await?)
            } else {
                None
            };

            let result = run.await;

            if let Some(lock) = lock {
                if let Err(e) = lock.release().await {
                    warn!("Failed to release migration lock: {}", e);
                }
            }
            result
        };

        match self.run_timeout() {
            Some(limit) => tokio::time::timeout(limit, locked)
                .await
                .unwrap_or_else(|_| Err(StrataError::Timeout(limit))),
            None => locked.await,
        }
    }
}

/// Builder wiring configuration, database pool and migration sources together.
pub struct StrataBuilder {
    config: Option<StrataConfig>,
    migrations_dir: Option<PathBuf>,
    pool: Option<PgPool>,
    code: CodeSource<PgSession>,
    sql: Vec<(String, String, Option<String>)>,
    events: Option<Arc<dyn EventSink>>,
}

impl StrataBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            migrations_dir: None,
            pool: None,
            code: CodeSource::new(),
            sql: Vec::new(),
            events: None,
        }
    }

    pub fn config(mut self, config: StrataConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Override `migrations.dir` from the configuration.
    pub fn migrations_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.migrations_dir = Some(path.into());
        self
    }

    /// Use an existing pool instead of connecting from `[database]`.
    pub fn pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Add a forward-only SQL migration alongside the directory ones.
    pub fn migration(mut self, id: impl Into<String>, up: impl Into<String>) -> Self {
        self.sql.push((id.into(), up.into(), None));
        self
    }

    /// Add a SQL migration with a down section.
    pub fn reversible_migration(
        mut self,
        id: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        self.sql.push((id.into(), up.into(), Some(down.into())));
        self
    }

    /// Add a migration implemented in Rust.
    pub fn script(
        mut self,
        id: impl Into<String>,
        script: impl MigrationScript<PgSession> + 'static,
    ) -> Self {
        self.code = self.code.register(id, script);
        self
    }

    /// Receive run events instead of logging them through `tracing`.
    pub fn events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Validate configuration, then connect.
    pub async fn connect(self) -> Result<Strata> {
        let mut config = self
            .config
            .ok_or_else(|| StrataError::Configuration("Configuration is required".to_string()))?;
        if let Some(dir) = self.migrations_dir {
            config.migrations.dir = dir;
        }

        config.migrations.validate()?;
        if self.pool.is_none() {
            config.database.validate()?;
        }

        let mut code = self.code;
        for (id, up, down) in self.sql {
            code = code.register_sql(id, &up, down.as_deref())?;
        }
        let source = MultiSource::new()
            .with(DirectorySource::new(
                config.migrations.dir.clone(),
                config.migrations.file_pattern()?,
            ))
            .with(code);

        let db = match self.pool {
            Some(pool) => Database::from_pool(pool),
            None => Database::from_config(&config.database).await?,
        };
        let store = PgRecordStore::new(db.pool().clone(), &config.migrations.table)?;
        debug!(
            table = %config.migrations.table,
            dir = ?config.migrations.dir,
            "Migration engine ready"
        );

        let mut migrator = Migrator::new(source, store);
        if let Some(sink) = self.events {
            migrator = migrator.with_events(sink);
        }

        Ok(Strata {
            config,
            db,
            migrator,
        })
    }
}

impl Default for StrataBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_builder_requires_config() {
        let err = StrataBuilder::new().connect().await.err().unwrap();
        assert!(matches!(err, StrataError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_builder_reports_missing_database_parameter() {
        let mut config = StrataConfig::default();
        config.database.name = Some("app".to_string());

        let err = Strata::builder()
            .config(config)
            .connect()
            .await
            .err()
            .unwrap();
        assert!(err
            .to_string()
            .contains("missing mandatory config parameter database.user"));
    }

    #[tokio::test]
    async fn test_builder_rejects_invalid_table_before_connecting() {
        let mut config = StrataConfig::default_with_database_url("postgres://localhost/app");
        config.migrations.table = "drop table; --".to_string();

        let err = Strata::builder().config(config).connect().await.err().unwrap();
        assert!(matches!(err, StrataError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_builder_rejects_empty_code_migration() {
        let config = StrataConfig::default_with_database_url("postgres://localhost/app");

        let err = Strata::builder()
            .config(config)
            .migration("0001_empty", "-- nothing")
            .connect()
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("0001_empty"));
    }

    fn database_config(table: &str, dir: &std::path::Path) -> StrataConfig {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let mut config = StrataConfig::default_with_database_url(&url);
        config.migrations.table = table.to_string();
        config.migrations.dir = dir.to_path_buf();
        config
    }

    async fn drop_tables(strata: &Strata, tables: &[&str]) {
        for table in tables {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table))
                .execute(strata.database().pool())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_timed_out_run_releases_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let table = "strata_test_timed_out";

        let mut config = database_config(table, dir.path());
        config.migrations.run_timeout_secs = Some(1);
        let slow = Strata::builder()
            .config(config)
            .migration("0001_slow", "SELECT pg_sleep(3);")
            .connect()
            .await
            .unwrap();
        drop_tables(&slow, &[table]).await;

        let err = slow.up().await.unwrap_err();
        assert!(matches!(err, StrataError::Timeout(_)));

        let fast = Strata::builder()
            .config(database_config(table, dir.path()))
            .migration("0001_fast", "SELECT 1;")
            .connect()
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), fast.up())
            .await
            .expect("lock from the timed out run is still held")
            .unwrap();
        assert_eq!(result.migrations, vec![MigrationId::new("0001_fast")]);

        drop_tables(&fast, &[table]).await;
        slow.close().await;
        fast.close().await;
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_timeout_covers_lock_wait() {
        let dir = tempfile::TempDir::new().unwrap();
        let table = "strata_test_lock_wait";

        let mut config = database_config(table, dir.path());
        config.migrations.run_timeout_secs = Some(1);
        let strata = Strata::builder()
            .config(config)
            .migration("0001_noop", "SELECT 1;")
            .connect()
            .await
            .unwrap();
        drop_tables(&strata, &[table]).await;

        let held = MigrationLock::acquire(
            strata.database().pool(),
            strata_runtime::migrations::lock_key(table),
        )
        .await
        .unwrap();

        let started = std::time::Instant::now();
        let err = strata.up().await.unwrap_err();
        assert!(matches!(err, StrataError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));

        held.release().await.unwrap();
        assert!(strata.pending().await.unwrap().contains(&MigrationId::new("0001_noop")));

        drop_tables(&strata, &[table]).await;
        strata.close().await;
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_single_connection_pool_with_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let table = "strata_test_single_conn";

        let mut config = database_config(table, dir.path());
        config.database.pool_size = 1;
        config.migrations.lock = true;
        let strata = Strata::builder()
            .config(config)
            .reversible_migration(
                "0001_widgets",
                "CREATE TABLE strata_test_widgets (id INT);",
                "DROP TABLE strata_test_widgets;",
            )
            .connect()
            .await
            .unwrap();
        drop_tables(&strata, &[table, "strata_test_widgets"]).await;

        let applied = strata.up().await.unwrap();
        assert_eq!(applied.len(), 1);

        let reverted = strata.revert(RevertTarget::All).await.unwrap();
        assert_eq!(reverted.migrations, vec![MigrationId::new("0001_widgets")]);

        drop_tables(&strata, &[table]).await;
        strata.close().await;
    }
}
