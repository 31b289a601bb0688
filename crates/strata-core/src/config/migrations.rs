use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Migration discovery and tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding migration files. Relative paths resolve against the config file.
    #[serde(default = "default_dir")]
    pub dir: PathBuf,

    /// Tracking table, optionally schema-qualified (`schema.table`).
    #[serde(default = "default_table")]
    pub table: String,

    /// Regex a file name must match to be considered a migration.
    #[serde(default = "default_pattern")]
    pub pattern: String,

    /// Skip the drift check on `up`.
    #[serde(default)]
    pub ignore_missing_migrations: bool,

    /// Timeout for a whole run, in seconds.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,

    /// Take a PostgreSQL advisory lock around each run.
    #[serde(default = "default_lock")]
    pub lock: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_dir(),
            table: default_table(),
            pattern: default_pattern(),
            ignore_missing_migrations: false,
            run_timeout_secs: None,
            lock: default_lock(),
        }
    }
}

fn default_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_table() -> String {
    "_migrations".to_string()
}

fn default_pattern() -> String {
    r"\.sql$".to_string()
}

fn default_lock() -> bool {
    true
}

impl MigrationsConfig {
    pub fn validate(&self) -> Result<()> {
        validate_table_name(&self.table)?;
        self.file_pattern()?;
        if self.run_timeout_secs == Some(0) {
            return Err(StrataError::Configuration(
                "migrations.run_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Compiled file name pattern.
    pub fn file_pattern(&self) -> Result<Regex> {
        Regex::new(&self.pattern).map_err(|e| {
            StrataError::Configuration(format!(
                "Invalid migrations.pattern '{}': {}",
                self.pattern, e
            ))
        })
    }
}

/// Check that a tracking table name is a plain (optionally schema-qualified) identifier.
pub fn validate_table_name(table: &str) -> Result<()> {
    let ident = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$")
        .map_err(|e| StrataError::Internal(e.to_string()))?;

    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 || parts.iter().any(|p| !ident.is_match(p)) {
        return Err(StrataError::Configuration(format!(
            "Invalid migrations table name '{}'",
            table
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationsConfig::default();
        assert_eq!(config.table, "_migrations");
        assert_eq!(config.dir, PathBuf::from("migrations"));
        assert!(config.lock);
        assert!(!config.ignore_missing_migrations);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_table_names() {
        assert!(validate_table_name("_migrations").is_ok());
        assert!(validate_table_name("ops.schema_history").is_ok());
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("a.b.c").is_err());
        assert!(validate_table_name("migrations; DROP TABLE users").is_err());
        assert!(validate_table_name("1migrations").is_err());
    }

    #[test]
    fn test_invalid_pattern() {
        let config = MigrationsConfig {
            pattern: "(".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            StrataError::Configuration(_)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = MigrationsConfig {
            run_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
