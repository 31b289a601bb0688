use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::{Result, StrataError};

/// Database configuration.
///
/// Either `url` or the discrete `name`/`user`/`password` parameters must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection URL. Takes precedence over the discrete parameters.
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name.
    pub name: Option<String>,

    pub user: Option<String>,

    pub password: Option<String>,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Pool checkout timeout in seconds.
    #[serde(default = "default_pool_timeout")]
    pub pool_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            host: default_host(),
            port: default_port(),
            name: None,
            user: None,
            password: None,
            pool_size: default_pool_size(),
            pool_timeout_secs: default_pool_timeout(),
        }
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_pool_size() -> u32 {
    5
}

fn default_pool_timeout() -> u64 {
    30
}

impl DatabaseConfig {
    /// Check that enough connection parameters are present.
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(StrataError::Configuration(
                "database.pool_size must be at least 1".to_string(),
            ));
        }

        if !self.url.is_empty() {
            return Ok(());
        }

        let required = [
            ("name", &self.name),
            ("user", &self.user),
            ("password", &self.password),
        ];
        for (param, value) in required {
            if value.as_deref().map_or(true, str::is_empty) {
                return Err(StrataError::Configuration(format!(
                    "missing mandatory config parameter database.{}",
                    param
                )));
            }
        }

        Ok(())
    }

    /// Build connection options, validating first.
    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        self.validate()?;

        if !self.url.is_empty() {
            return self.url.parse::<PgConnectOptions>().map_err(|e| {
                StrataError::Configuration(format!("Invalid database url: {}", e))
            });
        }

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port);
        if let Some(name) = &self.name {
            options = options.database(name);
        }
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}
