//! Migration sources: a directory of SQL files, units registered in code, or both.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::migration::{Catalog, Location, MigrationScript, MigrationSource, MigrationUnit};
use strata_core::store::SqlExecutor;

use super::sql::SqlScript;

/// Loads migrations from a directory.
///
/// Files are named after their identifier and must match the configured pattern:
/// - `0001_create_users.sql`, optionally split by `-- migrate:up` / `-- migrate:down`
/// - `0002_add_posts.up.sql` with an optional `0002_add_posts.down.sql`
///
/// They are sorted by identifier and executed in that order.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    pattern: Regex,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, pattern: Regex) -> Self {
        Self {
            dir: dir.into(),
            pattern,
        }
    }

    /// Directory with the default `\.sql$` pattern.
    pub fn sql(dir: impl Into<PathBuf>) -> Result<Self> {
        let pattern =
            Regex::new(r"\.sql$").map_err(|e| StrataError::Internal(e.to_string()))?;
        Ok(Self::new(dir, pattern))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn matching_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }

            let file_name = path
                .file_name()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    StrataError::Configuration(format!(
                        "Invalid migration filename: {}",
                        path.display()
                    ))
                })?
                .to_string();

            if self.pattern.is_match(&file_name) {
                files.push((file_name, path));
            }
        }

        files.sort();
        Ok(files)
    }
}

/// How a file takes part in a unit.
enum FileRole {
    Single,
    Up,
    Down,
}

fn classify(file_name: &str) -> (String, FileRole) {
    let stem = match file_name.rfind('.') {
        Some(idx) if idx > 0 => &file_name[..idx],
        _ => file_name,
    };

    if let Some(id) = stem.strip_suffix(".up") {
        (id.to_string(), FileRole::Up)
    } else if let Some(id) = stem.strip_suffix(".down") {
        (id.to_string(), FileRole::Down)
    } else {
        (stem.to_string(), FileRole::Single)
    }
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        StrataError::Configuration(format!(
            "Failed to read migration {}: {}",
            path.display(),
            e
        ))
    })
}

fn unsupported(path: &Path, reason: impl std::fmt::Display) -> StrataError {
    StrataError::Configuration(format!(
        "Unsupported migration {}: {}",
        path.display(),
        reason
    ))
}

#[derive(Default)]
struct Pair {
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

impl<S: SqlExecutor + 'static> MigrationSource<S> for DirectorySource {
    fn list_all(&self) -> Result<Catalog<S>> {
        if !self.dir.exists() {
            debug!("Migrations directory does not exist: {:?}", self.dir);
            return Ok(Catalog::empty());
        }

        let mut units: Vec<MigrationUnit<S>> = Vec::new();
        let mut pairs: BTreeMap<String, Pair> = BTreeMap::new();

        for (file_name, path) in self.matching_files()? {
            let (id, role) = classify(&file_name);
            if id.is_empty() {
                return Err(unsupported(&path, "empty migration identifier"));
            }

            match role {
                FileRole::Single => {
                    let content = read_file(&path)?;
                    let script =
                        SqlScript::from_sections(&content).map_err(|e| unsupported(&path, e))?;
                    units.push(MigrationUnit::new(
                        id,
                        Location::Files(vec![path]),
                        Arc::new(script),
                    ));
                }
                FileRole::Up => pairs.entry(id).or_default().up = Some(path),
                FileRole::Down => pairs.entry(id).or_default().down = Some(path),
            }
        }

        for (id, pair) in pairs {
            let up_path = match pair.up {
                Some(path) => path,
                None => {
                    let down_path = pair.down.unwrap_or_default();
                    return Err(unsupported(
                        &down_path,
                        format!("down file without a matching '{}.up' file", id),
                    ));
                }
            };

            let up_sql = read_file(&up_path)?;
            let down_sql = match &pair.down {
                Some(path) => Some(read_file(path)?),
                None => None,
            };
            let script = SqlScript::new(&up_sql, down_sql.as_deref())
                .map_err(|e| unsupported(&up_path, e))?;

            let mut files = vec![up_path];
            files.extend(pair.down);
            units.push(MigrationUnit::new(id, Location::Files(files), Arc::new(script)));
        }

        let catalog = Catalog::new(units)?;
        debug!("Loaded {} migrations from {:?}", catalog.len(), self.dir);
        Ok(catalog)
    }
}

/// Migrations registered programmatically.
pub struct CodeSource<S> {
    units: Vec<MigrationUnit<S>>,
}

impl<S> Default for CodeSource<S> {
    fn default() -> Self {
        Self { units: Vec::new() }
    }
}

impl<S: 'static> CodeSource<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit. Duplicate identifiers are reported by `list_all`.
    pub fn register(
        mut self,
        id: impl Into<String>,
        script: impl MigrationScript<S> + 'static,
    ) -> Self {
        self.units
            .push(MigrationUnit::new(id.into(), Location::Code, Arc::new(script)));
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl<S: SqlExecutor + 'static> CodeSource<S> {
    /// Register a unit from SQL text.
    pub fn register_sql(
        self,
        id: impl Into<String>,
        up: &str,
        down: Option<&str>,
    ) -> Result<Self> {
        let id = id.into();
        let script = SqlScript::new(up, down).map_err(|e| {
            StrataError::Configuration(format!("Unsupported migration '{}': {}", id, e))
        })?;
        Ok(self.register(id, script))
    }
}

impl<S: 'static> MigrationSource<S> for CodeSource<S> {
    fn list_all(&self) -> Result<Catalog<S>> {
        Catalog::new(self.units.clone())
    }
}

/// Several sources merged into one catalog. Identifiers must be unique across all of them.
pub struct MultiSource<S> {
    sources: Vec<Box<dyn MigrationSource<S>>>,
}

impl<S: 'static> MultiSource<S> {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    pub fn with(mut self, source: impl MigrationSource<S> + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

impl<S: 'static> Default for MultiSource<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: 'static> MigrationSource<S> for MultiSource<S> {
    fn list_all(&self) -> Result<Catalog<S>> {
        let mut units = Vec::new();
        for source in &self.sources {
            units.extend(source.list_all()?.into_units());
        }
        Catalog::new(units)
    }
}
