//! Migration units, identifiers and the catalog they are discovered into.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrataError};

/// Boxed future returned by migration actions and record store operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Unique, lexically sortable migration identifier (e.g. `0001_create_users`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MigrationId(String);

impl MigrationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MigrationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Direction a unit is run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// The {apply, revert} capability of a migration, run inside a store session `S`.
///
/// The session is the same one the record store writes its bookkeeping through,
/// so an action and its record commit together.
pub trait MigrationScript<S>: Send + Sync {
    /// Apply the migration.
    fn up<'a>(&'a self, session: &'a mut S) -> BoxFuture<'a, Result<()>>;

    /// Revert the migration. Only called when [`has_down`](Self::has_down) is true.
    fn down<'a>(&'a self, _session: &'a mut S) -> BoxFuture<'a, Result<()>> {
        Box::pin(async {
            Err(StrataError::Configuration(
                "migration has no down action".to_string(),
            ))
        })
    }

    /// Whether a down action exists.
    fn has_down(&self) -> bool {
        false
    }
}

/// Where a unit was discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// One or more files on disk (`up` file first).
    Files(Vec<PathBuf>),
    /// Registered in code.
    Code,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Files(paths) => {
                let joined = paths
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                f.write_str(&joined)
            }
            Location::Code => f.write_str("code"),
        }
    }
}

/// A single discovered migration.
pub struct MigrationUnit<S> {
    pub id: MigrationId,
    pub location: Location,
    pub script: Arc<dyn MigrationScript<S>>,
}

impl<S> MigrationUnit<S> {
    pub fn new(
        id: impl Into<MigrationId>,
        location: Location,
        script: Arc<dyn MigrationScript<S>>,
    ) -> Self {
        Self {
            id: id.into(),
            location,
            script,
        }
    }

    pub fn has_down(&self) -> bool {
        self.script.has_down()
    }
}

impl<S> Clone for MigrationUnit<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            location: self.location.clone(),
            script: Arc::clone(&self.script),
        }
    }
}

impl<S> fmt::Debug for MigrationUnit<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationUnit")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("has_down", &self.has_down())
            .finish()
    }
}

/// Units sorted ascending by identifier, identifiers unique.
pub struct Catalog<S> {
    units: Vec<MigrationUnit<S>>,
}

impl<S> fmt::Debug for Catalog<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.units.iter()).finish()
    }
}

impl<S> Catalog<S> {
    /// Build a catalog, rejecting duplicate identifiers.
    pub fn new(mut units: Vec<MigrationUnit<S>>) -> Result<Self> {
        units.sort_by(|a, b| a.id.cmp(&b.id));

        let duplicate = units
            .windows(2)
            .find(|pair| pair[0].id == pair[1].id)
            .map(|pair| pair[0].id.clone());

        if let Some(first) = duplicate {
            let locations: Vec<String> = units
                .iter()
                .filter(|u| u.id == first)
                .map(|u| u.location.to_string())
                .collect();
            return Err(StrataError::Configuration(format!(
                "Duplicate migration identifier '{}' ({})",
                first,
                locations.join("; ")
            )));
        }

        Ok(Self { units })
    }

    pub fn empty() -> Self {
        Self { units: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationUnit<S>> {
        self.units.iter()
    }

    pub fn ids(&self) -> Vec<MigrationId> {
        self.units.iter().map(|u| u.id.clone()).collect()
    }

    pub fn id_set(&self) -> HashSet<&MigrationId> {
        self.units.iter().map(|u| &u.id).collect()
    }

    pub fn into_units(self) -> Vec<MigrationUnit<S>> {
        self.units
    }

    pub fn get(&self, id: &MigrationId) -> Option<&MigrationUnit<S>> {
        self.units
            .binary_search_by(|u| u.id.cmp(id))
            .ok()
            .map(|idx| &self.units[idx])
    }
}

/// Discovers migration units. Read-only; called once per engine invocation.
pub trait MigrationSource<S>: Send + Sync {
    fn list_all(&self) -> Result<Catalog<S>>;
}
