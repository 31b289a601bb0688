//! Recorded-but-unknown migrations.

use std::collections::HashSet;

use strata_core::migration::MigrationId;

/// Identifiers recorded as applied that no source provides any more.
///
/// Result is ascending and free of duplicates. Empty means no drift.
pub fn check<'a>(
    applied: impl IntoIterator<Item = &'a MigrationId>,
    known: &HashSet<&MigrationId>,
) -> Vec<MigrationId> {
    let mut missing: Vec<MigrationId> = applied
        .into_iter()
        .filter(|id| !known.contains(id))
        .cloned()
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<MigrationId> {
        raw.iter().map(|s| MigrationId::new(*s)).collect()
    }

    #[test]
    fn test_no_drift_when_all_known() {
        let applied = ids(&["1", "2"]);
        let catalog = ids(&["1", "2", "3"]);
        let known: HashSet<&MigrationId> = catalog.iter().collect();
        assert!(check(&applied, &known).is_empty());
    }

    #[test]
    fn test_reports_missing_sorted() {
        let applied = ids(&["5", "1", "4", "2"]);
        let catalog = ids(&["1", "2"]);
        let known: HashSet<&MigrationId> = catalog.iter().collect();
        assert_eq!(check(&applied, &known), ids(&["4", "5"]));
    }

    #[test]
    fn test_empty_inputs() {
        let known = HashSet::new();
        assert!(check(std::iter::empty(), &known).is_empty());

        let applied = ids(&["0001_init"]);
        assert_eq!(check(&applied, &known), applied);
    }

    #[test]
    fn test_duplicates_collapsed() {
        let applied = ids(&["7", "7"]);
        let known = HashSet::new();
        assert_eq!(check(&applied, &known), ids(&["7"]));
    }
}
