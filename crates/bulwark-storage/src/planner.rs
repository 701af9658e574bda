//! Migration planning.
//!
//! [`plan`] is a pure function over a [`Catalog`]: it never touches a
//! database. It validates an operator request against the catalog and the
//! resolved prior version, then returns the ordered, single-direction list of
//! scripts that moves the schema to the target.
//!
//! Version 1 is special when the prior or target version is
//! [`SchemaVersion::PRE1`]: the step between pre1 and version 1 is a
//! structural re-shape rather than a script, so the plan carries it as a
//! [`LegacyTransition`] instead of a catalog entry.

use crate::catalog::{Catalog, SchemaMigration};
use crate::error::{StorageError, StorageResult};
use bulwark_core::constants::PRE1_SUPPORTED_RELEASE;
use bulwark_core::{Dialect, MigrationDirection, MigrationTarget, SchemaVersion};

/// Structural step across the pre1 boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyTransition {
    Pre1ToV1,
    V1ToPre1,
}

/// An ordered migration plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub dialect: Dialect,
    pub prior: SchemaVersion,
    pub target: SchemaVersion,
    pub direction: MigrationDirection,

    /// Scripts in application order.
    pub migrations: Vec<SchemaMigration>,

    /// Runs before `migrations` when travelling up, after them when
    /// travelling down.
    pub legacy: Option<LegacyTransition>,
}

impl MigrationPlan {
    /// Number of catalog scripts in the plan.
    #[must_use]
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty() && self.legacy.is_none()
    }

    /// Versions of the planned scripts, in application order.
    #[must_use]
    pub fn versions(&self) -> Vec<i32> {
        self.migrations.iter().map(|m| m.version).collect()
    }
}

/// Plan the migrations moving `dialect` from `prior` to `target`.
///
/// # Errors
///
/// - [`StorageError::UnknownSchemaState`] if `prior` is unknown
/// - [`StorageError::CurrentGreaterThanLatestKnown`] if the database is newer
///   than the catalog
/// - [`StorageError::AlreadyUpToDate`] for a `Latest` target when already there
/// - [`StorageError::AlreadyOnTargetVersion`] for an explicit target equal to `prior`
/// - [`StorageError::TargetGreaterThanLatest`] / [`StorageError::TargetLessThanMinimum`]
///   for targets outside the known range
/// - [`StorageError::Pre1DowngradeUnsupported`] for a down target of pre1
pub fn plan(
    catalog: &Catalog,
    dialect: Dialect,
    prior: SchemaVersion,
    target: MigrationTarget,
) -> StorageResult<MigrationPlan> {
    let latest = catalog.latest(dialect);

    if prior.is_unknown() {
        return Err(StorageError::UnknownSchemaState { tables: Vec::new() });
    }

    if prior > latest {
        return Err(StorageError::CurrentGreaterThanLatestKnown {
            current: prior,
            latest,
        });
    }

    let target = match target {
        MigrationTarget::Latest if prior == latest => return Err(StorageError::AlreadyUpToDate),
        MigrationTarget::Latest => latest,
        MigrationTarget::Version(version) => version,
    };

    if target == prior {
        return Err(StorageError::AlreadyOnTargetVersion {
            current: prior,
            target,
        });
    }

    if target > latest {
        return Err(StorageError::TargetGreaterThanLatest { target, latest });
    }

    if target < SchemaVersion::PRE1 {
        return Err(StorageError::TargetLessThanMinimum { target });
    }

    if target.is_pre1() {
        return Err(StorageError::Pre1DowngradeUnsupported {
            release: PRE1_SUPPORTED_RELEASE,
        });
    }

    // Leaving pre1 only ever goes forward into the tracked era.
    if prior.is_pre1() && target.is_empty() {
        return Err(StorageError::TargetLessThanMinimum { target });
    }

    build(catalog, dialect, prior, target)
}

/// Plan the compensating migrations used after a failed run.
///
/// Unlike [`plan`] this accepts pre1 as a target and an empty range, since a
/// rollback must always be able to return to wherever the run started.
pub(crate) fn plan_rollback(
    catalog: &Catalog,
    dialect: Dialect,
    from: SchemaVersion,
    to: SchemaVersion,
) -> StorageResult<MigrationPlan> {
    if from == to {
        return Ok(MigrationPlan {
            dialect,
            prior: from,
            target: to,
            direction: MigrationDirection::Down,
            migrations: Vec::new(),
            legacy: None,
        });
    }

    build(catalog, dialect, from, to)
}

fn build(
    catalog: &Catalog,
    dialect: Dialect,
    prior: SchemaVersion,
    target: SchemaVersion,
) -> StorageResult<MigrationPlan> {
    let direction = if target > prior {
        MigrationDirection::Up
    } else {
        MigrationDirection::Down
    };

    let (low, high) = match direction {
        MigrationDirection::Up => (prior, target),
        MigrationDirection::Down => (target, prior),
    };

    let legacy = match direction {
        MigrationDirection::Up if prior.is_pre1() => Some(LegacyTransition::Pre1ToV1),
        MigrationDirection::Down if target.is_pre1() => Some(LegacyTransition::V1ToPre1),
        _ => None,
    };

    // Version 1 is covered by the legacy transition when crossing pre1.
    let first = if legacy.is_some() { 2 } else { low.as_i32() + 1 };
    let mut versions: Vec<i32> = (first.max(1)..=high.as_i32()).collect();
    if !direction.is_up() {
        versions.reverse();
    }

    let migrations = versions
        .into_iter()
        .map(|version| {
            catalog
                .find(dialect, version, direction)
                .cloned()
                .ok_or(StorageError::MissingMigration {
                    version,
                    direction,
                    dialect,
                })
        })
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(MigrationPlan {
        dialect,
        prior,
        target,
        direction,
        migrations,
        legacy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn v(n: i32) -> SchemaVersion {
        SchemaVersion::new(n)
    }

    fn to(n: i32) -> MigrationTarget {
        MigrationTarget::Version(v(n))
    }

    fn catalog() -> std::sync::Arc<Catalog> {
        Catalog::bundled().unwrap()
    }

    #[rstest]
    #[case(Dialect::Sqlite)]
    #[case(Dialect::MySql)]
    #[case(Dialect::Postgres)]
    fn test_contiguous_up_ranges_are_ascending(#[case] dialect: Dialect) {
        let catalog = catalog();
        let latest = catalog.latest(dialect).as_i32();

        for a in 0..latest {
            for b in (a + 1)..=latest {
                let plan = plan(&catalog, dialect, v(a), to(b)).unwrap();
                let expected: Vec<i32> = ((a + 1)..=b).collect();

                assert_eq!(plan.versions(), expected);
                assert_eq!(plan.direction, MigrationDirection::Up);
                assert!(plan.legacy.is_none());
                assert_eq!(plan, super::plan(&catalog, dialect, v(a), to(b)).unwrap());
            }
        }
    }

    #[rstest]
    #[case(Dialect::Sqlite)]
    #[case(Dialect::MySql)]
    #[case(Dialect::Postgres)]
    fn test_same_version_is_rejected(#[case] dialect: Dialect) {
        let catalog = Catalog::discover(&[
            ("V0001.a.all.up.sql", ""),
            ("V0002.b.all.up.sql", ""),
            ("V0003.c.all.up.sql", ""),
            ("V0004.d.all.up.sql", ""),
            ("V0005.e.all.up.sql", ""),
        ])
        .unwrap();

        let err = plan(&catalog, dialect, v(5), to(5)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::AlreadyOnTargetVersion { current, target } if current == v(5) && target == v(5)
        ));
        assert!(err.to_string().contains("current version 5 is the same as the migration target 5"));
    }

    #[rstest]
    #[case(Dialect::Sqlite)]
    #[case(Dialect::MySql)]
    #[case(Dialect::Postgres)]
    fn test_up_and_down_plans_mirror(#[case] dialect: Dialect) {
        let catalog = catalog();
        let latest = catalog.latest(dialect);

        let up = plan(&catalog, dialect, SchemaVersion::EMPTY, MigrationTarget::Latest).unwrap();
        let down = plan(&catalog, dialect, latest, to(0)).unwrap();

        assert_eq!(up.len(), down.len());

        let mut mirrored = down.versions();
        mirrored.reverse();
        assert_eq!(up.versions(), mirrored);
        assert!(down.migrations.iter().all(|m| !m.is_up()));
    }

    #[rstest]
    #[case(Dialect::Sqlite)]
    #[case(Dialect::MySql)]
    #[case(Dialect::Postgres)]
    fn test_down_to_pre1_is_blocked(#[case] dialect: Dialect) {
        let err = plan(&catalog(), dialect, v(3), MigrationTarget::Version(SchemaVersion::PRE1))
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::Pre1DowngradeUnsupported { release } if release == PRE1_SUPPORTED_RELEASE
        ));
        assert!(err.to_string().contains(PRE1_SUPPORTED_RELEASE));
    }

    #[test]
    fn test_latest_when_up_to_date() {
        let catalog = catalog();
        let latest = catalog.latest(Dialect::Sqlite);

        let err = plan(&catalog, Dialect::Sqlite, latest, MigrationTarget::Latest).unwrap_err();
        assert!(err.is_already_up_to_date());
    }

    #[test]
    fn test_target_above_latest() {
        let err = plan(&catalog(), Dialect::MySql, v(1), to(99)).unwrap_err();
        assert!(matches!(err, StorageError::TargetGreaterThanLatest { .. }));
    }

    #[test]
    fn test_target_below_minimum() {
        let err = plan(&catalog(), Dialect::MySql, v(2), to(-5)).unwrap_err();
        assert!(matches!(err, StorageError::TargetLessThanMinimum { .. }));
    }

    #[test]
    fn test_current_ahead_of_binary() {
        let err = plan(&catalog(), Dialect::Postgres, v(40), MigrationTarget::Latest).unwrap_err();
        assert!(matches!(
            err,
            StorageError::CurrentGreaterThanLatestKnown { current, latest } if current == v(40) && latest == v(4)
        ));
    }

    #[test]
    fn test_unknown_prior_is_rejected() {
        let err = plan(&catalog(), Dialect::Sqlite, SchemaVersion::UNKNOWN, MigrationTarget::Latest)
            .unwrap_err();
        assert!(err.requires_manual_intervention());
    }

    #[test]
    fn test_up_from_pre1_uses_legacy_transition() {
        let plan = plan(&catalog(), Dialect::Sqlite, SchemaVersion::PRE1, MigrationTarget::Latest).unwrap();

        assert_eq!(plan.legacy, Some(LegacyTransition::Pre1ToV1));
        assert_eq!(plan.versions(), vec![2, 3, 4]);
    }

    #[test]
    fn test_pre1_to_one_is_only_the_transition() {
        let plan = plan(&catalog(), Dialect::Sqlite, SchemaVersion::PRE1, to(1)).unwrap();

        assert_eq!(plan.legacy, Some(LegacyTransition::Pre1ToV1));
        assert!(plan.migrations.is_empty());
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_pre1_to_empty_is_rejected() {
        let err = plan(&catalog(), Dialect::Sqlite, SchemaVersion::PRE1, to(0)).unwrap_err();
        assert!(matches!(err, StorageError::TargetLessThanMinimum { .. }));
    }

    #[test]
    fn test_down_to_empty_includes_version_one() {
        let plan = plan(&catalog(), Dialect::Postgres, v(2), to(0)).unwrap();
        assert_eq!(plan.versions(), vec![2, 1]);
        assert!(plan.legacy.is_none());
    }

    #[test]
    fn test_rollback_plan_may_cross_into_pre1() {
        let plan = plan_rollback(&catalog(), Dialect::MySql, v(3), SchemaVersion::PRE1).unwrap();

        assert_eq!(plan.direction, MigrationDirection::Down);
        assert_eq!(plan.versions(), vec![3, 2]);
        assert_eq!(plan.legacy, Some(LegacyTransition::V1ToPre1));
    }

    #[test]
    fn test_rollback_plan_for_no_progress_is_empty() {
        let plan = plan_rollback(&catalog(), Dialect::MySql, v(2), v(2)).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_missing_down_script() {
        let catalog = Catalog::discover(&[
            ("V0001.a.all.up.sql", ""),
            ("V0002.b.all.up.sql", ""),
            ("V0001.a.all.down.sql", ""),
        ])
        .unwrap();

        let err = plan(&catalog, Dialect::Sqlite, v(2), to(0)).unwrap_err();
        assert!(matches!(
            err,
            StorageError::MissingMigration { version: 2, direction: MigrationDirection::Down, .. }
        ));
    }
}
