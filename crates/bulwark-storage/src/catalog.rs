//! Migration catalog.
//!
//! The catalog is the parsed, validated form of the migration assets compiled
//! into the binary from the workspace `migrations/` directory. Every asset
//! must be named
//!
//! ```text
//! V{4-digit version}.{name}.{all|sqlite|mysql|postgres}.{up|down}.sql
//! ```
//!
//! Discovery fails on the first asset that breaks the grammar, and on any set
//! of assets that would make a plan ambiguous:
//!
//! - two scripts applying to the same dialect, version and direction (this
//!   includes an `all` script next to a dialect-specific one)
//! - a dialect missing an `up` script below its latest version
//! - version `0`, which is reserved for the empty schema
//!
//! The bundled catalog is discovered once per process and shared.

use crate::error::{StorageError, StorageResult};
use bulwark_core::{Dialect, MigrationDirection, SchemaVersion};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, OnceLock};

macro_rules! asset {
    ($name:literal) => {
        ($name, include_str!(concat!("../../../migrations/", $name)))
    };
}

/// Migration assets compiled into the binary, as `(file name, sql)` pairs.
pub const BUNDLED_ASSETS: &[(&str, &str)] = &[
    asset!("V0001.Initial_Schema.sqlite.up.sql"),
    asset!("V0001.Initial_Schema.sqlite.down.sql"),
    asset!("V0001.Initial_Schema.mysql.up.sql"),
    asset!("V0001.Initial_Schema.mysql.down.sql"),
    asset!("V0001.Initial_Schema.postgres.up.sql"),
    asset!("V0001.Initial_Schema.postgres.down.sql"),
    asset!("V0002.Regulation_History.sqlite.up.sql"),
    asset!("V0002.Regulation_History.sqlite.down.sql"),
    asset!("V0002.Regulation_History.mysql.up.sql"),
    asset!("V0002.Regulation_History.mysql.down.sql"),
    asset!("V0002.Regulation_History.postgres.up.sql"),
    asset!("V0002.Regulation_History.postgres.down.sql"),
    asset!("V0003.WebAuthn_Credentials.sqlite.up.sql"),
    asset!("V0003.WebAuthn_Credentials.sqlite.down.sql"),
    asset!("V0003.WebAuthn_Credentials.mysql.up.sql"),
    asset!("V0003.WebAuthn_Credentials.mysql.down.sql"),
    asset!("V0003.WebAuthn_Credentials.postgres.up.sql"),
    asset!("V0003.WebAuthn_Credentials.postgres.down.sql"),
    asset!("V0004.User_Preferences_Theme.all.up.sql"),
    asset!("V0004.User_Preferences_Theme.all.down.sql"),
];

static MIGRATION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^V(\d{4})\.([^.]+)\.(all|sqlite|mysql|postgres)\.(up|down)\.sql$")
        .unwrap_or_else(|e| unreachable!("migration name pattern is valid: {e}"))
});

static BUNDLED: OnceLock<Arc<Catalog>> = OnceLock::new();

/// Dialects a migration script applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    All,
    Sqlite,
    MySql,
    Postgres,
}

impl Provider {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::All => "all",
            Provider::Sqlite => "sqlite",
            Provider::MySql => "mysql",
            Provider::Postgres => "postgres",
        }
    }

    /// Returns `true` if scripts for this provider run on `dialect`.
    #[must_use]
    pub fn applies_to(self, dialect: Dialect) -> bool {
        match self {
            Provider::All => true,
            Provider::Sqlite => dialect == Dialect::Sqlite,
            Provider::MySql => dialect == Dialect::MySql,
            Provider::Postgres => dialect == Dialect::Postgres,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = StorageError;

    fn from_str(s: &str) -> StorageResult<Self> {
        match s {
            "all" => Ok(Provider::All),
            "sqlite" => Ok(Provider::Sqlite),
            "mysql" => Ok(Provider::MySql),
            "postgres" => Ok(Provider::Postgres),
            other => Err(StorageError::Configuration(format!(
                "unknown migration provider '{other}'"
            ))),
        }
    }
}

/// One discovered migration script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaMigration {
    pub version: i32,
    pub name: String,
    pub provider: Provider,
    pub direction: MigrationDirection,
    #[serde(skip)]
    pub query: String,
}

impl SchemaMigration {
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.direction.is_up()
    }

    /// Version the schema must be at before this script runs.
    #[must_use]
    pub fn before(&self) -> SchemaVersion {
        match self.direction {
            MigrationDirection::Up => SchemaVersion::new(self.version - 1),
            MigrationDirection::Down => SchemaVersion::new(self.version),
        }
    }

    /// Version the schema is at after this script runs.
    #[must_use]
    pub fn after(&self) -> SchemaVersion {
        match self.direction {
            MigrationDirection::Up => SchemaVersion::new(self.version),
            MigrationDirection::Down => SchemaVersion::new(self.version - 1),
        }
    }

    /// The asset file name this migration was parsed from.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "V{:04}.{}.{}.{}.sql",
            self.version,
            self.name.replace(' ', "_"),
            self.provider,
            self.direction
        )
    }
}

/// Parse one asset file name into a [`SchemaMigration`] carrying `query`.
///
/// # Examples
///
/// ```
/// use bulwark_core::MigrationDirection;
/// use bulwark_storage::catalog::{Provider, parse_migration_name};
///
/// let m = parse_migration_name("V0001.initial_schema.all.up.sql", "SELECT 1").unwrap();
/// assert_eq!(m.version, 1);
/// assert_eq!(m.name, "initial schema");
/// assert_eq!(m.provider, Provider::All);
/// assert_eq!(m.direction, MigrationDirection::Up);
///
/// assert!(parse_migration_name("bad-name.sql", "").is_err());
/// ```
pub fn parse_migration_name(file_name: &str, query: &str) -> StorageResult<SchemaMigration> {
    let parse_error = |reason: &str| StorageError::MigrationParse {
        name: file_name.to_string(),
        reason: reason.to_string(),
    };

    let caps = MIGRATION_NAME.captures(file_name).ok_or_else(|| {
        parse_error("expected V{version}.{name}.{all|sqlite|mysql|postgres}.{up|down}.sql")
    })?;

    let version: i32 = caps[1]
        .parse()
        .map_err(|_| parse_error("version is not a number"))?;

    if version == 0 {
        return Err(parse_error("version 0 is reserved for the empty schema"));
    }

    let provider: Provider = caps[3].parse()?;
    let direction: MigrationDirection = caps[4]
        .parse()
        .map_err(|_| parse_error("direction must be up or down"))?;

    Ok(SchemaMigration {
        version,
        name: caps[2].replace('_', " "),
        provider,
        direction,
        query: query.to_string(),
    })
}

/// Validated, immutable set of migrations indexed by version.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    versions: BTreeMap<i32, Vec<SchemaMigration>>,
}

impl Catalog {
    /// The catalog compiled into this binary.
    pub fn bundled() -> StorageResult<Arc<Catalog>> {
        Catalog::cached(&BUNDLED, BUNDLED_ASSETS)
    }

    /// Discover `assets` once into `cell`. Failures are not cached.
    fn cached(cell: &OnceLock<Arc<Catalog>>, assets: &[(&str, &str)]) -> StorageResult<Arc<Catalog>> {
        if let Some(catalog) = cell.get() {
            return Ok(Arc::clone(catalog));
        }

        let catalog = Arc::new(Catalog::discover(assets)?);
        Ok(Arc::clone(cell.get_or_init(|| catalog)))
    }

    /// Parse and validate a set of `(file name, sql)` assets.
    pub fn discover(assets: &[(&str, &str)]) -> StorageResult<Catalog> {
        let mut versions: BTreeMap<i32, Vec<SchemaMigration>> = BTreeMap::new();

        for (file_name, query) in assets {
            let migration = parse_migration_name(file_name, query)?;
            versions.entry(migration.version).or_default().push(migration);
        }

        for scripts in versions.values_mut() {
            scripts.sort_by_key(|m| (m.direction.is_up(), m.provider));
        }

        let catalog = Catalog { versions };
        catalog.validate()?;

        tracing::debug!(
            migrations = catalog.len(),
            "discovered schema migrations"
        );

        Ok(catalog)
    }

    fn validate(&self) -> StorageResult<()> {
        for dialect in Dialect::ALL {
            for (version, scripts) in &self.versions {
                for direction in [MigrationDirection::Up, MigrationDirection::Down] {
                    let mut applicable = scripts
                        .iter()
                        .filter(|m| m.direction == direction && m.provider.applies_to(dialect));

                    if let (Some(first), Some(second)) = (applicable.next(), applicable.next()) {
                        return Err(StorageError::DuplicateMigration {
                            version: *version,
                            direction,
                            dialect,
                            first: first.file_name(),
                            second: second.file_name(),
                        });
                    }
                }
            }

            let latest = self.latest(dialect).as_i32();
            for version in 1..=latest {
                if self.find(dialect, version, MigrationDirection::Up).is_none() {
                    return Err(StorageError::MigrationGap { version, dialect });
                }
            }
        }

        Ok(())
    }

    /// Highest `up` version applicable to `dialect`, or
    /// [`SchemaVersion::EMPTY`] if there is none.
    #[must_use]
    pub fn latest(&self, dialect: Dialect) -> SchemaVersion {
        self.versions
            .iter()
            .rev()
            .find(|(_, scripts)| {
                scripts
                    .iter()
                    .any(|m| m.is_up() && m.provider.applies_to(dialect))
            })
            .map(|(version, _)| SchemaVersion::new(*version))
            .unwrap_or(SchemaVersion::EMPTY)
    }

    /// The single script for `(dialect, version, direction)`.
    #[must_use]
    pub fn find(
        &self,
        dialect: Dialect,
        version: i32,
        direction: MigrationDirection,
    ) -> Option<&SchemaMigration> {
        self.versions
            .get(&version)?
            .iter()
            .find(|m| m.direction == direction && m.provider.applies_to(dialect))
    }

    /// Every script applicable to `dialect` in `direction`, ascending by version.
    #[must_use]
    pub fn migrations_for(
        &self,
        dialect: Dialect,
        direction: MigrationDirection,
    ) -> Vec<&SchemaMigration> {
        self.versions
            .values()
            .flatten()
            .filter(|m| m.direction == direction && m.provider.applies_to(dialect))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaMigration> {
        self.versions.values().flatten()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_cached_discovery_keeps_typed_errors() {
        let cell = OnceLock::new();

        let err = Catalog::cached(&cell, &[("V0001.broken", "SELECT 1")]).unwrap_err();
        assert!(matches!(err, StorageError::MigrationParse { ref name, .. } if name == "V0001.broken"));
        assert!(cell.get().is_none());

        let first = Catalog::cached(&cell, BUNDLED_ASSETS).unwrap();
        let second = Catalog::cached(&cell, &[]).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[rstest]
    #[case("V0001.initial_schema.all.up.sql", 1, "initial schema", Provider::All, MigrationDirection::Up)]
    #[case("V0012.Add_Column.postgres.down.sql", 12, "Add Column", Provider::Postgres, MigrationDirection::Down)]
    #[case("V0300.free text name.mysql.up.sql", 300, "free text name", Provider::MySql, MigrationDirection::Up)]
    fn test_parse_migration_name(
        #[case] file_name: &str,
        #[case] version: i32,
        #[case] name: &str,
        #[case] provider: Provider,
        #[case] direction: MigrationDirection,
    ) {
        let m = parse_migration_name(file_name, "SELECT 1").unwrap();

        assert_eq!(m.version, version);
        assert_eq!(m.name, name);
        assert_eq!(m.provider, provider);
        assert_eq!(m.direction, direction);
        assert_eq!(m.query, "SELECT 1");
    }

    #[rstest]
    #[case("bad-name.sql")]
    #[case("V1.initial.all.up.sql")]
    #[case("V0001.initial.mssql.up.sql")]
    #[case("V0001.initial.all.sideways.sql")]
    #[case("V0001.initial.all.up.txt")]
    #[case("V0000.empty.all.up.sql")]
    fn test_parse_migration_name_rejects(#[case] file_name: &str) {
        assert!(matches!(
            parse_migration_name(file_name, ""),
            Err(StorageError::MigrationParse { .. })
        ));
    }

    #[test]
    fn test_file_name_round_trips() {
        let m = parse_migration_name("V0002.Regulation_History.sqlite.down.sql", "").unwrap();
        assert_eq!(m.file_name(), "V0002.Regulation_History.sqlite.down.sql");
        assert_eq!(m.before(), SchemaVersion::new(2));
        assert_eq!(m.after(), SchemaVersion::new(1));
    }

    #[test]
    fn test_bundled_catalog_is_valid() {
        let catalog = Catalog::bundled().unwrap();

        assert_eq!(catalog.len(), BUNDLED_ASSETS.len());
        for dialect in Dialect::ALL {
            assert_eq!(catalog.latest(dialect), SchemaVersion::new(4));
            assert_eq!(catalog.migrations_for(dialect, MigrationDirection::Up).len(), 4);
            assert_eq!(catalog.migrations_for(dialect, MigrationDirection::Down).len(), 4);
        }
    }

    #[test]
    fn test_mysql_scripts_can_rerun_over_a_partial_step() {
        let catalog = Catalog::bundled().unwrap();

        for m in catalog.iter().filter(|m| m.provider.applies_to(Dialect::MySql)) {
            let statements = crate::transaction::split_statements(&m.query);
            if statements.len() == 1 {
                continue;
            }

            for statement in statements {
                assert!(
                    statement.starts_with("CREATE TABLE IF NOT EXISTS")
                        || statement.starts_with("DROP TABLE IF EXISTS"),
                    "{}: unguarded statement {statement}",
                    m.file_name()
                );
            }
        }
    }

    #[test]
    fn test_all_script_applies_to_every_dialect() {
        let catalog = Catalog::bundled().unwrap();

        for dialect in Dialect::ALL {
            let m = catalog.find(dialect, 4, MigrationDirection::Up).unwrap();
            assert_eq!(m.provider, Provider::All);
        }
    }

    #[test]
    fn test_all_and_specific_for_same_version_is_rejected() {
        let err = Catalog::discover(&[
            ("V0001.init.all.up.sql", ""),
            ("V0001.init.sqlite.up.sql", ""),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            StorageError::DuplicateMigration { version: 1, dialect: Dialect::Sqlite, .. }
        ));
    }

    #[test]
    fn test_gap_is_rejected() {
        let err = Catalog::discover(&[
            ("V0001.init.all.up.sql", ""),
            ("V0003.later.postgres.up.sql", ""),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            StorageError::MigrationGap { version: 2, dialect: Dialect::Postgres }
        ));
    }

    #[test]
    fn test_latest_is_per_dialect() {
        let catalog = Catalog::discover(&[
            ("V0001.init.all.up.sql", ""),
            ("V0002.pg_only.postgres.up.sql", ""),
        ])
        .unwrap();

        assert_eq!(catalog.latest(Dialect::Postgres), SchemaVersion::new(2));
        assert_eq!(catalog.latest(Dialect::Sqlite), SchemaVersion::new(1));
    }

    #[test]
    fn test_empty_catalog_latest_is_empty() {
        let catalog = Catalog::discover(&[]).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(catalog.latest(Dialect::MySql), SchemaVersion::EMPTY);
    }
}
