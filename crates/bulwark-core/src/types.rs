use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Resolved schema version of a live database.
///
/// The value is either a tracked version (`1..`) or one of the sentinel
/// states:
///
/// | Value | Meaning | Display |
/// |-------|---------|---------|
/// | `-2` | tables exist in an unrecognised combination | `unknown` |
/// | `-1` | legacy pre-history tables, no history table | `pre1` |
/// | `0` | no relevant tables | `N/A` |
/// | `N` | history table present, latest row says `N` | `N` |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaVersion(i32);

impl SchemaVersion {
    pub const UNKNOWN: SchemaVersion = SchemaVersion(-2);
    pub const PRE1: SchemaVersion = SchemaVersion(-1);
    pub const EMPTY: SchemaVersion = SchemaVersion(0);

    #[must_use]
    pub const fn new(version: i32) -> Self {
        SchemaVersion(version)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    #[must_use]
    pub const fn is_unknown(self) -> bool {
        self.0 <= Self::UNKNOWN.0
    }

    #[must_use]
    pub const fn is_pre1(self) -> bool {
        self.0 == Self::PRE1.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == Self::EMPTY.0
    }

    /// Returns `true` for versions recorded in the migration history table.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        self.0 >= 1
    }

    /// The version a database reaches after one more `up` step.
    #[must_use]
    pub const fn next(self) -> Self {
        match self.0 {
            -1 => SchemaVersion(1),
            v => SchemaVersion(v + 1),
        }
    }

    /// The version a database reaches after one `down` step.
    #[must_use]
    pub const fn previous(self) -> Self {
        SchemaVersion(self.0 - 1)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0 {
            v if v <= -2 => write!(f, "unknown"),
            -1 => write!(f, "pre1"),
            0 => write!(f, "N/A"),
            v => write!(f, "{v}"),
        }
    }
}

impl From<i32> for SchemaVersion {
    fn from(value: i32) -> Self {
        SchemaVersion(value)
    }
}

impl From<SchemaVersion> for i32 {
    fn from(value: SchemaVersion) -> Self {
        value.0
    }
}

impl FromStr for SchemaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "pre1" => Ok(SchemaVersion::PRE1),
            "unknown" => Ok(SchemaVersion::UNKNOWN),
            "N/A" => Ok(SchemaVersion::EMPTY),
            other => other
                .parse::<i32>()
                .map(SchemaVersion)
                .map_err(|_| Error::InvalidSchemaVersion(other.to_string())),
        }
    }
}

/// Where an operator wants the schema to end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationTarget {
    /// The newest version the bundled catalog knows for the live dialect.
    Latest,

    /// An explicit version, including [`SchemaVersion::PRE1`] and
    /// [`SchemaVersion::EMPTY`].
    Version(SchemaVersion),
}

impl MigrationTarget {
    #[must_use]
    pub fn is_latest(self) -> bool {
        matches!(self, MigrationTarget::Latest)
    }

    /// Resolve against the latest known version.
    #[must_use]
    pub fn resolve(self, latest: SchemaVersion) -> SchemaVersion {
        match self {
            MigrationTarget::Latest => latest,
            MigrationTarget::Version(version) => version,
        }
    }
}

impl fmt::Display for MigrationTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MigrationTarget::Latest => write!(f, "latest"),
            MigrationTarget::Version(version) => write!(f, "{version}"),
        }
    }
}

impl From<SchemaVersion> for MigrationTarget {
    fn from(value: SchemaVersion) -> Self {
        MigrationTarget::Version(value)
    }
}

/// Direction a migration script moves the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    /// Version `N - 1` to `N`.
    Up,

    /// Version `N` to `N - 1`.
    Down,
}

impl MigrationDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MigrationDirection::Up => "up",
            MigrationDirection::Down => "down",
        }
    }

    #[must_use]
    pub fn is_up(self) -> bool {
        matches!(self, MigrationDirection::Up)
    }

    #[must_use]
    pub fn inverse(self) -> Self {
        match self {
            MigrationDirection::Up => MigrationDirection::Down,
            MigrationDirection::Down => MigrationDirection::Up,
        }
    }
}

impl fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "up" => Ok(MigrationDirection::Up),
            "down" => Ok(MigrationDirection::Down),
            other => Err(Error::InvalidDirection(other.to_string())),
        }
    }
}

/// SQL backend family.
///
/// This is only the name of a backend; the per-backend SQL details live in
/// the storage crate's dialect descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    Sqlite,
    MySql,
    Postgres,
}

impl Dialect {
    pub const ALL: [Dialect; 3] = [Dialect::Sqlite, Dialect::MySql, Dialect::Postgres];

    /// Name used in migration asset filenames and configuration.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Sqlite => "sqlite",
            Dialect::MySql => "mysql",
            Dialect::Postgres => "postgres",
        }
    }

    /// URL schemes accepted for connections of this dialect.
    #[must_use]
    pub fn url_schemes(self) -> &'static [&'static str] {
        match self {
            Dialect::Sqlite => &["sqlite:"],
            Dialect::MySql => &["mysql:", "mariadb:"],
            Dialect::Postgres => &["postgres:", "postgresql:"],
        }
    }

    /// Returns `true` if `url` uses a scheme belonging to this dialect.
    #[must_use]
    pub fn accepts_url(self, url: &str) -> bool {
        self.url_schemes().iter().any(|scheme| url.starts_with(scheme))
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            "mysql" | "mariadb" => Ok(Dialect::MySql),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => Err(Error::InvalidDialect(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(-2, "unknown")]
    #[case(-1, "pre1")]
    #[case(0, "N/A")]
    #[case(1, "1")]
    #[case(42, "42")]
    fn test_schema_version_display(#[case] value: i32, #[case] expected: &str) {
        assert_eq!(SchemaVersion::from(value).to_string(), expected);
    }

    #[rstest]
    #[case("pre1", SchemaVersion::PRE1)]
    #[case("0", SchemaVersion::EMPTY)]
    #[case(" 7 ", SchemaVersion::new(7))]
    fn test_schema_version_parse(#[case] input: &str, #[case] expected: SchemaVersion) {
        assert_eq!(input.parse::<SchemaVersion>().unwrap(), expected);
    }

    #[test]
    fn test_schema_version_parse_invalid() {
        assert!(matches!(
            "seven".parse::<SchemaVersion>(),
            Err(Error::InvalidSchemaVersion(_))
        ));
    }

    #[test]
    fn test_schema_version_classes() {
        assert!(SchemaVersion::UNKNOWN.is_unknown());
        assert!(SchemaVersion::PRE1.is_pre1());
        assert!(SchemaVersion::EMPTY.is_empty());
        assert!(SchemaVersion::new(3).is_tracked());
        assert!(!SchemaVersion::PRE1.is_tracked());
    }

    #[test]
    fn test_schema_version_next_skips_empty_from_pre1() {
        assert_eq!(SchemaVersion::PRE1.next(), SchemaVersion::new(1));
        assert_eq!(SchemaVersion::EMPTY.next(), SchemaVersion::new(1));
        assert_eq!(SchemaVersion::new(4).previous(), SchemaVersion::new(3));
    }

    #[test]
    fn test_migration_target_resolve() {
        let latest = SchemaVersion::new(4);
        assert_eq!(MigrationTarget::Latest.resolve(latest), latest);
        assert_eq!(
            MigrationTarget::Version(SchemaVersion::new(2)).resolve(latest),
            SchemaVersion::new(2)
        );
        assert_eq!(MigrationTarget::Latest.to_string(), "latest");
    }

    #[rstest]
    #[case("sqlite", Dialect::Sqlite)]
    #[case("SQLite3", Dialect::Sqlite)]
    #[case("mysql", Dialect::MySql)]
    #[case("postgresql", Dialect::Postgres)]
    fn test_dialect_parse(#[case] input: &str, #[case] expected: Dialect) {
        assert_eq!(input.parse::<Dialect>().unwrap(), expected);
    }

    #[test]
    fn test_dialect_parse_invalid() {
        assert!(matches!(
            "mssql".parse::<Dialect>(),
            Err(Error::InvalidDialect(_))
        ));
    }

    #[rstest]
    #[case(Dialect::Sqlite, "sqlite://bulwark.db", true)]
    #[case(Dialect::Sqlite, "postgres://localhost/bulwark", false)]
    #[case(Dialect::Postgres, "postgresql://localhost/bulwark", true)]
    #[case(Dialect::MySql, "mysql://root@localhost/bulwark", true)]
    fn test_dialect_accepts_url(#[case] dialect: Dialect, #[case] url: &str, #[case] ok: bool) {
        assert_eq!(dialect.accepts_url(url), ok);
    }

    #[test]
    fn test_direction_round_trip_names() {
        assert_eq!("up".parse::<MigrationDirection>().unwrap(), MigrationDirection::Up);
        assert_eq!(MigrationDirection::Up.inverse(), MigrationDirection::Down);
        assert!("sideways".parse::<MigrationDirection>().is_err());
    }
}
