use bulwark_core::{Dialect, MigrationDirection, SchemaVersion};
use thiserror::Error;

/// Storage-specific error types for the Bulwark schema engine.
///
/// The variants follow the engine's failure taxonomy: discovery errors are
/// raised while parsing the bundled migration assets, planning errors are
/// user-input errors returned verbatim, execution errors trigger a rollback,
/// and encryption errors abort the whole key rotation transaction.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection or query execution failed
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------
    /// A bundled migration asset does not follow the filename grammar
    #[error("could not parse migration name '{name}': {reason}")]
    MigrationParse { name: String, reason: String },

    /// Two bundled assets apply to the same dialect, version and direction
    #[error(
        "duplicate {direction} migration for version {version} on {dialect}: '{first}' and '{second}'"
    )]
    DuplicateMigration {
        version: i32,
        direction: MigrationDirection,
        dialect: Dialect,
        first: String,
        second: String,
    },

    /// A dialect is missing an up migration below its latest version
    #[error("missing up migration for version {version} on {dialect}")]
    MigrationGap { version: i32, dialect: Dialect },

    // ------------------------------------------------------------------
    // Planning
    // ------------------------------------------------------------------
    /// The schema already matches the latest known version
    #[error("schema already up to date")]
    AlreadyUpToDate,

    /// The requested target is the current version
    #[error(
        "current version {current} is the same as the migration target {target}, no action being taken"
    )]
    AlreadyOnTargetVersion {
        current: SchemaVersion,
        target: SchemaVersion,
    },

    #[error(
        "schema migration target version {target} is greater than the latest version {latest} which indicates it doesn't exist"
    )]
    TargetGreaterThanLatest {
        target: SchemaVersion,
        latest: SchemaVersion,
    },

    #[error(
        "schema migration target version {target} is less than the minimum version which indicates it doesn't exist"
    )]
    TargetLessThanMinimum { target: SchemaVersion },

    /// Down migrations into the pre1 era are no longer offered
    #[error(
        "schema down migrations to pre1 are no longer supported: you must use a release from the {release} line or earlier to perform this migration"
    )]
    Pre1DowngradeUnsupported { release: &'static str },

    /// The database is newer than this binary
    #[error(
        "current schema version {current} is not compatible with this version of bulwark, the latest compatible version is {latest}: you must downgrade the schema with a newer release before using this one"
    )]
    CurrentGreaterThanLatestKnown {
        current: SchemaVersion,
        latest: SchemaVersion,
    },

    /// The schema is behind the binary and automatic migration is disabled
    #[error(
        "schema version {current} is outdated, the latest version is {latest}: run the storage migrate up command or enable automatic migration"
    )]
    SchemaOutdated {
        current: SchemaVersion,
        latest: SchemaVersion,
    },

    /// Tables exist in a combination the resolver does not recognise
    #[error(
        "unknown schema state: the database contains tables {tables:?} which do not match any known schema version, manual intervention is required"
    )]
    UnknownSchemaState { tables: Vec<String> },

    /// A plan needs a script the catalog does not contain
    #[error("no {direction} migration is available for version {version} on {dialect}")]
    MissingMigration {
        version: i32,
        direction: MigrationDirection,
        dialect: Dialect,
    },

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------
    /// A single migration step failed
    #[error("schema migration {version} ({name}) failed: {source}")]
    Migration {
        version: i32,
        name: String,
        #[source]
        source: Box<StorageError>,
    },

    /// The pre1 transition step failed
    #[error("schema migration {direction} across pre1 failed: {source}")]
    Pre1Transition {
        direction: MigrationDirection,
        #[source]
        source: Box<StorageError>,
    },

    /// A migration failed and the compensating rollback succeeded
    #[error("migration rollback complete, caused by: {0}")]
    RollbackComplete(#[source] Box<StorageError>),

    /// A migration failed and the compensating rollback failed as well
    #[error(
        "migration rollback failed, manual intervention is required: rollback error: {rollback}, original error: {original}"
    )]
    DoubleFailure {
        original: Box<StorageError>,
        rollback: Box<StorageError>,
    },

    /// A history row holds a value outside the range of its field
    #[error("migration history column {column} holds an invalid value {value}")]
    InvalidHistory { column: &'static str, value: i64 },

    /// A paginated loop observed a cancellation request at a page boundary
    #[error("operation cancelled")]
    Cancelled,

    // ------------------------------------------------------------------
    // Encryption
    // ------------------------------------------------------------------
    /// Encryption or decryption failed
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A row could not be decrypted with the configured key
    #[error("could not decrypt {table} row {id} with the configured encryption key")]
    Decrypt { table: &'static str, id: i64 },

    /// The check value was missing or did not decrypt
    #[error(
        "the configured encryption key does not appear to be valid for this database which may occur if the encryption key was changed in the configuration without using the cli to change it in the database"
    )]
    InvalidEncryptionKey,

    /// The schema is too old to hold encrypted values
    #[error("schema version {version} doesn't support encryption")]
    EncryptionUnsupported { version: SchemaVersion },

    /// Legacy data could not be re-shaped
    #[error("Legacy data error: {0}")]
    LegacyData(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Returns `true` for the no-op "already up to date" signal.
    #[must_use]
    pub fn is_already_up_to_date(&self) -> bool {
        matches!(self, StorageError::AlreadyUpToDate)
    }

    /// Returns `true` if the database may have been left between versions.
    #[must_use]
    pub fn requires_manual_intervention(&self) -> bool {
        matches!(
            self,
            StorageError::DoubleFailure { .. } | StorageError::UnknownSchemaState { .. }
        )
    }
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
