//! The schema engine facade.
//!
//! [`SchemaManager`] ties the resolver, planner, executor and rotation engine
//! to one database and one set of [`StorageConfig`] options. It is what the
//! CLI and application startup talk to.

use crate::catalog::{Catalog, SchemaMigration};
use crate::connection::Database;
use crate::encryption::EncryptionKey;
use crate::error::{StorageError, StorageResult};
use crate::executor::{ExecutorOptions, MigrationExecutor};
use crate::models::MigrationHistoryRecord;
use crate::planner::{self, MigrationPlan};
use crate::queries::Queries;
use crate::repositories::{MigrationHistoryRepository, SqlMigrationHistoryRepository};
use crate::resolver;
use crate::rotation::{self, RotationReport, ValidationResult};
use crate::transaction;
use bulwark_core::constants::{DEFAULT_TOTP_ISSUER, ENCRYPTION_KEY_MIN_LENGTH};
use bulwark_core::{Dialect, MigrationDirection, MigrationTarget, SchemaVersion};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Engine options
#[derive(Clone)]
pub struct StorageConfig {
    /// Key string every encrypted column is sealed with
    pub encryption_key: String,

    /// Recorded in each migration history row
    pub application_version: String,

    /// Issuer given to TOTP secrets carried out of the pre1 schema
    pub totp_issuer: String,
}

impl StorageConfig {
    /// Create engine options for an encryption key, with defaults for the rest
    pub fn new(encryption_key: impl Into<String>) -> Self {
        Self {
            encryption_key: encryption_key.into(),
            application_version: crate::VERSION.to_string(),
            totp_issuer: DEFAULT_TOTP_ISSUER.to_string(),
        }
    }

    /// Set the application version recorded in history rows
    pub fn application_version(mut self, version: impl Into<String>) -> Self {
        self.application_version = version.into();
        self
    }

    /// Set the issuer used for legacy TOTP secrets
    pub fn totp_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.totp_issuer = issuer.into();
        self
    }

    pub fn validate(&self) -> StorageResult<()> {
        validate_key(&self.encryption_key)
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("encryption_key", &"<redacted>")
            .field("application_version", &self.application_version)
            .field("totp_issuer", &self.totp_issuer)
            .finish()
    }
}

fn validate_key(key: &str) -> StorageResult<()> {
    if key.chars().count() < ENCRYPTION_KEY_MIN_LENGTH {
        return Err(StorageError::Configuration(format!(
            "the encryption key must be at least {} characters",
            ENCRYPTION_KEY_MIN_LENGTH
        )));
    }

    Ok(())
}

/// Result of comparing the configured key with the stored check value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStatus {
    Valid,
    /// The check value is missing or sealed with another key.
    Invalid,
    /// The schema predates the encryption table.
    Unsupported,
}

impl fmt::Display for EncryptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EncryptionStatus::Valid => "valid",
            EncryptionStatus::Invalid => "invalid",
            EncryptionStatus::Unsupported => "unsupported",
        })
    }
}

/// Snapshot of the connected schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaInfo {
    pub dialect: Dialect,
    /// [`SchemaVersion::UNKNOWN`] when the table set is not recognised.
    pub version: SchemaVersion,
    pub latest: SchemaVersion,
    pub upgrade_available: bool,
    pub tables: Vec<String>,
    pub encryption: EncryptionStatus,
}

/// Entry point to the schema engine for one database.
pub struct SchemaManager {
    db: Database,
    catalog: Arc<Catalog>,
    queries: Queries,
    config: StorageConfig,
    key: EncryptionKey,
    cancel: CancellationToken,
}

impl SchemaManager {
    /// Create a manager over the bundled migration catalog
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bulwark_core::MigrationTarget;
    /// use bulwark_storage::{Database, SchemaManager, StorageConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = Database::in_memory().await?;
    /// let manager = SchemaManager::new(db, StorageConfig::new("a_very_long_encryption_key"))?;
    ///
    /// let version = manager.migrate(MigrationTarget::Latest).await?;
    /// println!("schema is now at version {}", version);
    /// # Ok(())
    /// # }
    /// ```
    pub fn new(db: Database, config: StorageConfig) -> StorageResult<Self> {
        let catalog = Catalog::bundled()?;
        Self::with_catalog(db, catalog, config)
    }

    /// Create a manager over an explicit catalog
    pub fn with_catalog(db: Database, catalog: Arc<Catalog>, config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;

        let queries = Queries::new(db.dialect());
        let key = EncryptionKey::derive(&config.encryption_key);

        Ok(Self {
            db,
            catalog,
            queries,
            config,
            key,
            cancel: CancellationToken::new(),
        })
    }

    /// Observe `cancel` at the page boundaries of long-running operations
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Resolve the live schema version
    pub async fn schema_version(&self) -> StorageResult<SchemaVersion> {
        let mut conn = self.db.pool().acquire().await?;
        resolver::resolve(&mut conn, &self.queries).await
    }

    /// Latest version the catalog offers for this dialect
    pub fn latest_version(&self) -> SchemaVersion {
        self.catalog.latest(self.db.dialect())
    }

    /// Describe the live schema
    ///
    /// An unrecognised table set is reported as [`SchemaVersion::UNKNOWN`]
    /// instead of an error so the table list can still be inspected.
    pub async fn schema_info(&self) -> StorageResult<SchemaInfo> {
        let mut conn = self.db.pool().acquire().await?;
        let tables = transaction::existing_tables(&mut conn, &self.queries).await?;

        let version = match resolver::resolve_with_tables(&mut conn, &self.queries, tables.clone()).await {
            Ok(version) => version,
            Err(StorageError::UnknownSchemaState { .. }) => SchemaVersion::UNKNOWN,
            Err(e) => return Err(e),
        };

        let encryption = if version.is_tracked() {
            if rotation::check_value_matches(&mut conn, &self.queries, &self.key).await? {
                EncryptionStatus::Valid
            } else {
                EncryptionStatus::Invalid
            }
        } else {
            EncryptionStatus::Unsupported
        };

        let latest = self.latest_version();

        Ok(SchemaInfo {
            dialect: self.db.dialect(),
            version,
            latest,
            upgrade_available: !version.is_unknown() && version < latest,
            tables,
            encryption,
        })
    }

    /// Plan a migration from the current version to `target` without
    /// touching the schema
    ///
    /// # Errors
    ///
    /// Planning errors as documented on [`planner::plan`].
    pub async fn plan(&self, target: MigrationTarget) -> StorageResult<MigrationPlan> {
        let prior = self.schema_version().await?;
        planner::plan(&self.catalog, self.db.dialect(), prior, target)
    }

    /// Migrate the schema to `target`, returning the version reached
    ///
    /// Equivalent to [`SchemaManager::plan`] followed by [`SchemaManager::apply`].
    ///
    /// # Errors
    ///
    /// Planning errors are returned as-is, [`StorageError::AlreadyUpToDate`]
    /// included. Execution failures are wrapped in
    /// [`StorageError::RollbackComplete`] or [`StorageError::DoubleFailure`].
    pub async fn migrate(&self, target: MigrationTarget) -> StorageResult<SchemaVersion> {
        let plan = self.plan(target).await?;
        self.apply(&plan).await
    }

    /// Apply a plan made by [`SchemaManager::plan`]
    ///
    /// A run that leaves the empty or pre1 state stores a check value for the
    /// configured key. Once the plan has committed this never fails: a check
    /// value that cannot be stored is logged and left for
    /// [`SchemaManager::startup_check`] to write.
    pub async fn apply(&self, plan: &MigrationPlan) -> StorageResult<SchemaVersion> {
        let current = self.schema_version().await?;
        if current != plan.prior {
            return Err(StorageError::Internal(format!(
                "the schema moved from version {} to {current} after the migration was planned",
                plan.prior
            )));
        }

        let options = ExecutorOptions {
            key: &self.key,
            application_version: &self.config.application_version,
            totp_issuer: &self.config.totp_issuer,
        };

        let version = MigrationExecutor::new(&self.db, &self.catalog, &self.queries, options)
            .with_cancellation(self.cancel.clone())
            .apply(plan)
            .await?;

        if !plan.prior.is_tracked()
            && version.is_tracked()
            && let Err(e) = self.store_missing_check_value().await
        {
            warn!(error = %e, "schema migrated but the encryption check value could not be stored");
        }

        Ok(version)
    }

    /// Every history row in insertion order
    pub async fn migration_history(&self) -> StorageResult<Vec<MigrationHistoryRecord>> {
        SqlMigrationHistoryRepository::new(self.db.pool().clone(), self.queries.clone())
            .list()
            .await
    }

    /// Scripts a run to latest (`Up`) or to zero (`Down`) would apply
    ///
    /// Pre1 databases list the up scripts after version 1, which the legacy
    /// transition replaces.
    pub async fn pending_migrations(&self, direction: MigrationDirection) -> StorageResult<Vec<SchemaMigration>> {
        let current = self.schema_version().await?;
        let dialect = self.db.dialect();

        let migrations = match direction {
            MigrationDirection::Up => {
                let floor = if current.is_pre1() { 1 } else { current.as_i32() };
                self.catalog
                    .migrations_for(dialect, MigrationDirection::Up)
                    .into_iter()
                    .filter(|m| m.version > floor)
                    .cloned()
                    .collect()
            }
            MigrationDirection::Down => {
                let mut down: Vec<SchemaMigration> = self
                    .catalog
                    .migrations_for(dialect, MigrationDirection::Down)
                    .into_iter()
                    .filter(|m| m.version <= current.as_i32())
                    .cloned()
                    .collect();
                down.sort_by(|a, b| b.version.cmp(&a.version));
                down
            }
        };

        Ok(migrations)
    }

    /// Re-encrypt every encrypted value under `new_key`
    ///
    /// The configured key must match the stored check value first. On success
    /// the manager switches to the new key.
    pub async fn change_key(&mut self, new_key: &str) -> StorageResult<RotationReport> {
        validate_key(new_key)?;

        if new_key == self.config.encryption_key {
            return Err(StorageError::Configuration(
                "the new encryption key must be different from the current one".to_string(),
            ));
        }

        let version = self.schema_version().await?;
        if !version.is_tracked() {
            return Err(StorageError::EncryptionUnsupported { version });
        }

        {
            let mut conn = self.db.pool().acquire().await?;
            if !rotation::check_value_matches(&mut conn, &self.queries, &self.key).await? {
                return Err(StorageError::InvalidEncryptionKey);
            }
        }

        let new = EncryptionKey::derive(new_key);
        let report = rotation::change_key(&self.db, &self.queries, version, &self.key, &new, &self.cancel).await?;

        self.key = new;
        self.config.encryption_key = new_key.to_string();

        Ok(report)
    }

    /// Validate the configured key, walking every encrypted row if `verbose`
    pub async fn check_key(&self, verbose: bool) -> StorageResult<ValidationResult> {
        let version = self.schema_version().await?;
        rotation::check_key(&self.db, &self.queries, version, &self.key, verbose, &self.cancel).await
    }

    /// Bring the schema into a usable state at application start
    ///
    /// With `auto_migrate` the schema is migrated to latest, otherwise an
    /// outdated schema is an error. The key is then checked against the check
    /// value, writing one if none exists.
    pub async fn startup_check(&self, auto_migrate: bool) -> StorageResult<SchemaVersion> {
        let latest = self.latest_version();
        let mut version = self.schema_version().await?;

        if version > latest {
            return Err(StorageError::CurrentGreaterThanLatestKnown { current: version, latest });
        }

        if version < latest {
            if !auto_migrate {
                return Err(StorageError::SchemaOutdated { current: version, latest });
            }

            version = match self.migrate(MigrationTarget::Latest).await {
                Ok(v) => v,
                Err(e) if e.is_already_up_to_date() => version,
                Err(e) => return Err(e),
            };
        }

        self.ensure_check_value().await?;

        info!(%version, dialect = %self.db.dialect(), "storage startup check passed");

        Ok(version)
    }

    async fn store_missing_check_value(&self) -> StorageResult<()> {
        let mut conn = self.db.pool().acquire().await?;

        if rotation::read_check_value(&mut conn, &self.queries).await?.is_none() {
            rotation::write_check_value(&mut conn, &self.queries, &self.key).await?;
        }

        Ok(())
    }

    async fn ensure_check_value(&self) -> StorageResult<()> {
        let mut conn = self.db.pool().acquire().await?;

        match rotation::read_check_value(&mut conn, &self.queries).await? {
            None => {
                warn!("no encryption check value found, storing one for the configured key");
                rotation::write_check_value(&mut conn, &self.queries, &self.key).await
            }
            Some(value) if self.key.decrypt(&value).is_ok() => Ok(()),
            Some(_) => Err(StorageError::InvalidEncryptionKey),
        }
    }
}
