//! Schema migration and encryption key rotation engine for Bulwark.
//!
//! This crate owns the relational schema of a Bulwark deployment on SQLite,
//! MySQL or PostgreSQL: it works out which version a database is at, plans
//! and applies versioned migrations with automatic rollback, carries data
//! across the legacy pre1 schema, and re-encrypts sensitive columns when the
//! encryption key changes.
//!
//! # Architecture
//!
//! The engine is a pipeline of small components:
//!
//! - [`Catalog`] - Migration scripts compiled into the binary, indexed by version
//! - [`resolver`] - Reads the live schema version from tables and history
//! - [`planner`] - Computes the ordered scripts between two versions
//! - [`executor`] - Applies a plan step by step, rolling back on failure
//! - [`legacy`] - Re-shapes data across the pre1 boundary
//! - [`rotation`] - Re-encrypts every encrypted column in one transaction
//! - [`SchemaManager`] - Facade tying the above to one [`Database`]
//!
//! Dialect differences are data, not branches: every statement is built
//! once per dialect by [`Queries`] from a [`DialectDescriptor`].
//!
//! # Core Concepts
//!
//! ## Schema Versions
//!
//! Versions are integers with three sentinels: `-2` unknown, `-1` pre1 (the
//! legacy schema without a history table) and `0` empty. Every version from
//! 1 up is recorded in the append-only `migrations` table.
//!
//! ## Units of Work
//!
//! One migration step, its script plus its history row, commits atomically.
//! A failed step triggers the inverse plan back to where the run started.
//! A key rotation is a single transaction over every encrypted row.
//!
//! # Examples
//!
//! ## Migrating to the Latest Schema
//!
//! ```no_run
//! use bulwark_core::{Dialect, MigrationTarget};
//! use bulwark_storage::{Database, DatabaseConfig, SchemaManager, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DatabaseConfig::new(Dialect::Postgres, "postgres://bulwark@localhost/bulwark");
//! let db = Database::new(config).await?;
//!
//! let manager = SchemaManager::new(db, StorageConfig::new("a_very_long_encryption_key"))?;
//!
//! match manager.migrate(MigrationTarget::Latest).await {
//!     Ok(version) => println!("migrated to version {}", version),
//!     Err(e) if e.is_already_up_to_date() => println!("already up to date"),
//!     Err(e) => return Err(e.into()),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Rotating the Encryption Key
//!
//! ```no_run
//! use bulwark_storage::{Database, DatabaseConfig, SchemaManager, StorageConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(DatabaseConfig::sqlite("/var/lib/bulwark/db.sqlite3")).await?;
//! let mut manager = SchemaManager::new(db, StorageConfig::new("the_current_encryption_key"))?;
//!
//! let report = manager.change_key("the_replacement_encryption_key").await?;
//! println!("re-encrypted {} rows", report.total_rows());
//! # Ok(())
//! # }
//! ```
//!
//! ## Planning Without Applying
//!
//! ```
//! use bulwark_core::{Dialect, MigrationTarget, SchemaVersion};
//! use bulwark_storage::{Catalog, planner};
//!
//! let catalog = Catalog::bundled().unwrap();
//! let plan = planner::plan(&catalog, Dialect::Sqlite, SchemaVersion::EMPTY, MigrationTarget::Latest).unwrap();
//!
//! assert_eq!(plan.versions(), vec![1, 2, 3, 4]);
//! ```
//!
//! # Safety Considerations
//!
//! ## Partial Failure
//!
//! On SQLite and PostgreSQL a whole plan is one transaction, so a failure
//! leaves the schema and its rows exactly as they were.
//!
//! MySQL commits DDL implicitly, so a failed step there cannot be undone by
//! its transaction. The engine instead applies the inverse migrations back to
//! the starting version, including the failed step's own down script when
//! any of its statements completed. Multi-statement MySQL scripts only use
//! `CREATE TABLE IF NOT EXISTS` and `DROP TABLE IF EXISTS`, so they tolerate
//! running over a partial step. When the compensation itself fails the engine
//! stops with [`StorageError::DoubleFailure`] and never guesses.
//!
//! ## Legacy Backups
//!
//! Tables renamed to `_bkp_` backups during a pre1 transition are dropped
//! only after the copy succeeds. A failed transition is rolled back with the
//! rest of the plan on SQLite and PostgreSQL; on MySQL the backups are left
//! for the operator.

pub mod catalog;
pub mod connection;
pub mod dialect;
pub mod encryption;
pub mod error;
pub mod executor;
pub mod legacy;
pub mod manager;
pub mod models;
pub mod planner;
pub mod queries;
pub mod repositories;
pub mod resolver;
pub mod rotation;
pub mod transaction;

pub use catalog::{Catalog, Provider, SchemaMigration};
pub use connection::{Database, DatabaseConfig};
pub use dialect::DialectDescriptor;
pub use encryption::EncryptionKey;
pub use error::{StorageError, StorageResult};
pub use executor::{ExecutorState, MigrationExecutor};
pub use manager::{EncryptionStatus, SchemaInfo, SchemaManager, StorageConfig};
pub use models::MigrationHistoryRecord;
pub use planner::MigrationPlan;
pub use queries::Queries;
pub use repositories::{MigrationHistoryRepository, SqlMigrationHistoryRepository};
pub use rotation::{RotationReport, ValidationResult};

/// Version recorded in migration history rows by default
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
