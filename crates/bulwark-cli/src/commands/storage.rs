//! `bulwark storage` subcommands.

use anyhow::{Context, Result, bail};
use bulwark_core::{Dialect, MigrationDirection, MigrationTarget, SchemaVersion};
use bulwark_storage::{
    Database, DatabaseConfig, MigrationHistoryRecord, MigrationPlan, RotationReport, SchemaInfo,
    SchemaManager, SchemaMigration, StorageConfig, ValidationResult,
};
use clap::{Args, Parser, Subcommand};
use std::fmt::Write as _;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

const DESTROY_CONFIRMATION: &str = "DESTROY";

#[derive(Debug, Parser)]
#[command(name = "storage")]
pub struct StorageCommand {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub action: StorageAction,
}

#[derive(Debug, Args)]
pub struct ConnectionArgs {
    /// SQL backend: sqlite, mysql or postgres
    #[arg(long, env = "BULWARK_STORAGE_DIALECT")]
    pub dialect: Dialect,

    /// Connection URL, e.g. sqlite:///var/lib/bulwark/db.sqlite3
    #[arg(long, env = "BULWARK_STORAGE_URL", hide_env_values = true)]
    pub url: String,

    /// Key the encrypted columns are sealed with
    #[arg(long, env = "BULWARK_STORAGE_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: String,
}

#[derive(Debug, Subcommand)]
pub enum StorageAction {
    /// Show the schema version, pending upgrades, tables and key status
    SchemaInfo {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Apply or revert schema migrations
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Manage the encryption key
    Encryption {
        #[command(subcommand)]
        action: EncryptionAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum MigrateAction {
    /// Migrate up to the latest or a given version
    Up {
        /// Version to migrate to
        #[arg(long)]
        target: Option<SchemaVersion>,
    },

    /// Migrate down to a given version
    Down {
        /// Version to migrate to
        #[arg(long, required_unless_present = "pre1", conflicts_with = "pre1")]
        target: Option<SchemaVersion>,

        /// Migrate down to the pre1 schema
        #[arg(long)]
        pre1: bool,

        /// Skip the interactive confirmation
        #[arg(long)]
        destroy_data: bool,
    },

    /// Show the migration history
    History,

    /// List the migrations an upgrade to latest would apply
    ListUp,

    /// List the migrations a downgrade to zero would apply
    ListDown,
}

#[derive(Debug, Subcommand)]
pub enum EncryptionAction {
    /// Re-encrypt every encrypted value with a new key
    ChangeKey {
        /// The replacement key
        #[arg(long, env = "BULWARK_STORAGE_NEW_ENCRYPTION_KEY", hide_env_values = true)]
        new_encryption_key: String,
    },

    /// Check the configured key against the database
    CheckKey {
        /// Decrypt every encrypted row, not just the check value
        #[arg(long)]
        verbose: bool,
    },
}

pub async fn run(command: StorageCommand) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping at the next page boundary");
                cancel.cancel();
            }
        });
    }

    let ConnectionArgs {
        dialect,
        url,
        encryption_key,
    } = command.connection;

    let db = Database::new(DatabaseConfig::new(dialect, url))
        .await
        .context("failed to connect to the storage backend")?;

    let mut manager =
        SchemaManager::new(db.clone(), StorageConfig::new(encryption_key))?.with_cancellation(cancel);

    let result = match command.action {
        StorageAction::SchemaInfo { json } => schema_info(&manager, json).await,
        StorageAction::Migrate { action } => migrate(&manager, action).await,
        StorageAction::Encryption { action } => encryption(&mut manager, action).await,
    };

    db.close().await;
    result
}

async fn schema_info(manager: &SchemaManager, json: bool) -> Result<()> {
    let info = manager.schema_info().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print!("{}", render_schema_info(&info));
    }

    Ok(())
}

async fn migrate(manager: &SchemaManager, action: MigrateAction) -> Result<()> {
    match action {
        MigrateAction::Up { target } => {
            let target = target.map_or(MigrationTarget::Latest, MigrationTarget::Version);
            apply(manager, target, false).await
        }
        MigrateAction::Down {
            target,
            pre1,
            destroy_data,
        } => {
            let target = if pre1 {
                SchemaVersion::PRE1
            } else {
                target.context("a target version is required")?
            };

            apply(manager, MigrationTarget::Version(target), !destroy_data).await
        }
        MigrateAction::History => {
            print!("{}", render_history(&manager.migration_history().await?));
            Ok(())
        }
        MigrateAction::ListUp => {
            let pending = manager.pending_migrations(MigrationDirection::Up).await?;
            print!("{}", render_migration_list(MigrationDirection::Up, &pending));
            Ok(())
        }
        MigrateAction::ListDown => {
            let pending = manager.pending_migrations(MigrationDirection::Down).await?;
            print!("{}", render_migration_list(MigrationDirection::Down, &pending));
            Ok(())
        }
    }
}

/// Plan, confirm if asked and the plan drops data, then apply.
async fn apply(manager: &SchemaManager, target: MigrationTarget, confirm: bool) -> Result<()> {
    let plan = match manager.plan(target).await {
        Ok(plan) => plan,
        Err(e) if e.is_already_up_to_date() => {
            println!("Storage schema is already up to date");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if confirm && is_destructive(&plan) && !confirm_destroy().await? {
        bail!("schema down migration cancelled");
    }

    let version = manager.apply(&plan).await?;
    println!("Storage schema migration from {} to {version} is complete", plan.prior);

    Ok(())
}

fn is_destructive(plan: &MigrationPlan) -> bool {
    !plan.direction.is_up()
}

async fn confirm_destroy() -> Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(
            format!(
                "Schema Down Migrations may DESTROY data, type '{DESTROY_CONFIRMATION}' and press return to continue: "
            )
            .as_bytes(),
        )
        .await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;

    Ok(line.trim() == DESTROY_CONFIRMATION)
}

async fn encryption(manager: &mut SchemaManager, action: EncryptionAction) -> Result<()> {
    match action {
        EncryptionAction::ChangeKey { new_encryption_key } => {
            let report = manager.change_key(&new_encryption_key).await?;
            print!("{}", render_rotation(&report));
            Ok(())
        }
        EncryptionAction::CheckKey { verbose } => {
            let result = manager.check_key(verbose).await?;
            print!("{}", render_validation(&result, verbose));

            if !result.success() {
                bail!("the configured encryption key is not valid for this database");
            }
            Ok(())
        }
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn render_schema_info(info: &SchemaInfo) -> String {
    let tables = if info.tables.is_empty() {
        "N/A".to_string()
    } else {
        info.tables.join(", ")
    };

    let mut out = String::new();
    let _ = writeln!(out, "Schema Dialect: {}", info.dialect);
    let _ = writeln!(out, "Schema Version: {}", info.version);
    let _ = writeln!(out, "Schema Latest Version: {}", info.latest);
    let _ = writeln!(out, "Schema Upgrade Available: {}", yes_no(info.upgrade_available));
    let _ = writeln!(out, "Schema Tables: {tables}");
    let _ = writeln!(out, "Schema Encryption Key: {}", info.encryption);
    out
}

fn render_history(records: &[MigrationHistoryRecord]) -> String {
    if records.is_empty() {
        return "No migration history is available\n".to_string();
    }

    let mut out = String::from("Migration History:\n\nID\tDate\t\t\t\tBefore\tAfter\tApplication Version\n");
    for r in records {
        let before = r
            .version_before
            .map_or_else(|| "N/A".to_string(), |v| v.to_string());
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            r.id,
            r.applied.format("%Y-%m-%d %H:%M:%S %z"),
            before,
            r.version_after,
            r.application_version
        );
    }
    out
}

fn render_migration_list(direction: MigrationDirection, migrations: &[SchemaMigration]) -> String {
    if migrations.is_empty() {
        return "No Migrations Available\n".to_string();
    }

    let label = if direction.is_up() { "Up" } else { "Down" };
    let mut out = format!("Storage Schema Migration List ({label})\n\nVersion\t\tDescription\n");
    for m in migrations {
        let _ = writeln!(out, "{}\t\t{}", m.version, m.name);
    }
    out
}

fn render_rotation(report: &RotationReport) -> String {
    let mut out = String::from("Completed the encryption key change. Please adjust your configuration to use the new key.\n");
    for (table, rotation) in &report.tables {
        let _ = writeln!(out, "\t{table}: {} rows re-encrypted", rotation.rows);
    }
    out
}

fn render_validation(result: &ValidationResult, verbose: bool) -> String {
    let overall = if result.success() { "SUCCESS" } else { "FAILURE" };
    let mut out = format!("Encryption Key Validation: {overall}\n");

    if result.invalid_check_value {
        out.push_str("\n\tThe check value did not decrypt with the configured key\n");
    }

    if verbose {
        out.push_str("\nTables:\n");
        for (table, t) in &result.tables {
            match &t.error {
                Some(error) => {
                    let _ = writeln!(out, "\t{table}: {} ({error})", t.result_descriptor());
                }
                None => {
                    let _ = writeln!(
                        out,
                        "\t{table}: {} ({} of {} rows invalid)",
                        t.result_descriptor(),
                        t.invalid,
                        t.total
                    );
                }
            }
        }
    }

    out
}
