//! Migration execution and rollback.
//!
//! # Unit of Work
//!
//! Where DDL is transactional (SQLite, PostgreSQL) the whole plan, including
//! the legacy pre1 step, runs inside one transaction. A failure anywhere
//! rolls that transaction back and nothing the plan touched is kept.
//!
//! MySQL commits DDL implicitly, so there each step runs in its own
//! transaction and a failure is compensated by planning the inverse
//! migration back to the version the run started from.
//!
//! ```text
//! Idle -> Applying(i) -> Committed
//!                     -> RollingBack -> RolledBack     (RollbackComplete error)
//!                                    -> DoubleFailure  (manual intervention)
//! ```
//!
//! # Partial Steps
//!
//! Without transactional DDL a failed script may have left some of its
//! statements behind. The executor counts the statements that completed: if
//! none did, the compensation starts from the failed step's starting
//! version; otherwise it starts from the step's target, so the inverse script
//! of the failed step runs as well. A single-statement script that fails has
//! left nothing behind. Multi-statement MySQL scripts only use `CREATE TABLE
//! IF NOT EXISTS` and `DROP TABLE IF EXISTS`, with indexes declared inside
//! the table definition, so re-running either direction over a partial step
//! is safe.

use crate::catalog::{Catalog, SchemaMigration};
use crate::connection::Database;
use crate::encryption::EncryptionKey;
use crate::error::{StorageError, StorageResult};
use crate::legacy::{self, LegacyContext};
use crate::planner::{self, LegacyTransition, MigrationPlan};
use crate::queries::Queries;
use crate::transaction;
use bulwark_core::{MigrationDirection, SchemaVersion};
use serde::Serialize;
use sqlx::AnyConnection;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "step", rename_all = "snake_case")]
pub enum ExecutorState {
    Idle,
    /// Applying the step at this index of the plan.
    Applying(usize),
    Committed,
    RollingBack,
    RolledBack,
    DoubleFailure,
}

#[derive(Debug, Clone, Copy)]
enum Step<'p> {
    Legacy(LegacyTransition),
    Script(&'p SchemaMigration),
}

impl Step<'_> {
    fn before(&self) -> SchemaVersion {
        match self {
            Step::Legacy(LegacyTransition::Pre1ToV1) => SchemaVersion::PRE1,
            Step::Legacy(LegacyTransition::V1ToPre1) => SchemaVersion::new(1),
            Step::Script(m) => m.before(),
        }
    }

    fn after(&self) -> SchemaVersion {
        match self {
            Step::Legacy(LegacyTransition::Pre1ToV1) => SchemaVersion::new(1),
            Step::Legacy(LegacyTransition::V1ToPre1) => SchemaVersion::PRE1,
            Step::Script(m) => m.after(),
        }
    }
}

fn steps(plan: &MigrationPlan) -> Vec<Step<'_>> {
    let scripts = plan.migrations.iter().map(Step::Script);

    match (plan.direction, plan.legacy) {
        (MigrationDirection::Up, Some(legacy)) => {
            std::iter::once(Step::Legacy(legacy)).chain(scripts).collect()
        }
        (MigrationDirection::Down, Some(legacy)) => {
            scripts.chain(std::iter::once(Step::Legacy(legacy))).collect()
        }
        (_, None) => scripts.collect(),
    }
}

/// Engine options that reach the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorOptions<'a> {
    pub key: &'a EncryptionKey,
    pub application_version: &'a str,
    pub totp_issuer: &'a str,
}

/// Applies migration plans against a database.
pub struct MigrationExecutor<'a> {
    db: &'a Database,
    catalog: &'a Catalog,
    queries: &'a Queries,
    options: ExecutorOptions<'a>,
    cancel: CancellationToken,
    transactional_ddl: bool,
    state: ExecutorState,
}

impl<'a> MigrationExecutor<'a> {
    pub fn new(
        db: &'a Database,
        catalog: &'a Catalog,
        queries: &'a Queries,
        options: ExecutorOptions<'a>,
    ) -> Self {
        Self {
            db,
            catalog,
            queries,
            options,
            cancel: CancellationToken::new(),
            transactional_ddl: queries.descriptor().transactional_ddl,
            state: ExecutorState::Idle,
        }
    }

    /// Observe `cancel` between steps and at legacy page boundaries.
    ///
    /// Cancellation is treated as a step failure and rolled back. The
    /// compensating migrations ignore the token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run SQLite through the step-wise path used for MySQL.
    #[cfg(test)]
    fn without_transactional_ddl(mut self) -> Self {
        self.transactional_ddl = false;
        self
    }

    #[must_use]
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Apply `plan`, returning the version reached.
    ///
    /// # Errors
    ///
    /// - [`StorageError::RollbackComplete`] wrapping the step failure when the
    ///   plan was undone; the schema is back at `plan.prior`
    /// - [`StorageError::DoubleFailure`] when undoing it failed as well
    pub async fn apply(&mut self, plan: &MigrationPlan) -> StorageResult<SchemaVersion> {
        let steps = steps(plan);

        info!(
            dialect = %plan.dialect,
            from = %plan.prior,
            to = %plan.target,
            steps = steps.len(),
            atomic = self.transactional_ddl,
            "applying schema migrations"
        );

        if self.transactional_ddl {
            self.apply_atomic(plan, &steps).await
        } else {
            self.apply_stepwise(plan, &steps).await
        }
    }

    async fn apply_atomic(&mut self, plan: &MigrationPlan, steps: &[Step<'_>]) -> StorageResult<SchemaVersion> {
        let mut tx = self.db.pool().begin().await?;
        let mut current = plan.prior;

        for (i, step) in steps.iter().enumerate() {
            self.state = ExecutorState::Applying(i);

            let result = if self.cancel.is_cancelled() {
                Err(StorageError::Cancelled)
            } else {
                let mut applied = 0;
                self.run_step(&mut tx, step, &self.cancel, &mut applied).await
            };

            if let Err(original) = result {
                self.state = ExecutorState::RollingBack;
                warn!(error = %original, to = %plan.prior, "schema migration failed, rolling back");

                return Err(match tx.rollback().await {
                    Ok(()) => {
                        self.state = ExecutorState::RolledBack;
                        info!(version = %plan.prior, "schema migration rollback complete");
                        StorageError::RollbackComplete(Box::new(original))
                    }
                    Err(rollback) => self.double_failure(original, rollback.into()),
                });
            }

            current = step.after();
            info!(from = %step.before(), to = %current, "schema migration applied");
        }

        tx.commit().await?;
        self.state = ExecutorState::Committed;
        info!(version = %current, "schema migrations committed");
        Ok(current)
    }

    async fn apply_stepwise(&mut self, plan: &MigrationPlan, steps: &[Step<'_>]) -> StorageResult<SchemaVersion> {
        let mut current = plan.prior;

        for (i, step) in steps.iter().enumerate() {
            self.state = ExecutorState::Applying(i);

            let mut applied = 0;
            let result = if self.cancel.is_cancelled() {
                Err(StorageError::Cancelled)
            } else {
                self.commit_step(step, &self.cancel, &mut applied).await
            };

            match result {
                Ok(()) => {
                    current = step.after();
                    info!(from = %step.before(), to = %current, "schema migration committed");
                }
                Err(original) => {
                    let rollback_from = match step {
                        Step::Script(_) if applied > 0 => step.after(),
                        _ => current,
                    };
                    return Err(self.compensate(plan, rollback_from, original).await);
                }
            }
        }

        self.state = ExecutorState::Committed;
        Ok(current)
    }

    async fn compensate(
        &mut self,
        plan: &MigrationPlan,
        from: SchemaVersion,
        original: StorageError,
    ) -> StorageError {
        self.state = ExecutorState::RollingBack;
        warn!(error = %original, from = %from, to = %plan.prior, "schema migration failed, rolling back");

        match self.apply_inverse(plan, from).await {
            Ok(()) => {
                self.state = ExecutorState::RolledBack;
                info!(version = %plan.prior, "schema migration rollback complete");
                StorageError::RollbackComplete(Box::new(original))
            }
            Err(rollback) => self.double_failure(original, rollback),
        }
    }

    fn double_failure(&mut self, original: StorageError, rollback: StorageError) -> StorageError {
        self.state = ExecutorState::DoubleFailure;
        error!(
            original = %original,
            rollback = %rollback,
            "schema migration rollback failed, manual intervention is required"
        );
        StorageError::DoubleFailure {
            original: Box::new(original),
            rollback: Box::new(rollback),
        }
    }

    async fn apply_inverse(&self, plan: &MigrationPlan, from: SchemaVersion) -> StorageResult<()> {
        let inverse = planner::plan_rollback(self.catalog, plan.dialect, from, plan.prior)?;
        let never = CancellationToken::new();

        for step in steps(&inverse) {
            let mut applied = 0;
            self.commit_step(&step, &never, &mut applied).await?;
            info!(from = %step.before(), to = %step.after(), "schema rollback step committed");
        }

        Ok(())
    }

    async fn commit_step(
        &self,
        step: &Step<'_>,
        cancel: &CancellationToken,
        applied: &mut usize,
    ) -> StorageResult<()> {
        let mut tx = self.db.pool().begin().await?;
        self.run_step(&mut tx, step, cancel, applied).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn run_step(
        &self,
        conn: &mut AnyConnection,
        step: &Step<'_>,
        cancel: &CancellationToken,
        applied: &mut usize,
    ) -> StorageResult<()> {
        match step {
            Step::Script(m) => {
                self.run_script(conn, m, applied)
                    .await
                    .map_err(|source| StorageError::Migration {
                        version: m.version,
                        name: m.name.clone(),
                        source: Box::new(source),
                    })
            }
            Step::Legacy(transition) => {
                self.run_legacy(conn, *transition, cancel)
                    .await
                    .map_err(|source| StorageError::Pre1Transition {
                        direction: match transition {
                            LegacyTransition::Pre1ToV1 => MigrationDirection::Up,
                            LegacyTransition::V1ToPre1 => MigrationDirection::Down,
                        },
                        source: Box::new(source),
                    })
            }
        }
    }

    async fn run_script(
        &self,
        conn: &mut AnyConnection,
        m: &SchemaMigration,
        applied: &mut usize,
    ) -> StorageResult<()> {
        transaction::execute_statements(conn, &m.query, applied).await?;

        // Leaving version 1 drops the history table itself.
        if m.direction == MigrationDirection::Down && m.version == 1 {
            return Ok(());
        }

        transaction::insert_history(
            conn,
            self.queries,
            m.before(),
            m.after(),
            self.options.application_version,
        )
        .await
    }

    async fn run_legacy(
        &self,
        conn: &mut AnyConnection,
        transition: LegacyTransition,
        cancel: &CancellationToken,
    ) -> StorageResult<()> {
        let ctx = LegacyContext {
            queries: self.queries,
            key: self.options.key,
            totp_issuer: self.options.totp_issuer,
            application_version: self.options.application_version,
            cancel,
        };

        match transition {
            LegacyTransition::Pre1ToV1 => {
                let v1_up = self
                    .catalog
                    .find(self.queries.dialect(), 1, MigrationDirection::Up)
                    .ok_or(StorageError::MissingMigration {
                        version: 1,
                        direction: MigrationDirection::Up,
                        dialect: self.queries.dialect(),
                    })?;
                legacy::pre1_to_v1(conn, v1_up, &ctx).await
            }
            LegacyTransition::V1ToPre1 => legacy::v1_to_pre1(conn, &ctx).await,
        }
    }
}
