#![allow(async_fn_in_trait)]

use crate::error::StorageResult;
use crate::models::MigrationHistoryRecord;
use crate::queries::Queries;
use crate::transaction;
use bulwark_core::constants::TABLE_MIGRATIONS;
use sqlx::AnyPool;

/// Read access to the migration history table.
///
/// Writes happen only inside the executor's unit of work, through
/// [`transaction::insert_history`].
pub trait MigrationHistoryRepository: Send + Sync {
    /// Every record in insertion order.
    ///
    /// Returns an empty list if the history table does not exist.
    async fn list(&self) -> StorageResult<Vec<MigrationHistoryRecord>>;
}

/// `MigrationHistoryRepository` over any supported dialect.
pub struct SqlMigrationHistoryRepository {
    pool: AnyPool,
    queries: Queries,
}

impl SqlMigrationHistoryRepository {
    pub fn new(pool: AnyPool, queries: Queries) -> Self {
        Self { pool, queries }
    }

    async fn has_history_table(&self) -> StorageResult<bool> {
        let mut conn = self.pool.acquire().await?;
        let tables = transaction::existing_tables(&mut conn, &self.queries).await?;
        Ok(tables.iter().any(|t| t == TABLE_MIGRATIONS))
    }
}

impl MigrationHistoryRepository for SqlMigrationHistoryRepository {
    async fn list(&self) -> StorageResult<Vec<MigrationHistoryRecord>> {
        if !self.has_history_table().await? {
            return Ok(Vec::new());
        }

        let rows: Vec<(i64, i64, Option<i64>, i64, String)> = sqlx::query_as(&self.queries.select_history)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(MigrationHistoryRecord::from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Database;
    use bulwark_core::SchemaVersion;

    async fn setup_test_repo() -> (Database, SqlMigrationHistoryRepository) {
        let db = Database::in_memory().await.unwrap();
        let repo = SqlMigrationHistoryRepository::new(db.pool().clone(), Queries::new(db.dialect()));
        (db, repo)
    }

    #[tokio::test]
    async fn test_list_without_table_is_empty() {
        let (_db, repo) = setup_test_repo().await;

        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_in_insertion_order() {
        let (db, repo) = setup_test_repo().await;
        let queries = Queries::new(db.dialect());

        {
            let mut conn = db.pool().acquire().await.unwrap();
            transaction::execute_script(
                &mut conn,
                "CREATE TABLE migrations (id INTEGER PRIMARY KEY AUTOINCREMENT, applied TIMESTAMP NOT NULL, version_before INTEGER NULL, version_after INTEGER NOT NULL, application_version VARCHAR(128) NOT NULL);",
            )
            .await
            .unwrap();

            for (before, after) in [(0, 1), (1, 2), (2, 1)] {
                transaction::insert_history(
                    &mut conn,
                    &queries,
                    SchemaVersion::new(before),
                    SchemaVersion::new(after),
                    "test",
                )
                .await
                .unwrap();
            }
        }

        let records = repo.list().await.unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].version_after, SchemaVersion::new(1));
        assert!(records[2].is_downgrade());
        assert!(records.windows(2).all(|w| w[0].id < w[1].id));
    }
}
