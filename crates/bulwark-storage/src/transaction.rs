//! Connection-level statements shared by the resolver, executor and legacy
//! adapter.
//!
//! These functions accept any `AnyConnection`, so they run equally against a
//! pooled connection or inside an open transaction. The executor relies on
//! that to keep a migration script and its history row in a single unit of
//! work.
//!
//! # Usage Pattern
//!
//! ```no_run
//! use bulwark_core::SchemaVersion;
//! use bulwark_storage::{Database, Queries, transaction};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::in_memory().await?;
//! let queries = Queries::new(db.dialect());
//!
//! let mut tx = db.pool().begin().await?;
//!
//! transaction::execute_script(&mut tx, "CREATE TABLE IF NOT EXISTS migrations (id INTEGER PRIMARY KEY, applied TIMESTAMP, version_before INTEGER, version_after INTEGER, application_version TEXT);").await?;
//! transaction::insert_history(&mut tx, &queries, SchemaVersion::EMPTY, SchemaVersion::new(1), "0.1.0").await?;
//!
//! // Both statements commit or neither does
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use crate::error::StorageResult;
use crate::models::history::history_version;
use crate::queries::Queries;
use bulwark_core::SchemaVersion;
use chrono::Utc;
use sqlx::AnyConnection;

/// Split a script into its individual statements.
///
/// Statements are separated by `;`. Blank statements are dropped.
#[must_use]
pub fn split_statements(script: &str) -> Vec<&str> {
    script
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Execute every statement of a migration script in order.
pub async fn execute_script(conn: &mut AnyConnection, script: &str) -> StorageResult<()> {
    let mut applied = 0;
    execute_statements(conn, script, &mut applied).await
}

/// Like [`execute_script`], counting the statements that completed.
///
/// On error `applied` holds the number of statements that ran before the
/// failing one. Without transactional DDL those statements stay applied.
pub async fn execute_statements(
    conn: &mut AnyConnection,
    script: &str,
    applied: &mut usize,
) -> StorageResult<()> {
    for statement in split_statements(script) {
        sqlx::raw_sql(statement).execute(&mut *conn).await?;
        *applied += 1;
    }

    Ok(())
}

/// List the base tables of the connected database.
pub async fn existing_tables(conn: &mut AnyConnection, queries: &Queries) -> StorageResult<Vec<String>> {
    let tables: Vec<(String,)> = sqlx::query_as(&queries.select_tables)
        .fetch_all(&mut *conn)
        .await?;

    Ok(tables.into_iter().map(|(name,)| name).collect())
}

/// Latest `version_after` recorded in the history table.
///
/// Returns `None` if the table has no rows.
pub async fn latest_history_version(
    conn: &mut AnyConnection,
    queries: &Queries,
) -> StorageResult<Option<SchemaVersion>> {
    let row: Option<(i64,)> = sqlx::query_as(&queries.select_latest_version)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(|(version,)| history_version("version_after", version))
        .transpose()
}

/// Append one history row.
pub async fn insert_history(
    conn: &mut AnyConnection,
    queries: &Queries,
    before: SchemaVersion,
    after: SchemaVersion,
    application_version: &str,
) -> StorageResult<()> {
    sqlx::query(&queries.insert_history)
        .bind(Utc::now().timestamp())
        .bind(before.as_i32())
        .bind(after.as_i32())
        .bind(application_version)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub async fn rename_table(
    conn: &mut AnyConnection,
    queries: &Queries,
    from: &str,
    to: &str,
) -> StorageResult<()> {
    let statement = queries.descriptor().rename_table(from, to);
    sqlx::raw_sql(&statement).execute(&mut *conn).await?;
    Ok(())
}

pub async fn drop_table(conn: &mut AnyConnection, queries: &Queries, table: &str) -> StorageResult<()> {
    let statement = queries.descriptor().drop_table(table);
    sqlx::raw_sql(&statement).execute(&mut *conn).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Database;
    use crate::error::StorageError;

    async fn setup_test_db() -> (Database, Queries) {
        let db = Database::in_memory().await.unwrap();
        let queries = Queries::new(db.dialect());
        (db, queries)
    }

    #[test]
    fn test_split_statements_drops_blanks() {
        let script = "CREATE TABLE a (id INTEGER);\n\n  CREATE INDEX a_idx ON a (id);\n;\n";
        assert_eq!(
            split_statements(script),
            vec!["CREATE TABLE a (id INTEGER)", "CREATE INDEX a_idx ON a (id)"]
        );
    }

    #[tokio::test]
    async fn test_transaction_commit() {
        let (db, queries) = setup_test_db().await;
        let mut tx = db.pool().begin().await.unwrap();

        execute_script(&mut tx, "CREATE TABLE alpha (id INTEGER); CREATE TABLE beta (id INTEGER);")
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        let tables = existing_tables(&mut conn, &queries).await.unwrap();
        assert_eq!(tables, vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn test_transaction_rollback() {
        let (db, queries) = setup_test_db().await;
        let mut tx = db.pool().begin().await.unwrap();

        execute_script(&mut tx, "CREATE TABLE alpha (id INTEGER);").await.unwrap();
        tx.rollback().await.unwrap();

        let mut conn = db.pool().acquire().await.unwrap();
        assert!(existing_tables(&mut conn, &queries).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_and_drop() {
        let (db, queries) = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        execute_script(&mut conn, "CREATE TABLE config (id INTEGER);").await.unwrap();
        rename_table(&mut conn, &queries, "config", "_bkp_UP_V0001_config")
            .await
            .unwrap();
        assert_eq!(
            existing_tables(&mut conn, &queries).await.unwrap(),
            vec!["_bkp_UP_V0001_config".to_string()]
        );

        drop_table(&mut conn, &queries, "_bkp_UP_V0001_config").await.unwrap();
        assert!(existing_tables(&mut conn, &queries).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_rows() {
        let (db, queries) = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        execute_script(
            &mut conn,
            "CREATE TABLE migrations (id INTEGER PRIMARY KEY AUTOINCREMENT, applied TIMESTAMP NOT NULL, version_before INTEGER NULL, version_after INTEGER NOT NULL, application_version VARCHAR(128) NOT NULL);",
        )
        .await
        .unwrap();

        assert_eq!(latest_history_version(&mut conn, &queries).await.unwrap(), None);

        insert_history(&mut conn, &queries, SchemaVersion::EMPTY, SchemaVersion::new(1), "test")
            .await
            .unwrap();
        insert_history(&mut conn, &queries, SchemaVersion::new(1), SchemaVersion::new(2), "test")
            .await
            .unwrap();

        assert_eq!(
            latest_history_version(&mut conn, &queries).await.unwrap(),
            Some(SchemaVersion::new(2))
        );
    }

    #[tokio::test]
    async fn test_execute_statements_counts_until_failure() {
        let (db, queries) = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        let mut applied = 0;
        let err = execute_statements(
            &mut conn,
            "CREATE TABLE alpha (id INTEGER); INSERT INTO missing_table VALUES (1); CREATE TABLE beta (id INTEGER);",
            &mut applied,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::Database(_)));
        assert_eq!(applied, 1);
        assert_eq!(
            existing_tables(&mut conn, &queries).await.unwrap(),
            vec!["alpha".to_string()]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_history_version_is_an_error() {
        let (db, queries) = setup_test_db().await;
        let mut conn = db.pool().acquire().await.unwrap();

        execute_script(
            &mut conn,
            "CREATE TABLE migrations (id INTEGER PRIMARY KEY AUTOINCREMENT, applied TIMESTAMP NOT NULL, version_before INTEGER NULL, version_after INTEGER NOT NULL, application_version VARCHAR(128) NOT NULL);
             INSERT INTO migrations (applied, version_before, version_after, application_version) VALUES (CURRENT_TIMESTAMP, 0, 4294967297, 'test');",
        )
        .await
        .unwrap();

        let err = latest_history_version(&mut conn, &queries).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidHistory { column: "version_after", value: 4_294_967_297 }
        ));
    }
}
