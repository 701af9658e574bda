//! Schema version resolution.
//!
//! The resolved version depends only on the live table set and, when the
//! history table exists, its latest row. Migration scripts play no part.

use crate::error::{StorageError, StorageResult};
use crate::queries::Queries;
use crate::transaction;
use bulwark_core::SchemaVersion;
use bulwark_core::constants::{PRE1_SIGNATURE, PRE1_TABLES, TABLE_MIGRATIONS};
use sqlx::AnyConnection;

/// Classification of a table set before the history table is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSet {
    /// The history table exists.
    Tracked,
    /// Legacy pre-history tables only.
    Pre1,
    /// No tables at all.
    Empty,
    /// Anything else.
    Unrecognised,
}

impl TableSet {
    #[must_use]
    pub fn classify(tables: &[String]) -> Self {
        if tables.iter().any(|t| t == TABLE_MIGRATIONS) {
            return TableSet::Tracked;
        }

        if tables.is_empty() {
            return TableSet::Empty;
        }

        let only_pre1 = tables.iter().all(|t| PRE1_TABLES.contains(&t.as_str()));
        let has_signature = PRE1_SIGNATURE
            .iter()
            .all(|required| tables.iter().any(|t| t == required));

        if only_pre1 && has_signature {
            TableSet::Pre1
        } else {
            TableSet::Unrecognised
        }
    }
}

/// Resolve the schema version of the connected database.
///
/// An unrecognised table set, or a history table without rows, is reported
/// as [`StorageError::UnknownSchemaState`] and must be fixed by hand.
pub async fn resolve(conn: &mut AnyConnection, queries: &Queries) -> StorageResult<SchemaVersion> {
    let tables = transaction::existing_tables(conn, queries).await?;
    resolve_with_tables(conn, queries, tables).await
}

/// Same as [`resolve`], reusing an already fetched table list.
pub async fn resolve_with_tables(
    conn: &mut AnyConnection,
    queries: &Queries,
    tables: Vec<String>,
) -> StorageResult<SchemaVersion> {
    let version = match TableSet::classify(&tables) {
        TableSet::Tracked => transaction::latest_history_version(conn, queries)
            .await?
            .ok_or(StorageError::UnknownSchemaState { tables })?,
        TableSet::Pre1 => SchemaVersion::PRE1,
        TableSet::Empty => SchemaVersion::EMPTY,
        TableSet::Unrecognised => return Err(StorageError::UnknownSchemaState { tables }),
    };

    tracing::debug!(%version, dialect = %queries.dialect(), "resolved schema version");

    Ok(version)
}
