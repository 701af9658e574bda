//! Encryption key rotation and key validation.
//!
//! # Rotation
//!
//! [`change_key`] re-encrypts every registered encrypted column inside a
//! single transaction:
//!
//! 1. For each [`EncryptedColumn`] whose table exists at the current version,
//!    fetch `(id, value)` pages of [`ENCRYPTION_PAGE_SIZE`] rows ordered by id.
//! 2. Decrypt each value with the current key, encrypt it with the new key and
//!    write it back by primary key.
//! 3. Stop when a page comes back short.
//! 4. Replace the check value with a fresh one sealed under the new key.
//!
//! Any failure, including a single undecryptable row or a cancellation
//! observed at a page boundary, drops the transaction. Nothing is left
//! half-rotated.
//!
//! # Validation
//!
//! [`check_key`] only reads. It decrypts the check value and, in verbose
//! mode, walks every encrypted column counting rows that do not decrypt.

use crate::connection::Database;
use crate::encryption::{EncryptionKey, new_check_value};
use crate::error::{StorageError, StorageResult};
use crate::queries::Queries;
use bulwark_core::SchemaVersion;
use bulwark_core::constants::{
    ENCRYPTION_PAGE_SIZE, TABLE_TOTP_CONFIGURATIONS, TABLE_WEBAUTHN_CREDENTIALS,
};
use serde::Serialize;
use sqlx::AnyConnection;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A column holding values sealed with the configured key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedColumn {
    pub table: &'static str,
    pub id_column: &'static str,
    pub value_column: &'static str,

    /// First schema version containing the table.
    pub since: SchemaVersion,
}

/// Every encrypted column known to the schema.
pub const ENCRYPTED_COLUMNS: &[EncryptedColumn] = &[
    EncryptedColumn {
        table: TABLE_TOTP_CONFIGURATIONS,
        id_column: "id",
        value_column: "secret",
        since: SchemaVersion::new(1),
    },
    EncryptedColumn {
        table: TABLE_WEBAUTHN_CREDENTIALS,
        id_column: "id",
        value_column: "public_key",
        since: SchemaVersion::new(3),
    },
];

/// Columns present at `version`.
pub fn columns_at(version: SchemaVersion) -> impl Iterator<Item = &'static EncryptedColumn> {
    ENCRYPTED_COLUMNS.iter().filter(move |c| version >= c.since)
}

/// Work done by a committed key rotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RotationReport {
    pub tables: BTreeMap<String, TableRotation>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TableRotation {
    pub rows: u64,
    pub pages: u64,
}

impl RotationReport {
    #[must_use]
    pub fn total_rows(&self) -> u64 {
        self.tables.values().map(|t| t.rows).sum()
    }
}

/// Outcome of a key validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub invalid_check_value: bool,

    /// Per-table results, only populated in verbose mode.
    pub tables: BTreeMap<String, ValidationTableResult>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationTableResult {
    pub total: u64,
    pub invalid: u64,
    pub error: Option<String>,
}

impl ValidationTableResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.invalid == 0 && self.error.is_none()
    }

    /// `N/A`, `SUCCESS` or `FAILURE`.
    #[must_use]
    pub fn result_descriptor(&self) -> &'static str {
        if self.total == 0 && self.error.is_none() {
            "N/A"
        } else if self.success() {
            "SUCCESS"
        } else {
            "FAILURE"
        }
    }
}

impl ValidationResult {
    /// Returns `true` if any table was walked.
    #[must_use]
    pub fn checked(&self) -> bool {
        !self.tables.is_empty()
    }

    #[must_use]
    pub fn success(&self) -> bool {
        !self.invalid_check_value && self.tables.values().all(ValidationTableResult::success)
    }

    /// `N/A` when no table was walked, otherwise `SUCCESS` or `FAILURE`.
    #[must_use]
    pub fn result_descriptor(&self) -> &'static str {
        if !self.checked() {
            "N/A"
        } else if self.success() {
            "SUCCESS"
        } else {
            "FAILURE"
        }
    }
}

/// Re-encrypt every encrypted column from `current` to `new`.
pub async fn change_key(
    db: &Database,
    queries: &Queries,
    version: SchemaVersion,
    current: &EncryptionKey,
    new: &EncryptionKey,
    cancel: &CancellationToken,
) -> StorageResult<RotationReport> {
    if !version.is_tracked() {
        return Err(StorageError::EncryptionUnsupported { version });
    }

    let mut tx = db.pool().begin().await?;
    let mut report = RotationReport::default();

    for column in columns_at(version) {
        let rotated = rotate_column(&mut tx, queries, column, current, new, cancel).await?;

        info!(
            table = column.table,
            rows = rotated.rows,
            pages = rotated.pages,
            "re-encrypted table"
        );
        report.tables.insert(column.table.to_string(), rotated);
    }

    write_check_value(&mut tx, queries, new).await?;
    tx.commit().await?;

    info!(rows = report.total_rows(), "encryption key rotation committed");

    Ok(report)
}

async fn rotate_column(
    conn: &mut AnyConnection,
    queries: &Queries,
    column: &EncryptedColumn,
    current: &EncryptionKey,
    new: &EncryptionKey,
    cancel: &CancellationToken,
) -> StorageResult<TableRotation> {
    let select = queries.select_encrypted_page(column.table, column.id_column, column.value_column);
    let update = queries.update_encrypted_value(column.table, column.id_column, column.value_column);

    let mut rotation = TableRotation::default();
    let mut offset = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let page: Vec<(i64, Vec<u8>)> = sqlx::query_as(&select)
            .bind(ENCRYPTION_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;
        rotation.pages += 1;

        debug!(table = column.table, offset, rows = page.len(), "fetched encrypted page");

        for (id, value) in &page {
            let plaintext = current.decrypt(value).map_err(|_| StorageError::Decrypt {
                table: column.table,
                id: *id,
            })?;
            let sealed = new.encrypt(&plaintext)?;

            sqlx::query(&update)
                .bind(sealed)
                .bind(*id)
                .execute(&mut *conn)
                .await?;
            rotation.rows += 1;
        }

        if (page.len() as i64) < ENCRYPTION_PAGE_SIZE {
            break;
        }
        offset += ENCRYPTION_PAGE_SIZE;
    }

    Ok(rotation)
}

/// Validate `key` against the check value and, if `verbose`, every row.
pub async fn check_key(
    db: &Database,
    queries: &Queries,
    version: SchemaVersion,
    key: &EncryptionKey,
    verbose: bool,
    cancel: &CancellationToken,
) -> StorageResult<ValidationResult> {
    if !version.is_tracked() {
        return Err(StorageError::EncryptionUnsupported { version });
    }

    let mut conn = db.pool().acquire().await?;
    let mut result = ValidationResult {
        invalid_check_value: !check_value_matches(&mut conn, queries, key).await?,
        ..Default::default()
    };

    if verbose {
        for column in columns_at(version) {
            let table = match validate_column(&mut conn, queries, column, key, cancel).await {
                Ok(table) => table,
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled),
                Err(e) => ValidationTableResult {
                    error: Some(e.to_string()),
                    ..Default::default()
                },
            };
            result.tables.insert(column.table.to_string(), table);
        }
    }

    Ok(result)
}

async fn validate_column(
    conn: &mut AnyConnection,
    queries: &Queries,
    column: &EncryptedColumn,
    key: &EncryptionKey,
    cancel: &CancellationToken,
) -> StorageResult<ValidationTableResult> {
    let select = queries.select_encrypted_page(column.table, column.id_column, column.value_column);
    let mut result = ValidationTableResult::default();
    let mut offset = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let page: Vec<(i64, Vec<u8>)> = sqlx::query_as(&select)
            .bind(ENCRYPTION_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (_, value) in &page {
            result.total += 1;
            if key.decrypt(value).is_err() {
                result.invalid += 1;
            }
        }

        if (page.len() as i64) < ENCRYPTION_PAGE_SIZE {
            break;
        }
        offset += ENCRYPTION_PAGE_SIZE;
    }

    Ok(result)
}

/// Returns `false` if the check value is missing or does not decrypt.
pub async fn check_value_matches(
    conn: &mut AnyConnection,
    queries: &Queries,
    key: &EncryptionKey,
) -> StorageResult<bool> {
    Ok(match read_check_value(conn, queries).await? {
        Some(value) => key.decrypt(&value).is_ok(),
        None => false,
    })
}

pub async fn read_check_value(
    conn: &mut AnyConnection,
    queries: &Queries,
) -> StorageResult<Option<Vec<u8>>> {
    let row: Option<(Vec<u8>,)> = sqlx::query_as(&queries.select_check_value)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|(value,)| value))
}

/// Store a fresh check value sealed under `key`, replacing any existing one.
pub async fn write_check_value(
    conn: &mut AnyConnection,
    queries: &Queries,
    key: &EncryptionKey,
) -> StorageResult<()> {
    let sealed = key.encrypt(new_check_value().as_bytes())?;

    sqlx::query(&queries.upsert_check_value)
        .bind(bulwark_core::constants::ENCRYPTION_CHECK_NAME)
        .bind(sealed)
        .execute(&mut *conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_at_version() {
        let at = |n| columns_at(SchemaVersion::new(n)).map(|c| c.table).collect::<Vec<_>>();

        assert!(at(0).is_empty());
        assert_eq!(at(1), vec!["totp_configurations"]);
        assert_eq!(at(2), vec!["totp_configurations"]);
        assert_eq!(at(4), vec!["totp_configurations", "webauthn_credentials"]);
    }

    #[test]
    fn test_validation_descriptors() {
        let mut result = ValidationResult::default();
        assert_eq!(result.result_descriptor(), "N/A");
        assert!(result.success());

        result.tables.insert(
            "totp_configurations".to_string(),
            ValidationTableResult { total: 3, invalid: 0, error: None },
        );
        assert_eq!(result.result_descriptor(), "SUCCESS");

        result.tables.insert(
            "webauthn_credentials".to_string(),
            ValidationTableResult { total: 2, invalid: 1, error: None },
        );
        assert_eq!(result.result_descriptor(), "FAILURE");
        assert_eq!(result.tables["webauthn_credentials"].result_descriptor(), "FAILURE");
    }

    #[test]
    fn test_invalid_check_value_fails_without_tables() {
        let result = ValidationResult {
            invalid_check_value: true,
            ..Default::default()
        };

        assert!(!result.success());
        assert_eq!(result.result_descriptor(), "N/A");
    }

    #[test]
    fn test_empty_table_is_not_applicable() {
        assert_eq!(ValidationTableResult::default().result_descriptor(), "N/A");
    }
}
