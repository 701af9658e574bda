//! Dialect-specific query sets.
//!
//! Statements are written once with `?` placeholders and rebound for the
//! target dialect when a [`Queries`] value is built. Nothing rewrites a query
//! string after construction.

use crate::dialect::DialectDescriptor;
use bulwark_core::Dialect;
use bulwark_core::constants::{ENCRYPTION_CHECK_NAME, TABLE_ENCRYPTION, TABLE_MIGRATIONS};

/// Immutable statements used by the resolver, executor and key rotation.
#[derive(Debug, Clone)]
pub struct Queries {
    descriptor: &'static DialectDescriptor,

    pub select_tables: String,
    pub select_latest_version: String,
    pub select_history: String,
    pub insert_history: String,
    pub select_check_value: String,
    pub upsert_check_value: String,
}

impl Queries {
    /// Build the query set for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        let d = DialectDescriptor::of(dialect);

        Self {
            descriptor: d,
            select_tables: d.select_tables.to_string(),
            select_latest_version: format!(
                "SELECT {} FROM {TABLE_MIGRATIONS} ORDER BY id DESC LIMIT 1",
                d.cast_int("version_after")
            ),
            select_history: format!(
                "SELECT {}, {}, {}, {}, application_version FROM {TABLE_MIGRATIONS} ORDER BY id ASC",
                d.cast_int("id"),
                d.unix_seconds("applied"),
                d.cast_int("version_before"),
                d.cast_int("version_after"),
            ),
            insert_history: d.rebind(&format!(
                "INSERT INTO {TABLE_MIGRATIONS} (applied, version_before, version_after, application_version) VALUES ({}, ?, ?, ?)",
                d.from_unix_seconds("?")
            )),
            select_check_value: d.rebind(&format!(
                "SELECT value FROM {TABLE_ENCRYPTION} WHERE name = '{ENCRYPTION_CHECK_NAME}'"
            )),
            upsert_check_value: d.upsert(TABLE_ENCRYPTION, "name", &["name", "value"]),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &'static DialectDescriptor {
        self.descriptor
    }

    #[must_use]
    pub fn dialect(&self) -> Dialect {
        self.descriptor.dialect
    }

    /// Rebind an ad-hoc statement for this dialect.
    #[must_use]
    pub fn rebind(&self, query: &str) -> String {
        self.descriptor.rebind(query)
    }

    /// One page of `(id, value)` pairs from an encrypted column.
    ///
    /// Binds: limit, offset.
    #[must_use]
    pub fn select_encrypted_page(&self, table: &str, id_column: &str, value_column: &str) -> String {
        self.rebind(&format!(
            "SELECT {}, {value_column} FROM {table} ORDER BY {id_column} ASC LIMIT ? OFFSET ?",
            self.descriptor.cast_int(id_column)
        ))
    }

    /// Rewrite one encrypted value by primary key.
    ///
    /// Binds: value, id.
    #[must_use]
    pub fn update_encrypted_value(&self, table: &str, id_column: &str, value_column: &str) -> String {
        self.rebind(&format!(
            "UPDATE {table} SET {value_column} = ? WHERE {id_column} = ?"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_history_insert_is_rebound() {
        let q = Queries::new(Dialect::Postgres);
        assert_eq!(
            q.insert_history,
            "INSERT INTO migrations (applied, version_before, version_after, application_version) VALUES (to_timestamp(CAST($1 AS DOUBLE PRECISION)), $2, $3, $4)"
        );
    }

    #[test]
    fn test_sqlite_history_insert_keeps_question_marks() {
        let q = Queries::new(Dialect::Sqlite);
        assert_eq!(q.insert_history.matches('?').count(), 4);
        assert!(q.insert_history.contains("datetime(?, 'unixepoch')"));
    }

    #[test]
    fn test_encrypted_page_query() {
        let q = Queries::new(Dialect::MySql);
        assert_eq!(
            q.select_encrypted_page("totp_configurations", "id", "secret"),
            "SELECT CAST(id AS SIGNED), secret FROM totp_configurations ORDER BY id ASC LIMIT ? OFFSET ?"
        );

        let q = Queries::new(Dialect::Postgres);
        assert_eq!(
            q.update_encrypted_value("totp_configurations", "id", "secret"),
            "UPDATE totp_configurations SET secret = $1 WHERE id = $2"
        );
    }

    #[test]
    fn test_check_value_literal_survives_rebind() {
        let q = Queries::new(Dialect::Postgres);
        assert!(q.select_check_value.ends_with("WHERE name = 'check'"));
        assert!(q.upsert_check_value.contains("ON CONFLICT (name)"));
    }
}
