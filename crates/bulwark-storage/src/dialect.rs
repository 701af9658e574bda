//! Per-backend SQL details.
//!
//! A [`DialectDescriptor`] is a static, immutable record describing how one
//! SQL backend spells the handful of things the engine cannot write
//! portably: placeholders, identifier quoting, table renames, upserts,
//! timestamp conversion and table introspection. Everything above this module
//! builds its statements through a descriptor, so the migration and rotation
//! algorithms stay dialect-agnostic.
//!
//! # Examples
//!
//! ```
//! use bulwark_core::Dialect;
//! use bulwark_storage::dialect::DialectDescriptor;
//!
//! let pg = DialectDescriptor::of(Dialect::Postgres);
//! assert_eq!(pg.rebind("SELECT * FROM t WHERE a = ? AND b = ?"), "SELECT * FROM t WHERE a = $1 AND b = $2");
//!
//! let mysql = DialectDescriptor::of(Dialect::MySql);
//! assert_eq!(mysql.quote("_bkp_UP_V0001_config"), "`_bkp_UP_V0001_config`");
//! ```

use bulwark_core::Dialect;

/// Bind parameter spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` for every parameter.
    Question,
    /// `$1`, `$2`, ... numbered parameters.
    Dollar,
}

/// Table rename spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameSyntax {
    /// `ALTER TABLE a RENAME TO b`
    AlterTable,
    /// `RENAME TABLE a TO b`
    RenameTable,
}

/// Upsert spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertSyntax {
    /// `ON CONFLICT (key) DO UPDATE SET col = excluded.col`
    OnConflict,
    /// `ON DUPLICATE KEY UPDATE col = VALUES(col)`
    OnDuplicateKey,
}

/// Static description of one SQL backend.
#[derive(Debug)]
pub struct DialectDescriptor {
    pub dialect: Dialect,
    pub placeholder: PlaceholderStyle,
    pub identifier_quote: char,
    pub rename: RenameSyntax,
    pub upsert: UpsertSyntax,

    /// Whether DDL participates in transactions.
    ///
    /// MySQL commits implicitly around most DDL statements, so a failed
    /// migration step there can only be undone by the compensating down
    /// migrations, never by the transaction rollback alone.
    pub transactional_ddl: bool,

    /// Lists the base tables of the connected database, one name per row.
    pub select_tables: &'static str,
}

static SQLITE: DialectDescriptor = DialectDescriptor {
    dialect: Dialect::Sqlite,
    placeholder: PlaceholderStyle::Question,
    identifier_quote: '"',
    rename: RenameSyntax::AlterTable,
    upsert: UpsertSyntax::OnConflict,
    transactional_ddl: true,
    select_tables: "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
};

static MYSQL: DialectDescriptor = DialectDescriptor {
    dialect: Dialect::MySql,
    placeholder: PlaceholderStyle::Question,
    identifier_quote: '`',
    rename: RenameSyntax::RenameTable,
    upsert: UpsertSyntax::OnDuplicateKey,
    transactional_ddl: false,
    select_tables: "SELECT CAST(table_name AS CHAR) FROM information_schema.tables WHERE table_type = 'BASE TABLE' AND table_schema = database() ORDER BY table_name",
};

static POSTGRES: DialectDescriptor = DialectDescriptor {
    dialect: Dialect::Postgres,
    placeholder: PlaceholderStyle::Dollar,
    identifier_quote: '"',
    rename: RenameSyntax::AlterTable,
    upsert: UpsertSyntax::OnConflict,
    transactional_ddl: true,
    select_tables: "SELECT CAST(table_name AS TEXT) FROM information_schema.tables WHERE table_type = 'BASE TABLE' AND table_schema = current_schema() ORDER BY table_name",
};

impl DialectDescriptor {
    /// Descriptor for `dialect`.
    #[must_use]
    pub fn of(dialect: Dialect) -> &'static DialectDescriptor {
        match dialect {
            Dialect::Sqlite => &SQLITE,
            Dialect::MySql => &MYSQL,
            Dialect::Postgres => &POSTGRES,
        }
    }

    /// Rewrite `?` placeholders into this dialect's style.
    ///
    /// Question marks inside single-quoted literals are left untouched.
    #[must_use]
    pub fn rebind(&self, query: &str) -> String {
        if self.placeholder == PlaceholderStyle::Question {
            return query.to_string();
        }

        let mut out = String::with_capacity(query.len() + 8);
        let mut n = 0;
        let mut in_literal = false;

        for c in query.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '?' if !in_literal => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }

        out
    }

    /// Quote an identifier.
    #[must_use]
    pub fn quote(&self, identifier: &str) -> String {
        let q = self.identifier_quote;
        format!("{q}{identifier}{q}")
    }

    #[must_use]
    pub fn rename_table(&self, from: &str, to: &str) -> String {
        match self.rename {
            RenameSyntax::AlterTable => {
                format!("ALTER TABLE {} RENAME TO {}", self.quote(from), self.quote(to))
            }
            RenameSyntax::RenameTable => {
                format!("RENAME TABLE {} TO {}", self.quote(from), self.quote(to))
            }
        }
    }

    #[must_use]
    pub fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote(table))
    }

    /// Build an upsert keyed on `key`, updating every other column.
    ///
    /// Placeholders are already rebound.
    #[must_use]
    pub fn upsert(&self, table: &str, key: &str, columns: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = columns
            .iter()
            .filter(|c| **c != key)
            .map(|c| match self.upsert {
                UpsertSyntax::OnConflict => format!("{c} = excluded.{c}"),
                UpsertSyntax::OnDuplicateKey => format!("{c} = VALUES({c})"),
            })
            .collect();

        let conflict = match self.upsert {
            UpsertSyntax::OnConflict => format!("ON CONFLICT ({key}) DO UPDATE SET"),
            UpsertSyntax::OnDuplicateKey => "ON DUPLICATE KEY UPDATE".to_string(),
        };

        self.rebind(&format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders}) {conflict} {}",
            columns.join(", "),
            updates.join(", ")
        ))
    }

    /// Expression reading a timestamp column as Unix seconds (`BIGINT`).
    #[must_use]
    pub fn unix_seconds(&self, column: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => format!("CAST(strftime('%s', {column}) AS INTEGER)"),
            Dialect::MySql => format!("CAST(UNIX_TIMESTAMP({column}) AS SIGNED)"),
            Dialect::Postgres => format!("CAST(EXTRACT(EPOCH FROM {column}) AS BIGINT)"),
        }
    }

    /// Expression turning a Unix seconds placeholder into a timestamp.
    #[must_use]
    pub fn from_unix_seconds(&self, placeholder: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => format!("datetime({placeholder}, 'unixepoch')"),
            Dialect::MySql => format!("FROM_UNIXTIME({placeholder})"),
            Dialect::Postgres => format!("to_timestamp(CAST({placeholder} AS DOUBLE PRECISION))"),
        }
    }

    /// Expression projecting a boolean column as a `BIGINT` 0 or 1.
    #[must_use]
    pub fn bool_as_int(&self, column: &str) -> String {
        self.cast_int(&format!("CASE WHEN {column} THEN 1 ELSE 0 END"))
    }

    /// Expression casting `expr` to this dialect's 64-bit integer.
    #[must_use]
    pub fn cast_int(&self, expr: &str) -> String {
        match self.dialect {
            Dialect::Sqlite => format!("CAST({expr} AS INTEGER)"),
            Dialect::MySql => format!("CAST({expr} AS SIGNED)"),
            Dialect::Postgres => format!("CAST({expr} AS BIGINT)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Dialect::Sqlite, "SELECT ? , ?", "SELECT ? , ?")]
    #[case(Dialect::MySql, "SELECT ?", "SELECT ?")]
    #[case(Dialect::Postgres, "SELECT ? , ?", "SELECT $1 , $2")]
    #[case(Dialect::Postgres, "SELECT '?' , ?", "SELECT '?' , $1")]
    fn test_rebind(#[case] dialect: Dialect, #[case] input: &str, #[case] expected: &str) {
        assert_eq!(DialectDescriptor::of(dialect).rebind(input), expected);
    }

    #[rstest]
    #[case(Dialect::Sqlite, "ALTER TABLE \"a\" RENAME TO \"b\"")]
    #[case(Dialect::Postgres, "ALTER TABLE \"a\" RENAME TO \"b\"")]
    #[case(Dialect::MySql, "RENAME TABLE `a` TO `b`")]
    fn test_rename_table(#[case] dialect: Dialect, #[case] expected: &str) {
        assert_eq!(DialectDescriptor::of(dialect).rename_table("a", "b"), expected);
    }

    #[test]
    fn test_upsert_on_conflict() {
        let sql = DialectDescriptor::of(Dialect::Postgres).upsert("encryption", "name", &["name", "value"]);
        assert_eq!(
            sql,
            "INSERT INTO encryption (name, value) VALUES ($1, $2) ON CONFLICT (name) DO UPDATE SET value = excluded.value"
        );
    }

    #[test]
    fn test_upsert_on_duplicate_key() {
        let sql = DialectDescriptor::of(Dialect::MySql).upsert("encryption", "name", &["name", "value"]);
        assert_eq!(
            sql,
            "INSERT INTO encryption (name, value) VALUES (?, ?) ON DUPLICATE KEY UPDATE value = VALUES(value)"
        );
    }

    #[test]
    fn test_only_mysql_lacks_transactional_ddl() {
        for dialect in Dialect::ALL {
            let descriptor = DialectDescriptor::of(dialect);
            assert_eq!(descriptor.dialect, dialect);
            assert_eq!(descriptor.transactional_ddl, dialect != Dialect::MySql);
        }
    }
}
