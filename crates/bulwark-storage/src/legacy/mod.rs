//! Transition between the pre1 era and schema version 1.
//!
//! Pre1 databases predate the history table and store some values in a
//! different shape, so moving across the boundary re-shapes rows instead of
//! running a plain script.
//!
//! # Pre1 to 1
//!
//! 1. Rename every pre1 table present to `_bkp_UP_V0001_<table>`.
//! 2. Run the catalog's version 1 `up` script.
//! 3. Copy `user_preferences` with a single `INSERT ... SELECT`.
//! 4. Page through the re-shaped tables, [`LEGACY_PAGE_SIZE`] rows at a time:
//!
//! | Table | Change |
//! |-------|--------|
//! | `authentication_logs` | Unix seconds become a timestamp |
//! | `totp_secrets` | plaintext secret is sealed and becomes `totp_configurations` |
//! | `u2f_devices` | base64 text becomes binary, description `Primary` |
//!
//! 5. Record the `pre1 -> 1` history row.
//! 6. Drop the backups.
//!
//! # 1 to pre1
//!
//! The inverse: version 1 tables are renamed to `_bkp_DOWN_V0001_<table>`,
//! the pre1 tables are recreated and the same columns are copied back with
//! the inverse transforms. Only `Primary` U2F devices survive, since pre1
//! held one device per user.
//!
//! Both directions run on the connection they are given. The executor hands
//! them an open transaction so a failure leaves the backups in place for the
//! rollback to find.

pub mod schema;

use crate::catalog::SchemaMigration;
use crate::encryption::EncryptionKey;
use crate::error::{StorageError, StorageResult};
use crate::queries::Queries;
use crate::transaction;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bulwark_core::SchemaVersion;
use bulwark_core::constants::{
    BACKUP_PREFIX_DOWN_V1, BACKUP_PREFIX_UP_V1, LEGACY_PAGE_SIZE, PRE1_TABLES,
    TABLE_AUTHENTICATION_LOGS, TABLE_PRE1_TOTP_SECRETS, TABLE_TOTP_CONFIGURATIONS,
    TABLE_U2F_DEVICES, TABLE_USER_PREFERENCES, V1_TABLES,
};
use sqlx::AnyConnection;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const U2F_PRIMARY: &str = "Primary";
const TOTP_ALGORITHM: &str = "SHA1";
const TOTP_DIGITS: i32 = 6;
const TOTP_PERIOD: i32 = 30;

/// Everything the transition needs besides the connection.
#[derive(Debug, Clone, Copy)]
pub struct LegacyContext<'a> {
    pub queries: &'a Queries,
    pub key: &'a EncryptionKey,
    pub totp_issuer: &'a str,
    pub application_version: &'a str,
    pub cancel: &'a CancellationToken,
}

impl LegacyContext<'_> {
    fn check_cancelled(&self) -> StorageResult<()> {
        if self.cancel.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn backup_name(prefix: &str, table: &str) -> String {
    format!("{prefix}{table}")
}

/// Move a pre1 database to schema version 1.
pub async fn pre1_to_v1(
    conn: &mut AnyConnection,
    v1_up: &SchemaMigration,
    ctx: &LegacyContext<'_>,
) -> StorageResult<()> {
    let existing = transaction::existing_tables(conn, ctx.queries).await?;
    let present: Vec<&str> = PRE1_TABLES
        .iter()
        .copied()
        .filter(|t| existing.iter().any(|e| e == t))
        .collect();

    for table in &present {
        transaction::rename_table(conn, ctx.queries, table, &backup_name(BACKUP_PREFIX_UP_V1, table))
            .await?;
    }

    transaction::execute_script(conn, &v1_up.query).await?;

    if present.contains(&TABLE_USER_PREFERENCES) {
        copy_user_preferences(conn, ctx, BACKUP_PREFIX_UP_V1).await?;
    }
    if present.contains(&TABLE_AUTHENTICATION_LOGS) {
        authentication_logs_up(conn, ctx).await?;
    }
    if present.contains(&TABLE_PRE1_TOTP_SECRETS) {
        totp_up(conn, ctx).await?;
    }
    if present.contains(&TABLE_U2F_DEVICES) {
        u2f_up(conn, ctx).await?;
    }

    transaction::insert_history(
        conn,
        ctx.queries,
        SchemaVersion::PRE1,
        SchemaVersion::new(1),
        ctx.application_version,
    )
    .await?;

    for table in &present {
        transaction::drop_table(conn, ctx.queries, &backup_name(BACKUP_PREFIX_UP_V1, table)).await?;
    }

    info!(tables = present.len(), "migrated pre1 schema to version 1");

    Ok(())
}

/// Move a version 1 database back to the pre1 layout.
pub async fn v1_to_pre1(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let existing = transaction::existing_tables(conn, ctx.queries).await?;
    let present: Vec<&str> = V1_TABLES
        .iter()
        .copied()
        .filter(|t| existing.iter().any(|e| e == t))
        .collect();

    for table in &present {
        transaction::rename_table(conn, ctx.queries, table, &backup_name(BACKUP_PREFIX_DOWN_V1, table))
            .await?;
    }

    transaction::execute_script(conn, schema::PRE1_SCHEMA).await?;

    if present.contains(&TABLE_USER_PREFERENCES) {
        copy_user_preferences(conn, ctx, BACKUP_PREFIX_DOWN_V1).await?;
    }
    if present.contains(&TABLE_AUTHENTICATION_LOGS) {
        authentication_logs_down(conn, ctx).await?;
    }
    if present.contains(&TABLE_TOTP_CONFIGURATIONS) {
        totp_down(conn, ctx).await?;
    }
    if present.contains(&TABLE_U2F_DEVICES) {
        u2f_down(conn, ctx).await?;
    }

    for table in &present {
        transaction::drop_table(conn, ctx.queries, &backup_name(BACKUP_PREFIX_DOWN_V1, table)).await?;
    }

    info!(tables = present.len(), "migrated schema version 1 to pre1");

    Ok(())
}

async fn copy_user_preferences(
    conn: &mut AnyConnection,
    ctx: &LegacyContext<'_>,
    prefix: &str,
) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let statement = format!(
        "INSERT INTO {TABLE_USER_PREFERENCES} (username, second_factor_method) SELECT username, second_factor_method FROM {}",
        d.quote(&backup_name(prefix, TABLE_USER_PREFERENCES))
    );

    sqlx::raw_sql(&statement).execute(&mut *conn).await?;
    Ok(())
}

async fn authentication_logs_up(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT username, {}, {} FROM {} ORDER BY time, username, successful LIMIT ? OFFSET ?",
        d.bool_as_int("successful"),
        d.cast_int("time"),
        d.quote(&backup_name(BACKUP_PREFIX_UP_V1, TABLE_AUTHENTICATION_LOGS)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_AUTHENTICATION_LOGS} (username, successful, time) VALUES (?, ?, {})",
        d.from_unix_seconds("?")
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(String, i64, i64)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (username, successful, time) in &page {
            sqlx::query(&insert)
                .bind(username)
                .bind(*successful != 0)
                .bind(*time)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_AUTHENTICATION_LOGS, offset, rows = page.len(), "copied legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

async fn authentication_logs_down(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT username, {}, {} FROM {} ORDER BY id LIMIT ? OFFSET ?",
        d.bool_as_int("successful"),
        d.unix_seconds("time"),
        d.quote(&backup_name(BACKUP_PREFIX_DOWN_V1, TABLE_AUTHENTICATION_LOGS)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_AUTHENTICATION_LOGS} (username, successful, time) VALUES (?, ?, ?)"
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(String, i64, i64)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (username, successful, time) in &page {
            sqlx::query(&insert)
                .bind(username)
                .bind(*successful != 0)
                .bind(*time)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_AUTHENTICATION_LOGS, offset, rows = page.len(), "restored legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

async fn totp_up(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT username, secret FROM {} ORDER BY username LIMIT ? OFFSET ?",
        d.quote(&backup_name(BACKUP_PREFIX_UP_V1, TABLE_PRE1_TOTP_SECRETS)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_TOTP_CONFIGURATIONS} (username, issuer, algorithm, digits, period, secret) VALUES (?, ?, ?, ?, ?, ?)"
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(String, String)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (username, secret) in &page {
            let sealed = ctx.key.encrypt(secret.as_bytes())?;

            sqlx::query(&insert)
                .bind(username)
                .bind(ctx.totp_issuer)
                .bind(TOTP_ALGORITHM)
                .bind(TOTP_DIGITS)
                .bind(TOTP_PERIOD)
                .bind(sealed)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_PRE1_TOTP_SECRETS, offset, rows = page.len(), "copied legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

async fn totp_down(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT {}, username, secret FROM {} ORDER BY id LIMIT ? OFFSET ?",
        d.cast_int("id"),
        d.quote(&backup_name(BACKUP_PREFIX_DOWN_V1, TABLE_TOTP_CONFIGURATIONS)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_PRE1_TOTP_SECRETS} (username, secret) VALUES (?, ?)"
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(i64, String, Vec<u8>)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (id, username, sealed) in &page {
            let plaintext = ctx.key.decrypt(sealed).map_err(|_| StorageError::Decrypt {
                table: TABLE_TOTP_CONFIGURATIONS,
                id: *id,
            })?;
            let secret = String::from_utf8(plaintext).map_err(|_| {
                StorageError::LegacyData(format!("totp secret for user '{username}' is not valid text"))
            })?;

            sqlx::query(&insert)
                .bind(username)
                .bind(secret)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_TOTP_CONFIGURATIONS, offset, rows = page.len(), "restored legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

async fn u2f_up(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT username, keyHandle, publicKey FROM {} ORDER BY username LIMIT ? OFFSET ?",
        d.quote(&backup_name(BACKUP_PREFIX_UP_V1, TABLE_U2F_DEVICES)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_U2F_DEVICES} (username, description, key_handle, public_key) VALUES (?, ?, ?, ?)"
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(String, String, String)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (username, key_handle, public_key) in &page {
            let decode = |field: &str, value: &str| {
                STANDARD.decode(value).map_err(|e| {
                    StorageError::LegacyData(format!(
                        "u2f device for user '{username}' has an invalid base64 {field}: {e}"
                    ))
                })
            };

            sqlx::query(&insert)
                .bind(username)
                .bind(U2F_PRIMARY)
                .bind(decode("key handle", key_handle.as_str())?)
                .bind(decode("public key", public_key.as_str())?)
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_U2F_DEVICES, offset, rows = page.len(), "copied legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

async fn u2f_down(conn: &mut AnyConnection, ctx: &LegacyContext<'_>) -> StorageResult<()> {
    let d = ctx.queries.descriptor();
    let select = d.rebind(&format!(
        "SELECT username, key_handle, public_key FROM {} WHERE description = '{U2F_PRIMARY}' ORDER BY id LIMIT ? OFFSET ?",
        d.quote(&backup_name(BACKUP_PREFIX_DOWN_V1, TABLE_U2F_DEVICES)),
    ));
    let insert = d.rebind(&format!(
        "INSERT INTO {TABLE_U2F_DEVICES} (username, keyHandle, publicKey) VALUES (?, ?, ?)"
    ));

    let mut offset = 0;
    loop {
        ctx.check_cancelled()?;

        let page: Vec<(String, Vec<u8>, Vec<u8>)> = sqlx::query_as(&select)
            .bind(LEGACY_PAGE_SIZE)
            .bind(offset)
            .fetch_all(&mut *conn)
            .await?;

        for (username, key_handle, public_key) in &page {
            sqlx::query(&insert)
                .bind(username)
                .bind(STANDARD.encode(key_handle))
                .bind(STANDARD.encode(public_key))
                .execute(&mut *conn)
                .await?;
        }

        debug!(table = TABLE_U2F_DEVICES, offset, rows = page.len(), "restored legacy page");

        if (page.len() as i64) < LEGACY_PAGE_SIZE {
            return Ok(());
        }
        offset += LEGACY_PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_names() {
        assert_eq!(
            backup_name(BACKUP_PREFIX_UP_V1, TABLE_U2F_DEVICES),
            "_bkp_UP_V0001_u2f_devices"
        );
        assert_eq!(
            backup_name(BACKUP_PREFIX_DOWN_V1, TABLE_TOTP_CONFIGURATIONS),
            "_bkp_DOWN_V0001_totp_configurations"
        );
    }

    #[test]
    fn test_cancelled_context() {
        let queries = Queries::new(bulwark_core::Dialect::Sqlite);
        let key = EncryptionKey::derive("key");
        let cancel = CancellationToken::new();
        let ctx = LegacyContext {
            queries: &queries,
            key: &key,
            totp_issuer: "bulwark",
            application_version: "test",
            cancel: &cancel,
        };

        assert!(ctx.check_cancelled().is_ok());
        cancel.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(StorageError::Cancelled)));
    }
}
