//! Shared constants for the Bulwark storage engine.
//!
//! Table names, legacy backup prefixes and paging limits are defined here so
//! the storage crate, the CLI and the tests agree on a single vocabulary.
//!
//! # Table Eras
//!
//! The persisted schema has lived through two eras:
//!
//! | Era | Marker | Tables |
//! |-----|--------|--------|
//! | pre1 | no `migrations` table | [`PRE1_TABLES`] |
//! | tracked | `migrations` table present | everything created by `V0001` onwards |
//!
//! The pre1 era predates version history. Moving in or out of it requires the
//! legacy transition adapter rather than a plain migration script.
//!
//! # Usage
//!
//! ```
//! use bulwark_core::constants::*;
//!
//! assert_eq!(TABLE_MIGRATIONS, "migrations");
//! assert!(PRE1_SIGNATURE.iter().all(|t| PRE1_TABLES.contains(t)));
//! ```

// ============================================================================
// Tracked-era tables
// ============================================================================

/// Migration history table. Its presence marks a tracked schema.
pub const TABLE_MIGRATIONS: &str = "migrations";

/// Encryption check value table.
pub const TABLE_ENCRYPTION: &str = "encryption";

pub const TABLE_AUTHENTICATION_LOGS: &str = "authentication_logs";
pub const TABLE_IDENTITY_VERIFICATION: &str = "identity_verification";
pub const TABLE_TOTP_CONFIGURATIONS: &str = "totp_configurations";
pub const TABLE_U2F_DEVICES: &str = "u2f_devices";
pub const TABLE_DUO_DEVICES: &str = "duo_devices";
pub const TABLE_USER_PREFERENCES: &str = "user_preferences";
pub const TABLE_BANNED_USER: &str = "banned_user";
pub const TABLE_BANNED_IP: &str = "banned_ip";
pub const TABLE_WEBAUTHN_CREDENTIALS: &str = "webauthn_credentials";

/// Tables created by the version 1 schema.
///
/// This is the set renamed to backups when leaving version 1 for pre1.
pub const V1_TABLES: [&str; 8] = [
    TABLE_MIGRATIONS,
    TABLE_ENCRYPTION,
    TABLE_AUTHENTICATION_LOGS,
    TABLE_IDENTITY_VERIFICATION,
    TABLE_TOTP_CONFIGURATIONS,
    TABLE_U2F_DEVICES,
    TABLE_DUO_DEVICES,
    TABLE_USER_PREFERENCES,
];

// ============================================================================
// Pre1-era tables
// ============================================================================

pub const TABLE_PRE1_CONFIG: &str = "config";
pub const TABLE_PRE1_IDENTITY_VERIFICATION_TOKENS: &str = "identity_verification_tokens";
pub const TABLE_PRE1_TOTP_SECRETS: &str = "totp_secrets";

/// Every table a pre1 database may contain.
pub const PRE1_TABLES: [&str; 6] = [
    TABLE_PRE1_CONFIG,
    TABLE_USER_PREFERENCES,
    TABLE_PRE1_IDENTITY_VERIFICATION_TOKENS,
    TABLE_AUTHENTICATION_LOGS,
    TABLE_PRE1_TOTP_SECRETS,
    TABLE_U2F_DEVICES,
];

/// Tables that must all be present for a database to be recognised as pre1.
///
/// The legacy `config` table is optional; some pre1 installations never
/// created it.
pub const PRE1_SIGNATURE: [&str; 5] = [
    TABLE_USER_PREFERENCES,
    TABLE_PRE1_IDENTITY_VERIFICATION_TOKENS,
    TABLE_AUTHENTICATION_LOGS,
    TABLE_PRE1_TOTP_SECRETS,
    TABLE_U2F_DEVICES,
];

/// Prefix for pre1 tables renamed out of the way during pre1 → 1.
pub const BACKUP_PREFIX_UP_V1: &str = "_bkp_UP_V0001_";

/// Prefix for version 1 tables renamed out of the way during 1 → pre1.
pub const BACKUP_PREFIX_DOWN_V1: &str = "_bkp_DOWN_V0001_";

// ============================================================================
// Paging
// ============================================================================

/// Rows fetched per page when re-shaping legacy tables.
pub const LEGACY_PAGE_SIZE: i64 = 100;

/// Rows fetched per page during encryption key rotation and key checks.
pub const ENCRYPTION_PAGE_SIZE: i64 = 10;

// ============================================================================
// Encryption
// ============================================================================

/// Shortest accepted encryption key string.
pub const ENCRYPTION_KEY_MIN_LENGTH: usize = 20;

/// Name of the row in [`TABLE_ENCRYPTION`] holding the check value.
pub const ENCRYPTION_CHECK_NAME: &str = "check";

/// Release line operators must use to move a database back into the pre1 era.
pub const PRE1_SUPPORTED_RELEASE: &str = "0.1.x";

/// Default TOTP issuer applied to legacy secrets which never stored one.
pub const DEFAULT_TOTP_ISSUER: &str = "bulwark";
