//! Table layout of the pre1 era.
//!
//! The same statements are valid on every supported dialect. Column names
//! are left unquoted so Postgres folds `keyHandle` and `publicKey` the same
//! way the original installations did.

/// Statements recreating an empty pre1 schema.
pub const PRE1_SCHEMA: &str = "
CREATE TABLE user_preferences (
    username VARCHAR(100),
    second_factor_method VARCHAR(11),
    PRIMARY KEY (username)
);

CREATE TABLE identity_verification_tokens (
    token VARCHAR(512)
);

CREATE TABLE totp_secrets (
    username VARCHAR(100),
    secret VARCHAR(64),
    PRIMARY KEY (username)
);

CREATE TABLE u2f_devices (
    username VARCHAR(100),
    keyHandle TEXT,
    publicKey TEXT,
    PRIMARY KEY (username)
);

CREATE TABLE authentication_logs (
    username VARCHAR(100),
    successful BOOL,
    time INTEGER
);

CREATE TABLE config (
    category VARCHAR(32) NOT NULL,
    key_name VARCHAR(32) NOT NULL,
    value TEXT,
    PRIMARY KEY (category, key_name)
);

INSERT INTO config (category, key_name, value) VALUES ('schema', 'version', '1');
";
