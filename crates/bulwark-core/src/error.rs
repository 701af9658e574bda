use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Unsupported storage dialect: {0} (expected one of sqlite, mysql, postgres)")]
    InvalidDialect(String),

    #[error("Invalid schema version: {0}")]
    InvalidSchemaVersion(String),

    #[error("Invalid migration direction: {0} (expected up or down)")]
    InvalidDirection(String),
}

pub type Result<T> = std::result::Result<T, Error>;
