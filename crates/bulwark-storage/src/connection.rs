use crate::error::{StorageError, StorageResult};
use bulwark_core::Dialect;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::{AnyPool, ConnectOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// SQL backend the URL points at
    pub dialect: Dialect,

    /// Connection URL (`sqlite://`, `mysql://`, `postgres://`)
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Minimum number of idle connections to maintain
    pub min_connections: u32,

    /// Maximum lifetime of a connection before it's closed
    pub max_lifetime: Option<Duration>,

    /// How long an idle connection is kept before it's closed
    pub idle_timeout: Option<Duration>,

    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,

    /// Whether to create a SQLite database file if it doesn't exist
    pub create_if_missing: bool,
}

impl DatabaseConfig {
    /// Create a new database configuration for a dialect and URL
    pub fn new(dialect: Dialect, url: impl Into<String>) -> Self {
        Self {
            dialect,
            url: url.into(),
            max_connections: 5,
            min_connections: 0,
            max_lifetime: Some(Duration::from_secs(1800)), // 30 minutes
            idle_timeout: Some(Duration::from_secs(600)),
            acquire_timeout: Duration::from_secs(30),
            create_if_missing: true,
        }
    }

    /// Create a configuration for a SQLite database file
    pub fn sqlite(path: impl AsRef<Path>) -> Self {
        Self::new(Dialect::Sqlite, format!("sqlite://{}", path.as_ref().display()))
    }

    /// Set the maximum number of connections in the pool
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the minimum number of idle connections
    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the maximum connection lifetime, `None` to keep connections forever
    pub fn max_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.max_lifetime = lifetime;
        self
    }

    /// Set the idle timeout, `None` to never close idle connections
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the pool acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set whether to create the database if it doesn't exist
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    /// Check that the URL scheme belongs to the configured dialect
    pub fn validate(&self) -> StorageResult<()> {
        if !self.dialect.accepts_url(&self.url) {
            return Err(StorageError::Configuration(format!(
                "connection url does not match the {} dialect, expected a url starting with one of {:?}",
                self.dialect,
                self.dialect.url_schemes()
            )));
        }

        if self.max_connections == 0 {
            return Err(StorageError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// URL handed to the driver, with SQLite's create mode applied
    fn connect_url(&self) -> String {
        if self.dialect == Dialect::Sqlite
            && self.create_if_missing
            && !self.url.contains(":memory:")
            && !self.url.contains('?')
        {
            format!("{}?mode=rwc", self.url)
        } else {
            self.url.clone()
        }
    }

    /// Filesystem path of a SQLite database, if the URL names one
    fn sqlite_path(&self) -> Option<&Path> {
        if self.dialect != Dialect::Sqlite || self.url.contains(":memory:") {
            return None;
        }

        let rest = self
            .url
            .strip_prefix("sqlite://")
            .or_else(|| self.url.strip_prefix("sqlite:"))?;
        let path = rest.split('?').next().unwrap_or(rest);

        (!path.is_empty()).then(|| Path::new(path))
    }
}

/// Database connection pool wrapper
#[derive(Debug, Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
}

impl Database {
    /// Create a new database connection pool with the given configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bulwark_core::Dialect;
    /// use bulwark_storage::connection::{Database, DatabaseConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = DatabaseConfig::new(Dialect::Postgres, "postgres://bulwark@localhost/bulwark")
    ///     .max_connections(4);
    ///
    /// let db = Database::new(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: DatabaseConfig) -> StorageResult<Self> {
        config.validate()?;

        // Create parent directory if it doesn't exist
        if config.create_if_missing
            && let Some(parent) = config.sqlite_path().and_then(Path::parent)
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::Configuration(format!("Failed to create database directory: {}", e))
            })?;
        }

        sqlx::any::install_default_drivers();

        let options = AnyConnectOptions::from_str(&config.connect_url())
            .map_err(|e| StorageError::Configuration(format!("Invalid database url: {}", e)))?
            .disable_statement_logging(); // Statements are logged by the engine itself

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await?;

        tracing::debug!(dialect = %config.dialect, "connected to database");

        Ok(Self {
            pool,
            dialect: config.dialect,
        })
    }

    /// Create an in-memory SQLite database (primarily for testing)
    ///
    /// The pool holds exactly one connection that is never recycled, since
    /// every new connection would open a separate empty database.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use bulwark_storage::connection::Database;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let db = Database::in_memory().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn in_memory() -> StorageResult<Self> {
        let config = DatabaseConfig::new(Dialect::Sqlite, "sqlite::memory:")
            .max_connections(1)
            .min_connections(1)
            .max_lifetime(None)
            .idle_timeout(None);

        Self::new(config).await
    }

    /// Get a reference to the underlying connection pool
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Dialect of the connected backend
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Close the database connection pool
    ///
    /// This will wait for all active connections to be returned to the pool
    /// before closing them.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Check if the database connection is healthy
    ///
    /// Executes a simple query to verify the connection is working.
    pub async fn health_check(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
