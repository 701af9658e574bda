pub mod history;

pub use history::{MigrationHistoryRepository, SqlMigrationHistoryRepository};
