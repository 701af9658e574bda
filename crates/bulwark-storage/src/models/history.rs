use crate::error::{StorageError, StorageResult};
use bulwark_core::SchemaVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One applied migration, as recorded in the `migrations` table.
///
/// Rows are append-only. A down migration adds a row with
/// `version_after < version_before` rather than removing the row of the
/// migration it undoes, so the latest row always names the live version.
///
/// # Fields
///
/// * `id` - Insertion order
/// * `applied` - When the step committed
/// * `version_before` - Schema version before the step (`None` on very old rows)
/// * `version_after` - Schema version after the step
/// * `application_version` - Version of the binary that applied it
///
/// # Examples
///
/// ```
/// use bulwark_core::SchemaVersion;
/// use bulwark_storage::models::MigrationHistoryRecord;
/// use chrono::Utc;
///
/// let record = MigrationHistoryRecord {
///     id: 3,
///     applied: Utc::now(),
///     version_before: Some(SchemaVersion::new(3)),
///     version_after: SchemaVersion::new(2),
///     application_version: "0.1.0".to_string(),
/// };
///
/// assert!(record.is_downgrade());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationHistoryRecord {
    pub id: i64,
    pub applied: DateTime<Utc>,
    pub version_before: Option<SchemaVersion>,
    pub version_after: SchemaVersion,
    pub application_version: String,
}

impl MigrationHistoryRecord {
    #[must_use]
    pub fn is_downgrade(&self) -> bool {
        self.version_before
            .is_some_and(|before| self.version_after < before)
    }

    /// Build a record from the raw row shape read through the any driver.
    pub(crate) fn from_row(
        (id, applied, before, after, application_version): (i64, i64, Option<i64>, i64, String),
    ) -> StorageResult<Self> {
        Ok(Self {
            id,
            applied: DateTime::from_timestamp(applied, 0).ok_or(StorageError::InvalidHistory {
                column: "applied",
                value: applied,
            })?,
            version_before: before
                .map(|v| history_version("version_before", v))
                .transpose()?,
            version_after: history_version("version_after", after)?,
            application_version,
        })
    }
}

/// Narrow a version column read as `BIGINT`.
pub(crate) fn history_version(column: &'static str, value: i64) -> StorageResult<SchemaVersion> {
    i32::try_from(value)
        .map(SchemaVersion::new)
        .map_err(|_| StorageError::InvalidHistory { column, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_row() {
        let record = MigrationHistoryRecord::from_row((7, 1_700_000_000, Some(-1), 1, "0.1.0".to_string())).unwrap();

        assert_eq!(record.id, 7);
        assert_eq!(record.applied.timestamp(), 1_700_000_000);
        assert_eq!(record.version_before, Some(SchemaVersion::PRE1));
        assert_eq!(record.version_after, SchemaVersion::new(1));
        assert!(!record.is_downgrade());
    }

    #[test]
    fn test_missing_before_is_not_a_downgrade() {
        let record = MigrationHistoryRecord::from_row((1, 0, None, 1, "old".to_string())).unwrap();
        assert!(!record.is_downgrade());
    }

    #[test]
    fn test_from_row_rejects_truncated_version() {
        let err = MigrationHistoryRecord::from_row((2, 0, Some(1), i64::from(i32::MAX) + 1, "x".to_string()))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidHistory { column: "version_after", .. }));

        let err = MigrationHistoryRecord::from_row((2, 0, Some(-4_294_967_295), 1, "x".to_string()))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidHistory { column: "version_before", .. }));
    }

    #[test]
    fn test_from_row_rejects_unrepresentable_timestamp() {
        let err = MigrationHistoryRecord::from_row((3, i64::MAX, Some(0), 1, "x".to_string())).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidHistory { column: "applied", value: i64::MAX }
        ));
    }
}
