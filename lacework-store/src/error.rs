//! Error types for lease storage

use std::time::Duration;

/// Result type alias for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The call did not complete within the configured timeout
    #[error("{operation}: timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out
        operation: &'static str,
        /// Bound that was exceeded
        timeout: Duration,
    },

    /// A unique column collided with an existing row
    #[error("{operation}: constraint violation: {message}")]
    ConstraintViolation {
        /// Operation that hit the constraint
        operation: &'static str,
        /// Database message
        message: String,
    },

    /// A single-row mutation touched no row
    #[error("record not affected")]
    RecordNotAffected,

    /// A single-row mutation touched more than one row
    #[error("multiple records affected: {count}")]
    MultipleRecordsAffected {
        /// Rows reported by the database
        count: u64,
    },

    /// No lease row for the underlay address
    #[error("{operation}: no lease for underlay ip {underlay_ip}")]
    NotFound {
        /// Lookup that came back empty
        operation: &'static str,
        /// Address looked up
        underlay_ip: String,
    },

    /// Lease rejected before reaching the database
    #[error("invalid lease: {0}")]
    InvalidLease(#[from] lacework_common::LaceworkError),

    /// Driver name with no matching dialect
    #[error("database type {0} is not supported")]
    UnsupportedDriver(String),

    /// Schema migration failed
    #[error("migrating: {0}")]
    Migration(String),

    /// Rolling back after a failure failed as well
    #[error("db rollback: {rollback} (sql error: {cause})")]
    Rollback {
        /// Rollback failure
        rollback: String,
        /// Error that triggered the rollback
        cause: Box<StoreError>,
    },

    /// Any other driver or transport failure
    #[error("{operation}: {source}")]
    Database {
        /// Operation that failed
        operation: &'static str,
        /// Driver error
        #[source]
        source: sqlx::Error,
    },
}

impl StoreError {
    /// Classify a driver error raised by `operation`
    pub fn from_sqlx(operation: &'static str, error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::ConstraintViolation {
                    operation,
                    message: db_err.message().to_string(),
                }
            }
            source => StoreError::Database { operation, source },
        }
    }

    /// True when a unique constraint rejected the write
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, StoreError::ConstraintViolation { .. })
    }

    /// True when the caller may reasonably try the same call again
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Timeout { .. } => true,
            StoreError::ConstraintViolation { .. } => true,
            StoreError::Database { source, .. } => {
                matches!(source, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            }
            StoreError::RecordNotAffected => false,
            StoreError::MultipleRecordsAffected { .. } => false,
            StoreError::NotFound { .. } => false,
            StoreError::InvalidLease(_) => false,
            StoreError::UnsupportedDriver(_) => false,
            StoreError::Migration(_) => false,
            StoreError::Rollback { .. } => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::Timeout { .. } => "timeout",
            StoreError::ConstraintViolation { .. } => "constraint_violation",
            StoreError::RecordNotAffected => "record_not_affected",
            StoreError::MultipleRecordsAffected { .. } => "multiple_records_affected",
            StoreError::NotFound { .. } => "not_found",
            StoreError::InvalidLease(_) => "invalid_lease",
            StoreError::UnsupportedDriver(_) => "unsupported_driver",
            StoreError::Migration(_) => "migration",
            StoreError::Rollback { .. } => "rollback",
            StoreError::Database { .. } => "database",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = StoreError::Timeout {
            operation: "selecting all subnets",
            timeout: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert!(!timeout.is_constraint_violation());

        assert!(!StoreError::RecordNotAffected.is_retryable());
        assert!(!StoreError::MultipleRecordsAffected { count: 2 }.is_retryable());

        let pool = StoreError::from_sqlx("adding entry", sqlx::Error::PoolTimedOut);
        assert!(pool.is_retryable());
        assert_eq!(pool.kind(), "database");
    }

    #[test]
    fn test_messages_carry_operation() {
        let err = StoreError::from_sqlx("adding entry", sqlx::Error::RowNotFound);
        assert!(err.to_string().starts_with("adding entry: "));

        let rollback = StoreError::Rollback {
            rollback: "connection reset".to_string(),
            cause: Box::new(StoreError::RecordNotAffected),
        };
        assert_eq!(
            rollback.to_string(),
            "db rollback: connection reset (sql error: record not affected)"
        );
    }
}
