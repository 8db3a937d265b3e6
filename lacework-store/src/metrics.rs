//! Metrics collection for lease storage

use metrics::{counter, describe_histogram, gauge, histogram, Unit};
use std::time::Duration;
use tracing::{debug, warn};

/// Metrics collector for database operations
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    prefix: String,
}

impl Default for StoreMetrics {
    fn default() -> Self {
        Self::new("lacework_store")
    }
}

impl StoreMetrics {
    /// Create a new metrics collector with the given prefix
    pub fn new(prefix: &str) -> Self {
        describe_histogram!(
            format!("{}_query_duration_seconds", prefix),
            Unit::Seconds,
            "Duration of single database calls"
        );
        describe_histogram!(
            format!("{}_transaction_duration_seconds", prefix),
            Unit::Seconds,
            "Time from begin to commit or rollback"
        );

        Self {
            prefix: prefix.to_string(),
        }
    }

    /// Record one bounded database call
    pub fn query_executed(&self, operation: &'static str, sql: &str, duration: Duration, success: bool) {
        let statement = classify_sql_statement(sql);

        counter!(
            format!("{}_queries_total", self.prefix),
            "operation" => operation,
            "statement" => statement,
            "success" => success.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_query_duration_seconds", self.prefix),
            "statement" => statement
        )
        .record(duration.as_secs_f64());

        if success {
            debug!(operation, statement, ?duration, "query executed");
        } else {
            warn!(operation, statement, ?duration, "query failed");
        }
    }

    /// Record a transaction being opened
    pub fn transaction_started(&self) {
        counter!(format!("{}_transactions_started_total", self.prefix)).increment(1);
        gauge!(format!("{}_active_transactions", self.prefix)).increment(1.0);
    }

    /// Record transaction completion
    pub fn transaction_completed(&self, outcome: TransactionOutcome, duration: Duration) {
        counter!(
            format!("{}_transactions_completed_total", self.prefix),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        gauge!(format!("{}_active_transactions", self.prefix)).decrement(1.0);

        histogram!(
            format!("{}_transaction_duration_seconds", self.prefix),
            "outcome" => outcome.as_str()
        )
        .record(duration.as_secs_f64());

        match outcome {
            TransactionOutcome::Committed => debug!(?duration, "transaction committed"),
            TransactionOutcome::RolledBack => warn!(?duration, "transaction rolled back"),
        }
    }

    /// Record a classified storage error
    pub fn database_error(&self, kind: &'static str) {
        counter!(format!("{}_errors_total", self.prefix), "kind" => kind).increment(1);
    }

    /// Record row counts for queries
    pub fn query_rows_returned(&self, row_count: usize) {
        histogram!(format!("{}_query_rows_returned", self.prefix)).record(row_count as f64);
    }
}

/// Statement kind used as a metrics label
fn classify_sql_statement(sql: &str) -> &'static str {
    let keyword = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();

    match keyword.as_str() {
        "SELECT" => "select",
        "INSERT" => "insert",
        "UPDATE" => "update",
        "DELETE" => "delete",
        "CREATE" => "create",
        "BEGIN" | "START" => "begin",
        "COMMIT" => "commit",
        "ROLLBACK" => "rollback",
        _ => "other",
    }
}

/// Transaction outcome for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Transaction was committed
    Committed,
    /// Transaction was rolled back
    RolledBack,
}

impl TransactionOutcome {
    /// Get string representation for metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Committed => "committed",
            TransactionOutcome::RolledBack => "rolled_back",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_statement_classification() {
        assert_eq!(classify_sql_statement("SELECT underlay_ip FROM subnets"), "select");
        assert_eq!(classify_sql_statement("  select 1  "), "select");
        assert_eq!(classify_sql_statement("INSERT INTO subnets VALUES (1)"), "insert");
        assert_eq!(classify_sql_statement("UPDATE subnets SET last_renewed_at = 1"), "update");
        assert_eq!(classify_sql_statement("DELETE FROM subnets WHERE underlay_ip = ?"), "delete");
        assert_eq!(classify_sql_statement("CREATE TABLE IF NOT EXISTS subnets (id int)"), "create");
        assert_eq!(classify_sql_statement("BEGIN"), "begin");
        assert_eq!(classify_sql_statement("COMMIT"), "commit");
        assert_eq!(classify_sql_statement("ROLLBACK"), "rollback");
        assert_eq!(classify_sql_statement("PRAGMA table_info(subnets)"), "other");
        assert_eq!(classify_sql_statement(""), "other");
    }

    #[test]
    fn test_recording_without_recorder() {
        let metrics = StoreMetrics::default();
        metrics.query_executed("selecting all subnets", "SELECT 1", Duration::from_millis(3), true);
        metrics.transaction_started();
        metrics.transaction_completed(TransactionOutcome::RolledBack, Duration::from_millis(1));
        metrics.database_error("timeout");
        metrics.query_rows_returned(4);
    }

    #[test]
    fn test_transaction_outcome_labels() {
        assert_eq!(TransactionOutcome::Committed.as_str(), "committed");
        assert_eq!(TransactionOutcome::RolledBack.as_str(), "rolled_back");
    }
}
