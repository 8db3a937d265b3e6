//! Connection pool, timeout-bounded calls and transactions

use crate::metrics::{StoreMetrics, TransactionOutcome};
use crate::{Dialect, Result, StoreError};
use async_trait::async_trait;
use lacework_common::DatabaseConfig;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

/// A bound query parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// Text value
    Text(String),
    /// Integer value
    Integer(i64),
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

fn bind_all<'q>(
    sql: &'q str,
    params: &'q [SqlValue],
) -> sqlx::query::Query<'q, Any, sqlx::any::AnyArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, param| match param {
            SqlValue::Text(value) => query.bind(value.as_str()),
            SqlValue::Integer(value) => query.bind(*value),
        })
}

/// Await `fut` for at most `timeout`, labelling any failure with `operation`
pub async fn with_timeout<T, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(StoreError::from_sqlx(operation, error)),
        Err(_) => Err(StoreError::Timeout { operation, timeout }),
    }
}

/// Shared handle to the lease database
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
    dialect: Dialect,
    timeout: Duration,
    metrics: StoreMetrics,
}

impl Database {
    /// Resolve the dialect and open a pool.
    ///
    /// An unknown driver name fails here, before any connection is attempted.
    #[instrument(skip(config), fields(driver = %config.driver))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let dialect: Dialect = config.driver.parse()?;
        let timeout = Duration::from_secs(config.timeout_secs);

        sqlx::any::install_default_drivers();

        let pool = with_timeout(
            "connecting to database",
            timeout,
            AnyPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(timeout)
                .connect(&config.url),
        )
        .await?;

        info!(%dialect, max_connections = config.max_connections, "database pool created");

        Ok(Self {
            pool,
            dialect,
            timeout,
            metrics: StoreMetrics::default(),
        })
    }

    /// Backend dialect
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Bound applied to every call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Underlying pool
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Execute a statement and return the affected-row count
    pub async fn execute(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<u64> {
        let sql = self.dialect.rebind(sql);
        let start = Instant::now();
        let result = with_timeout(
            operation,
            self.timeout,
            bind_all(&sql, params).execute(&self.pool),
        )
        .await;
        self.observe(operation, &sql, start, &result);

        Ok(result?.rows_affected())
    }

    /// Run a query and collect every row
    pub async fn fetch_all(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Vec<AnyRow>> {
        let sql = self.dialect.rebind(sql);
        let start = Instant::now();
        let result = with_timeout(
            operation,
            self.timeout,
            bind_all(&sql, params).fetch_all(&self.pool),
        )
        .await;
        self.observe(operation, &sql, start, &result);

        let rows = result?;
        self.metrics.query_rows_returned(rows.len());
        Ok(rows)
    }

    /// Run a query expected to return at most one row
    pub async fn fetch_optional(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<Option<AnyRow>> {
        let sql = self.dialect.rebind(sql);
        let start = Instant::now();
        let result = with_timeout(
            operation,
            self.timeout,
            bind_all(&sql, params).fetch_optional(&self.pool),
        )
        .await;
        self.observe(operation, &sql, start, &result);

        result
    }

    /// Open a transaction on a pooled connection
    pub async fn begin(&self) -> Result<SqlTransaction> {
        let inner = with_timeout("begin transaction", self.timeout, self.pool.begin()).await;
        let inner = inner.inspect_err(|e| self.metrics.database_error(e.kind()))?;

        debug!("started transaction");

        Ok(SqlTransaction {
            inner,
            dialect: self.dialect,
            timeout: self.timeout,
            metrics: self.metrics.clone(),
            completion: Completion::start(self.metrics.clone()),
        })
    }

    fn observe<T>(&self, operation: &'static str, sql: &str, start: Instant, result: &Result<T>) {
        self.metrics
            .query_executed(operation, sql, start.elapsed(), result.is_ok());
        if let Err(error) = result {
            self.metrics.database_error(error.kind());
        }
    }
}

/// The slice of a transaction that statement helpers need
#[async_trait]
pub trait Transaction: Send {
    /// Execute a statement inside the transaction, bounded by `timeout`
    async fn execute(
        &mut self,
        operation: &'static str,
        sql: &str,
        params: &[SqlValue],
        timeout: Duration,
    ) -> Result<u64>;

    /// Rewrite `?` placeholders for the transaction's backend
    fn rebind(&self, sql: &str) -> String;
}

/// An open database transaction.
///
/// Dropping it without calling [`SqlTransaction::commit`] rolls it back.
pub struct SqlTransaction {
    inner: sqlx::Transaction<'static, Any>,
    dialect: Dialect,
    timeout: Duration,
    metrics: StoreMetrics,
    completion: Completion,
}

impl SqlTransaction {
    /// Commit the transaction
    pub async fn commit(self) -> Result<()> {
        let Self {
            inner,
            timeout,
            completion,
            ..
        } = self;

        let result = with_timeout("commit transaction", timeout, inner.commit()).await;
        completion.finish(if result.is_ok() {
            TransactionOutcome::Committed
        } else {
            TransactionOutcome::RolledBack
        });
        result
    }

    /// Roll back the transaction
    pub async fn rollback(self) -> Result<()> {
        let Self {
            inner,
            timeout,
            completion,
            ..
        } = self;

        let result = with_timeout("rollback transaction", timeout, inner.rollback()).await;
        completion.finish(TransactionOutcome::RolledBack);
        result
    }
}

/// Records a transaction's outcome exactly once.
///
/// A transaction dropped without commit or rollback is counted as rolled back.
struct Completion {
    metrics: StoreMetrics,
    started: Instant,
    finished: bool,
}

impl Completion {
    fn start(metrics: StoreMetrics) -> Self {
        metrics.transaction_started();
        Self {
            metrics,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: TransactionOutcome) {
        self.record(outcome);
    }

    fn record(&mut self, outcome: TransactionOutcome) {
        if !self.finished {
            self.finished = true;
            self.metrics
                .transaction_completed(outcome, self.started.elapsed());
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        self.record(TransactionOutcome::RolledBack);
    }
}

#[async_trait]
impl Transaction for SqlTransaction {
    async fn execute(
        &mut self,
        operation: &'static str,
        sql: &str,
        params: &[SqlValue],
        timeout: Duration,
    ) -> Result<u64> {
        let start = Instant::now();
        let result = with_timeout(
            operation,
            timeout,
            bind_all(sql, params).execute(&mut *self.inner),
        )
        .await;

        self.metrics
            .query_executed(operation, sql, start.elapsed(), result.is_ok());
        if let Err(error) = &result {
            self.metrics.database_error(error.kind());
        }

        Ok(result?.rows_affected())
    }

    fn rebind(&self, sql: &str) -> String {
        self.dialect.rebind(sql)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    /// An on-disk SQLite database living as long as the returned directory
    pub(crate) async fn sqlite_database() -> (Database, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            driver: "sqlite".to_string(),
            url: format!("sqlite://{}?mode=rwc", dir.path().join("leases.db").display()),
            timeout_secs: 5,
            max_connections: 4,
        };
        let database = Database::connect(&config).await.unwrap();
        (database, dir)
    }
}
