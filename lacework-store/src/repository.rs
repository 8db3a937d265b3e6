//! Durable lease storage

use crate::database::{Database, SqlTransaction, SqlValue};
use crate::deleter::{Deleter, SubnetDeleter};
use crate::{migrations, Result, StoreError};
use async_trait::async_trait;
use lacework_common::Lease;
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::{debug, instrument, warn};

const LEASE_COLUMNS: &str = "underlay_ip, overlay_subnet, overlay_hwaddr, last_renewed_at";

/// Storage port used by the lease allocator.
///
/// Every call is bounded by the store's timeout. Uniqueness of the underlay
/// address, the overlay subnet and the hardware address is enforced here and
/// surfaces as [`StoreError::ConstraintViolation`].
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Every lease, active or not
    async fn all(&self) -> Result<Vec<Lease>>;

    /// Leases renewed within the last `window` seconds
    async fn all_active(&self, window: u32) -> Result<Vec<Lease>>;

    /// The least recently renewed lease outside the `window`, if any
    async fn oldest_expired(&self, window: u32) -> Result<Option<Lease>>;

    /// Insert a lease stamped with the database's current time
    async fn add_entry(&self, lease: &Lease) -> Result<()>;

    /// Stamp the host's lease with the current time, returning rows touched
    async fn renew_lease_for_underlay_ip(&self, underlay_ip: &str) -> Result<u64>;

    /// Lease held by a host
    async fn lease_for_underlay_ip(&self, underlay_ip: &str) -> Result<Option<Lease>>;

    /// Renewal time of a host's lease
    async fn last_renewed_at_for_underlay_ip(&self, underlay_ip: &str) -> Result<i64>;

    /// Subnet granted to a host
    async fn subnet_for_underlay_ip(&self, underlay_ip: &str) -> Result<String>;

    /// Remove a host's lease. Exactly one row must go.
    async fn delete_entry(&self, underlay_ip: &str) -> Result<()>;

    /// Create or upgrade the schema, returning migrations applied
    async fn migrate(&self) -> Result<usize>;
}

/// SQL-backed [`LeaseStore`]
#[derive(Clone)]
pub struct LeaseRepository<D = Deleter> {
    db: Database,
    deleter: D,
}

impl LeaseRepository {
    /// Repository deleting through the default [`Deleter`]
    pub fn new(db: Database) -> Self {
        Self::with_deleter(db, Deleter)
    }
}

impl<D: SubnetDeleter> LeaseRepository<D> {
    /// Repository deleting through `deleter`
    pub fn with_deleter(db: Database, deleter: D) -> Self {
        Self { db, deleter }
    }

    /// Underlying database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    async fn select_leases(
        &self,
        operation: &'static str,
        condition: &str,
        window: Option<u32>,
    ) -> Result<Vec<Lease>> {
        let sql = format!("SELECT {LEASE_COLUMNS} FROM subnets {condition} ORDER BY id");
        let params: Vec<SqlValue> = window.map(|w| i64::from(w).into()).into_iter().collect();

        self.db
            .fetch_all(operation, &sql, &params)
            .await?
            .iter()
            .map(|row| lease_from_row(operation, row))
            .collect()
    }

    async fn finish_delete(&self, tx: SqlTransaction, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => tx.commit().await,
            Err(cause) => match tx.rollback().await {
                Ok(()) => Err(cause),
                Err(rollback) => Err(StoreError::Rollback {
                    rollback: rollback.to_string(),
                    cause: Box::new(cause),
                }),
            },
        }
    }
}

fn lease_from_row(operation: &'static str, row: &AnyRow) -> Result<Lease> {
    let column = |name: &str| {
        row.try_get::<String, _>(name)
            .map_err(|source| StoreError::Database { operation, source })
    };

    Ok(Lease {
        underlay_ip: column("underlay_ip")?,
        overlay_subnet: column("overlay_subnet")?,
        overlay_hardware_addr: column("overlay_hwaddr")?,
        last_renewed_at: Some(
            row.try_get::<i64, _>("last_renewed_at")
                .map_err(|source| StoreError::Database { operation, source })?,
        ),
    })
}

#[async_trait]
impl<D: SubnetDeleter> LeaseStore for LeaseRepository<D> {
    #[instrument(skip(self))]
    async fn all(&self) -> Result<Vec<Lease>> {
        self.select_leases("selecting all subnets", "", None).await
    }

    #[instrument(skip(self))]
    async fn all_active(&self, window: u32) -> Result<Vec<Lease>> {
        let condition = format!("WHERE last_renewed_at + ? > {}", self.db.dialect().now());
        self.select_leases("selecting active subnets", &condition, Some(window))
            .await
    }

    #[instrument(skip(self))]
    async fn oldest_expired(&self, window: u32) -> Result<Option<Lease>> {
        let operation = "selecting oldest expired subnet";
        let sql = format!(
            "SELECT {LEASE_COLUMNS} FROM subnets WHERE last_renewed_at + ? <= {} \
             ORDER BY last_renewed_at ASC LIMIT 1",
            self.db.dialect().now()
        );

        self.db
            .fetch_optional(operation, &sql, &[i64::from(window).into()])
            .await?
            .map(|row| lease_from_row(operation, &row))
            .transpose()
    }

    #[instrument(skip(self, lease), fields(underlay_ip = %lease.underlay_ip, subnet = %lease.overlay_subnet))]
    async fn add_entry(&self, lease: &Lease) -> Result<()> {
        lease.validate()?;

        let sql = format!(
            "INSERT INTO subnets ({LEASE_COLUMNS}) VALUES (?, ?, ?, {})",
            self.db.dialect().now()
        );
        self.db
            .execute(
                "adding entry",
                &sql,
                &[
                    lease.underlay_ip.as_str().into(),
                    lease.overlay_subnet.as_str().into(),
                    lease.overlay_hardware_addr.as_str().into(),
                ],
            )
            .await?;

        debug!("lease stored");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn renew_lease_for_underlay_ip(&self, underlay_ip: &str) -> Result<u64> {
        let sql = format!(
            "UPDATE subnets SET last_renewed_at = {} WHERE underlay_ip = ?",
            self.db.dialect().now()
        );
        self.db
            .execute("renewing lease", &sql, &[underlay_ip.into()])
            .await
    }

    #[instrument(skip(self))]
    async fn lease_for_underlay_ip(&self, underlay_ip: &str) -> Result<Option<Lease>> {
        let operation = "selecting lease";
        let sql = format!("SELECT {LEASE_COLUMNS} FROM subnets WHERE underlay_ip = ?");

        self.db
            .fetch_optional(operation, &sql, &[underlay_ip.into()])
            .await?
            .map(|row| lease_from_row(operation, &row))
            .transpose()
    }

    #[instrument(skip(self))]
    async fn last_renewed_at_for_underlay_ip(&self, underlay_ip: &str) -> Result<i64> {
        let operation = "selecting last renewed at";
        let row = self
            .db
            .fetch_optional(
                operation,
                "SELECT last_renewed_at FROM subnets WHERE underlay_ip = ?",
                &[underlay_ip.into()],
            )
            .await?
            .ok_or_else(|| StoreError::NotFound {
                operation,
                underlay_ip: underlay_ip.to_string(),
            })?;

        row.try_get("last_renewed_at")
            .map_err(|source| StoreError::Database { operation, source })
    }

    #[instrument(skip(self))]
    async fn subnet_for_underlay_ip(&self, underlay_ip: &str) -> Result<String> {
        let operation = "selecting subnet";
        let row = self
            .db
            .fetch_optional(
                operation,
                "SELECT overlay_subnet FROM subnets WHERE underlay_ip = ?",
                &[underlay_ip.into()],
            )
            .await?
            .ok_or_else(|| StoreError::NotFound {
                operation,
                underlay_ip: underlay_ip.to_string(),
            })?;

        row.try_get("overlay_subnet")
            .map_err(|source| StoreError::Database { operation, source })
    }

    #[instrument(skip(self))]
    async fn delete_entry(&self, underlay_ip: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;

        let outcome = match self
            .deleter
            .delete(&mut tx, underlay_ip, self.db.timeout())
            .await
        {
            Ok(1) => Ok(()),
            Ok(0) => Err(StoreError::RecordNotAffected),
            Ok(count) => Err(StoreError::MultipleRecordsAffected { count }),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!(error = %e, "deleting entry failed, rolling back");
        }
        self.finish_delete(tx, outcome).await
    }

    async fn migrate(&self) -> Result<usize> {
        migrations::run(&self.db).await
    }
}
