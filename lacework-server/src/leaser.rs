//! Lease lifecycle on top of the lease store

use ipnetwork::Ipv4Network;
use lacework_common::{network::CidrPool, parse_underlay_ip, LaceworkError, Lease, LeaseConfig};
use lacework_store::{LeaseStore, StoreError};
use metrics::{counter, gauge};
use tracing::{debug, info, instrument, warn};

/// Lease allocation errors
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// Every block of the pool is held by some host
    #[error("no free subnet left in {range}")]
    PoolExhausted {
        /// Parent range of the pool
        range: String,
    },

    /// Concurrent allocations kept taking the computed candidate
    #[error("acquiring lease for {underlay_ip}: gave up after {attempts} conflicting attempts")]
    Contention {
        /// Requesting host
        underlay_ip: String,
        /// Attempts made
        attempts: u32,
    },

    /// The host holds no lease
    #[error("no lease for underlay ip {0}")]
    LeaseNotFound(String),

    /// The presented lease differs from the one on record
    #[error("lease for {underlay_ip} does not match: {reason}")]
    LeaseMismatch {
        /// Host the lease was presented for
        underlay_ip: String,
        /// What did not match
        reason: String,
    },

    /// Malformed address or lease
    #[error("invalid lease: {0}")]
    InvalidLease(#[from] LaceworkError),

    /// Storage failure
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for LeaseError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::InvalidLease(e) => LeaseError::InvalidLease(e),
            other => LeaseError::Store(other),
        }
    }
}

/// Result type for lease operations
pub type Result<T> = std::result::Result<T, LeaseError>;

/// Hands out, renews, releases and reclaims overlay subnets.
///
/// Holds no allocation state of its own. The store's unique constraints
/// decide every race, so any number of allocators may share one database.
pub struct LeaseAllocator<S> {
    store: S,
    pool: CidrPool,
    expiration_seconds: u32,
    max_attempts: u32,
}

impl<S: LeaseStore> LeaseAllocator<S> {
    /// Create an allocator over `store` carving blocks out of `pool`
    pub fn new(store: S, pool: CidrPool, config: &LeaseConfig) -> Self {
        gauge!("lacework_pool_size").set(pool.size() as f64);
        info!(
            range = %pool.range(),
            subnet_prefix = pool.subnet_prefix(),
            size = pool.size(),
            "lease allocator ready"
        );

        Self {
            store,
            pool,
            expiration_seconds: config.expiration_seconds,
            max_attempts: config.acquire_max_attempts.max(1),
        }
    }

    /// The backing store
    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The subnet pool
    pub fn pool(&self) -> &CidrPool {
        &self.pool
    }

    /// Return the host's lease, allocating one if it has none.
    ///
    /// An existing lease is returned unchanged, renewal timestamp included.
    #[instrument(skip(self))]
    pub async fn acquire(&self, underlay_ip: &str) -> Result<Lease> {
        parse_underlay_ip(underlay_ip)?;

        if let Some(existing) = self.store.lease_for_underlay_ip(underlay_ip).await? {
            debug!(subnet = %existing.overlay_subnet, "host already holds a lease");
            counter!("lacework_leases_acquired_total", "outcome" => "existing").increment(1);
            return Ok(existing);
        }

        for attempt in 1..=self.max_attempts {
            let taken: Vec<String> = self
                .store
                .all()
                .await?
                .into_iter()
                .map(|lease| lease.overlay_subnet)
                .collect();

            let Some(subnet) = self.pool.get_available(&taken) else {
                warn!(range = %self.pool.range(), held = taken.len(), "subnet pool exhausted");
                counter!("lacework_pool_exhausted_total").increment(1);
                return Err(LeaseError::PoolExhausted {
                    range: self.pool.range().to_string(),
                });
            };

            let network: Ipv4Network = subnet
                .parse()
                .map_err(|_| LaceworkError::InvalidCidr(subnet.clone()))?;
            let lease = Lease::new(underlay_ip, network);

            match self.store.add_entry(&lease).await {
                Ok(()) => {
                    info!(subnet = %lease.overlay_subnet, attempt, "lease acquired");
                    counter!("lacework_leases_acquired_total", "outcome" => "new").increment(1);
                    let stored = self.store.lease_for_underlay_ip(underlay_ip).await?;
                    return Ok(stored.unwrap_or(lease));
                }
                Err(e) if e.is_constraint_violation() => {
                    counter!("lacework_lease_conflicts_total").increment(1);

                    // A concurrent acquire for the same host may have won.
                    if let Some(existing) = self.store.lease_for_underlay_ip(underlay_ip).await? {
                        return Ok(existing);
                    }
                    warn!(subnet = %lease.overlay_subnet, attempt, error = %e, "subnet taken concurrently, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(LeaseError::Contention {
            underlay_ip: underlay_ip.to_string(),
            attempts: self.max_attempts,
        })
    }

    /// Refresh the host's lease
    #[instrument(skip(self))]
    pub async fn renew(&self, underlay_ip: &str) -> Result<()> {
        parse_underlay_ip(underlay_ip)?;

        match self.store.renew_lease_for_underlay_ip(underlay_ip).await? {
            0 => Err(LeaseError::LeaseNotFound(underlay_ip.to_string())),
            _ => {
                counter!("lacework_leases_renewed_total").increment(1);
                debug!("lease renewed");
                Ok(())
            }
        }
    }

    /// Renew a lease presented by its holder.
    ///
    /// The lease must belong to this pool and match the stored lease of its
    /// underlay host. Returns the lease as stored after renewal.
    #[instrument(skip(self, lease), fields(underlay_ip = %lease.underlay_ip))]
    pub async fn renew_lease(&self, lease: &Lease) -> Result<Lease> {
        lease.validate()?;

        if !self.pool.is_member(&lease.overlay_subnet) {
            return Err(LeaseError::LeaseMismatch {
                underlay_ip: lease.underlay_ip.clone(),
                reason: format!(
                    "{} is not a /{} block of {}",
                    lease.overlay_subnet,
                    self.pool.subnet_prefix(),
                    self.pool.range()
                ),
            });
        }

        let stored = self
            .store
            .lease_for_underlay_ip(&lease.underlay_ip)
            .await?
            .ok_or_else(|| LeaseError::LeaseNotFound(lease.underlay_ip.clone()))?;
        if !stored.same_assignment(lease) {
            return Err(LeaseError::LeaseMismatch {
                underlay_ip: lease.underlay_ip.clone(),
                reason: format!("host holds {}", stored.overlay_subnet),
            });
        }

        self.renew(&lease.underlay_ip).await?;

        self.store
            .lease_for_underlay_ip(&lease.underlay_ip)
            .await?
            .ok_or_else(|| LeaseError::LeaseNotFound(lease.underlay_ip.clone()))
    }

    /// Give up the host's lease
    #[instrument(skip(self))]
    pub async fn release(&self, underlay_ip: &str) -> Result<()> {
        parse_underlay_ip(underlay_ip)?;

        match self.store.delete_entry(underlay_ip).await {
            Ok(()) => {
                counter!("lacework_leases_released_total").increment(1);
                info!("lease released");
                Ok(())
            }
            Err(StoreError::RecordNotAffected) => {
                Err(LeaseError::LeaseNotFound(underlay_ip.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Leases renewed within the expiration window
    #[instrument(skip(self))]
    pub async fn routable_leases(&self) -> Result<Vec<Lease>> {
        Ok(self.store.all_active(self.expiration_seconds).await?)
    }

    /// Delete every lease not renewed within the expiration window.
    ///
    /// Stops at the first failure. Returns the number of leases reclaimed.
    #[instrument(skip(self))]
    pub async fn expire_stale(&self) -> Result<usize> {
        let mut reclaimed = 0;

        while let Some(lease) = self.store.oldest_expired(self.expiration_seconds).await? {
            self.store.delete_entry(&lease.underlay_ip).await?;
            info!(
                underlay_ip = %lease.underlay_ip,
                subnet = %lease.overlay_subnet,
                last_renewed_at = ?lease.last_renewed_at,
                "expired lease reclaimed"
            );
            counter!("lacework_leases_expired_total").increment(1);
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use std::sync::Mutex;

    /// In-memory store with a settable clock and injectable failures
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        leases: Mutex<Vec<Lease>>,
        now: AtomicI64,
        /// Inserts that lose to a simulated concurrent host
        pub(crate) stolen_inserts: AtomicU32,
        /// Deletes that fail with a timeout
        pub(crate) failing_deletes: AtomicU32,
    }

    impl MemoryStore {
        pub(crate) fn advance(&self, seconds: i64) {
            self.now.fetch_add(seconds, Ordering::SeqCst);
        }

        pub(crate) fn len(&self) -> usize {
            self.leases.lock().unwrap().len()
        }

        fn take(counter: &AtomicU32) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        fn insert(&self, lease: &Lease) -> lacework_store::Result<()> {
            let mut leases = self.leases.lock().unwrap();
            let collides = leases.iter().any(|held| {
                held.underlay_ip == lease.underlay_ip
                    || held.overlay_subnet == lease.overlay_subnet
                    || held.overlay_hardware_addr == lease.overlay_hardware_addr
            });
            if collides {
                return Err(StoreError::ConstraintViolation {
                    operation: "adding entry",
                    message: "UNIQUE constraint failed".to_string(),
                });
            }

            let mut stored = lease.clone();
            stored.last_renewed_at = Some(self.now.load(Ordering::SeqCst));
            leases.push(stored);
            Ok(())
        }
    }

    #[async_trait]
    impl LeaseStore for MemoryStore {
        async fn all(&self) -> lacework_store::Result<Vec<Lease>> {
            Ok(self.leases.lock().unwrap().clone())
        }

        async fn all_active(&self, window: u32) -> lacework_store::Result<Vec<Lease>> {
            let now = self.now.load(Ordering::SeqCst);
            Ok(self
                .leases
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.last_renewed_at.unwrap_or_default() + i64::from(window) > now)
                .cloned()
                .collect())
        }

        async fn oldest_expired(&self, window: u32) -> lacework_store::Result<Option<Lease>> {
            let now = self.now.load(Ordering::SeqCst);
            Ok(self
                .leases
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.last_renewed_at.unwrap_or_default() + i64::from(window) <= now)
                .min_by_key(|l| l.last_renewed_at)
                .cloned())
        }

        async fn add_entry(&self, lease: &Lease) -> lacework_store::Result<()> {
            lease.validate()?;

            if Self::take(&self.stolen_inserts) {
                // Another host grabs the same subnet first.
                let octets = 200 + self.stolen_inserts.load(Ordering::SeqCst) as u8;
                let mut interloper = lease.clone();
                interloper.underlay_ip = format!("172.16.0.{octets}");
                self.insert(&interloper)?;
            }
            self.insert(lease)
        }

        async fn renew_lease_for_underlay_ip(&self, underlay_ip: &str) -> lacework_store::Result<u64> {
            let now = self.now.load(Ordering::SeqCst);
            let mut leases = self.leases.lock().unwrap();
            let mut renewed = 0;
            for lease in leases.iter_mut().filter(|l| l.underlay_ip == underlay_ip) {
                lease.last_renewed_at = Some(now);
                renewed += 1;
            }
            Ok(renewed)
        }

        async fn lease_for_underlay_ip(&self, underlay_ip: &str) -> lacework_store::Result<Option<Lease>> {
            Ok(self
                .leases
                .lock()
                .unwrap()
                .iter()
                .find(|l| l.underlay_ip == underlay_ip)
                .cloned())
        }

        async fn last_renewed_at_for_underlay_ip(&self, underlay_ip: &str) -> lacework_store::Result<i64> {
            self.lease_for_underlay_ip(underlay_ip)
                .await?
                .and_then(|l| l.last_renewed_at)
                .ok_or_else(|| StoreError::NotFound {
                    operation: "selecting last renewed at",
                    underlay_ip: underlay_ip.to_string(),
                })
        }

        async fn subnet_for_underlay_ip(&self, underlay_ip: &str) -> lacework_store::Result<String> {
            self.lease_for_underlay_ip(underlay_ip)
                .await?
                .map(|l| l.overlay_subnet)
                .ok_or_else(|| StoreError::NotFound {
                    operation: "selecting subnet",
                    underlay_ip: underlay_ip.to_string(),
                })
        }

        async fn delete_entry(&self, underlay_ip: &str) -> lacework_store::Result<()> {
            if Self::take(&self.failing_deletes) {
                return Err(StoreError::Timeout {
                    operation: "deleting entry",
                    timeout: std::time::Duration::from_secs(5),
                });
            }

            let mut leases = self.leases.lock().unwrap();
            let before = leases.len();
            leases.retain(|l| l.underlay_ip != underlay_ip);
            match before - leases.len() {
                0 => Err(StoreError::RecordNotAffected),
                _ => Ok(()),
            }
        }

        async fn migrate(&self) -> lacework_store::Result<usize> {
            Ok(0)
        }
    }
}
