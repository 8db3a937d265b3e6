//! Periodic reclamation of expired leases

use crate::leaser::LeaseAllocator;
use lacework_store::LeaseStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Run the expiry sweep every `interval` until `shutdown` flips to true
pub async fn run<S: LeaseStore>(
    allocator: Arc<LeaseAllocator<S>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(?interval, "lease sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match allocator.expire_stale().await {
                    Ok(0) => {}
                    Ok(reclaimed) => info!(reclaimed, "expired leases reclaimed"),
                    Err(e) => error!(error = %e, "lease sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("lease sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaser::fakes::MemoryStore;
    use lacework_common::{network::CidrPool, LeaseConfig};
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_sweeper_reclaims_and_stops() {
        let allocator = Arc::new(LeaseAllocator::new(
            MemoryStore::default(),
            CidrPool::new("10.255.0.0/16", 24).unwrap(),
            &LeaseConfig {
                expiration_seconds: 10,
                ..LeaseConfig::default()
            },
        ));
        allocator.acquire("192.168.1.10").await.unwrap();
        allocator.acquire("192.168.1.11").await.unwrap();
        allocator.store().advance(60);
        allocator.store().failing_deletes.store(1, Ordering::SeqCst);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(run(allocator.clone(), Duration::from_millis(10), rx));

        tokio::time::timeout(Duration::from_secs(5), async {
            while allocator.store().len() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
