//! Tombstone purge.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use compute_core::config::PurgeConfig;
use compute_state::{ResourceKind, StateStore};

pub struct PurgeSweeper {
    store: StateStore,
    config: PurgeConfig,
}

impl PurgeSweeper {
    pub fn new(store: StateStore, config: PurgeConfig) -> Self {
        Self { store, config }
    }

    /// Remove tombstones finalized before `now - grace` across every
    /// collection, at most `batch_limit` rows in total. Returns the number
    /// of rows removed.
    pub fn purge_expired_deletions(&self, now: DateTime<Utc>, grace: Duration) -> anyhow::Result<u64> {
        let cutoff = now - chrono::Duration::from_std(grace)?;
        let mut remaining = self.config.batch_limit as u64;
        let mut purged = 0;
        for kind in ResourceKind::ALL {
            if remaining == 0 {
                break;
            }
            let n = self.store.purge_finalized(kind, cutoff, remaining as usize)?;
            debug!(%kind, purged = n, "collection swept");
            purged += n;
            remaining -= n.min(remaining);
        }
        Ok(purged)
    }

    /// Sweep every `interval` until `shutdown` changes.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = self.config.interval();
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.config.grace_secs,
            batch_limit = self.config.batch_limit,
            "purge sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.purge_expired_deletions(Utc::now(), self.config.grace()) {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "expired deletions purged"),
                        Err(e) => warn!(error = %e, "purge sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("purge sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use compute_state::{ResourceMetadata, VNet, VNetSpec};

    use super::*;

    const ACCOUNT: &str = "123456789012";

    fn vnet(name: &str) -> VNet {
        VNet {
            metadata: ResourceMetadata::new(ACCOUNT, name, &format!("id-{name}")),
            spec: VNetSpec::default(),
        }
    }

    /// Insert and finalize `n` vnets.
    fn tombstones(store: &StateStore, n: usize) {
        for i in 0..n {
            let name = format!("net-{i}");
            store.write(|txn| txn.insert(vnet(&name))).unwrap();
            store
                .write(|txn| txn.finalize::<VNet>(ACCOUNT, &format!("id-{name}")))
                .unwrap();
        }
    }

    fn sweeper(store: &StateStore, batch_limit: usize) -> PurgeSweeper {
        PurgeSweeper::new(
            store.clone(),
            PurgeConfig {
                batch_limit,
                ..Default::default()
            },
        )
    }

    #[test]
    fn only_tombstones_older_than_grace_are_purged() {
        let store = StateStore::open_in_memory().unwrap();
        tombstones(&store, 2);
        store.write(|txn| txn.insert(vnet("live"))).unwrap();
        let hour = Duration::from_secs(3600);
        let sweeper = sweeper(&store, 100);

        assert_eq!(sweeper.purge_expired_deletions(Utc::now(), hour).unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(sweeper.purge_expired_deletions(later, hour).unwrap(), 2);
        assert_eq!(sweeper.purge_expired_deletions(later, hour).unwrap(), 0);
        assert_eq!(store.list::<VNet>(Some(ACCOUNT)).unwrap().len(), 1);
        assert!(store.compacted_through(ResourceKind::Vnet).unwrap() > 0);
    }

    #[test]
    fn batch_limit_bounds_each_sweep() {
        let store = StateStore::open_in_memory().unwrap();
        tombstones(&store, 5);
        let sweeper = sweeper(&store, 3);
        let later = Utc::now() + chrono::Duration::hours(1);

        assert_eq!(sweeper.purge_expired_deletions(later, Duration::ZERO).unwrap(), 3);
        assert_eq!(sweeper.purge_expired_deletions(later, Duration::ZERO).unwrap(), 2);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = StateStore::open_in_memory().unwrap();
        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(async move { sweeper(&store, 10).run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
