//! Cleanup of instances owned by deactivated accounts.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use compute_service::InstanceService;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One account reported by billing, with the instance types it may no
/// longer run. An empty list means every type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeactivatedAccount {
    pub cloud_account_id: String,
    #[serde(default)]
    pub instance_types: Vec<String>,
}

/// Source of deactivated accounts, polled once per sweep.
pub trait DeactivationFeed: Send + Sync {
    fn deactivated_accounts(&self) -> BoxFuture<'_, anyhow::Result<Vec<DeactivatedAccount>>>;
}

/// Reads a JSON array of [`DeactivatedAccount`] from a file on every poll.
/// A missing file means no deactivated accounts.
#[derive(Debug, Clone)]
pub struct FileDeactivationFeed {
    path: PathBuf,
}

impl FileDeactivationFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl DeactivationFeed for FileDeactivationFeed {
    fn deactivated_accounts(&self) -> BoxFuture<'_, anyhow::Result<Vec<DeactivatedAccount>>> {
        Box::pin(async move {
            let content = match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            Ok(serde_json::from_str(&content)?)
        })
    }
}

pub struct DeactivationSweeper {
    instances: InstanceService,
    feed: Arc<dyn DeactivationFeed>,
    interval: Duration,
}

impl DeactivationSweeper {
    pub fn new(instances: InstanceService, feed: Arc<dyn DeactivationFeed>, interval: Duration) -> Self {
        Self {
            instances,
            feed,
            interval,
        }
    }

    /// Request deletion of every live instance of a deactivated account.
    /// An account that fails is logged and skipped. Returns the number of
    /// instances newly marked for deletion.
    pub async fn purge_deactivated_instances(&self) -> anyhow::Result<u64> {
        let accounts = self.feed.deactivated_accounts().await?;
        let mut marked = 0;
        for account in &accounts {
            match self
                .instances
                .delete_by_instance_types(&account.cloud_account_id, &account.instance_types)
            {
                Ok(n) => marked += n,
                Err(e) => warn!(
                    cloud_account_id = %account.cloud_account_id,
                    error = %e,
                    "deactivated account cleanup failed"
                ),
            }
        }
        Ok(marked)
    }

    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "deactivation sweeper started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.purge_deactivated_instances().await {
                        Ok(0) => {}
                        Ok(count) => info!(count, "deactivated instances marked for deletion"),
                        Err(e) => warn!(error = %e, "deactivation sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("deactivation sweeper shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use compute_core::config::{InstanceTypeConfig, MachineImageConfig, QuotaConfig};
    use compute_core::{ControlPlaneConfig, InstanceCategory};
    use compute_quota::{QuotaEvaluator, QuotaSource};
    use compute_service::{ComputeServices, CreateMetadata, InstanceCreate, ServiceContext, VNetPut};
    use compute_state::{InstanceSpec, NetworkInterface, ResourceRef, StateStore, VNetSpec};

    use super::*;

    const ACCOUNT: &str = "123456789012";
    const OTHER: &str = "210987654321";

    struct FixedFeed(Vec<DeactivatedAccount>);

    impl DeactivationFeed for FixedFeed {
        fn deactivated_accounts(&self) -> BoxFuture<'_, anyhow::Result<Vec<DeactivatedAccount>>> {
            let accounts = self.0.clone();
            Box::pin(async move { Ok(accounts) })
        }
    }

    struct BrokenFeed;

    impl DeactivationFeed for BrokenFeed {
        fn deactivated_accounts(&self) -> BoxFuture<'_, anyhow::Result<Vec<DeactivatedAccount>>> {
            Box::pin(async { anyhow::bail!("billing unavailable") })
        }
    }

    async fn services_with_instances() -> ComputeServices {
        let config = ControlPlaneConfig {
            instance_types: vec![InstanceTypeConfig {
                name: "vm-small".into(),
                category: InstanceCategory::VirtualMachine,
            }],
            machine_images: vec![MachineImageConfig {
                name: "ubuntu".into(),
                instance_categories: Vec::new(),
                instance_types: Vec::new(),
            }],
            quota: QuotaConfig {
                system_default: BTreeMap::from([("instances/vm-small".to_string(), 10)]),
                ..Default::default()
            },
            ..Default::default()
        };
        let quota = QuotaEvaluator::new(QuotaSource::from_config(&config.quota));
        let services = ComputeServices::new(ServiceContext::new(
            StateStore::open_in_memory().unwrap(),
            quota,
            config,
        ));

        for account in [ACCOUNT, OTHER] {
            services
                .vnets
                .put(VNetPut {
                    cloud_account_id: account.into(),
                    name: "default".into(),
                    spec: VNetSpec {
                        region: "us-dev-1".into(),
                        availability_zone: "us-dev-1a".into(),
                        prefix_length: 24,
                    },
                })
                .unwrap();
            services
                .instances
                .create(InstanceCreate {
                    metadata: CreateMetadata {
                        cloud_account_id: account.into(),
                        name: Some("vm".into()),
                        ..Default::default()
                    },
                    spec: InstanceSpec {
                        availability_zone: "us-dev-1a".into(),
                        instance_type: "vm-small".into(),
                        machine_image: "ubuntu".into(),
                        interfaces: vec![NetworkInterface {
                            name: "eth0".into(),
                            vnet: "default".into(),
                            dns_name: String::new(),
                        }],
                        ..Default::default()
                    },
                })
                .await
                .unwrap();
        }
        services
    }

    fn deactivated(account: &str) -> DeactivatedAccount {
        DeactivatedAccount {
            cloud_account_id: account.into(),
            instance_types: Vec::new(),
        }
    }

    #[tokio::test]
    async fn marks_only_deactivated_accounts() {
        let services = services_with_instances().await;
        let sweeper = DeactivationSweeper::new(
            services.instances.clone(),
            Arc::new(FixedFeed(vec![deactivated(ACCOUNT)])),
            Duration::from_secs(60),
        );

        assert_eq!(sweeper.purge_deactivated_instances().await.unwrap(), 1);
        let vm = ResourceRef::Name("vm".into());
        assert!(services.instances.get(ACCOUNT, &vm).unwrap().metadata.is_deleting());
        assert!(!services.instances.get(OTHER, &vm).unwrap().metadata.is_deleting());

        // Already marked instances are not counted again.
        assert_eq!(sweeper.purge_deactivated_instances().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_account_is_skipped() {
        let services = services_with_instances().await;
        let sweeper = DeactivationSweeper::new(
            services.instances.clone(),
            Arc::new(FixedFeed(vec![deactivated("not-an-account"), deactivated(OTHER)])),
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.purge_deactivated_instances().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn feed_failure_is_reported() {
        let services = services_with_instances().await;
        let sweeper = DeactivationSweeper::new(
            services.instances.clone(),
            Arc::new(BrokenFeed),
            Duration::from_secs(60),
        );
        assert!(sweeper.purge_deactivated_instances().await.is_err());
    }

    #[tokio::test]
    async fn file_feed_reads_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deactivated.json");
        let feed = FileDeactivationFeed::new(&path);
        assert!(feed.deactivated_accounts().await.unwrap().is_empty());

        std::fs::write(
            &path,
            r#"[{"cloud_account_id": "123456789012", "instance_types": ["vm-small"]}]"#,
        )
        .unwrap();
        let accounts = feed.deactivated_accounts().await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].instance_types, ["vm-small"]);
    }
}
