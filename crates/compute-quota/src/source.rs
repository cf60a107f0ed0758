//! Quota sources.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use compute_core::AccountType;
use compute_core::config::QuotaConfig;

/// What a quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QuotaResource {
    /// Live instances of one instance type.
    Instances { instance_type: String },
    LoadBalancers,
    /// Listeners on a single load balancer.
    LoadBalancerListeners,
    /// Source IP entries on a single load balancer.
    LoadBalancerSourceIps,
}

impl QuotaResource {
    pub fn instances(instance_type: &str) -> Self {
        QuotaResource::Instances {
            instance_type: instance_type.to_string(),
        }
    }

    /// Key used in configuration tables.
    pub fn key(&self) -> String {
        match self {
            QuotaResource::Instances { instance_type } => format!("instances/{instance_type}"),
            QuotaResource::LoadBalancers => "load_balancers".to_string(),
            QuotaResource::LoadBalancerListeners => "load_balancer_listeners".to_string(),
            QuotaResource::LoadBalancerSourceIps => "load_balancer_source_ips".to_string(),
        }
    }
}

impl fmt::Display for QuotaResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ── Static tables ──────────────────────────────────────────────────

/// Account-tier and system-wide default limits.
#[derive(Debug, Clone, Default)]
pub struct QuotaTable {
    pub system_default: BTreeMap<String, u64>,
    pub account_types: BTreeMap<AccountType, BTreeMap<String, u64>>,
    /// Account id to tier. Unlisted accounts are `STANDARD`.
    pub account_directory: BTreeMap<String, AccountType>,
}

impl QuotaTable {
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            system_default: config.system_default.clone(),
            account_types: config.account_types.clone(),
            account_directory: config.account_directory.clone(),
        }
    }

    pub fn account_type(&self, cloud_account_id: &str) -> AccountType {
        self.account_directory
            .get(cloud_account_id)
            .copied()
            .unwrap_or_default()
    }

    /// Tier default, else system default.
    pub fn lookup(&self, cloud_account_id: &str, resource: &QuotaResource) -> Option<u64> {
        let key = resource.key();
        self.account_types
            .get(&self.account_type(cloud_account_id))
            .and_then(|limits| limits.get(&key))
            .or_else(|| self.system_default.get(&key))
            .copied()
    }
}

/// Explicit per-account limits layered over a [`QuotaTable`].
#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    pub overrides: BTreeMap<String, BTreeMap<String, u64>>,
    pub defaults: QuotaTable,
}

impl OverrideTable {
    pub fn from_config(config: &QuotaConfig) -> Self {
        Self {
            overrides: config.accounts.clone(),
            defaults: QuotaTable::from_config(config),
        }
    }

    pub fn lookup(&self, cloud_account_id: &str, resource: &QuotaResource) -> Option<u64> {
        self.overrides
            .get(cloud_account_id)
            .and_then(|limits| limits.get(&resource.key()))
            .copied()
            .or_else(|| self.defaults.lookup(cloud_account_id, resource))
    }
}

// ── External service ───────────────────────────────────────────────

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A remote quota management service.
///
/// Returns the account's custom limit if one is set, else the service's
/// default, else `None` to defer to local tables.
pub trait QuotaService: Send + Sync {
    fn resource_limit<'a>(
        &'a self,
        cloud_account_id: &'a str,
        resource: &'a QuotaResource,
    ) -> BoxFuture<'a, anyhow::Result<Option<u64>>>;
}

#[derive(Clone)]
pub struct ExternalQuota {
    pub service: Arc<dyn QuotaService>,
    pub fallback: OverrideTable,
}

impl fmt::Debug for ExternalQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalQuota")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

// ── Source ─────────────────────────────────────────────────────────

/// Where limits come from. Injected into services at construction.
#[derive(Debug, Clone)]
pub enum QuotaSource {
    StaticMap(QuotaTable),
    PerAccountOverride(OverrideTable),
    External(ExternalQuota),
}

impl QuotaSource {
    /// Per-account overrides over tier and system defaults, all from config.
    pub fn from_config(config: &QuotaConfig) -> Self {
        QuotaSource::PerAccountOverride(OverrideTable::from_config(config))
    }

    pub fn external(service: Arc<dyn QuotaService>, config: &QuotaConfig) -> Self {
        QuotaSource::External(ExternalQuota {
            service,
            fallback: OverrideTable::from_config(config),
        })
    }

    /// Resolve a limit, or `None` if no layer defines one.
    pub async fn lookup(
        &self,
        cloud_account_id: &str,
        resource: &QuotaResource,
    ) -> anyhow::Result<Option<u64>> {
        match self {
            QuotaSource::StaticMap(table) => Ok(table.lookup(cloud_account_id, resource)),
            QuotaSource::PerAccountOverride(table) => Ok(table.lookup(cloud_account_id, resource)),
            QuotaSource::External(external) => {
                match external
                    .service
                    .resource_limit(cloud_account_id, resource)
                    .await?
                {
                    Some(limit) => Ok(Some(limit)),
                    None => Ok(external.fallback.lookup(cloud_account_id, resource)),
                }
            }
        }
    }
}
