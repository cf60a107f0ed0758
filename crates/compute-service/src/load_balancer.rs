//! Load balancer service.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use compute_core::LoadBalancerState;
use compute_core::validate::{check_cloud_account_id, check_labels, check_resource_name};
use compute_quota::{QuotaDecision, QuotaResource};
use compute_state::{
    Listener, LoadBalancer, LoadBalancerSpec, LoadBalancerStatus, PoolMembers, ResourceRef,
    Security,
};
use compute_watch::{SnapshotStream, WatchRequest, WatchStream};

use crate::ServiceContext;
use crate::common::{CreateMetadata, check_ref};
use crate::error::{ServiceError, ServiceResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerCreate {
    pub metadata: CreateMetadata,
    pub spec: LoadBalancerSpec,
}

/// Replaces listeners and security. Both are required.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerUpdate {
    pub resource_version: Option<u64>,
    pub listeners: Option<Vec<Listener>>,
    pub security: Option<Security>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerStatusUpdate {
    pub resource_version: Option<u64>,
    pub status: LoadBalancerStatus,
}

/// Per-load-balancer limits, resolved before a write.
struct SpecLimits {
    listeners: u64,
    source_ips: u64,
}

#[derive(Clone)]
pub struct LoadBalancerService {
    ctx: Arc<ServiceContext>,
}

impl LoadBalancerService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    async fn spec_limits(&self, account: &str) -> ServiceResult<SpecLimits> {
        let quota = &self.ctx.quota;
        Ok(SpecLimits {
            listeners: quota.limit(account, &QuotaResource::LoadBalancerListeners).await?,
            source_ips: quota.limit(account, &QuotaResource::LoadBalancerSourceIps).await?,
        })
    }

    pub async fn create(&self, req: LoadBalancerCreate) -> ServiceResult<LoadBalancer> {
        let metadata = req
            .metadata
            .resolve(false, |name| Ok(check_resource_name("load balancer", name)?))?;
        let account = metadata.cloud_account_id.clone();

        let limits = self.spec_limits(&account).await?;
        check_spec(&req.spec.listeners, &req.spec.security, &limits)?;
        let max_lbs = self
            .ctx
            .quota
            .limit(&account, &QuotaResource::LoadBalancers)
            .await?;

        let lb = LoadBalancer {
            metadata,
            spec: req.spec,
            status: LoadBalancerStatus {
                state: LoadBalancerState::Pending,
                ..Default::default()
            },
        };
        let created = self.ctx.store.write(|txn| {
            let current = txn.list::<LoadBalancer>(Some(&account))?.len() as u64;
            let decision = QuotaDecision::evaluate(max_lbs, current, 1);
            debug!(cloud_account_id = %account, ?decision, "load balancer quota checked");
            if !decision.allowed {
                return Err(ServiceError::invalid(format!(
                    "quota exceeded: account has {current} of {max_lbs} allowed load balancers"
                )));
            }
            Ok(txn.insert(lb)?)
        })?;

        info!(
            cloud_account_id = %account,
            name = %created.metadata.name,
            resource_id = %created.metadata.resource_id,
            listeners = created.spec.listeners.len(),
            "load balancer created"
        );
        Ok(created)
    }

    pub fn get(&self, account: &str, by: &ResourceRef) -> ServiceResult<LoadBalancer> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        self.ctx
            .store
            .get(account, by)?
            .ok_or_else(|| ServiceError::not_found(format!("load balancer {by} not found")))
    }

    pub fn search(
        &self,
        account: &str,
        labels: &BTreeMap<String, String>,
    ) -> ServiceResult<Vec<LoadBalancer>> {
        check_cloud_account_id(account)?;
        check_labels(labels)?;
        let all: Vec<LoadBalancer> = self.ctx.store.list(Some(account))?;
        Ok(all
            .into_iter()
            .filter(|lb| lb.metadata.matches_labels(labels))
            .collect())
    }

    pub async fn update(
        &self,
        account: &str,
        by: &ResourceRef,
        update: LoadBalancerUpdate,
    ) -> ServiceResult<LoadBalancer> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let listeners = update
            .listeners
            .ok_or_else(|| ServiceError::invalid("missing listeners"))?;
        let security = update
            .security
            .ok_or_else(|| ServiceError::invalid("missing security"))?;
        let limits = self.spec_limits(account).await?;
        check_spec(&listeners, &security, &limits)?;

        let updated = self.ctx.store.write(|txn| {
            txn.update::<LoadBalancer, ServiceError, _>(account, by, update.resource_version, |lb| {
                if lb.metadata.is_deleting() {
                    return Err(ServiceError::precondition(format!(
                        "load balancer {} is being deleted",
                        lb.metadata.name
                    )));
                }
                lb.spec.listeners = listeners;
                lb.spec.security = security;
                Ok(())
            })
        })?;
        info!(cloud_account_id = %account, name = %updated.metadata.name, "load balancer updated");
        Ok(updated)
    }

    /// Operator status callback.
    pub fn update_status(
        &self,
        account: &str,
        resource_id: &str,
        update: LoadBalancerStatusUpdate,
    ) -> ServiceResult<LoadBalancer> {
        check_cloud_account_id(account)?;
        let by = ResourceRef::Id(resource_id.to_string());
        check_ref(&by)?;
        let updated = self.ctx.store.write(|txn| {
            txn.update::<LoadBalancer, ServiceError, _>(account, &by, update.resource_version, |lb| {
                lb.status = update.status;
                Ok(())
            })
        })?;
        debug!(cloud_account_id = %account, resource_id, state = %updated.status.state, "load balancer status updated");
        Ok(updated)
    }

    /// Request deletion. Repeating the call keeps the first timestamp.
    pub fn delete(&self, account: &str, by: &ResourceRef) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let deleted = self.ctx.store.write(|txn| {
            let current: LoadBalancer = txn
                .get(account, by)?
                .ok_or_else(|| ServiceError::not_found(format!("load balancer {by} not found")))?;
            if current.metadata.is_deleting() {
                return Ok(current);
            }
            txn.update::<LoadBalancer, ServiceError, _>(account, by, None, |lb| {
                lb.metadata.deletion_timestamp = Some(Utc::now());
                Ok(())
            })
        })?;
        info!(cloud_account_id = %account, name = %deleted.metadata.name, "load balancer deletion requested");
        Ok(())
    }

    pub fn remove_finalizer(&self, account: &str, resource_id: &str) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        let removed = self
            .ctx
            .store
            .write(|txn| txn.finalize::<LoadBalancer>(account, resource_id))?;
        if let Some(lb) = removed {
            info!(cloud_account_id = %account, name = %lb.metadata.name, "load balancer finalized");
        }
        Ok(())
    }

    pub fn search_stream(&self, account: Option<&str>) -> ServiceResult<SnapshotStream<LoadBalancer>> {
        if let Some(account) = account {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.search_stream(account)?)
    }

    pub fn watch(&self, request: WatchRequest) -> ServiceResult<WatchStream<LoadBalancer>> {
        if let Some(account) = &request.cloud_account_id {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.watch(request)?)
    }
}

/// Validate listeners and security against the per-load-balancer limits.
fn check_spec(listeners: &[Listener], security: &Security, limits: &SpecLimits) -> ServiceResult<()> {
    if listeners.is_empty() {
        return Err(ServiceError::invalid("at least one listener is required"));
    }
    if listeners.len() as u64 > limits.listeners {
        return Err(ServiceError::invalid(format!(
            "too many listeners configured, max allowed is {}",
            limits.listeners
        )));
    }
    if security.source_ips.len() as u64 > limits.source_ips {
        return Err(ServiceError::invalid(format!(
            "too many source IPs configured, max allowed is {}",
            limits.source_ips
        )));
    }

    let mut ports = BTreeSet::new();
    for listener in listeners {
        if listener.port == 0 || listener.pool.port == 0 {
            return Err(ServiceError::invalid("listener and pool ports must be non-zero"));
        }
        if !ports.insert(listener.port) {
            return Err(ServiceError::invalid(format!(
                "listener port {} is used more than once",
                listener.port
            )));
        }
        if let PoolMembers::InstanceSelectors(selectors) = &listener.pool.members {
            check_labels(selectors)?;
        }
    }
    for source in &security.source_ips {
        check_source_ip(source)?;
    }
    Ok(())
}

/// `any`, a bare address, or an address with a prefix length.
fn check_source_ip(source: &str) -> ServiceResult<()> {
    if source == "any" {
        return Ok(());
    }
    let invalid = || ServiceError::invalid(format!("invalid source IP {source:?}"));
    let (addr, prefix) = match source.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (source, None),
    };
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return Err(invalid());
        }
    }
    Ok(())
}
