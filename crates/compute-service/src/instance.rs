//! Instance service.
//!
//! Public calls mask user data and refuse to touch instance group members
//! directly. Private calls (used by the instance group reconciler and by
//! operators) see raw records and may bypass quota with `skip_quota_check`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use compute_core::validate::{check_cloud_account_id, check_labels, check_resource_name};
use compute_core::{InstancePhase, RunStrategy, SearchFilterCriteria};
use compute_quota::{QuotaDecision, QuotaResource};
use compute_state::{
    Instance, InstanceSpec, InstanceStatus, ResourceRef, SshPublicKey, VNet, WriteTxn,
};
use compute_watch::{SnapshotStream, WatchRequest, WatchStream};

use crate::ServiceContext;
use crate::common::{CreateMetadata, check_ref};
use crate::error::{ServiceError, ServiceResult};

/// Largest accepted user data payload.
pub const MAX_USER_DATA_BYTES: usize = 256 * 1024;

const INITIAL_STATUS_MESSAGE: &str = "Instance reconciliation has not started";

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceCreate {
    pub metadata: CreateMetadata,
    pub spec: InstanceSpec,
}

/// Public update. Fields left out keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceUpdate {
    pub resource_version: Option<u64>,
    pub run_strategy: Option<RunStrategy>,
    pub ssh_public_key_names: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceUpdatePrivate {
    pub resource_version: Option<u64>,
    pub instance_group_size: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceStatusUpdate {
    pub resource_version: Option<u64>,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSearch {
    pub labels: BTreeMap<String, String>,
    pub instance_group: Option<String>,
    pub instance_group_filter: SearchFilterCriteria,
}

impl InstanceSearch {
    pub fn in_any_group() -> Self {
        Self {
            instance_group_filter: SearchFilterCriteria::NonEmpty,
            ..Default::default()
        }
    }

    fn group_filter(&self) -> ServiceResult<GroupFilter<'_>> {
        let group = self.instance_group.as_deref().filter(|g| !g.is_empty());
        match (self.instance_group_filter, group) {
            (SearchFilterCriteria::ExactValue, None) => Err(ServiceError::invalid(
                "instance_group is required when filtering by exact value",
            )),
            (SearchFilterCriteria::ExactValue | SearchFilterCriteria::Default, Some(g)) => {
                Ok(GroupFilter::Exact(g))
            }
            (SearchFilterCriteria::NonEmpty, _) => Ok(GroupFilter::InAnyGroup),
            (SearchFilterCriteria::Any, _) => Ok(GroupFilter::Any),
            (SearchFilterCriteria::Default, None) => Ok(GroupFilter::Ungrouped),
        }
    }
}

enum GroupFilter<'a> {
    Exact(&'a str),
    InAnyGroup,
    Any,
    Ungrouped,
}

impl GroupFilter<'_> {
    fn matches(&self, instance: &Instance) -> bool {
        match self {
            GroupFilter::Exact(g) => instance.group() == Some(*g),
            GroupFilter::InAnyGroup => instance.group().is_some(),
            GroupFilter::Any => true,
            GroupFilter::Ungrouped => instance.group().is_none(),
        }
    }
}

// ── Service ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct InstanceService {
    pub(crate) ctx: Arc<ServiceContext>,
}

impl InstanceService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub async fn create(&self, req: InstanceCreate) -> ServiceResult<Instance> {
        let created = self.create_batch(vec![req], false).await?;
        first(created).map(Instance::masked)
    }

    /// Create one instance, honouring `resource_id` and `skip_quota_check`.
    pub async fn create_private(&self, req: InstanceCreate) -> ServiceResult<Instance> {
        first(self.create_batch(vec![req], true).await?)
    }

    /// Create a batch atomically: all instances are stored or none are.
    pub async fn create_multiple_private(
        &self,
        reqs: Vec<InstanceCreate>,
    ) -> ServiceResult<Vec<Instance>> {
        let created = self.create_batch(reqs, true).await?;
        Ok(created.into_iter().map(Instance::masked).collect())
    }

    pub(crate) async fn create_batch(
        &self,
        reqs: Vec<InstanceCreate>,
        privileged: bool,
    ) -> ServiceResult<Vec<Instance>> {
        let Some(account) = reqs.first().map(|r| r.metadata.cloud_account_id.clone()) else {
            return Err(ServiceError::invalid("at least one instance is required"));
        };
        check_cloud_account_id(&account)?;

        let batch_size = reqs.len() as u32;
        let mut names = BTreeSet::new();
        let mut batch = Vec::with_capacity(reqs.len());
        for req in reqs {
            if req.metadata.cloud_account_id != account {
                return Err(ServiceError::invalid(
                    "all instances in a batch must belong to the same cloud account",
                ));
            }
            let metadata = req
                .metadata
                .resolve(privileged, |name| Ok(check_resource_name("instance", name)?))?;
            if !names.insert(metadata.name.clone()) {
                return Err(ServiceError::AlreadyExists(format!(
                    "instance {} appears more than once in the request",
                    metadata.name
                )));
            }
            let spec = self.prepare_spec(req.spec, privileged, batch_size)?;
            batch.push(Instance {
                metadata,
                spec,
                status: initial_status(),
            });
        }

        let limits = self.instance_limits(&account, &batch).await?;
        let created = self.ctx.store.write(|txn| {
            for instance in &mut batch {
                self.bind_references(txn, instance)?;
            }
            check_instance_quota(txn, &account, &limits, &batch)?;
            batch
                .into_iter()
                .map(|instance| Ok(txn.insert(instance)?))
                .collect::<ServiceResult<Vec<_>>>()
        })?;

        for instance in &created {
            info!(
                cloud_account_id = %account,
                name = %instance.metadata.name,
                resource_id = %instance.metadata.resource_id,
                instance_type = %instance.spec.instance_type,
                "instance created"
            );
        }
        Ok(created)
    }

    /// Static checks on a requested spec, before anything is read.
    fn prepare_spec(
        &self,
        mut spec: InstanceSpec,
        privileged: bool,
        batch_size: u32,
    ) -> ServiceResult<InstanceSpec> {
        let config = &self.ctx.config;
        if !privileged {
            if spec.instance_group.as_deref().is_some_and(|g| !g.is_empty()) {
                return Err(ServiceError::invalid(
                    "instance group members are created through the instance group",
                ));
            }
            spec.skip_quota_check = false;
        }
        if spec.user_data.len() > MAX_USER_DATA_BYTES {
            return Err(ServiceError::invalid(format!(
                "user data is {} bytes, at most {MAX_USER_DATA_BYTES} are allowed",
                spec.user_data.len()
            )));
        }
        if !config.availability_zones.contains(&spec.availability_zone) {
            return Err(ServiceError::invalid(format!(
                "invalid availability zone {:?}",
                spec.availability_zone
            )));
        }
        let instance_type = config
            .instance_type(&spec.instance_type)
            .ok_or_else(|| {
                ServiceError::invalid(format!("invalid instance type {:?}", spec.instance_type))
            })?;
        let image = config.machine_image(&spec.machine_image).ok_or_else(|| {
            ServiceError::invalid(format!("invalid machine image {:?}", spec.machine_image))
        })?;
        if !image.is_compatible_with(instance_type) {
            return Err(ServiceError::invalid(format!(
                "machine image {} is not compatible with instance type {}",
                image.name, instance_type.name
            )));
        }
        if spec.interfaces.len() != 1 {
            return Err(ServiceError::invalid(
                "exactly one network interface is required",
            ));
        }
        if spec.instance_group_size == 0 {
            spec.instance_group_size = batch_size;
        }
        spec.ssh_public_keys.clear();
        Ok(spec)
    }

    /// Resolve the limit of every instance type the batch is charged for.
    pub(crate) async fn instance_limits(
        &self,
        account: &str,
        batch: &[Instance],
    ) -> ServiceResult<BTreeMap<String, u64>> {
        let mut limits = BTreeMap::new();
        for instance in batch.iter().filter(|i| !i.spec.skip_quota_check) {
            let ty = &instance.spec.instance_type;
            if !limits.contains_key(ty) {
                let limit = self
                    .ctx
                    .quota
                    .limit(account, &QuotaResource::instances(ty))
                    .await?;
                limits.insert(ty.clone(), limit);
            }
        }
        Ok(limits)
    }

    /// Check the vnet and SSH key references and fill in derived fields.
    pub(crate) fn bind_references(
        &self,
        txn: &WriteTxn<'_>,
        instance: &mut Instance,
    ) -> ServiceResult<()> {
        let account = &instance.metadata.cloud_account_id;
        for iface in &mut instance.spec.interfaces {
            let vnet: VNet = txn
                .get(account, &ResourceRef::Name(iface.vnet.clone()))?
                .ok_or_else(|| {
                    ServiceError::invalid(format!("unable to get VNet with name {}", iface.vnet))
                })?;
            if vnet.spec.availability_zone != instance.spec.availability_zone {
                return Err(ServiceError::invalid(format!(
                    "VNet {} is in availability zone {}, not {}",
                    iface.vnet, vnet.spec.availability_zone, instance.spec.availability_zone
                )));
            }
            iface.dns_name = self.dns_name(&instance.metadata.name, account);
        }
        instance.spec.ssh_public_keys =
            resolve_ssh_keys(txn, account, &instance.spec.ssh_public_key_names)?;
        Ok(())
    }

    fn dns_name(&self, name: &str, account: &str) -> String {
        let config = &self.ctx.config;
        format!(
            "{name}.{account}.{}.{}",
            config.region, config.dns_domain_suffix
        )
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, account: &str, by: &ResourceRef) -> ServiceResult<Instance> {
        self.get_private(account, by).map(Instance::masked)
    }

    pub fn get_private(&self, account: &str, by: &ResourceRef) -> ServiceResult<Instance> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        self.ctx
            .store
            .get(account, by)?
            .ok_or_else(|| ServiceError::not_found(format!("instance {by} not found")))
    }

    pub fn search(&self, account: &str, search: &InstanceSearch) -> ServiceResult<Vec<Instance>> {
        check_cloud_account_id(account)?;
        let found = self.search_private(Some(account), search)?;
        Ok(found.into_iter().map(Instance::masked).collect())
    }

    /// Search one account, or every account when `account` is `None`.
    /// Results are ordered by name.
    pub fn search_private(
        &self,
        account: Option<&str>,
        search: &InstanceSearch,
    ) -> ServiceResult<Vec<Instance>> {
        if let Some(account) = account {
            check_cloud_account_id(account)?;
        }
        check_labels(&search.labels)?;
        let filter = search.group_filter()?;
        let instances: Vec<Instance> = self.ctx.store.list(account)?;
        Ok(instances
            .into_iter()
            .filter(|i| filter.matches(i) && i.metadata.matches_labels(&search.labels))
            .collect())
    }

    pub fn search_stream(&self, account: &str) -> ServiceResult<SnapshotStream<Instance>> {
        check_cloud_account_id(account)?;
        let (instances, version) = self.ctx.store.snapshot::<Instance>(Some(account))?;
        let masked = instances.into_iter().map(Instance::masked).collect();
        Ok(SnapshotStream::new(masked, version))
    }

    pub fn search_stream_private(
        &self,
        account: Option<&str>,
    ) -> ServiceResult<SnapshotStream<Instance>> {
        if let Some(account) = account {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.search_stream(account)?)
    }

    /// Change stream for operators. Objects are not masked.
    pub fn watch(&self, request: WatchRequest) -> ServiceResult<WatchStream<Instance>> {
        if let Some(account) = &request.cloud_account_id {
            check_cloud_account_id(account)?;
        }
        Ok(self.ctx.watch.watch(request)?)
    }

    // ── Updates ────────────────────────────────────────────────────

    pub fn update(
        &self,
        account: &str,
        by: &ResourceRef,
        update: InstanceUpdate,
    ) -> ServiceResult<Instance> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let updated = self.ctx.store.write(|txn| {
            let keys = match &update.ssh_public_key_names {
                Some(names) => Some((names.clone(), resolve_ssh_keys(txn, account, names)?)),
                None => None,
            };
            txn.update::<Instance, ServiceError, _>(account, by, update.resource_version, |instance| {
                if let Some(strategy) = update.run_strategy {
                    check_run_strategy_change(instance, strategy)?;
                    instance.spec.run_strategy = strategy;
                }
                if let Some((names, keys)) = keys {
                    instance.spec.ssh_public_key_names = names;
                    instance.spec.ssh_public_keys = keys;
                }
                Ok(())
            })
        })?;
        info!(
            cloud_account_id = %account,
            name = %updated.metadata.name,
            run_strategy = %updated.spec.run_strategy,
            "instance updated"
        );
        Ok(updated.masked())
    }

    pub fn update_private(
        &self,
        account: &str,
        by: &ResourceRef,
        update: InstanceUpdatePrivate,
    ) -> ServiceResult<Instance> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let updated = self.ctx.store.write(|txn| {
            txn.update::<Instance, ServiceError, _>(account, by, update.resource_version, |instance| {
                instance.spec.instance_group_size = update.instance_group_size;
                Ok(())
            })
        })?;
        Ok(updated.masked())
    }

    /// Operator status callback. Replaces the whole status.
    pub fn update_status(
        &self,
        account: &str,
        resource_id: &str,
        update: InstanceStatusUpdate,
    ) -> ServiceResult<Instance> {
        check_cloud_account_id(account)?;
        let by = ResourceRef::Id(resource_id.to_string());
        check_ref(&by)?;
        let updated = self.ctx.store.write(|txn| {
            txn.update::<Instance, ServiceError, _>(account, &by, update.resource_version, |instance| {
                instance.status = update.status;
                Ok(())
            })
        })?;
        debug!(
            cloud_account_id = %account,
            resource_id,
            phase = %updated.status.phase,
            "instance status updated"
        );
        Ok(updated)
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Request deletion. Repeating the call is a no-op that keeps the
    /// original deletion timestamp.
    pub fn delete(
        &self,
        account: &str,
        by: &ResourceRef,
        resource_version: Option<u64>,
    ) -> ServiceResult<()> {
        self.soft_delete(account, by, resource_version, false)
    }

    /// Like [`delete`](Self::delete) but also accepts instance group members.
    pub fn delete_private(
        &self,
        account: &str,
        by: &ResourceRef,
        resource_version: Option<u64>,
    ) -> ServiceResult<()> {
        self.soft_delete(account, by, resource_version, true)
    }

    fn soft_delete(
        &self,
        account: &str,
        by: &ResourceRef,
        resource_version: Option<u64>,
        privileged: bool,
    ) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        check_ref(by)?;
        let deleted = self.ctx.store.write(|txn| {
            let current: Instance = txn
                .get(account, by)?
                .ok_or_else(|| ServiceError::not_found(format!("instance {by} not found")))?;
            if !privileged && let Some(group) = current.group() {
                return Err(ServiceError::precondition(format!(
                    "instance {} belongs to instance group {group}; delete it through the instance group",
                    current.metadata.name
                )));
            }
            if current.metadata.is_deleting() {
                return Ok(current);
            }
            txn.update::<Instance, ServiceError, _>(account, by, resource_version, |instance| {
                instance.metadata.deletion_timestamp = Some(Utc::now());
                Ok(())
            })
        })?;
        info!(
            cloud_account_id = %account,
            name = %deleted.metadata.name,
            "instance deletion requested"
        );
        Ok(())
    }

    /// Finalize a deleted instance. Succeeds when there is nothing left to
    /// finalize.
    pub fn remove_finalizer(&self, account: &str, resource_id: &str) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        let removed = self
            .ctx
            .store
            .write(|txn| txn.finalize::<Instance>(account, resource_id))?;
        if let Some(instance) = removed {
            info!(
                cloud_account_id = %account,
                name = %instance.metadata.name,
                resource_id,
                "instance finalized"
            );
        }
        Ok(())
    }

    /// Request deletion of every live instance of the given types in an
    /// account. An empty type list matches every type. Returns how many
    /// instances were newly marked.
    pub fn delete_by_instance_types(
        &self,
        account: &str,
        instance_types: &[String],
    ) -> ServiceResult<u64> {
        check_cloud_account_id(account)?;
        let marked = self.ctx.store.write(|txn| {
            let targets: Vec<String> = txn
                .list::<Instance>(Some(account))?
                .into_iter()
                .filter(|i| !i.metadata.is_deleting())
                .filter(|i| instance_types.is_empty() || instance_types.contains(&i.spec.instance_type))
                .map(|i| i.metadata.resource_id)
                .collect();
            let now = Utc::now();
            for id in &targets {
                txn.update::<Instance, ServiceError, _>(account, &ResourceRef::Id(id.clone()), None, |instance| {
                    instance.metadata.deletion_timestamp = Some(now);
                    Ok(())
                })?;
            }
            Ok::<_, ServiceError>(targets.len() as u64)
        })?;
        if marked > 0 {
            info!(cloud_account_id = %account, count = marked, "instances of deactivated account marked for deletion");
        }
        Ok(marked)
    }
}

fn first(mut created: Vec<Instance>) -> ServiceResult<Instance> {
    created
        .pop()
        .ok_or_else(|| ServiceError::Internal("batch create returned nothing".into()))
}

pub(crate) fn initial_status() -> InstanceStatus {
    InstanceStatus {
        phase: InstancePhase::Provisioning,
        message: INITIAL_STATUS_MESSAGE.to_string(),
        ..Default::default()
    }
}

/// Look up key material for each named key, in order.
fn resolve_ssh_keys(
    txn: &WriteTxn<'_>,
    account: &str,
    names: &[String],
) -> ServiceResult<Vec<String>> {
    names
        .iter()
        .map(|name| {
            let key: SshPublicKey = txn
                .get(account, &ResourceRef::Name(name.clone()))?
                .ok_or_else(|| ServiceError::not_found(format!("ssh public key {name} not found")))?;
            Ok(key.spec.ssh_public_key)
        })
        .collect()
}

/// Compare the account's live count per instance type plus the batch
/// against the resolved limits. Instances with `skip_quota_check` are
/// neither counted nor charged.
pub(crate) fn check_instance_quota(
    txn: &WriteTxn<'_>,
    account: &str,
    limits: &BTreeMap<String, u64>,
    batch: &[Instance],
) -> ServiceResult<()> {
    let mut requested: BTreeMap<&str, u64> = BTreeMap::new();
    for instance in batch.iter().filter(|i| !i.spec.skip_quota_check) {
        *requested.entry(instance.spec.instance_type.as_str()).or_default() += 1;
    }
    if requested.is_empty() {
        return Ok(());
    }

    let live: Vec<Instance> = txn.list(Some(account))?;
    for (instance_type, count) in requested {
        let current = live
            .iter()
            .filter(|i| !i.spec.skip_quota_check && i.spec.instance_type == instance_type)
            .count() as u64;
        let limit = limits.get(instance_type).copied().unwrap_or(0);
        let decision = QuotaDecision::evaluate(limit, current, count);
        debug!(cloud_account_id = %account, instance_type, ?decision, "instance quota checked");
        if !decision.allowed {
            return Err(ServiceError::invalid(format!(
                "quota exceeded: account has {current} of {limit} allowed {instance_type} instances and requested {count} more"
            )));
        }
    }
    Ok(())
}

fn check_run_strategy_change(instance: &Instance, requested: RunStrategy) -> ServiceResult<()> {
    if instance.spec.run_strategy == requested {
        return Ok(());
    }
    let phase = instance.status.phase;
    match requested {
        RunStrategy::Halted if phase != InstancePhase::Ready => Err(ServiceError::precondition(
            format!("instance can only be stopped when Ready; current phase is {phase}"),
        )),
        RunStrategy::Always | RunStrategy::RerunOnFailure if phase == InstancePhase::Stopping => {
            Err(ServiceError::precondition(
                "instance cannot be started while it is Stopping",
            ))
        }
        _ => Ok(()),
    }
}
