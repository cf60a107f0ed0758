//! Instance groups and the scale-up reconciler.
//!
//! A group has no record of its own: it is the set of instances whose
//! `instance_group` names it. Members are named `{group}-{index}`, which
//! makes the member name the arbiter between concurrent reconcilers.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use compute_core::InstancePhase;
use compute_core::validate::{check_cloud_account_id, check_group_name};
use compute_state::{Instance, InstanceSpec, ResourceMetadata, ResourceRef, StateError};

use crate::common::{CreateMetadata, check_ref};
use crate::error::{ServiceError, ServiceResult};
use crate::instance::{InstanceCreate, InstanceSearch, InstanceService, check_instance_quota, initial_status};

/// Largest group size accepted by create and scale-up.
pub const MAX_GROUP_SIZE: u32 = 128;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceGroupCreate {
    pub cloud_account_id: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub instance_count: u32,
    pub instance_spec: InstanceSpec,
}

/// A group as derived from its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub cloud_account_id: String,
    pub name: String,
    pub instance_spec: InstanceSpec,
    pub instance_count: u32,
    pub ready_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleUpRequest {
    pub desired_count: i64,
    /// Replaces the template's user data on new members only.
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScaleStatus {
    pub current_count: u32,
    pub desired_count: u32,
    pub ready_count: u32,
    pub current_members: Vec<String>,
    pub new_members: Vec<String>,
    pub ready_members: Vec<String>,
}

pub fn member_name(group: &str, index: u32) -> String {
    format!("{group}-{index}")
}

#[derive(Clone)]
pub struct InstanceGroupService {
    instances: InstanceService,
}

impl InstanceGroupService {
    pub fn new(instances: InstanceService) -> Self {
        Self { instances }
    }

    /// Create `instance_count` members from one template, atomically.
    pub async fn create(&self, req: InstanceGroupCreate) -> ServiceResult<InstanceGroup> {
        check_cloud_account_id(&req.cloud_account_id)?;
        check_group_name(&req.name)?;
        check_group_size(req.instance_count.into())?;

        let mut template = req.instance_spec;
        template.instance_group = Some(req.name.clone());
        template.instance_group_size = req.instance_count;
        template.skip_quota_check = false;

        let members = (0..req.instance_count)
            .map(|i| InstanceCreate {
                metadata: CreateMetadata {
                    cloud_account_id: req.cloud_account_id.clone(),
                    name: Some(member_name(&req.name, i)),
                    resource_id: None,
                    labels: req.labels.clone(),
                },
                spec: template.clone(),
            })
            .collect();
        let created = self.instances.create_multiple_private(members).await?;

        info!(
            cloud_account_id = %req.cloud_account_id,
            group = %req.name,
            count = created.len(),
            "instance group created"
        );
        Ok(InstanceGroup {
            cloud_account_id: req.cloud_account_id,
            name: req.name,
            instance_spec: template,
            instance_count: created.len() as u32,
            ready_count: 0,
        })
    }

    /// Every group in the account, ordered by name.
    pub fn search(&self, account: &str) -> ServiceResult<Vec<InstanceGroup>> {
        let members = self.instances.search(account, &InstanceSearch::in_any_group())?;
        let mut groups: BTreeMap<String, InstanceGroup> = BTreeMap::new();
        for member in members {
            let Some(name) = member.group().map(str::to_string) else {
                continue;
            };
            let group = groups.entry(name.clone()).or_insert_with(|| InstanceGroup {
                cloud_account_id: account.to_string(),
                name,
                instance_spec: InstanceSpec::default(),
                instance_count: 0,
                ready_count: 0,
            });
            group.instance_count += 1;
            if member.status.phase == InstancePhase::Ready {
                group.ready_count += 1;
            }
            group.instance_spec = member.spec;
        }
        Ok(groups.into_values().collect())
    }

    /// Request deletion of every member. Returns the number of members.
    pub fn delete(&self, account: &str, group: &str) -> ServiceResult<usize> {
        check_cloud_account_id(account)?;
        check_group_name(group)?;
        let members = self.members(account, group)?;
        for member in &members {
            self.instances.delete_private(
                account,
                &ResourceRef::Id(member.metadata.resource_id.clone()),
                None,
            )?;
        }
        info!(cloud_account_id = %account, group, count = members.len(), "instance group deletion requested");
        Ok(members.len())
    }

    /// Delete one member and shrink the group to the remaining live count.
    /// The last live member cannot be deleted this way.
    pub fn delete_member(&self, account: &str, group: &str, member: &ResourceRef) -> ServiceResult<()> {
        check_cloud_account_id(account)?;
        check_group_name(group)?;
        check_ref(member)?;

        let deleted = self.instances.ctx.store.write(|txn| {
            let members: Vec<Instance> = txn
                .list::<Instance>(Some(account))?
                .into_iter()
                .filter(|i| i.group() == Some(group))
                .collect();
            if members.is_empty() {
                return Err(ServiceError::not_found(format!("instance group {group} not found")));
            }
            let target = members
                .iter()
                .find(|i| match member {
                    ResourceRef::Id(id) => &i.metadata.resource_id == id,
                    ResourceRef::Name(name) => &i.metadata.name == name,
                })
                .ok_or_else(|| {
                    ServiceError::not_found(format!("instance {member} not found in instance group {group}"))
                })?;
            if target.metadata.is_deleting() {
                return Ok(None);
            }

            let live: Vec<&Instance> = members.iter().filter(|i| !i.metadata.is_deleting()).collect();
            if live.len() == 1 {
                return Err(ServiceError::precondition(format!(
                    "instance {} is the last member of instance group {group} and cannot be deleted",
                    target.metadata.name
                )));
            }

            let target_id = target.metadata.resource_id.clone();
            let remaining = (live.len() - 1) as u32;
            let now = Utc::now();
            for instance in live {
                let id = &instance.metadata.resource_id;
                txn.update::<Instance, ServiceError, _>(account, &ResourceRef::Id(id.clone()), None, |i| {
                    if *id == target_id {
                        i.metadata.deletion_timestamp = Some(now);
                    } else {
                        i.spec.instance_group_size = remaining;
                    }
                    Ok(())
                })?;
            }
            Ok(Some((target.metadata.name.clone(), remaining)))
        })?;

        if let Some((name, remaining)) = deleted {
            info!(cloud_account_id = %account, group, member = %name, remaining, "instance group member deleted");
        }
        Ok(())
    }

    /// Grow the group to `desired_count` members, cloning a live member.
    ///
    /// Only names `{group}-0` to `{group}-{desired - 1}` are considered.
    /// A name already in use (including by a member being deleted) is
    /// skipped, so the group may end up smaller than `desired`. Every live
    /// member's `instance_group_size` is set to the resulting count. The
    /// whole step, including the quota check, runs in one store
    /// transaction.
    pub async fn scale_up(
        &self,
        account: &str,
        group: &str,
        req: ScaleUpRequest,
    ) -> ServiceResult<ScaleStatus> {
        check_cloud_account_id(account)?;
        check_group_name(group)?;
        let desired = check_group_size(req.desired_count)?;

        // Resolve the template's limit up front; the source may be remote.
        let preview = self.members(account, group)?;
        let Some(template) = live_template(&preview) else {
            return Err(missing_members(group, &preview));
        };
        let template_type = template.spec.instance_type.clone();
        let probe = new_member(template, group, None);
        let limits = self.instances.instance_limits(account, &[probe]).await?;

        let ctx = &self.instances.ctx;
        let status = ctx.store.write(|txn| {
            let members: Vec<Instance> = txn
                .list::<Instance>(Some(account))?
                .into_iter()
                .filter(|i| i.group() == Some(group))
                .collect();
            let Some(template) = live_template(&members).cloned() else {
                return Err(missing_members(group, &members));
            };
            if template.spec.instance_type != template_type {
                return Err(ServiceError::Conflict(format!(
                    "instance group {group} changed during scale-up; retry"
                )));
            }

            let live_count = members.iter().filter(|i| !i.metadata.is_deleting()).count() as u32;
            if desired < live_count {
                return Err(ServiceError::invalid(format!(
                    "instance group {group} has {live_count} members; scale down is not supported"
                )));
            }

            let taken: BTreeSet<&str> = members.iter().map(|i| i.metadata.name.as_str()).collect();
            let mut to_create = Vec::new();
            for index in 0..desired {
                let name = member_name(group, index);
                if taken.contains(name.as_str()) {
                    continue;
                }
                to_create.push(new_member(&template, &name, req.user_data.as_deref()));
            }

            for instance in &mut to_create {
                self.instances.bind_references(txn, instance)?;
            }
            check_instance_quota(txn, account, &limits, &to_create)?;

            let mut inserted = Vec::new();
            for instance in to_create {
                match txn.insert(instance) {
                    Ok(instance) => inserted.push(instance),
                    // The name belongs to someone else, possibly another reconciler.
                    Err(StateError::AlreadyExists(_)) => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            let current_count = live_count + inserted.len() as u32;
            let new_members: Vec<String> = inserted.iter().map(|i| i.metadata.name.clone()).collect();
            let mut current_members = Vec::new();
            let mut ready_members = Vec::new();
            let live = members.iter().filter(|i| !i.metadata.is_deleting());
            for member in live.chain(inserted.iter()) {
                current_members.push(member.metadata.name.clone());
                if member.status.phase == InstancePhase::Ready {
                    ready_members.push(member.metadata.name.clone());
                }
                if member.spec.instance_group_size != current_count {
                    txn.update::<Instance, ServiceError, _>(
                        account,
                        &ResourceRef::Id(member.metadata.resource_id.clone()),
                        None,
                        |i| {
                            i.spec.instance_group_size = current_count;
                            Ok(())
                        },
                    )?;
                }
            }
            current_members.sort();

            Ok(ScaleStatus {
                current_count,
                desired_count: desired,
                ready_count: ready_members.len() as u32,
                current_members,
                new_members,
                ready_members,
            })
        })?;

        info!(
            cloud_account_id = %account,
            group,
            desired = status.desired_count,
            current = status.current_count,
            created = status.new_members.len(),
            "instance group scaled up"
        );
        Ok(status)
    }

    /// All members, including those being deleted, ordered by name.
    fn members(&self, account: &str, group: &str) -> ServiceResult<Vec<Instance>> {
        self.instances.search_private(
            Some(account),
            &InstanceSearch {
                instance_group: Some(group.to_string()),
                ..Default::default()
            },
        )
    }
}

fn check_group_size(count: i64) -> ServiceResult<u32> {
    if count < 1 || count > i64::from(MAX_GROUP_SIZE) {
        return Err(ServiceError::invalid(format!(
            "instance count must be between 1 and {MAX_GROUP_SIZE}, got {count}"
        )));
    }
    Ok(count as u32)
}

fn live_template(members: &[Instance]) -> Option<&Instance> {
    members.iter().find(|i| !i.metadata.is_deleting())
}

fn missing_members(group: &str, members: &[Instance]) -> ServiceError {
    if members.is_empty() {
        ServiceError::not_found(format!("instance group {group} not found"))
    } else {
        ServiceError::not_found(format!("instance group {group} is being deleted"))
    }
}

fn new_member(template: &Instance, name: &str, user_data: Option<&str>) -> Instance {
    let mut metadata = ResourceMetadata::new(
        &template.metadata.cloud_account_id,
        name,
        &uuid::Uuid::new_v4().to_string(),
    );
    metadata.labels = template.metadata.labels.clone();

    let mut spec = template.spec.clone();
    spec.skip_quota_check = false;
    if let Some(user_data) = user_data {
        spec.user_data = user_data.to_string();
    }
    Instance {
        metadata,
        spec,
        status: initial_status(),
    }
}
