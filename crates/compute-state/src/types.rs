//! Resource types persisted by the store.
//!
//! Every resource embeds [`ResourceMetadata`] and implements [`Resource`],
//! which ties it to a [`ResourceKind`] and therefore to a redb table.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use compute_core::{HealthMonitorType, InstancePhase, LoadBalancerState, RunStrategy};

/// Sentinel returned in place of instance user data to non-privileged readers.
pub const OMITTED: &str = "OMITTED";

// ── Metadata ───────────────────────────────────────────────────────

/// Metadata common to every resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceMetadata {
    pub cloud_account_id: String,
    pub name: String,
    pub resource_id: String,
    /// Assigned by the store on every write.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub creation_timestamp: DateTime<Utc>,
    /// Set when a delete has been requested. The resource stays visible
    /// until its finalizer is removed.
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ResourceMetadata {
    pub fn new(cloud_account_id: &str, name: &str, resource_id: &str) -> Self {
        Self {
            cloud_account_id: cloud_account_id.to_string(),
            name: name.to_string(),
            resource_id: resource_id.to_string(),
            resource_version: 0,
            labels: BTreeMap::new(),
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Whether every `(key, value)` in `selector` is present in the labels.
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}

/// How a caller addresses a resource within a cloud account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Id(String),
    Name(String),
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceRef::Id(id) => write!(f, "resource id {id}"),
            ResourceRef::Name(name) => write!(f, "name {name}"),
        }
    }
}

// ── Resource kinds ─────────────────────────────────────────────────

/// The collections held by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instance,
    LoadBalancer,
    Vnet,
    SshPublicKey,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Instance,
        ResourceKind::LoadBalancer,
        ResourceKind::Vnet,
        ResourceKind::SshPublicKey,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Instance => "instance",
            ResourceKind::LoadBalancer => "load_balancer",
            ResourceKind::Vnet => "vnet",
            ResourceKind::SshPublicKey => "ssh_public_key",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed resource the store can persist.
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &ResourceMetadata;

    fn metadata_mut(&mut self) -> &mut ResourceMetadata;
}

macro_rules! impl_resource {
    ($ty:ty, $kind:expr) => {
        impl Resource for $ty {
            const KIND: ResourceKind = $kind;

            fn metadata(&self) -> &ResourceMetadata {
                &self.metadata
            }

            fn metadata_mut(&mut self) -> &mut ResourceMetadata {
                &mut self.metadata
            }
        }
    };
}

// ── Instance ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub metadata: ResourceMetadata,
    pub spec: InstanceSpec,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl_resource!(Instance, ResourceKind::Instance);

impl Instance {
    /// Replace user data with [`OMITTED`] for non-privileged readers.
    pub fn masked(mut self) -> Self {
        if !self.spec.user_data.is_empty() {
            self.spec.user_data = OMITTED.to_string();
        }
        self
    }

    pub fn group(&self) -> Option<&str> {
        self.spec.instance_group.as_deref().filter(|g| !g.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceSpec {
    pub availability_zone: String,
    pub instance_type: String,
    pub machine_image: String,
    #[serde(default)]
    pub run_strategy: RunStrategy,
    #[serde(default)]
    pub ssh_public_key_names: Vec<String>,
    /// Key material resolved from `ssh_public_key_names` at write time.
    #[serde(default)]
    pub ssh_public_keys: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
    #[serde(default)]
    pub instance_group: Option<String>,
    #[serde(default)]
    pub instance_group_size: u32,
    #[serde(default)]
    pub cluster_group_id: Option<String>,
    #[serde(default)]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub user_data: String,
    /// Created through a privileged path that bypassed quota. Such
    /// instances are not counted against the tenant.
    #[serde(default)]
    pub skip_quota_check: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkInterface {
    pub name: String,
    pub vnet: String,
    #[serde(default)]
    pub dns_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,
    #[serde(default)]
    pub ssh_proxy: Option<SshProxyTunnelStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InterfaceStatus {
    pub name: String,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub subnet: String,
    #[serde(default)]
    pub prefix_length: u8,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshProxyTunnelStatus {
    pub proxy_user: String,
    pub proxy_address: String,
    pub proxy_port: u16,
}

// ── Load balancer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancer {
    pub metadata: ResourceMetadata,
    pub spec: LoadBalancerSpec,
    #[serde(default)]
    pub status: LoadBalancerStatus,
}

impl_resource!(LoadBalancer, ResourceKind::LoadBalancer);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerSpec {
    pub listeners: Vec<Listener>,
    pub security: Security,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listener {
    pub port: u16,
    pub pool: ListenerPool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerPool {
    pub port: u16,
    pub monitor: HealthMonitorType,
    pub members: PoolMembers,
}

/// Pool membership is either explicit or label-selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PoolMembers {
    InstanceResourceIds(Vec<String>),
    InstanceSelectors(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Security {
    #[serde(default)]
    pub source_ips: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadBalancerStatus {
    #[serde(default)]
    pub state: LoadBalancerState,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub vip: String,
    #[serde(default)]
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ListenerStatus {
    pub port: u16,
    pub state: LoadBalancerState,
    #[serde(default)]
    pub pool_members: Vec<PoolMemberStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolMemberStatus {
    pub instance_resource_id: String,
    pub ip: String,
}

// ── VNet ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VNet {
    pub metadata: ResourceMetadata,
    pub spec: VNetSpec,
}

impl_resource!(VNet, ResourceKind::Vnet);

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VNetSpec {
    pub region: String,
    pub availability_zone: String,
    pub prefix_length: u8,
}

// ── SSH public key ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshPublicKey {
    pub metadata: ResourceMetadata,
    pub spec: SshPublicKeySpec,
}

impl_resource!(SshPublicKey, ResourceKind::SshPublicKey);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshPublicKeySpec {
    pub ssh_public_key: String,
    pub owner_email: String,
    /// `SHA256:` fingerprint of the decoded key blob.
    #[serde(default)]
    pub fingerprint: String,
}
