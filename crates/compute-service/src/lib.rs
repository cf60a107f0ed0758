//! compute-service — resource services for the compute control plane.
//!
//! One service per resource type, all sharing a [`ServiceContext`]:
//!
//! - [`InstanceService`]: create (single and batch), update, status
//!   callbacks, soft delete, finalizer removal, search and streams
//! - [`InstanceGroupService`]: groups derived from instance membership,
//!   scale-up reconciliation and member deletion
//! - [`LoadBalancerService`]
//! - [`VNetService`]: idempotent put, immediate delete
//! - [`SshPublicKeyService`]: key validation, fingerprints, owner-only delete
//!
//! # Architecture
//!
//! ```text
//! API handler
//!   └── *Service (validate, resolve quota limits)
//!         └── StateStore::write (one transaction: cross-checks, quota
//!             count, compare-and-swap, insert/update)
//!               └── change feed → WatchEngine
//! ```
//!
//! Quota limits are resolved before the transaction because the source may
//! be remote. The live count they are compared against is read inside the
//! transaction, so a batch is admitted or rejected as a whole.

use std::sync::Arc;

use compute_core::ControlPlaneConfig;
use compute_quota::QuotaEvaluator;
use compute_state::StateStore;
use compute_watch::WatchEngine;

pub mod common;
pub mod error;
pub mod instance;
pub mod instance_group;
pub mod load_balancer;
pub mod ssh_key;
pub mod vnet;

pub use common::CreateMetadata;
pub use error::{ServiceError, ServiceResult};
pub use instance::{
    InstanceCreate, InstanceSearch, InstanceService, InstanceStatusUpdate, InstanceUpdate,
    InstanceUpdatePrivate,
};
pub use instance_group::{
    InstanceGroup, InstanceGroupCreate, InstanceGroupService, ScaleStatus, ScaleUpRequest,
};
pub use load_balancer::{
    LoadBalancerCreate, LoadBalancerService, LoadBalancerStatusUpdate, LoadBalancerUpdate,
};
pub use ssh_key::{SshPublicKeyCreate, SshPublicKeyService, SshPublicKeyView};
pub use vnet::{VNetPut, VNetService};

/// Dependencies shared by every service.
pub struct ServiceContext {
    pub store: StateStore,
    pub quota: QuotaEvaluator,
    pub watch: WatchEngine,
    pub config: Arc<ControlPlaneConfig>,
}

impl ServiceContext {
    pub fn new(store: StateStore, quota: QuotaEvaluator, config: ControlPlaneConfig) -> Self {
        let watch = WatchEngine::new(store.clone(), &config.watch);
        Self {
            store,
            quota,
            watch,
            config: Arc::new(config),
        }
    }
}

/// Every service, wired to one context.
#[derive(Clone)]
pub struct ComputeServices {
    pub instances: InstanceService,
    pub instance_groups: InstanceGroupService,
    pub load_balancers: LoadBalancerService,
    pub vnets: VNetService,
    pub ssh_keys: SshPublicKeyService,
}

impl ComputeServices {
    pub fn new(ctx: ServiceContext) -> Self {
        let ctx = Arc::new(ctx);
        let instances = InstanceService::new(ctx.clone());
        Self {
            instance_groups: InstanceGroupService::new(instances.clone()),
            instances,
            load_balancers: LoadBalancerService::new(ctx.clone()),
            vnets: VNetService::new(ctx.clone()),
            ssh_keys: SshPublicKeyService::new(ctx),
        }
    }
}
