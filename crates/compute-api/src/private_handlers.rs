//! Private handlers for operators and the instance group reconciler.
//!
//! Nothing here masks user data. Streams and searches span every account
//! unless `cloud_account_id` is given.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;

use compute_service::{
    InstanceCreate, InstanceSearch, InstanceStatusUpdate, InstanceUpdatePrivate,
    LoadBalancerStatusUpdate, ServiceResult,
};
use compute_state::ResourceRef;
use compute_watch::WatchRequest;

use crate::response::{created, ndjson, resource_ref, respond};
use crate::{ApiState, VersionQuery};

#[derive(Debug, Default, Deserialize)]
pub struct AccountQuery {
    pub cloud_account_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WatchQuery {
    #[serde(default)]
    pub resource_version: u64,
    pub cloud_account_id: Option<String>,
}

impl From<WatchQuery> for WatchRequest {
    fn from(query: WatchQuery) -> Self {
        WatchRequest {
            resource_version: query.resource_version,
            cloud_account_id: query.cloud_account_id.filter(|a| !a.is_empty()),
        }
    }
}

impl AccountQuery {
    fn account(&self) -> Option<&str> {
        self.cloud_account_id.as_deref().filter(|a| !a.is_empty())
    }
}

/// Status callbacks and finalizers work on resource ids; a name is
/// resolved first.
fn instance_id(state: &ApiState, account: &str, by: &str, value: String) -> ServiceResult<String> {
    match resource_ref(by, value)? {
        ResourceRef::Id(id) => Ok(id),
        by => Ok(state.services.instances.get_private(account, &by)?.metadata.resource_id),
    }
}

fn load_balancer_id(
    state: &ApiState,
    account: &str,
    by: &str,
    value: String,
) -> ServiceResult<String> {
    match resource_ref(by, value)? {
        ResourceRef::Id(id) => Ok(id),
        by => Ok(state.services.load_balancers.get(account, &by)?.metadata.resource_id),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// POST /api/v1/private/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Json(req): Json<InstanceCreate>,
) -> impl IntoResponse {
    created(state.services.instances.create_private(req).await)
}

/// POST /api/v1/private/instances/batch
pub async fn create_instances(
    State(state): State<ApiState>,
    Json(reqs): Json<Vec<InstanceCreate>>,
) -> impl IntoResponse {
    created(state.services.instances.create_multiple_private(reqs).await)
}

/// POST /api/v1/private/instances/search?cloud_account_id=
pub async fn search_instances(
    State(state): State<ApiState>,
    Query(query): Query<AccountQuery>,
    Json(search): Json<InstanceSearch>,
) -> impl IntoResponse {
    respond(state.services.instances.search_private(query.account(), &search))
}

/// GET /api/v1/private/instances/stream?cloud_account_id=
pub async fn stream_instances(
    State(state): State<ApiState>,
    Query(query): Query<AccountQuery>,
) -> impl IntoResponse {
    ndjson(state.services.instances.search_stream_private(query.account()))
}

/// GET /api/v1/private/instances/watch?resource_version=&cloud_account_id=
pub async fn watch_instances(
    State(state): State<ApiState>,
    Query(query): Query<WatchQuery>,
) -> impl IntoResponse {
    ndjson(state.services.instances.watch(query.into()))
}

/// PUT /api/v1/private/cloudaccounts/{account}/instances/{by}/{value}
pub async fn update_instance(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Json(update): Json<InstanceUpdatePrivate>,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value)
            .and_then(|by| state.services.instances.update_private(&account, &by, update)),
    )
}

/// DELETE /api/v1/private/cloudaccounts/{account}/instances/{by}/{value}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
) -> impl IntoResponse {
    respond(resource_ref(&by, value).and_then(|by| {
        state
            .services
            .instances
            .delete_private(&account, &by, query.resource_version)
    }))
}

/// PUT /api/v1/private/cloudaccounts/{account}/instances/{by}/{value}/status
pub async fn update_instance_status(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Json(update): Json<InstanceStatusUpdate>,
) -> impl IntoResponse {
    respond(
        instance_id(&state, &account, &by, value)
            .and_then(|id| state.services.instances.update_status(&account, &id, update)),
    )
}

/// DELETE /api/v1/private/cloudaccounts/{account}/instances/{by}/{value}/finalizer
pub async fn remove_instance_finalizer(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        instance_id(&state, &account, &by, value)
            .and_then(|id| state.services.instances.remove_finalizer(&account, &id)),
    )
}

// ── Load balancers ─────────────────────────────────────────────

/// GET /api/v1/private/loadbalancers/stream?cloud_account_id=
pub async fn stream_load_balancers(
    State(state): State<ApiState>,
    Query(query): Query<AccountQuery>,
) -> impl IntoResponse {
    ndjson(state.services.load_balancers.search_stream(query.account()))
}

/// GET /api/v1/private/loadbalancers/watch?resource_version=&cloud_account_id=
pub async fn watch_load_balancers(
    State(state): State<ApiState>,
    Query(query): Query<WatchQuery>,
) -> impl IntoResponse {
    ndjson(state.services.load_balancers.watch(query.into()))
}

/// PUT /api/v1/private/cloudaccounts/{account}/loadbalancers/{by}/{value}/status
pub async fn update_load_balancer_status(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Json(update): Json<LoadBalancerStatusUpdate>,
) -> impl IntoResponse {
    respond(
        load_balancer_id(&state, &account, &by, value)
            .and_then(|id| state.services.load_balancers.update_status(&account, &id, update)),
    )
}

/// DELETE /api/v1/private/cloudaccounts/{account}/loadbalancers/{by}/{value}/finalizer
pub async fn remove_load_balancer_finalizer(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        load_balancer_id(&state, &account, &by, value)
            .and_then(|id| state.services.load_balancers.remove_finalizer(&account, &id)),
    )
}

// ── Snapshots ──────────────────────────────────────────────────

/// GET /api/v1/private/vnets/stream?cloud_account_id=
pub async fn stream_vnets(
    State(state): State<ApiState>,
    Query(query): Query<AccountQuery>,
) -> impl IntoResponse {
    ndjson(state.services.vnets.search_stream(query.account()))
}

/// GET /api/v1/private/sshpublickeys/stream?cloud_account_id=
pub async fn stream_ssh_keys(
    State(state): State<ApiState>,
    Query(query): Query<AccountQuery>,
) -> impl IntoResponse {
    ndjson(state.services.ssh_keys.search_stream(query.account()))
}
