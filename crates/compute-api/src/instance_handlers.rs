//! Public instance handlers.
//!
//! The cloud account in the path wins over any account in the body.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;

use compute_service::{InstanceCreate, InstanceSearch, InstanceUpdate};

use crate::response::{created, ndjson, resource_ref, respond};
use crate::{ApiState, VersionQuery};

/// GET /api/v1/cloudaccounts/{account}/instances?label=value
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Query(labels): Query<BTreeMap<String, String>>,
) -> impl IntoResponse {
    let search = InstanceSearch {
        labels,
        ..Default::default()
    };
    respond(state.services.instances.search(&account, &search))
}

/// POST /api/v1/cloudaccounts/{account}/instances
pub async fn create_instance(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Json(mut req): Json<InstanceCreate>,
) -> impl IntoResponse {
    req.metadata.cloud_account_id = account;
    created(state.services.instances.create(req).await)
}

/// POST /api/v1/cloudaccounts/{account}/instances/search
pub async fn search_instances(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Json(search): Json<InstanceSearch>,
) -> impl IntoResponse {
    respond(state.services.instances.search(&account, &search))
}

/// GET /api/v1/cloudaccounts/{account}/instances/stream
pub async fn stream_instances(
    State(state): State<ApiState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    ndjson(state.services.instances.search_stream(&account))
}

/// GET /api/v1/cloudaccounts/{account}/instances/{by}/{value}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value).and_then(|by| state.services.instances.get(&account, &by)),
    )
}

/// PUT /api/v1/cloudaccounts/{account}/instances/{by}/{value}
pub async fn update_instance(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Json(update): Json<InstanceUpdate>,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value)
            .and_then(|by| state.services.instances.update(&account, &by, update)),
    )
}

/// DELETE /api/v1/cloudaccounts/{account}/instances/{by}/{value}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Query(query): Query<VersionQuery>,
) -> impl IntoResponse {
    respond(resource_ref(&by, value).and_then(|by| {
        state
            .services
            .instances
            .delete(&account, &by, query.resource_version)
    }))
}
