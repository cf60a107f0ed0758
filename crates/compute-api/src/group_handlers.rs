//! Instance group handlers.

use axum::Json;
use axum::extract::{Path, State};
use axum::response::IntoResponse;

use compute_service::{InstanceGroupCreate, ScaleUpRequest};

use crate::ApiState;
use crate::response::{created, resource_ref, respond};

/// GET /api/v1/cloudaccounts/{account}/instancegroups
pub async fn list_groups(
    State(state): State<ApiState>,
    Path(account): Path<String>,
) -> impl IntoResponse {
    respond(state.services.instance_groups.search(&account))
}

/// POST /api/v1/cloudaccounts/{account}/instancegroups
pub async fn create_group(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Json(mut req): Json<InstanceGroupCreate>,
) -> impl IntoResponse {
    req.cloud_account_id = account;
    created(state.services.instance_groups.create(req).await)
}

/// DELETE /api/v1/cloudaccounts/{account}/instancegroups/{group}
///
/// Responds with the number of members marked for deletion.
pub async fn delete_group(
    State(state): State<ApiState>,
    Path((account, group)): Path<(String, String)>,
) -> impl IntoResponse {
    respond(state.services.instance_groups.delete(&account, &group))
}

/// POST /api/v1/cloudaccounts/{account}/instancegroups/{group}/scale-up
pub async fn scale_up(
    State(state): State<ApiState>,
    Path((account, group)): Path<(String, String)>,
    Json(req): Json<ScaleUpRequest>,
) -> impl IntoResponse {
    respond(
        state
            .services
            .instance_groups
            .scale_up(&account, &group, req)
            .await,
    )
}

/// DELETE /api/v1/cloudaccounts/{account}/instancegroups/{group}/instances/{by}/{value}
pub async fn delete_member(
    State(state): State<ApiState>,
    Path((account, group, by, value)): Path<(String, String, String, String)>,
) -> impl IntoResponse {
    respond(resource_ref(&by, value).and_then(|member| {
        state
            .services
            .instance_groups
            .delete_member(&account, &group, &member)
    }))
}
