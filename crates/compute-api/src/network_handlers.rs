//! Load balancer, vnet and SSH public key handlers.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;

use compute_service::{LoadBalancerCreate, LoadBalancerUpdate, SshPublicKeyCreate, VNetPut};

use crate::ApiState;
use crate::response::{created, resource_ref, respond};

/// Header carrying the caller's identity for SSH key ownership checks.
pub const USER_EMAIL_HEADER: &str = "x-user-email";

fn user_email(headers: &HeaderMap) -> &str {
    headers
        .get(USER_EMAIL_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

// ── Load balancers ─────────────────────────────────────────────

/// GET /api/v1/cloudaccounts/{account}/loadbalancers?label=value
pub async fn list_load_balancers(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Query(labels): Query<BTreeMap<String, String>>,
) -> impl IntoResponse {
    respond(state.services.load_balancers.search(&account, &labels))
}

/// POST /api/v1/cloudaccounts/{account}/loadbalancers
pub async fn create_load_balancer(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Json(mut req): Json<LoadBalancerCreate>,
) -> impl IntoResponse {
    req.metadata.cloud_account_id = account;
    created(state.services.load_balancers.create(req).await)
}

/// GET /api/v1/cloudaccounts/{account}/loadbalancers/{by}/{value}
pub async fn get_load_balancer(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value).and_then(|by| state.services.load_balancers.get(&account, &by)),
    )
}

/// PUT /api/v1/cloudaccounts/{account}/loadbalancers/{by}/{value}
pub async fn update_load_balancer(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    Json(update): Json<LoadBalancerUpdate>,
) -> impl IntoResponse {
    let result = match resource_ref(&by, value) {
        Ok(by) => state.services.load_balancers.update(&account, &by, update).await,
        Err(e) => Err(e),
    };
    respond(result)
}

/// DELETE /api/v1/cloudaccounts/{account}/loadbalancers/{by}/{value}
pub async fn delete_load_balancer(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value)
            .and_then(|by| state.services.load_balancers.delete(&account, &by)),
    )
}

// ── VNets ──────────────────────────────────────────────────────

/// GET /api/v1/cloudaccounts/{account}/vnets?label=value
pub async fn list_vnets(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Query(labels): Query<BTreeMap<String, String>>,
) -> impl IntoResponse {
    respond(state.services.vnets.search(&account, &labels))
}

/// PUT /api/v1/cloudaccounts/{account}/vnets
pub async fn put_vnet(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    Json(mut req): Json<VNetPut>,
) -> impl IntoResponse {
    req.cloud_account_id = account;
    respond(state.services.vnets.put(req))
}

/// GET /api/v1/cloudaccounts/{account}/vnets/{by}/{value}
pub async fn get_vnet(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(resource_ref(&by, value).and_then(|by| state.services.vnets.get(&account, &by)))
}

/// DELETE /api/v1/cloudaccounts/{account}/vnets/{by}/{value}
pub async fn delete_vnet(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
) -> impl IntoResponse {
    respond(resource_ref(&by, value).and_then(|by| state.services.vnets.delete(&account, &by)))
}

// ── SSH public keys ────────────────────────────────────────────

/// GET /api/v1/cloudaccounts/{account}/sshpublickeys
pub async fn list_ssh_keys(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    respond(state.services.ssh_keys.search(&account, user_email(&headers)))
}

/// POST /api/v1/cloudaccounts/{account}/sshpublickeys
///
/// The owner defaults to the caller when the body leaves it out.
pub async fn create_ssh_key(
    State(state): State<ApiState>,
    Path(account): Path<String>,
    headers: HeaderMap,
    Json(mut req): Json<SshPublicKeyCreate>,
) -> impl IntoResponse {
    req.metadata.cloud_account_id = account;
    if req.owner_email.is_empty() {
        req.owner_email = user_email(&headers).to_string();
    }
    created(state.services.ssh_keys.create(req))
}

/// GET /api/v1/cloudaccounts/{account}/sshpublickeys/{by}/{value}
pub async fn get_ssh_key(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value)
            .and_then(|by| state.services.ssh_keys.get(&account, &by, user_email(&headers))),
    )
}

/// DELETE /api/v1/cloudaccounts/{account}/sshpublickeys/{by}/{value}
pub async fn delete_ssh_key(
    State(state): State<ApiState>,
    Path((account, by, value)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> impl IntoResponse {
    respond(
        resource_ref(&by, value)
            .and_then(|by| state.services.ssh_keys.delete(&account, &by, user_email(&headers))),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn user_email_defaults_to_empty() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_email(&headers), "");
        headers.insert(USER_EMAIL_HEADER, HeaderValue::from_static("alice@example.com"));
        assert_eq!(user_email(&headers), "alice@example.com");
    }
}
