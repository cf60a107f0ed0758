//! compute-api — REST API for the compute control plane.
//!
//! Thin axum handlers over [`ComputeServices`]. Every JSON response uses
//! the `{success, data, error}` envelope; streams are newline-delimited
//! JSON (`application/x-ndjson`), one delta per line.
//!
//! Resources are addressed as `{by}/{value}` where `by` is `id` or `name`.
//! SSH key calls read the caller's identity from the `x-user-email` header.
//!
//! # Public routes (`/api/v1/cloudaccounts/{account}`)
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET, POST | `/instances` | List (label query) / create an instance |
//! | POST | `/instances/search` | Search with group filters |
//! | GET | `/instances/stream` | Snapshot stream, user data masked |
//! | GET, PUT, DELETE | `/instances/{by}/{value}` | Get / update / delete |
//! | GET, POST | `/instancegroups` | List / create a group |
//! | DELETE | `/instancegroups/{group}` | Delete every member |
//! | POST | `/instancegroups/{group}/scale-up` | Grow the group |
//! | DELETE | `/instancegroups/{group}/instances/{by}/{value}` | Delete one member |
//! | GET, POST | `/loadbalancers` | List / create a load balancer |
//! | GET, PUT, DELETE | `/loadbalancers/{by}/{value}` | Get / update / delete |
//! | GET, PUT | `/vnets` | List / create-or-replace a vnet |
//! | GET, DELETE | `/vnets/{by}/{value}` | Get / delete |
//! | GET, POST | `/sshpublickeys` | List / create a key |
//! | GET, DELETE | `/sshpublickeys/{by}/{value}` | Get / delete |
//!
//! # Private routes (`/api/v1/private`)
//!
//! Used by operators and the instance group reconciler. Objects are never
//! masked and `cloud_account_id` is an optional query filter.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/instances` | Create, honouring `resource_id` and quota bypass |
//! | POST | `/instances/batch` | Create several instances atomically |
//! | POST | `/instances/search` | Search across accounts |
//! | GET | `/instances/stream` | Snapshot stream |
//! | GET | `/instances/watch` | Change stream from `resource_version` |
//! | GET | `/loadbalancers/stream`, `/loadbalancers/watch` | Same for load balancers |
//! | GET | `/vnets/stream`, `/sshpublickeys/stream` | Snapshot streams |
//! | PUT, DELETE | `/cloudaccounts/{account}/instances/{by}/{value}` | Private update / delete |
//! | PUT | `/cloudaccounts/{account}/instances/{by}/{value}/status` | Status callback |
//! | DELETE | `/cloudaccounts/{account}/instances/{by}/{value}/finalizer` | Finalize |
//! | PUT | `/cloudaccounts/{account}/loadbalancers/{by}/{value}/status` | Status callback |
//! | DELETE | `/cloudaccounts/{account}/loadbalancers/{by}/{value}/finalizer` | Finalize |

pub mod group_handlers;
pub mod instance_handlers;
pub mod network_handlers;
pub mod private_handlers;
mod response;

use axum::Router;
use axum::routing::{delete, get, post, put};
use serde::Deserialize;

use compute_service::ComputeServices;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub services: ComputeServices,
}

/// `?resource_version=` on deletes.
#[derive(Debug, Default, Deserialize)]
pub struct VersionQuery {
    pub resource_version: Option<u64>,
}

/// Build the complete API router.
pub fn build_router(services: ComputeServices) -> Router {
    let state = ApiState { services };

    let account_routes = Router::new()
        .route(
            "/instances",
            get(instance_handlers::list_instances).post(instance_handlers::create_instance),
        )
        .route("/instances/search", post(instance_handlers::search_instances))
        .route("/instances/stream", get(instance_handlers::stream_instances))
        .route(
            "/instances/{by}/{value}",
            get(instance_handlers::get_instance)
                .put(instance_handlers::update_instance)
                .delete(instance_handlers::delete_instance),
        )
        .route(
            "/instancegroups",
            get(group_handlers::list_groups).post(group_handlers::create_group),
        )
        .route("/instancegroups/{group}", delete(group_handlers::delete_group))
        .route("/instancegroups/{group}/scale-up", post(group_handlers::scale_up))
        .route(
            "/instancegroups/{group}/instances/{by}/{value}",
            delete(group_handlers::delete_member),
        )
        .route(
            "/loadbalancers",
            get(network_handlers::list_load_balancers).post(network_handlers::create_load_balancer),
        )
        .route(
            "/loadbalancers/{by}/{value}",
            get(network_handlers::get_load_balancer)
                .put(network_handlers::update_load_balancer)
                .delete(network_handlers::delete_load_balancer),
        )
        .route(
            "/vnets",
            get(network_handlers::list_vnets).put(network_handlers::put_vnet),
        )
        .route(
            "/vnets/{by}/{value}",
            get(network_handlers::get_vnet).delete(network_handlers::delete_vnet),
        )
        .route(
            "/sshpublickeys",
            get(network_handlers::list_ssh_keys).post(network_handlers::create_ssh_key),
        )
        .route(
            "/sshpublickeys/{by}/{value}",
            get(network_handlers::get_ssh_key).delete(network_handlers::delete_ssh_key),
        );

    let private_routes = Router::new()
        .route("/instances", post(private_handlers::create_instance))
        .route("/instances/batch", post(private_handlers::create_instances))
        .route("/instances/search", post(private_handlers::search_instances))
        .route("/instances/stream", get(private_handlers::stream_instances))
        .route("/instances/watch", get(private_handlers::watch_instances))
        .route("/loadbalancers/stream", get(private_handlers::stream_load_balancers))
        .route("/loadbalancers/watch", get(private_handlers::watch_load_balancers))
        .route("/vnets/stream", get(private_handlers::stream_vnets))
        .route("/sshpublickeys/stream", get(private_handlers::stream_ssh_keys))
        .route(
            "/cloudaccounts/{account}/instances/{by}/{value}",
            put(private_handlers::update_instance).delete(private_handlers::delete_instance),
        )
        .route(
            "/cloudaccounts/{account}/instances/{by}/{value}/status",
            put(private_handlers::update_instance_status),
        )
        .route(
            "/cloudaccounts/{account}/instances/{by}/{value}/finalizer",
            delete(private_handlers::remove_instance_finalizer),
        )
        .route(
            "/cloudaccounts/{account}/loadbalancers/{by}/{value}/status",
            put(private_handlers::update_load_balancer_status),
        )
        .route(
            "/cloudaccounts/{account}/loadbalancers/{by}/{value}/finalizer",
            delete(private_handlers::remove_load_balancer_finalizer),
        );

    let api_routes = Router::new()
        .nest("/cloudaccounts/{account}", account_routes)
        .nest("/private", private_routes)
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
