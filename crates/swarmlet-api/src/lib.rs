//! swarmlet-api — the HTTP shell over the swarmlet core.
//!
//! Routes cover manifest apply, per-kind CRUD reads and deletes,
//! endpoint/address reads, node listing, the DNS whitelist, and join
//! token issue/revoke. Authentication is optional bearer tokens; the
//! health probe is always open.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use tracing::warn;

use swarmlet_cluster::{Cluster, TokenManager};
use swarmlet_discovery::ServiceRegistry;
use swarmlet_dns::DnsServer;
use swarmlet_state::Store;
use swarmlet_workload::WorkloadController;

pub use auth::{ApiToken, ApiTokenManager};

use handlers::*;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
    pub registry: Arc<ServiceRegistry>,
    pub cluster: Arc<Cluster>,
    pub dns: DnsServer,
    pub join_tokens: Arc<TokenManager>,
    pub api_tokens: Arc<ApiTokenManager>,
    pub workload: Arc<WorkloadController>,
}

/// Build the full API router. With auth enabled, every `/api/v1` route
/// requires a valid bearer token; `/healthz` never does.
pub fn build_router(state: ApiState, enable_auth: bool) -> Router {
    let mut api = Router::new()
        .route("/manifests", post(apply_manifests))
        .route("/deployments", get(list_deployments))
        .route(
            "/deployments/:namespace/:name",
            get(get_deployment).delete(delete_deployment),
        )
        .route("/services", get(list_services))
        .route(
            "/services/:namespace/:name",
            get(get_service).delete(delete_service),
        )
        .route("/services/:namespace/:name/endpoints", get(get_endpoints))
        .route("/services/:namespace/:name/addresses", get(get_addresses))
        .route("/ingresses", get(list_ingresses))
        .route(
            "/ingresses/:namespace/:name",
            get(get_ingress).delete(delete_ingress),
        )
        .route("/pods", get(list_pods))
        .route("/nodes", get(list_nodes))
        .route("/dns/whitelist", get(get_whitelist).put(put_whitelist))
        .route("/dns/whitelist/hosts", post(add_whitelist_host))
        .route("/dns/whitelist/hosts/:host", delete(remove_whitelist_host))
        .route("/tokens", get(list_tokens).post(issue_token))
        .route("/tokens/:token", delete(revoke_token));

    if enable_auth {
        api = api.layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));
    }

    Router::new()
        .route("/healthz", get(health))
        .nest("/api/v1", api)
        .with_state(state)
}

/// Reject requests without a valid `Authorization: Bearer` token.
async fn require_bearer(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| state.api_tokens.validate(token))
        .unwrap_or(false);

    if !authorized {
        warn!(path = %request.uri().path(), "rejected unauthenticated api request");
        return handlers::error_response("unauthorized", StatusCode::UNAUTHORIZED);
    }
    next.run(request).await
}
