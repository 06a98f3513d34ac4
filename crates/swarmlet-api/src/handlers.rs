//! REST API handlers.
//!
//! Thin marshaling over the core components; every response uses the
//! `ApiResponse` envelope.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use swarmlet_discovery::{DiscoveryError, ServiceEndpoint};

use crate::ApiState;

/// Response wrapper for a consistent API shape.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(message: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(message.to_string()),
        }),
    )
        .into_response()
}

/// Serializable projection of a registry endpoint.
#[derive(Serialize)]
struct EndpointView {
    service_name: String,
    namespace: String,
    pod_id: String,
    pod_name: String,
    node_name: String,
    address: String,
    port: u16,
    healthy: bool,
    last_seen: u64,
}

impl From<ServiceEndpoint> for EndpointView {
    fn from(e: ServiceEndpoint) -> Self {
        EndpointView {
            service_name: e.service_name,
            namespace: e.namespace,
            pod_id: e.pod_id,
            pod_name: e.pod_name,
            node_name: e.node_name,
            address: e.address,
            port: e.port,
            healthy: e.healthy,
            last_seen: e.timestamp,
        }
    }
}

// ── Health ─────────────────────────────────────────────────────────

/// GET /healthz
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "status": "ok",
        "node": state.cluster.local_node_name(),
        "members": state.cluster.members().len(),
    }))
}

// ── Manifests ──────────────────────────────────────────────────────

/// POST /api/v1/manifests — apply a YAML manifest stream.
pub async fn apply_manifests(State(state): State<ApiState>, body: Bytes) -> impl IntoResponse {
    match state.workload.apply_manifests(&body).await {
        Ok(applied) => (StatusCode::CREATED, ApiResponse::ok(applied)).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response(),
    }
}

// ── Deployments ────────────────────────────────────────────────────

/// GET /api/v1/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.list_deployments())
}

/// GET /api/v1/deployments/:namespace/:name
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_deployment(&namespace, &name) {
        Ok(deployment) => ApiResponse::ok(deployment).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// DELETE /api/v1/deployments/:namespace/:name
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    state.workload.delete_deployment(&namespace, &name).await;
    ApiResponse::ok("deleted")
}

// ── Services ───────────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.list_services())
}

/// GET /api/v1/services/:namespace/:name
pub async fn get_service(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_service(&namespace, &name) {
        Ok(service) => ApiResponse::ok(service).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// DELETE /api/v1/services/:namespace/:name
pub async fn delete_service(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    state.workload.delete_service(&namespace, &name);
    ApiResponse::ok("deleted")
}

/// GET /api/v1/services/:namespace/:name/endpoints
pub async fn get_endpoints(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.registry.get_endpoints(&name, &namespace) {
        Ok(endpoints) => {
            let views: Vec<EndpointView> = endpoints.into_iter().map(Into::into).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => discovery_error(e),
    }
}

/// GET /api/v1/services/:namespace/:name/addresses
pub async fn get_addresses(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.registry.get_addresses(&name, &namespace) {
        Ok(addresses) => ApiResponse::ok(addresses).into_response(),
        Err(e) => discovery_error(e),
    }
}

fn discovery_error(e: DiscoveryError) -> axum::response::Response {
    let status = match e {
        DiscoveryError::NotFound(_) | DiscoveryError::NoHealthyEndpoints(_) => {
            StatusCode::NOT_FOUND
        }
        DiscoveryError::Malformed(_) => StatusCode::BAD_REQUEST,
    };
    error_response(&e.to_string(), status)
}

// ── Ingresses ──────────────────────────────────────────────────────

/// GET /api/v1/ingresses
pub async fn list_ingresses(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.list_ingresses())
}

/// GET /api/v1/ingresses/:namespace/:name
pub async fn get_ingress(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.store.get_ingress(&namespace, &name) {
        Ok(ingress) => ApiResponse::ok(ingress).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::NOT_FOUND).into_response(),
    }
}

/// DELETE /api/v1/ingresses/:namespace/:name
pub async fn delete_ingress(
    State(state): State<ApiState>,
    Path((namespace, name)): Path<(String, String)>,
) -> impl IntoResponse {
    state.workload.delete_ingress(&namespace, &name);
    ApiResponse::ok("deleted")
}

// ── Pods and nodes ─────────────────────────────────────────────────

/// GET /api/v1/pods
pub async fn list_pods(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.store.list_pods())
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.cluster.members())
}

// ── DNS whitelist ──────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
pub struct WhitelistBody {
    pub enabled: bool,
    #[serde(default)]
    pub hosts: Vec<String>,
}

/// GET /api/v1/dns/whitelist
pub async fn get_whitelist(State(state): State<ApiState>) -> impl IntoResponse {
    let (enabled, hosts) = state.dns.whitelist();
    ApiResponse::ok(WhitelistBody { enabled, hosts })
}

/// PUT /api/v1/dns/whitelist
pub async fn put_whitelist(
    State(state): State<ApiState>,
    Json(body): Json<WhitelistBody>,
) -> impl IntoResponse {
    state.dns.set_whitelist(body.enabled, body.hosts);
    let (enabled, hosts) = state.dns.whitelist();
    ApiResponse::ok(WhitelistBody { enabled, hosts })
}

#[derive(Deserialize)]
pub struct HostBody {
    pub host: String,
}

/// POST /api/v1/dns/whitelist/hosts
pub async fn add_whitelist_host(
    State(state): State<ApiState>,
    Json(body): Json<HostBody>,
) -> impl IntoResponse {
    state.dns.add_whitelist_host(&body.host);
    ApiResponse::ok("added")
}

/// DELETE /api/v1/dns/whitelist/hosts/:host
pub async fn remove_whitelist_host(
    State(state): State<ApiState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    if state.dns.remove_whitelist_host(&host) {
        ApiResponse::ok("removed").into_response()
    } else {
        error_response("host not in whitelist", StatusCode::NOT_FOUND).into_response()
    }
}

// ── Join tokens ────────────────────────────────────────────────────

/// POST /api/v1/tokens — issue a join token.
pub async fn issue_token(State(state): State<ApiState>) -> impl IntoResponse {
    let token = state.join_tokens.generate();
    (
        StatusCode::CREATED,
        ApiResponse::ok(serde_json::json!({ "token": token })),
    )
}

/// GET /api/v1/tokens
pub async fn list_tokens(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.join_tokens.list())
}

/// DELETE /api/v1/tokens/:token
pub async fn revoke_token(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    state.join_tokens.revoke(&token);
    ApiResponse::ok("revoked")
}
