//! swarmlet-proxy — the ingress HTTP data plane.
//!
//! A catch-all router that matches requests against the installed
//! ingress rules (host + path), resolves the backing service through
//! the endpoint registry — the same read path DNS uses — and forwards
//! the request to one endpoint, round-robin. An endpoint on the local
//! node is reached over loopback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use swarmlet_discovery::ServiceRegistry;
use swarmlet_state::{resource_key, Ingress, IngressPath, PathType};

type HttpClient = Client<HttpConnector, Body>;

struct ProxyInner {
    registry: Arc<ServiceRegistry>,
    /// Installed ingresses, keyed `{namespace}/{name}`.
    rules: RwLock<HashMap<String, Ingress>>,
    /// Round-robin cursor per `{namespace}/{service}`.
    round_robin: RwLock<HashMap<String, usize>>,
    local_node: String,
    client: HttpClient,
}

/// The ingress reverse proxy.
#[derive(Clone)]
pub struct IngressProxy {
    inner: Arc<ProxyInner>,
}

impl IngressProxy {
    pub fn new(registry: Arc<ServiceRegistry>, local_node: &str) -> Self {
        IngressProxy {
            inner: Arc::new(ProxyInner {
                registry,
                rules: RwLock::new(HashMap::new()),
                round_robin: RwLock::new(HashMap::new()),
                local_node: local_node.to_string(),
                client: Client::builder(TokioExecutor::new()).build_http(),
            }),
        }
    }

    /// Install (or replace) an ingress's rules.
    pub fn apply(&self, ingress: &Ingress) {
        let key = resource_key(&ingress.namespace, &ingress.name);
        self.inner
            .rules
            .write()
            .expect("rules lock")
            .insert(key.clone(), ingress.clone());
        info!(ingress = %key, rules = ingress.rules.len(), "installed ingress rules");
    }

    /// Drop an ingress's rules.
    pub fn remove(&self, namespace: &str, name: &str) {
        let key = resource_key(namespace, name);
        self.inner.rules.write().expect("rules lock").remove(&key);
        info!(ingress = %key, "removed ingress rules");
    }

    /// Number of installed ingresses.
    pub fn rule_count(&self) -> usize {
        self.inner.rules.read().expect("rules lock").len()
    }

    /// The catch-all router serving the data plane.
    pub fn router(&self) -> Router {
        Router::new().fallback(handle).with_state(self.clone())
    }

    /// Find the ingress path matching a request, with its namespace.
    fn match_rule(&self, host: &str, path: &str) -> Option<(String, IngressPath)> {
        let rules = self.inner.rules.read().expect("rules lock");
        for ingress in rules.values() {
            for rule in &ingress.rules {
                if !rule.host.is_empty() && rule.host != host {
                    continue;
                }
                for p in &rule.paths {
                    if matches_path(path, &p.path, p.path_type) {
                        return Some((ingress.namespace.clone(), p.clone()));
                    }
                }
            }
        }
        None
    }

    /// Round-robin one endpoint of the backing service. Local pods go
    /// over loopback.
    fn select_target(&self, namespace: &str, service: &str) -> Option<String> {
        let endpoints = self.inner.registry.get_endpoints(service, namespace).ok()?;
        if endpoints.is_empty() {
            return None;
        }

        let rr_key = format!("{namespace}/{service}");
        let idx = {
            let mut cursors = self.inner.round_robin.write().expect("round robin lock");
            let cursor = cursors.entry(rr_key).or_insert(0);
            let idx = *cursor % endpoints.len();
            *cursor = (*cursor + 1) % endpoints.len();
            idx
        };

        let endpoint = &endpoints[idx];
        let target = if endpoint.node_name == self.inner.local_node {
            format!("127.0.0.1:{}", endpoint.port)
        } else {
            format!("{}:{}", endpoint.address, endpoint.port)
        };
        Some(target)
    }
}

async fn handle(State(proxy): State<IngressProxy>, req: Request) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string();
    let path = req.uri().path().to_string();

    let Some((namespace, rule)) = proxy.match_rule(&host, &path) else {
        debug!(%host, %path, "no ingress rule matched");
        return error_response(StatusCode::NOT_FOUND, "no ingress rule found");
    };

    let Some(target) = proxy.select_target(&namespace, &rule.service_name) else {
        warn!(service = %rule.service_name, %namespace, "no healthy backend for ingress");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
    };

    let (mut parts, body) = req.into_parts();
    let path_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{target}{path_query}");
    parts.uri = match uri.parse() {
        Ok(uri) => uri,
        Err(e) => {
            warn!(%uri, error = %e, "bad proxy target uri");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "bad target");
        }
    };

    debug!(%host, %path, %target, "proxying request");
    match proxy.inner.client.request(Request::from_parts(parts, body)).await {
        Ok(response) => response.map(Body::new).into_response(),
        Err(e) => {
            warn!(%target, error = %e, "backend request failed");
            error_response(StatusCode::BAD_GATEWAY, "backend unreachable")
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Empty rule paths match everything; Exact compares whole paths;
/// Prefix and ImplementationSpecific are prefix matches.
fn matches_path(request_path: &str, rule_path: &str, path_type: PathType) -> bool {
    if rule_path.is_empty() {
        return true;
    }
    match path_type {
        PathType::Exact => request_path == rule_path,
        PathType::Prefix | PathType::ImplementationSpecific => {
            request_path.starts_with(rule_path)
        }
    }
}
