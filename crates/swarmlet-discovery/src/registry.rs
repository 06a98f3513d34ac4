//! Service endpoint registry.
//!
//! Maps `(service, namespace)` to the set of endpoints currently
//! backing it. Local registrations are broadcast to the cluster; peer
//! updates arrive through `handle_update`. Freshness is tracked on the
//! monotonic clock: an endpoint not refreshed within the window is
//! marked unhealthy by the periodic sweep and filtered from every read
//! path. Re-registration (the periodic state broadcast re-registers
//! local endpoints) is the liveness signal — there is no probing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use swarmlet_state::{Pod, Service};

use crate::error::{DiscoveryError, DiscoveryResult};

/// How long an endpoint stays eligible without a refresh.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(30);
/// How often the sweep marks silent endpoints unhealthy.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Message type tag for registry updates on the cluster bus.
pub const MSG_SERVICE_UPDATE: &str = "service_update";

/// The narrow view of the membership layer the registry needs.
///
/// `broadcast` is fire-and-forget: the bus is lossy by design and the
/// periodic snapshot repairs losses.
pub trait ClusterHandle: Send + Sync {
    fn broadcast(&self, payload: Vec<u8>);
    fn node_address(&self, node_name: &str) -> Option<String>;
}

/// One endpoint backing a service.
#[derive(Debug, Clone)]
pub struct ServiceEndpoint {
    pub service_name: String,
    pub namespace: String,
    pub pod_id: String,
    pub pod_name: String,
    pub node_name: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
    /// Wall-clock unix seconds of the last update (informational).
    pub timestamp: u64,
    /// Monotonic instant of the last refresh (drives freshness).
    pub last_seen: Instant,
}

impl ServiceEndpoint {
    fn fresh(&self, window: Duration) -> bool {
        self.healthy && self.last_seen.elapsed() <= window
    }
}

/// A registry update as carried on the cluster bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUpdate {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub action: String,
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub namespace: String,
    #[serde(rename = "podID")]
    pub pod_id: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
    pub address: String,
    pub port: u16,
    pub healthy: bool,
    pub timestamp: u64,
}

/// In-memory registry of service endpoints, shared across tasks.
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, HashMap<String, ServiceEndpoint>>>,
    cluster: Arc<dyn ClusterHandle>,
    freshness: Duration,
}

fn service_key(service: &str, namespace: &str) -> String {
    format!("{service}.{namespace}")
}

fn endpoint_id(namespace: &str, service: &str, pod_id: &str) -> String {
    format!("{namespace}-{service}-{pod_id}")
}

impl ServiceRegistry {
    pub fn new(cluster: Arc<dyn ClusterHandle>) -> Self {
        Self::with_freshness(cluster, FRESHNESS_WINDOW)
    }

    /// Override the freshness window (tests shrink it).
    pub fn with_freshness(cluster: Arc<dyn ClusterHandle>, freshness: Duration) -> Self {
        ServiceRegistry {
            services: RwLock::new(HashMap::new()),
            cluster,
            freshness,
        }
    }

    /// Register an endpoint for `pod` under `service` and broadcast it.
    ///
    /// The endpoint address is the pod's node address as known to the
    /// membership layer, falling back to the node name itself.
    pub fn register(&self, service: &Service, pod: &Pod) {
        let port = service.ports.first().map(|p| p.port).unwrap_or_default();
        let address = self
            .cluster
            .node_address(&pod.node_name)
            .unwrap_or_else(|| pod.node_name.clone());

        let endpoint = ServiceEndpoint {
            service_name: service.name.clone(),
            namespace: service.namespace.clone(),
            pod_id: pod.id.clone(),
            pod_name: pod.name.clone(),
            node_name: pod.node_name.clone(),
            address,
            port,
            healthy: true,
            timestamp: epoch_secs(),
            last_seen: Instant::now(),
        };

        let key = service_key(&service.name, &service.namespace);
        let id = endpoint_id(&service.namespace, &service.name, &pod.id);
        {
            let mut services = self.services.write().expect("registry lock");
            services
                .entry(key)
                .or_default()
                .insert(id, endpoint.clone());
        }

        self.broadcast_update(&endpoint, "register");
        info!(
            service = %service.name,
            pod = %pod.name,
            node = %pod.node_name,
            "registered service endpoint"
        );
    }

    /// Remove an endpoint and broadcast the deregistration.
    pub fn deregister(&self, service: &Service, pod: &Pod) {
        let key = service_key(&service.name, &service.namespace);
        let id = endpoint_id(&service.namespace, &service.name, &pod.id);

        let removed = {
            let mut services = self.services.write().expect("registry lock");
            let removed = services
                .get_mut(&key)
                .and_then(|endpoints| endpoints.remove(&id));
            if services.get(&key).is_some_and(|e| e.is_empty()) {
                services.remove(&key);
            }
            removed
        };

        if let Some(endpoint) = removed {
            self.broadcast_update(&endpoint, "deregister");
            info!(service = %service.name, pod = %pod.name, "deregistered service endpoint");
        }
    }

    /// Apply a registry update received from a peer.
    ///
    /// Messages whose `type` is not `service_update` are ignored.
    pub fn handle_update(&self, data: &[u8]) -> DiscoveryResult<()> {
        let update: ServiceUpdate = serde_json::from_slice(data)?;
        if update.msg_type != MSG_SERVICE_UPDATE {
            return Ok(());
        }

        let key = service_key(&update.service_name, &update.namespace);
        let id = endpoint_id(&update.namespace, &update.service_name, &update.pod_id);
        let mut services = self.services.write().expect("registry lock");

        match update.action.as_str() {
            "register" => {
                let endpoint = ServiceEndpoint {
                    service_name: update.service_name,
                    namespace: update.namespace,
                    pod_id: update.pod_id,
                    pod_name: update.pod_name,
                    node_name: update.node_name,
                    address: update.address,
                    port: update.port,
                    healthy: update.healthy,
                    timestamp: update.timestamp,
                    last_seen: Instant::now(),
                };
                services.entry(key.clone()).or_default().insert(id, endpoint);
                debug!(service = %key, "applied peer registration");
            }
            "deregister" => {
                if let Some(endpoints) = services.get_mut(&key) {
                    endpoints.remove(&id);
                    if endpoints.is_empty() {
                        services.remove(&key);
                    }
                    debug!(service = %key, "applied peer deregistration");
                }
            }
            other => {
                debug!(action = other, "ignoring unknown registry action");
            }
        }
        Ok(())
    }

    /// `"{address}:{port}"` for every fresh endpoint of a service.
    pub fn get_addresses(&self, service: &str, namespace: &str) -> DiscoveryResult<Vec<String>> {
        let key = service_key(service, namespace);
        let services = self.services.read().expect("registry lock");
        let endpoints = services
            .get(&key)
            .ok_or_else(|| DiscoveryError::NotFound(key.clone()))?;

        let addresses: Vec<String> = endpoints
            .values()
            .filter(|e| e.fresh(self.freshness))
            .map(|e| format!("{}:{}", e.address, e.port))
            .collect();

        if addresses.is_empty() {
            return Err(DiscoveryError::NoHealthyEndpoints(key));
        }
        Ok(addresses)
    }

    /// Structured records for every fresh endpoint of a service.
    ///
    /// A known service with only stale endpoints yields an empty list,
    /// not an error.
    pub fn get_endpoints(
        &self,
        service: &str,
        namespace: &str,
    ) -> DiscoveryResult<Vec<ServiceEndpoint>> {
        let key = service_key(service, namespace);
        let services = self.services.read().expect("registry lock");
        let endpoints = services
            .get(&key)
            .ok_or_else(|| DiscoveryError::NotFound(key))?;

        Ok(endpoints
            .values()
            .filter(|e| e.fresh(self.freshness))
            .cloned()
            .collect())
    }

    /// All service keys with their currently-fresh endpoints.
    pub fn list_services(&self) -> HashMap<String, Vec<ServiceEndpoint>> {
        let services = self.services.read().expect("registry lock");
        let mut result = HashMap::new();
        for (key, endpoints) in services.iter() {
            let fresh: Vec<ServiceEndpoint> = endpoints
                .values()
                .filter(|e| e.fresh(self.freshness))
                .cloned()
                .collect();
            if !fresh.is_empty() {
                result.insert(key.clone(), fresh);
            }
        }
        result
    }

    /// Mark endpoints silent past the freshness window as unhealthy.
    ///
    /// Called every `SWEEP_INTERVAL` by the agent. No probing: an
    /// unhealthy endpoint comes back by being re-registered.
    pub fn sweep_stale(&self) {
        let mut services = self.services.write().expect("registry lock");
        for endpoints in services.values_mut() {
            for (id, endpoint) in endpoints.iter_mut() {
                if endpoint.healthy && endpoint.last_seen.elapsed() > self.freshness {
                    endpoint.healthy = false;
                    debug!(endpoint = %id, "marked endpoint unhealthy");
                }
            }
        }
    }

    fn broadcast_update(&self, endpoint: &ServiceEndpoint, action: &str) {
        let update = ServiceUpdate {
            msg_type: MSG_SERVICE_UPDATE.to_string(),
            action: action.to_string(),
            service_name: endpoint.service_name.clone(),
            namespace: endpoint.namespace.clone(),
            pod_id: endpoint.pod_id.clone(),
            pod_name: endpoint.pod_name.clone(),
            node_name: endpoint.node_name.clone(),
            address: endpoint.address.clone(),
            port: endpoint.port,
            healthy: endpoint.healthy,
            timestamp: epoch_secs(),
        };
        match serde_json::to_vec(&update) {
            Ok(bytes) => self.cluster.broadcast(bytes),
            Err(e) => warn!(error = %e, "failed to serialize service update"),
        }
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
