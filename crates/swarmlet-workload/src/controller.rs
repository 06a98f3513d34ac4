//! Workload controller — turns declared state into runtime operations.
//!
//! Apply paths: a deployment is stored, its replicas synthesized from
//! the template, each scheduled, and the ones landing on this node are
//! realized through the container runtime (with the cluster DNS
//! injected). A service is stored and endpoints registered for every
//! known running pod matching its selector. An ingress is stored and
//! handed to the proxy's rule table.
//!
//! Failures stay local: a replica that fails to schedule or start is
//! logged and skipped, the rest of the apply continues. Deletes are
//! idempotent — deleting what is absent is not an error.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use swarmlet_discovery::ServiceRegistry;
use swarmlet_manifest::{Manifest, ManifestError};
use swarmlet_proxy::IngressProxy;
use swarmlet_runtime::ContainerRuntime;
use swarmlet_scheduler::Scheduler;
use swarmlet_state::{
    selector_matches, Deployment, Ingress, Pod, PodState, Service, Store, StoreError,
};

use thiserror::Error;

/// Result type alias for workload operations.
pub type WorkloadResult<T> = Result<T, WorkloadError>;

/// Errors surfaced by apply/delete operations.
#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives deployments, services and ingresses on the local node.
pub struct WorkloadController {
    store: Arc<Store>,
    scheduler: Arc<Scheduler>,
    registry: Arc<ServiceRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Option<Arc<IngressProxy>>,
    local_node: String,
}

impl WorkloadController {
    pub fn new(
        store: Arc<Store>,
        scheduler: Arc<Scheduler>,
        registry: Arc<ServiceRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Option<Arc<IngressProxy>>,
        local_node: String,
    ) -> Self {
        WorkloadController {
            store,
            scheduler,
            registry,
            runtime,
            proxy,
            local_node,
        }
    }

    /// Parse a manifest stream and apply every document.
    ///
    /// Returns `"{kind} {namespace}/{name}"` for each applied resource.
    pub async fn apply_manifests(&self, data: &[u8]) -> WorkloadResult<Vec<String>> {
        let manifests = swarmlet_manifest::parse(data)?;
        let mut applied = Vec::with_capacity(manifests.len());

        for manifest in manifests {
            let kind = manifest.kind();
            let description = match manifest {
                Manifest::Deployment(dep) => {
                    let key = format!("{kind} {}/{}", dep.namespace, dep.name);
                    self.apply_deployment(dep).await;
                    key
                }
                Manifest::Service(svc) => {
                    let key = format!("{kind} {}/{}", svc.namespace, svc.name);
                    self.apply_service(svc);
                    key
                }
                Manifest::Ingress(ing) => {
                    let key = format!("{kind} {}/{}", ing.namespace, ing.name);
                    self.apply_ingress(ing);
                    key
                }
            };
            applied.push(description);
        }
        Ok(applied)
    }

    /// Apply a deployment: synthesize, schedule and realize replicas.
    pub async fn apply_deployment(&self, mut deployment: Deployment) {
        info!(
            deployment = %deployment.name,
            namespace = %deployment.namespace,
            replicas = deployment.replicas,
            "applying deployment"
        );

        deployment.pods.clear();
        for i in 0..deployment.replicas {
            let pod_name = format!("{}-{}", deployment.name, i);
            if let Some(pod) = self.realize_replica(&deployment, &pod_name).await {
                self.store.save_pod(&pod);
                deployment.pods.push(pod);
            }
        }

        self.store.save_deployment(&deployment);
        self.register_matching_services(&deployment);
    }

    /// Synthesize one replica, schedule it, and — when it lands here —
    /// create and start its container. Returns `None` when the replica
    /// could not be scheduled or realized.
    pub(crate) async fn realize_replica(
        &self,
        deployment: &Deployment,
        pod_name: &str,
    ) -> Option<Pod> {
        let mut pod = Pod::from_template(
            &deployment.template,
            &deployment.namespace,
            pod_name,
            Uuid::new_v4().to_string(),
            epoch_secs(),
        );

        let node = match self.scheduler.schedule(&mut pod) {
            Ok(node) => node,
            Err(e) => {
                error!(pod = %pod_name, error = %e, "failed to schedule pod");
                return None;
            }
        };

        if node != self.local_node {
            // Scheduled elsewhere: the owning node realizes it.
            debug!(pod = %pod_name, %node, "pod scheduled to a remote node");
            return Some(pod);
        }

        let placeholder = pod.id.clone();
        let container_id = match self.runtime.create(&pod).await {
            Ok(id) => id,
            Err(e) => {
                error!(pod = %pod_name, error = %e, "failed to create container");
                self.scheduler.remove_pod(&placeholder);
                return None;
            }
        };
        pod.id = container_id.clone();

        if let Err(e) = self.runtime.start(&container_id).await {
            error!(pod = %pod_name, error = %e, "failed to start container");
            pod.state = PodState::Failed;
        } else {
            pod.state = self
                .runtime
                .state(&container_id)
                .await
                .unwrap_or(PodState::Running);
        }

        self.scheduler.rekey(&placeholder, &pod);
        info!(pod = %pod_name, container = %container_id, state = ?pod.state, "pod realized");
        Some(pod)
    }

    /// Apply a service: store it and register endpoints for every known
    /// running pod its selector matches.
    pub fn apply_service(&self, service: Service) {
        info!(service = %service.name, namespace = %service.namespace, "applying service");
        self.store.save_service(&service);

        for pod in self.scheduler.all_pods() {
            if pod.state == PodState::Running
                && pod.namespace == service.namespace
                && selector_matches(&pod.labels, &service.selector)
            {
                self.registry.register(&service, &pod);
            }
        }
    }

    /// Apply an ingress: store it and install its rules in the proxy.
    pub fn apply_ingress(&self, ingress: Ingress) {
        info!(ingress = %ingress.name, namespace = %ingress.namespace, "applying ingress");
        self.store.save_ingress(&ingress);
        if let Some(proxy) = &self.proxy {
            proxy.apply(&ingress);
        }
    }

    /// Delete a deployment: stop and remove its local containers, drop
    /// the scheduling records, then delete from the store.
    pub async fn delete_deployment(&self, namespace: &str, name: &str) {
        let deployment = match self.store.get_deployment(namespace, name) {
            Ok(deployment) => deployment,
            Err(_) => {
                debug!(%namespace, %name, "deployment already absent");
                return;
            }
        };

        for pod in &deployment.pods {
            if pod.node_name == self.local_node {
                if let Err(e) = self.runtime.stop(&pod.id).await {
                    warn!(pod = %pod.name, error = %e, "failed to stop container");
                }
                if let Err(e) = self.runtime.remove(&pod.id).await {
                    warn!(pod = %pod.name, error = %e, "failed to remove container");
                }
            }
            self.scheduler.remove_pod(&pod.id);
            self.store.delete_pod(&pod.namespace, &pod.name);
        }

        self.store.delete_deployment(namespace, name);
        info!(%namespace, %name, "deployment deleted");
    }

    /// Delete a service: deregister its endpoints, then remove it.
    pub fn delete_service(&self, namespace: &str, name: &str) {
        if let Ok(service) = self.store.get_service(namespace, name) {
            for pod in self.scheduler.all_pods() {
                if pod.namespace == service.namespace
                    && selector_matches(&pod.labels, &service.selector)
                {
                    self.registry.deregister(&service, &pod);
                }
            }
        }
        self.store.delete_service(namespace, name);
        info!(%namespace, %name, "service deleted");
    }

    /// Delete an ingress: drop its proxy rules, then remove it.
    pub fn delete_ingress(&self, namespace: &str, name: &str) {
        if let Some(proxy) = &self.proxy {
            proxy.remove(namespace, name);
        }
        self.store.delete_ingress(namespace, name);
        info!(%namespace, %name, "ingress deleted");
    }

    /// Re-register endpoints for local running pods of every stored
    /// service. Called periodically: this is the liveness signal that
    /// keeps local endpoints fresh in peers' registries.
    pub fn refresh_local_endpoints(&self) {
        for service in self.store.list_services() {
            for pod in self.scheduler.pods_on(&self.local_node) {
                if pod.state == PodState::Running
                    && pod.namespace == service.namespace
                    && selector_matches(&pod.labels, &service.selector)
                {
                    self.registry.register(&service, &pod);
                }
            }
        }
    }

    /// Register endpoints of stored services matching a freshly applied
    /// deployment's pods.
    fn register_matching_services(&self, deployment: &Deployment) {
        for service in self.store.list_services() {
            if service.namespace != deployment.namespace {
                continue;
            }
            for pod in &deployment.pods {
                if pod.state == PodState::Running
                    && selector_matches(&pod.labels, &service.selector)
                {
                    self.registry.register(&service, pod);
                }
            }
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub(crate) fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use swarmlet_discovery::ClusterHandle;
    use swarmlet_runtime::StubRuntime;
    use swarmlet_scheduler::MemberView;
    use swarmlet_state::{Node, NodeStatus, PodTemplate, ServicePort};

    struct SingleNode;
    impl MemberView for SingleNode {
        fn members(&self) -> Vec<Node> {
            vec![Node {
                name: "node-1".to_string(),
                address: "10.0.0.1".to_string(),
                status: NodeStatus::Ready,
                labels: HashMap::new(),
            }]
        }
    }

    struct NoopBus;
    impl ClusterHandle for NoopBus {
        fn broadcast(&self, _payload: Vec<u8>) {}
        fn node_address(&self, node_name: &str) -> Option<String> {
            (node_name == "node-1").then(|| "10.0.0.1".to_string())
        }
    }

    struct Fixture {
        controller: WorkloadController,
        runtime: Arc<StubRuntime>,
        store: Arc<Store>,
        registry: Arc<ServiceRegistry>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let scheduler = Arc::new(Scheduler::new(Arc::new(SingleNode)));
        let registry = Arc::new(ServiceRegistry::new(Arc::new(NoopBus)));
        let runtime = Arc::new(StubRuntime::new());

        let controller = WorkloadController::new(
            store.clone(),
            scheduler,
            registry.clone(),
            runtime.clone(),
            None,
            "node-1".to_string(),
        );
        Fixture {
            controller,
            runtime,
            store,
            registry,
            _dir: dir,
        }
    }

    fn deployment(name: &str, replicas: u32) -> Deployment {
        Deployment {
            name: name.to_string(),
            namespace: "default".to_string(),
            replicas,
            template: PodTemplate {
                image: "nginx:1.25".to_string(),
                labels: HashMap::from([("app".to_string(), name.to_string())]),
                ..Default::default()
            },
            selector: HashMap::from([("app".to_string(), name.to_string())]),
            labels: HashMap::new(),
            pods: Vec::new(),
        }
    }

    fn service(name: &str, app: &str) -> Service {
        Service {
            name: name.to_string(),
            namespace: "default".to_string(),
            selector: HashMap::from([("app".to_string(), app.to_string())]),
            ports: vec![ServicePort {
                name: None,
                port: 80,
                target_port: None,
                protocol: "TCP".to_string(),
            }],
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn apply_deployment_realizes_replicas_locally() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 3)).await;

        assert_eq!(f.runtime.container_count(), 3);

        let stored = f.store.get_deployment("default", "web").unwrap();
        assert_eq!(stored.pods.len(), 3);
        // Ids were swapped to the runtime ids.
        assert!(stored.pods.iter().all(|p| p.id.starts_with("stub-")));
        assert!(stored.pods.iter().all(|p| p.state == PodState::Running));
        assert!(stored.pods.iter().all(|p| p.node_name == "node-1"));

        let names: Vec<&str> = stored.pods.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"web-0"));
        assert!(names.contains(&"web-2"));
    }

    #[tokio::test]
    async fn unschedulable_replicas_are_skipped_not_fatal() {
        let f = fixture();
        let mut dep = deployment("pinned", 2);
        dep.template.node_selector = HashMap::from([("gpu".to_string(), "true".to_string())]);

        f.controller.apply_deployment(dep).await;

        // Nothing realized, nothing recorded, but the deployment itself
        // is stored.
        assert_eq!(f.runtime.container_count(), 0);
        let stored = f.store.get_deployment("default", "pinned").unwrap();
        assert!(stored.pods.is_empty());
    }

    #[tokio::test]
    async fn apply_service_registers_matching_running_pods() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 2)).await;
        f.controller.apply_service(service("web-svc", "web"));

        let addrs = f.registry.get_addresses("web-svc", "default").unwrap();
        assert_eq!(addrs.len(), 2);
        assert!(addrs.iter().all(|a| a == "10.0.0.1:80"));
    }

    #[tokio::test]
    async fn service_applied_before_deployment_still_gets_endpoints() {
        let f = fixture();
        f.controller.apply_service(service("web-svc", "web"));
        assert!(f.registry.get_addresses("web-svc", "default").is_err());

        f.controller.apply_deployment(deployment("web", 1)).await;
        let addrs = f.registry.get_addresses("web-svc", "default").unwrap();
        assert_eq!(addrs.len(), 1);
    }

    #[tokio::test]
    async fn selector_mismatch_registers_nothing() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 1)).await;
        f.controller.apply_service(service("db-svc", "db"));

        assert!(f.registry.get_addresses("db-svc", "default").is_err());
    }

    #[tokio::test]
    async fn delete_deployment_removes_local_containers() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 2)).await;
        assert_eq!(f.runtime.container_count(), 2);

        f.controller.delete_deployment("default", "web").await;
        assert_eq!(f.runtime.container_count(), 0);
        assert!(f.store.get_deployment("default", "web").is_err());
        assert!(f.store.list_pods().is_empty());

        // Idempotent.
        f.controller.delete_deployment("default", "web").await;
    }

    #[tokio::test]
    async fn delete_service_deregisters_endpoints() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 1)).await;
        f.controller.apply_service(service("web-svc", "web"));
        assert!(f.registry.get_addresses("web-svc", "default").is_ok());

        f.controller.delete_service("default", "web-svc");
        assert!(f.registry.get_addresses("web-svc", "default").is_err());
        assert!(f.store.get_service("default", "web-svc").is_err());
    }

    #[tokio::test]
    async fn apply_manifests_dispatches_by_kind() {
        let f = fixture();
        let yaml = r#"
kind: Deployment
metadata:
  name: web
spec:
  replicas: 1
  template:
    metadata:
      labels:
        app: web
    spec:
      containers:
        - name: web
          image: nginx
---
kind: Service
metadata:
  name: web-svc
spec:
  selector:
    app: web
  ports:
    - port: 80
"#;
        let applied = f.controller.apply_manifests(yaml.as_bytes()).await.unwrap();
        assert_eq!(
            applied,
            vec!["Deployment default/web", "Service default/web-svc"]
        );
        assert_eq!(f.runtime.container_count(), 1);
        assert!(f.registry.get_addresses("web-svc", "default").is_ok());
    }

    #[tokio::test]
    async fn bad_manifest_is_rejected() {
        let f = fixture();
        assert!(f
            .controller
            .apply_manifests(b"kind: CronJob\nmetadata:\n  name: x\nspec: {}\n")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn refresh_reregisters_local_endpoints() {
        let f = fixture();
        f.controller.apply_deployment(deployment("web", 1)).await;
        f.controller.apply_service(service("web-svc", "web"));

        // Re-registration refreshes the freshness stamp; the endpoint
        // set stays the same.
        f.controller.refresh_local_endpoints();
        let addrs = f.registry.get_addresses("web-svc", "default").unwrap();
        assert_eq!(addrs.len(), 1);
    }
}
