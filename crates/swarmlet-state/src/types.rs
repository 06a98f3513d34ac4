//! Domain types for the swarmlet cluster state.
//!
//! These types represent the declared resources of the cluster
//! (deployments, services, ingresses) and the derived pod records.
//! All types are JSON-serializable for the snapshot file and the
//! gossip wire.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle state of a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// A port exposed by a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: u16,
    /// Host port to publish on. Falls back to the container port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// An environment variable injected into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// A bind mount into a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// One runtime-backed instance created from a deployment template.
///
/// `id` is the runtime container id once the pod has been realized on
/// its node; before that it is a locally generated placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Node this pod was scheduled to. Empty until scheduled.
    #[serde(default)]
    pub node_name: String,
    pub state: PodState,
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
    /// Unix timestamp (seconds) when this pod record was created.
    pub created_at: u64,
}

/// The pod pattern a deployment stamps out per replica.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplate {
    pub image: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub node_selector: HashMap<String, String>,
}

impl Pod {
    /// Stamp a new pod record out of a template.
    ///
    /// The pod starts in `Pending` with a placeholder id; scheduling
    /// fills in `node_name` and realization replaces the id with the
    /// runtime container id.
    pub fn from_template(
        template: &PodTemplate,
        namespace: &str,
        name: &str,
        id: String,
        created_at: u64,
    ) -> Self {
        Pod {
            id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            node_name: String::new(),
            state: PodState::Pending,
            image: template.image.clone(),
            labels: template.labels.clone(),
            annotations: template.annotations.clone(),
            ports: template.ports.clone(),
            env: template.env.clone(),
            volume_mounts: template.volume_mounts.clone(),
            node_selector: template.node_selector.clone(),
            created_at,
        }
    }
}

/// A declared deployment: N replicas of a pod template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub namespace: String,
    pub replicas: u32,
    pub template: PodTemplate,
    /// Label matcher tying services to this deployment's pods.
    #[serde(default)]
    pub selector: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Current instance records, maintained by the workload controller.
    #[serde(default)]
    pub pods: Vec<Pod>,
}

/// A port a service fronts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

/// A declared service: a stable name over a label-selected pod set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub selector: HashMap<String, String>,
    #[serde(default)]
    pub ports: Vec<ServicePort>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// How an ingress path is matched against a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathType {
    Exact,
    Prefix,
    ImplementationSpecific,
}

/// One path rule inside an ingress rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub path_type: PathType,
    pub service_name: String,
    pub service_port: u16,
}

/// One host rule of an ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

/// A declared ingress: HTTP routing rules consumed by the proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingress {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Membership status of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    Ready,
    Gone,
}

/// A node in the cluster, as seen by the membership layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// The full declared state: the unit of persistence and anti-entropy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub deployments: HashMap<String, Deployment>,
    #[serde(default)]
    pub services: HashMap<String, Service>,
    #[serde(default)]
    pub ingresses: HashMap<String, Ingress>,
    #[serde(default)]
    pub pods: HashMap<String, Pod>,
    /// Unix timestamp in milliseconds of the last local mutation.
    #[serde(default)]
    pub last_modified: u64,
    #[serde(default)]
    pub version: u32,
}

/// Build the composite `{namespace}/{name}` key used by all entity maps.
pub fn resource_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Label-subset matching: every selector key must exist in `labels`
/// with the same value. An empty selector matches everything.
pub fn selector_matches(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|lv| lv == v).unwrap_or(false))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn selector_subset_matches() {
        let pod_labels = labels(&[("app", "web"), ("tier", "frontend")]);
        assert!(selector_matches(&pod_labels, &labels(&[("app", "web")])));
        assert!(selector_matches(
            &pod_labels,
            &labels(&[("app", "web"), ("tier", "frontend")])
        ));
    }

    #[test]
    fn selector_value_mismatch_rejected() {
        let pod_labels = labels(&[("app", "web")]);
        assert!(!selector_matches(&pod_labels, &labels(&[("app", "db")])));
        assert!(!selector_matches(&pod_labels, &labels(&[("tier", "web")])));
    }

    #[test]
    fn empty_selector_matches_all() {
        assert!(selector_matches(&labels(&[("app", "web")]), &HashMap::new()));
        assert!(selector_matches(&HashMap::new(), &HashMap::new()));
    }

    #[test]
    fn pod_from_template_copies_spec() {
        let template = PodTemplate {
            image: "nginx:1.25".to_string(),
            labels: labels(&[("app", "web")]),
            ports: vec![ContainerPort {
                name: None,
                container_port: 80,
                host_port: None,
                protocol: "TCP".to_string(),
            }],
            ..Default::default()
        };

        let pod = Pod::from_template(&template, "default", "web-0", "pod-1".to_string(), 1000);
        assert_eq!(pod.name, "web-0");
        assert_eq!(pod.namespace, "default");
        assert_eq!(pod.image, "nginx:1.25");
        assert_eq!(pod.state, PodState::Pending);
        assert_eq!(pod.ports.len(), 1);
        assert!(pod.node_name.is_empty());
    }

    #[test]
    fn resource_key_format() {
        assert_eq!(resource_key("default", "web"), "default/web");
    }

    #[test]
    fn cluster_state_roundtrips_through_json() {
        let mut state = ClusterState::default();
        state.services.insert(
            "default/api".to_string(),
            Service {
                name: "api".to_string(),
                namespace: "default".to_string(),
                selector: labels(&[("app", "api")]),
                ports: vec![ServicePort {
                    name: Some("http".to_string()),
                    port: 8080,
                    target_port: None,
                    protocol: "TCP".to_string(),
                }],
                labels: HashMap::new(),
            },
        );
        state.last_modified = 123_456;

        let bytes = serde_json::to_vec(&state).unwrap();
        let decoded: ClusterState = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, state);
    }
}
