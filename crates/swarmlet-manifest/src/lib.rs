//! swarmlet-manifest — parses the Kubernetes manifest subset.
//!
//! Accepts a multi-document YAML stream of Deployment, Service and
//! Ingress manifests and converts them into the cluster's own records.
//! Only the first container of a pod template is honored; a service
//! port referenced by name falls back to port 80.

use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use swarmlet_state::{
    ContainerPort, Deployment, EnvVar, Ingress, IngressPath, IngressRule, PathType, PodTemplate,
    Service, ServicePort, VolumeMount,
};

/// Result type alias for manifest parsing.
pub type ManifestResult<T> = Result<T, ManifestError>;

/// Errors that can occur while parsing manifests.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),

    #[error("manifest missing {0}")]
    Missing(&'static str),
}

/// A parsed manifest document.
#[derive(Debug, Clone)]
pub enum Manifest {
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Deployment(_) => "Deployment",
            Manifest::Service(_) => "Service",
            Manifest::Ingress(_) => "Ingress",
        }
    }
}

/// Parse a (possibly multi-document) YAML byte stream.
pub fn parse(data: &[u8]) -> ManifestResult<Vec<Manifest>> {
    let mut manifests = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(data) {
        let raw = RawDocument::deserialize(document)?;
        manifests.push(convert(raw)?);
    }
    Ok(manifests)
}

// ── Kubernetes-shaped raw documents ────────────────────────────────

#[derive(Debug, Deserialize)]
struct RawDocument {
    kind: Option<String>,
    metadata: Option<Metadata>,
    spec: Option<serde_yaml::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct Metadata {
    name: Option<String>,
    #[serde(default = "default_namespace")]
    namespace: String,
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeploymentSpec {
    #[serde(default = "default_replicas")]
    replicas: u32,
    #[serde(default)]
    selector: SelectorSpec,
    template: TemplateSpec,
}

fn default_replicas() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorSpec {
    #[serde(default)]
    match_labels: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateSpec {
    #[serde(default)]
    metadata: TemplateMetadata,
    spec: PodSpec,
}

#[derive(Debug, Default, Deserialize)]
struct TemplateMetadata {
    #[serde(default)]
    labels: HashMap<String, String>,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
    #[serde(default)]
    node_selector: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerSpec {
    image: String,
    #[serde(default)]
    ports: Vec<PortSpec>,
    #[serde(default)]
    env: Vec<EnvSpec>,
    #[serde(default)]
    volume_mounts: Vec<MountSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortSpec {
    container_port: u16,
    #[serde(default)]
    host_port: Option<u16>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_protocol")]
    protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Deserialize)]
struct EnvSpec {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountSpec {
    name: String,
    mount_path: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceSpec {
    #[serde(default)]
    selector: HashMap<String, String>,
    #[serde(default)]
    ports: Vec<ServicePortSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicePortSpec {
    #[serde(default)]
    name: Option<String>,
    port: u16,
    #[serde(default)]
    target_port: Option<u16>,
    #[serde(default = "default_protocol")]
    protocol: String,
}

#[derive(Debug, Deserialize)]
struct IngressSpec {
    #[serde(default)]
    rules: Vec<IngressRuleSpec>,
}

#[derive(Debug, Deserialize)]
struct IngressRuleSpec {
    #[serde(default)]
    host: String,
    http: Option<HttpRuleSpec>,
}

#[derive(Debug, Deserialize)]
struct HttpRuleSpec {
    #[serde(default)]
    paths: Vec<HttpPathSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpPathSpec {
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    path_type: Option<String>,
    backend: BackendSpec,
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Deserialize)]
struct BackendSpec {
    service: Option<BackendServiceSpec>,
}

#[derive(Debug, Deserialize)]
struct BackendServiceSpec {
    name: String,
    #[serde(default)]
    port: BackendPortSpec,
}

#[derive(Debug, Default, Deserialize)]
struct BackendPortSpec {
    #[serde(default)]
    number: Option<u16>,
}

// ── Conversion ─────────────────────────────────────────────────────

fn convert(raw: RawDocument) -> ManifestResult<Manifest> {
    let kind = raw.kind.ok_or(ManifestError::Missing("kind"))?;
    let metadata = raw.metadata.unwrap_or_default();
    let name = metadata
        .name
        .clone()
        .ok_or(ManifestError::Missing("metadata.name"))?;
    let spec = raw.spec.ok_or(ManifestError::Missing("spec"))?;

    match kind.as_str() {
        "Deployment" => {
            let spec: DeploymentSpec = serde_yaml::from_value(spec)?;
            let container = spec
                .template
                .spec
                .containers
                .into_iter()
                .next()
                .ok_or(ManifestError::Missing("template.spec.containers"))?;

            let template = PodTemplate {
                image: container.image,
                labels: spec.template.metadata.labels,
                annotations: spec.template.metadata.annotations,
                ports: container
                    .ports
                    .into_iter()
                    .map(|p| ContainerPort {
                        name: p.name,
                        container_port: p.container_port,
                        host_port: p.host_port,
                        protocol: p.protocol,
                    })
                    .collect(),
                env: container
                    .env
                    .into_iter()
                    .map(|e| EnvVar {
                        name: e.name,
                        value: e.value,
                    })
                    .collect(),
                volume_mounts: container
                    .volume_mounts
                    .into_iter()
                    .map(|v| VolumeMount {
                        name: v.name,
                        mount_path: v.mount_path,
                        read_only: v.read_only,
                    })
                    .collect(),
                node_selector: spec.template.spec.node_selector,
            };

            Ok(Manifest::Deployment(Deployment {
                name,
                namespace: metadata.namespace,
                replicas: spec.replicas,
                template,
                selector: spec.selector.match_labels,
                labels: metadata.labels,
                pods: Vec::new(),
            }))
        }
        "Service" => {
            let spec: ServiceSpec = serde_yaml::from_value(spec)?;
            Ok(Manifest::Service(Service {
                name,
                namespace: metadata.namespace,
                selector: spec.selector,
                ports: spec
                    .ports
                    .into_iter()
                    .map(|p| ServicePort {
                        name: p.name,
                        port: p.port,
                        target_port: p.target_port,
                        protocol: p.protocol,
                    })
                    .collect(),
                labels: metadata.labels,
            }))
        }
        "Ingress" => {
            let spec: IngressSpec = serde_yaml::from_value(spec)?;
            let rules = spec
                .rules
                .into_iter()
                .map(|rule| IngressRule {
                    host: rule.host,
                    paths: rule
                        .http
                        .map(|http| {
                            http.paths
                                .into_iter()
                                .filter_map(|p| {
                                    let service = p.backend.service?;
                                    Some(IngressPath {
                                        path: p.path,
                                        path_type: parse_path_type(p.path_type.as_deref()),
                                        service_name: service.name,
                                        // Named ports are not resolved;
                                        // fall back to 80.
                                        service_port: service.port.number.unwrap_or(80),
                                    })
                                })
                                .collect()
                        })
                        .unwrap_or_default(),
                })
                .collect();

            Ok(Manifest::Ingress(Ingress {
                name,
                namespace: metadata.namespace,
                rules,
                labels: metadata.labels,
                annotations: metadata.annotations,
            }))
        }
        other => Err(ManifestError::UnsupportedKind(other.to_string())),
    }
}

fn parse_path_type(path_type: Option<&str>) -> PathType {
    match path_type {
        Some("Exact") => PathType::Exact,
        Some("Prefix") => PathType::Prefix,
        _ => PathType::ImplementationSpecific,
    }
}
