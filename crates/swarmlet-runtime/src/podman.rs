//! Podman libpod REST client over a Unix socket.
//!
//! Speaks HTTP/1.1 directly over `UnixStream` — one connection per
//! call, which matches the low request rate of a control plane. The
//! container spec sent to `containers/create` mirrors the pod record:
//! image, env, labels, port mappings, bind mounts, and the cluster DNS
//! server so containers resolve service names through the local agent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use swarmlet_state::{Pod, PodState};

use crate::{ContainerRuntime, RuntimeError, RuntimeResult, STOP_GRACE_SECS};

const API_BASE: &str = "/v4.0.0/libpod";

/// Podman-backed implementation of [`ContainerRuntime`].
pub struct PodmanRuntime {
    socket_path: PathBuf,
    dns_ip: RwLock<Option<String>>,
}

// ── libpod wire types ──────────────────────────────────────────────

/// Subset of the libpod SpecGenerator we populate.
#[derive(Debug, Serialize)]
struct ContainerSpec<'a> {
    name: &'a str,
    image: &'a str,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    env: HashMap<String, String>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    portmappings: Vec<PortMapping>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mounts: Vec<Mount>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dns_server: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PortMapping {
    container_port: u16,
    host_port: u16,
    protocol: String,
}

#[derive(Debug, Serialize)]
struct Mount {
    destination: String,
    source: String,
    #[serde(rename = "type")]
    mount_type: String,
    options: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct InspectResponse {
    #[serde(rename = "State")]
    state: InspectState,
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "ExitCode", default)]
    exit_code: i32,
}

impl PodmanRuntime {
    /// Point the client at a Podman socket, e.g.
    /// `/run/podman/podman.sock`.
    pub fn new(socket_path: &Path) -> Self {
        PodmanRuntime {
            socket_path: socket_path.to_path_buf(),
            dns_ip: RwLock::new(None),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: String,
        body: Option<Vec<u8>>,
    ) -> RuntimeResult<(StatusCode, Bytes)> {
        let stream = UnixStream::connect(&self.socket_path).await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "podman connection closed with error");
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(path)
            .header(hyper::header::HOST, "d") // unix socket: any host
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.unwrap_or_default())))?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, bytes))
    }

    fn check(&self, id: &str, status: StatusCode, body: &Bytes) -> RuntimeResult<()> {
        // 304: container already in the requested state.
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(RuntimeError::NotFound(id.to_string()));
        }
        Err(RuntimeError::Api {
            status: status.as_u16(),
            message: String::from_utf8_lossy(body).into_owned(),
        })
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn create(&self, pod: &Pod) -> RuntimeResult<String> {
        let env = pod
            .env
            .iter()
            .map(|e| (e.name.clone(), e.value.clone()))
            .collect();

        let portmappings = pod
            .ports
            .iter()
            .map(|p| PortMapping {
                container_port: p.container_port,
                host_port: p.host_port.unwrap_or(p.container_port),
                protocol: p.protocol.to_ascii_lowercase(),
            })
            .collect();

        let mounts = pod
            .volume_mounts
            .iter()
            .map(|v| Mount {
                destination: v.mount_path.clone(),
                source: if v.name.is_empty() {
                    v.mount_path.clone()
                } else {
                    v.name.clone()
                },
                mount_type: "bind".to_string(),
                options: if v.read_only {
                    vec!["ro".to_string()]
                } else {
                    Vec::new()
                },
            })
            .collect();

        let dns_server = self
            .dns_ip
            .read()
            .expect("dns lock")
            .iter()
            .cloned()
            .collect();

        let spec = ContainerSpec {
            name: &pod.name,
            image: &pod.image,
            env,
            labels: pod.labels.clone(),
            portmappings,
            mounts,
            dns_server,
        };

        let body = serde_json::to_vec(&spec)?;
        let (status, bytes) = self
            .request(Method::POST, format!("{API_BASE}/containers/create"), Some(body))
            .await?;
        self.check(&pod.name, status, &bytes)?;

        let created: CreateResponse = serde_json::from_slice(&bytes)?;
        info!(pod = %pod.name, container = %created.id, "container created");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        let (status, bytes) = self
            .request(
                Method::POST,
                format!("{API_BASE}/containers/{id}/start"),
                None,
            )
            .await?;
        self.check(id, status, &bytes)?;
        debug!(container = %id, "container started");
        Ok(())
    }

    async fn stop(&self, id: &str) -> RuntimeResult<()> {
        let (status, bytes) = self
            .request(
                Method::POST,
                format!("{API_BASE}/containers/{id}/stop?timeout={STOP_GRACE_SECS}"),
                None,
            )
            .await?;
        self.check(id, status, &bytes)?;
        debug!(container = %id, "container stopped");
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        let (status, bytes) = self
            .request(
                Method::DELETE,
                format!("{API_BASE}/containers/{id}?force=true"),
                None,
            )
            .await?;
        self.check(id, status, &bytes)?;
        debug!(container = %id, "container removed");
        Ok(())
    }

    async fn state(&self, id: &str) -> RuntimeResult<PodState> {
        let (status, bytes) = self
            .request(
                Method::GET,
                format!("{API_BASE}/containers/{id}/json"),
                None,
            )
            .await?;
        self.check(id, status, &bytes)?;

        let inspect: InspectResponse = serde_json::from_slice(&bytes)?;
        Ok(map_status(&inspect.state))
    }

    async fn pull(&self, image: &str) -> RuntimeResult<()> {
        let reference = urlencode(image);
        let (status, bytes) = self
            .request(
                Method::POST,
                format!("{API_BASE}/images/pull?reference={reference}"),
                None,
            )
            .await?;
        self.check(image, status, &bytes)?;
        info!(%image, "image pulled");
        Ok(())
    }

    async fn logs(&self, id: &str, tail: Option<u32>) -> RuntimeResult<String> {
        let mut path = format!("{API_BASE}/containers/{id}/logs?stdout=true&stderr=true");
        if let Some(tail) = tail {
            path.push_str(&format!("&tail={tail}"));
        }
        let (status, bytes) = self.request(Method::GET, path, None).await?;
        self.check(id, status, &bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn set_dns(&self, ip: &str) {
        *self.dns_ip.write().expect("dns lock") = Some(ip.to_string());
        info!(dns = %ip, "containers will resolve through the cluster dns");
    }
}

fn map_status(state: &InspectState) -> PodState {
    match state.status.as_str() {
        "running" => PodState::Running,
        "created" | "configured" | "initialized" | "paused" => PodState::Pending,
        "exited" | "stopped" => {
            if state.exit_code == 0 {
                PodState::Succeeded
            } else {
                PodState::Failed
            }
        }
        other => {
            warn!(status = other, "unrecognized container status");
            PodState::Unknown
        }
    }
}

/// Percent-encode the handful of characters image references can carry.
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(status: &str, exit_code: i32) -> InspectState {
        InspectState {
            status: status.to_string(),
            exit_code,
        }
    }

    #[test]
    fn status_mapping() {
        assert_eq!(map_status(&state("running", 0)), PodState::Running);
        assert_eq!(map_status(&state("created", 0)), PodState::Pending);
        assert_eq!(map_status(&state("exited", 0)), PodState::Succeeded);
        assert_eq!(map_status(&state("exited", 137)), PodState::Failed);
        assert_eq!(map_status(&state("weird", 0)), PodState::Unknown);
    }

    #[test]
    fn image_references_are_encoded() {
        assert_eq!(
            urlencode("docker.io/library/nginx:1.25"),
            "docker.io%2Flibrary%2Fnginx%3A1.25"
        );
        assert_eq!(urlencode("nginx"), "nginx");
    }

    #[test]
    fn container_spec_serializes_expected_fields() {
        let pod = Pod {
            id: "p1".to_string(),
            name: "web-0".to_string(),
            namespace: "default".to_string(),
            node_name: "node-1".to_string(),
            state: PodState::Pending,
            image: "nginx:1.25".to_string(),
            labels: HashMap::from([("app".to_string(), "web".to_string())]),
            annotations: HashMap::new(),
            ports: vec![swarmlet_state::ContainerPort {
                name: None,
                container_port: 80,
                host_port: Some(8080),
                protocol: "TCP".to_string(),
            }],
            env: vec![swarmlet_state::EnvVar {
                name: "MODE".to_string(),
                value: "prod".to_string(),
            }],
            volume_mounts: vec![swarmlet_state::VolumeMount {
                name: "data".to_string(),
                mount_path: "/data".to_string(),
                read_only: true,
            }],
            node_selector: HashMap::new(),
            created_at: 1000,
        };

        let runtime = PodmanRuntime::new(Path::new("/tmp/podman.sock"));
        runtime.set_dns("10.0.0.5");

        // Rebuild the spec the same way create() does.
        let spec = ContainerSpec {
            name: &pod.name,
            image: &pod.image,
            env: pod
                .env
                .iter()
                .map(|e| (e.name.clone(), e.value.clone()))
                .collect(),
            labels: pod.labels.clone(),
            portmappings: vec![PortMapping {
                container_port: 80,
                host_port: 8080,
                protocol: "tcp".to_string(),
            }],
            mounts: vec![Mount {
                destination: "/data".to_string(),
                source: "data".to_string(),
                mount_type: "bind".to_string(),
                options: vec!["ro".to_string()],
            }],
            dns_server: vec![runtime.dns_ip.read().unwrap().clone().unwrap()],
        };

        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&spec).unwrap()).unwrap();
        assert_eq!(json["name"], "web-0");
        assert_eq!(json["image"], "nginx:1.25");
        assert_eq!(json["env"]["MODE"], "prod");
        assert_eq!(json["portmappings"][0]["host_port"], 8080);
        assert_eq!(json["portmappings"][0]["protocol"], "tcp");
        assert_eq!(json["mounts"][0]["type"], "bind");
        assert_eq!(json["mounts"][0]["options"][0], "ro");
        assert_eq!(json["dns_server"][0], "10.0.0.5");
    }
}
