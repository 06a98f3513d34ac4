//! swarmletd — the swarmlet agent.
//!
//! One process per node, every node equal: membership and the
//! encrypted gossip bus, the service endpoint registry, the persistent
//! state store with anti-entropy, cluster DNS, the scheduler, the
//! workload controller, the ingress proxy and the REST API all live
//! here, wired together at startup.
//!
//! # Usage
//!
//! ```text
//! # first node — prints the join token and encryption key
//! swarmletd --node-name node-1 --bind-addr 10.0.0.1:7946
//!
//! # joining node
//! swarmletd --node-name node-2 --bind-addr 10.0.0.2:7946 \
//!     --join 10.0.0.1:7946 --join-token <T> --encryption-key <K>
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use clap::Parser;
use rand::rngs::OsRng;
use rand::RngCore;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use swarmlet_api::{ApiState, ApiTokenManager};
use swarmlet_cluster::{Cluster, ClusterConfig, TlsFiles, TokenManager};
use swarmlet_discovery::{ClusterHandle, ServiceRegistry, SWEEP_INTERVAL};
use swarmlet_dns::DnsServer;
use swarmlet_proxy::IngressProxy;
use swarmlet_runtime::{ContainerRuntime, PodmanRuntime, StubRuntime};
use swarmlet_scheduler::{MemberView, Scheduler};
use swarmlet_state::{Node, Store};
use swarmlet_workload::{WorkloadController, RECOVERY_DELAY};

/// Interval between full-state anti-entropy broadcasts.
const SYNC_INTERVAL: Duration = Duration::from_secs(30);
/// Interval between snapshot backups.
const BACKUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Parser)]
#[command(name = "swarmletd", about = "swarmlet agent", version)]
struct Cli {
    /// Unique node name in the cluster.
    #[arg(long, env = "NODE_NAME", default_value = "node-1")]
    node_name: String,

    /// Cluster bind address (UDP and TCP).
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:7946")]
    bind_addr: SocketAddr,

    /// HTTP API bind address.
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Data directory for the snapshot, backups and key material.
    #[arg(long, env = "DATA_DIR", default_value = "/var/lib/swarmlet")]
    data_dir: PathBuf,

    /// Comma-separated seed addresses to join.
    #[arg(long, env = "JOIN", value_delimiter = ',')]
    join: Vec<String>,

    /// Join token authorizing this node.
    #[arg(long, env = "JOIN_TOKEN")]
    join_token: Option<String>,

    /// Shared secret for gossip encryption (any string; hashed to 32
    /// bytes). Generated and persisted on the first node when absent.
    #[arg(long, env = "ENCRYPTION_KEY")]
    encryption_key: Option<String>,

    /// Container engine to drive.
    #[arg(long, env = "RUNTIME", default_value = "podman")]
    runtime: RuntimeKind,

    /// Podman API socket.
    #[arg(long, env = "PODMAN_SOCKET", default_value = "/run/podman/podman.sock")]
    podman_socket: PathBuf,

    /// DNS listener port.
    #[arg(long, env = "DNS_PORT", default_value = "53")]
    dns_port: u16,

    /// Authoritative DNS zone.
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    /// Comma-separated upstream resolvers (port 53 assumed if absent).
    #[arg(long, env = "UPSTREAM_DNS", default_value = "8.8.8.8:53,8.8.4.4:53", value_delimiter = ',')]
    upstream_dns: Vec<String>,

    /// Ingress proxy port.
    #[arg(long, default_value = "80")]
    ingress_port: u16,

    /// Serve the ingress data plane on this node.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    enable_ingress: bool,

    /// Require bearer tokens on the API.
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    enable_api_auth: bool,

    /// TLS certificate for the membership TCP channel.
    #[arg(long, env = "TLS_CERT")]
    tls_cert: Option<String>,

    /// TLS private key for the membership TCP channel.
    #[arg(long, env = "TLS_KEY")]
    tls_key: Option<String>,

    /// CA bundle peers are verified against.
    #[arg(long, env = "TLS_CA")]
    tls_ca: Option<String>,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum RuntimeKind {
    Podman,
    /// In-memory stub, for agents without a container engine.
    Stub,
}

/// Registry's view of the cluster: fire-and-forget broadcasts plus
/// node address lookups.
struct BusAdapter(Arc<Cluster>);

impl ClusterHandle for BusAdapter {
    fn broadcast(&self, payload: Vec<u8>) {
        let cluster = self.0.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster.broadcast(&payload).await {
                debug!(error = %e, "registry broadcast failed");
            }
        });
    }

    fn node_address(&self, node_name: &str) -> Option<String> {
        self.0.node(node_name).map(|n| n.address)
    }
}

/// Scheduler's view of the cluster.
struct MembersAdapter(Arc<Cluster>);

impl MemberView for MembersAdapter {
    fn members(&self) -> Vec<Node> {
        self.0.members()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,swarmletd=debug,swarmlet=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    info!(node = %cli.node_name, "swarmlet agent starting");

    std::fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("cannot create data dir {}", cli.data_dir.display()))?;

    // ── Key material and join tokens ───────────────────────────────

    let encryption_key = resolve_encryption_key(&cli)?;
    let tokens = Arc::new(TokenManager::new(Some(encryption_key.clone())));

    // First node with no token: mint one and print the bootstrap pair.
    if cli.join.is_empty() && cli.join_token.is_none() {
        let token = tokens.generate();
        info!(token = %token, "generated join token");
        info!(
            secret = %URL_SAFE.encode(&encryption_key),
            "cluster encryption key (pass as --encryption-key on joining nodes)"
        );
    }

    // ── Membership ─────────────────────────────────────────────────

    let tls = match (&cli.tls_cert, &cli.tls_key) {
        (Some(cert), Some(key)) => {
            let files = TlsFiles {
                cert_file: cert.clone(),
                key_file: key.clone(),
                ca_file: cli.tls_ca.clone().unwrap_or_default(),
            };
            Some(swarmlet_cluster::tls::load(&files).context("loading TLS material")?)
        }
        _ => None,
    };

    let cluster = Arc::new(
        Cluster::start(
            ClusterConfig {
                node_name: cli.node_name.clone(),
                bind_addr: cli.bind_addr,
                advertise_ip: None,
                join_addrs: cli.join.clone(),
                join_token: cli.join_token.clone(),
                encryption_key: Some(encryption_key.clone()),
                labels: HashMap::new(),
            },
            tokens.clone(),
            tls,
        )
        .await
        .context("starting cluster membership")?,
    );
    info!(members = cluster.members().len(), "cluster initialized");

    // ── Core components ────────────────────────────────────────────

    let runtime: Arc<dyn ContainerRuntime> = match cli.runtime {
        RuntimeKind::Podman => Arc::new(PodmanRuntime::new(&cli.podman_socket)),
        RuntimeKind::Stub => {
            warn!("using the stub runtime; no real containers will run");
            Arc::new(StubRuntime::new())
        }
    };

    let store = Arc::new(Store::open(&cli.data_dir).context("opening state store")?);
    let registry = Arc::new(ServiceRegistry::new(Arc::new(BusAdapter(cluster.clone()))));
    let scheduler = Arc::new(Scheduler::new(Arc::new(MembersAdapter(cluster.clone()))));

    // One receive hook: decode the envelope type and route.
    {
        let registry = registry.clone();
        let store = store.clone();
        cluster.set_message_handler(move |payload| {
            dispatch_message(payload, &registry, &store);
        });
    }

    // ── DNS ────────────────────────────────────────────────────────

    let upstreams = cli
        .upstream_dns
        .iter()
        .map(|u| {
            let u = u.trim();
            if u.contains(':') {
                u.to_string()
            } else {
                format!("{u}:53")
            }
        })
        .collect();
    let dns = DnsServer::new(
        registry.clone(),
        &cli.cluster_domain,
        cli.dns_port,
        &cluster.local_address(),
        upstreams,
    );
    dns.start().await.context("starting dns server")?;
    runtime.set_dns(&dns.dns_ip());

    // ── Ingress proxy ──────────────────────────────────────────────

    let proxy = if cli.enable_ingress {
        let proxy = Arc::new(IngressProxy::new(registry.clone(), &cli.node_name));
        let router = proxy.router();
        let addr = SocketAddr::from(([0, 0, 0, 0], cli.ingress_port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .context("binding ingress port")?;
        info!(%addr, "ingress proxy started");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "ingress proxy stopped");
            }
        });
        Some(proxy)
    } else {
        None
    };

    // ── Workload controller ────────────────────────────────────────

    let workload = Arc::new(WorkloadController::new(
        store.clone(),
        scheduler.clone(),
        registry.clone(),
        runtime.clone(),
        proxy,
        cli.node_name.clone(),
    ));

    // ── API tokens ─────────────────────────────────────────────────

    let api_tokens = Arc::new(ApiTokenManager::new());
    if cli.enable_api_auth {
        let token = api_tokens.generate("default", None);
        info!(token = %token, "generated api token; pass as Authorization: Bearer");
    } else {
        warn!("api authentication disabled; not recommended outside trusted networks");
    }

    // ── Periodic tasks ─────────────────────────────────────────────

    let (shutdown_tx, _) = watch::channel(false);
    spawn_sync_loop(
        shutdown_tx.subscribe(),
        cluster.clone(),
        store.clone(),
        workload.clone(),
        cli.node_name.clone(),
    );
    spawn_sweep_loop(shutdown_tx.subscribe(), registry.clone());
    spawn_backup_loop(shutdown_tx.subscribe(), store.clone(), api_tokens.clone());

    // Recovery, once membership has settled.
    {
        let workload = workload.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECOVERY_DELAY).await;
            workload.recover().await;
        });
    }

    // ── API server ─────────────────────────────────────────────────

    let router = swarmlet_api::build_router(
        ApiState {
            store,
            registry,
            cluster: cluster.clone(),
            dns: dns.clone(),
            join_tokens: tokens,
            api_tokens,
            workload,
        },
        cli.enable_api_auth,
    );

    let listener = tokio::net::TcpListener::bind(cli.api_addr)
        .await
        .with_context(|| format!("binding api address {}", cli.api_addr))?;
    info!(addr = %cli.api_addr, "api server starting");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("api server failed")?;

    // ── Shutdown ───────────────────────────────────────────────────

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    dns.stop();
    cluster.shutdown().await;
    info!("swarmlet agent stopped");
    Ok(())
}

/// Route one gossip payload to the component that owns its type.
fn dispatch_message(payload: &[u8], registry: &ServiceRegistry, store: &Store) {
    let msg_type = serde_json::from_slice::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string));

    match msg_type.as_deref() {
        Some("service_update") => {
            if let Err(e) = registry.handle_update(payload) {
                warn!(error = %e, "failed to apply service update");
            }
        }
        Some("state_sync") | Some("state_request") => {
            if let Err(e) = store.handle_sync_message(payload) {
                warn!(error = %e, "failed to apply state sync");
            }
        }
        Some(other) => debug!(msg_type = other, "ignoring unknown cluster message"),
        None => debug!("ignoring undecodable cluster message"),
    }
}

/// Resolve the gossip encryption key, matching the bootstrap order:
/// explicit flag, then the join token, then a key file in the data dir
/// (generated on first boot, mode 0600).
fn resolve_encryption_key(cli: &Cli) -> anyhow::Result<Vec<u8>> {
    if let Some(key) = &cli.encryption_key {
        if !key.is_empty() {
            return Ok(key.as_bytes().to_vec());
        }
    }
    if !cli.join.is_empty() {
        if let Some(token) = &cli.join_token {
            return Ok(token.as_bytes().to_vec());
        }
    }

    let key_path = cli.data_dir.join("encryption.key");
    match std::fs::read(&key_path) {
        Ok(data) if data.len() >= 32 => {
            info!(path = %key_path.display(), "loaded encryption key");
            Ok(data[..32].to_vec())
        }
        Ok(_) => anyhow::bail!("corrupt encryption key file {}", key_path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = vec![0u8; 32];
            OsRng.fill_bytes(&mut key);
            std::fs::write(&key_path, &key)?;
            set_key_mode(&key_path)?;
            info!(path = %key_path.display(), "generated encryption key");
            Ok(key)
        }
        Err(e) => Err(e).context("reading encryption key file"),
    }
}

#[cfg(unix)]
fn set_key_mode(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_key_mode(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Anti-entropy: refresh local endpoints and broadcast the snapshot.
fn spawn_sync_loop(
    mut shutdown: watch::Receiver<bool>,
    cluster: Arc<Cluster>,
    store: Arc<Store>,
    workload: Arc<WorkloadController>,
    node_name: String,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    workload.refresh_local_endpoints();
                    match store.sync_message(&node_name) {
                        Ok(payload) => {
                            if let Err(e) = cluster.broadcast(&payload).await {
                                debug!(error = %e, "state broadcast failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to build state sync message"),
                    }
                }
            }
        }
    });
}

/// Mark endpoints stale past the freshness window.
fn spawn_sweep_loop(mut shutdown: watch::Receiver<bool>, registry: Arc<ServiceRegistry>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => registry.sweep_stale(),
            }
        }
    });
}

/// Hourly snapshot backup and expired API token cleanup.
fn spawn_backup_loop(
    mut shutdown: watch::Receiver<bool>,
    store: Arc<Store>,
    api_tokens: Arc<ApiTokenManager>,
) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(BACKUP_INTERVAL);
        tick.tick().await; // the first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => {
                    if let Err(e) = store.backup() {
                        error!(error = %e, "snapshot backup failed");
                    }
                    api_tokens.cleanup_expired();
                }
            }
        }
    });
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
