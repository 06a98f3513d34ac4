//! DNS server: authoritative for the cluster zone, forwarding for
//! everything else.
//!
//! Cluster names resolve from the service registry:
//!
//! - A:   `{service}.{namespace}.{zone}` and the Kubernetes-compatible
//!        `{service}.{namespace}.svc.{zone}`
//! - SRV: `_{port}._{proto}.{service}.{namespace}[.svc].{zone}`
//!
//! Non-cluster questions go through the upstream chain: UDP first with
//! a 5 s timeout, TCP retry on error, next upstream on failure. When
//! the whitelist is enabled, blocked questions get REFUSED and any
//! upstream answer whose CNAME targets fall outside the whitelist is
//! discarded. All upstreams failing yields SERVFAIL.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, SRV};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarmlet_discovery::ServiceRegistry;

use crate::error::DnsResult;
use crate::whitelist::Whitelist;

/// Default authoritative zone.
pub const DEFAULT_CLUSTER_DOMAIN: &str = "cluster.local";
/// Default listener port.
pub const DEFAULT_DNS_PORT: u16 = 53;
/// TTL for cluster records.
const CLUSTER_TTL: u32 = 60;
/// Per-upstream, per-transport exchange timeout.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

struct DnsInner {
    registry: Arc<ServiceRegistry>,
    /// Lowercased zone without a trailing dot.
    zone: String,
    port: u16,
    local_ip: String,
    upstreams: Vec<String>,
    whitelist: RwLock<Whitelist>,
    shutdown: watch::Sender<bool>,
}

/// The cluster DNS server.
#[derive(Clone)]
pub struct DnsServer {
    inner: Arc<DnsInner>,
}

impl DnsServer {
    /// Create a server. Empty zone, zero port or empty upstream list
    /// fall back to the defaults.
    pub fn new(
        registry: Arc<ServiceRegistry>,
        zone: &str,
        port: u16,
        local_ip: &str,
        upstreams: Vec<String>,
    ) -> Self {
        let zone = if zone.is_empty() {
            DEFAULT_CLUSTER_DOMAIN.to_string()
        } else {
            zone.trim_end_matches('.').to_ascii_lowercase()
        };
        let port = if port == 0 { DEFAULT_DNS_PORT } else { port };
        let upstreams = if upstreams.is_empty() {
            vec!["8.8.8.8:53".to_string(), "8.8.4.4:53".to_string()]
        } else {
            upstreams
        };

        let (shutdown, _) = watch::channel(false);
        DnsServer {
            inner: Arc::new(DnsInner {
                registry,
                zone,
                port,
                local_ip: local_ip.to_string(),
                upstreams,
                whitelist: RwLock::new(Whitelist::new()),
                shutdown,
            }),
        }
    }

    /// Bind UDP and TCP listeners on all interfaces and serve.
    pub async fn start(&self) -> DnsResult<SocketAddr> {
        self.start_on(([0, 0, 0, 0], self.inner.port).into()).await
    }

    /// Bind on a specific address (tests use an ephemeral loopback
    /// port). Returns the bound address.
    pub async fn start_on(&self, bind: SocketAddr) -> DnsResult<SocketAddr> {
        let udp = Arc::new(UdpSocket::bind(bind).await?);
        let bound = udp.local_addr()?;
        let tcp = TcpListener::bind(SocketAddr::new(bind.ip(), bound.port())).await?;

        self.spawn_udp_loop(udp);
        self.spawn_tcp_loop(tcp);

        info!(
            addr = %bound,
            zone = %self.inner.zone,
            upstreams = ?self.inner.upstreams,
            "dns server started"
        );
        Ok(bound)
    }

    /// Stop the listener loops.
    pub fn stop(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    // ── Whitelist surface ──────────────────────────────────────────

    pub fn set_whitelist(&self, enabled: bool, hosts: Vec<String>) {
        let mut wl = self.inner.whitelist.write().expect("whitelist lock");
        wl.set(enabled, hosts);
        info!(enabled, hosts = wl.hosts().len(), "dns whitelist updated");
    }

    pub fn whitelist(&self) -> (bool, Vec<String>) {
        let wl = self.inner.whitelist.read().expect("whitelist lock");
        (wl.enabled(), wl.hosts())
    }

    pub fn add_whitelist_host(&self, host: &str) {
        self.inner
            .whitelist
            .write()
            .expect("whitelist lock")
            .add(host);
    }

    pub fn remove_whitelist_host(&self, host: &str) -> bool {
        self.inner
            .whitelist
            .write()
            .expect("whitelist lock")
            .remove(host)
    }

    // ── Resolver address for containers ────────────────────────────

    /// The IP containers should use as their resolver.
    pub fn dns_ip(&self) -> String {
        if self.inner.local_ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.inner.local_ip.clone()
        }
    }

    /// The full `ip:port` resolver address.
    pub fn dns_address(&self) -> String {
        format!("{}:{}", self.dns_ip(), self.inner.port)
    }

    // ── Query handling ─────────────────────────────────────────────

    /// Handle one wire-format query, returning the wire-format reply.
    ///
    /// `None` means the request did not parse and is dropped.
    pub async fn handle_query(&self, data: &[u8]) -> Option<Vec<u8>> {
        let request = match Message::from_vec(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping unparseable dns query");
                return None;
            }
        };

        if self.is_cluster_query(&request) {
            let reply = self.answer_cluster(&request);
            return reply.to_vec().ok();
        }
        Some(self.forward(data, &request).await)
    }

    /// A question whose name ends with the cluster zone (or equals it)
    /// is answered authoritatively.
    fn is_cluster_query(&self, request: &Message) -> bool {
        request.queries().iter().any(|q| {
            let name = q.name().to_ascii().trim_end_matches('.').to_ascii_lowercase();
            name == self.inner.zone || name.ends_with(&format!(".{}", self.inner.zone))
        })
    }

    fn answer_cluster(&self, request: &Message) -> Message {
        let mut reply = reply_to(request, ResponseCode::NoError);
        reply.set_authoritative(true);

        for query in request.queries() {
            debug!(name = %query.name(), qtype = ?query.query_type(), "cluster dns query");
            match query.query_type() {
                RecordType::A => self.answer_a(&mut reply, query),
                RecordType::SRV => self.answer_srv(&mut reply, query),
                // IPv6 and anything else: an empty zero-TTL stub, never
                // a failure.
                _ => {
                    reply.add_answer(stub_answer(query.name().clone()));
                }
            }
        }
        reply
    }

    fn answer_a(&self, reply: &mut Message, query: &Query) {
        let name = query.name().to_ascii();
        let Some((service, namespace)) = self.parse_service_name(&name) else {
            debug!(%name, "unparseable cluster a query");
            return;
        };

        let endpoints = match self.inner.registry.get_endpoints(&service, &namespace) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                debug!(%service, %namespace, error = %e, "service not found for a query");
                return;
            }
        };

        for endpoint in &endpoints {
            let Ok(ip) = endpoint.address.parse::<Ipv4Addr>() else {
                warn!(address = %endpoint.address, "endpoint address is not an ipv4, skipping");
                continue;
            };
            reply.add_answer(Record::from_rdata(
                query.name().clone(),
                CLUSTER_TTL,
                RData::A(A(ip)),
            ));
        }
        if !endpoints.is_empty() {
            debug!(%name, endpoints = endpoints.len(), "resolved cluster a query");
        }
    }

    fn answer_srv(&self, reply: &mut Message, query: &Query) {
        let name = query.name().to_ascii();
        let Some((port_name, protocol, service, namespace)) = self.parse_srv_name(&name) else {
            debug!(%name, "unparseable cluster srv query");
            return;
        };

        let endpoints = match self.inner.registry.get_endpoints(&service, &namespace) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                debug!(%service, %namespace, error = %e, "service not found for srv query");
                return;
            }
        };

        // Named-port matching is not implemented: the endpoint's own
        // port is used whatever the _port label says.
        let target_port = endpoints.first().map(|e| e.port).unwrap_or_default();
        debug!(%service, %namespace, %port_name, %protocol, target_port, "srv query");

        let target = match Name::from_ascii(format!(
            "{service}.{namespace}.{}.",
            self.inner.zone
        )) {
            Ok(target) => target,
            Err(e) => {
                warn!(error = %e, "failed to build srv target name");
                return;
            }
        };

        let mut priority: u16 = 10;
        let weight: u16 = 10;
        for (i, endpoint) in endpoints.iter().enumerate() {
            if i > 0 {
                priority += 10;
            }
            reply.add_answer(Record::from_rdata(
                query.name().clone(),
                CLUSTER_TTL,
                RData::SRV(SRV::new(priority, weight, target_port, target.clone())),
            ));

            // Glue A record for the target.
            if let Ok(ip) = endpoint.address.parse::<Ipv4Addr>() {
                reply.add_additional(Record::from_rdata(
                    target.clone(),
                    CLUSTER_TTL,
                    RData::A(A(ip)),
                ));
            }
        }
    }

    /// `{service}.{namespace}[.svc].{zone}` → (service, namespace).
    /// Dots inside the service name are preserved.
    fn parse_service_name(&self, name: &str) -> Option<(String, String)> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let name = strip_zone(&name, &self.inner.zone);

        let (service, namespace) = name.rsplit_once('.')?;
        if service.is_empty() || namespace.is_empty() {
            return None;
        }
        Some((service.to_string(), namespace.to_string()))
    }

    /// `_{port}._{proto}.{service}.{namespace}[.svc].{zone}` →
    /// (port_name, protocol, service, namespace).
    fn parse_srv_name(&self, name: &str) -> Option<(String, String, String, String)> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let name = strip_zone(&name, &self.inner.zone);

        let parts: Vec<&str> = name.split('.').collect();
        if parts.len() < 4 || !parts[0].starts_with('_') || !parts[1].starts_with('_') {
            return None;
        }

        let port_name = parts[0].trim_start_matches('_').to_string();
        let protocol = parts[1].trim_start_matches('_').to_string();
        let namespace = parts[parts.len() - 1].to_string();
        let service = parts[2..parts.len() - 1].join(".");
        if service.is_empty() {
            return None;
        }
        Some((port_name, protocol, service, namespace))
    }

    // ── Forwarding ─────────────────────────────────────────────────

    async fn forward(&self, raw: &[u8], request: &Message) -> Vec<u8> {
        let question = request
            .queries()
            .first()
            .map(|q| q.name().to_ascii())
            .unwrap_or_default();

        let whitelist_on = {
            let wl = self.inner.whitelist.read().expect("whitelist lock");
            if !wl.allows(&question) {
                warn!(name = %question, "dns query blocked by whitelist");
                return encode_or_empty(reply_to(request, ResponseCode::Refused));
            }
            wl.enabled()
        };

        for upstream in &self.inner.upstreams {
            let response = match self.exchange(raw, upstream).await {
                Some(response) => response,
                None => continue,
            };

            let Ok(parsed) = Message::from_vec(&response) else {
                debug!(upstream, "unparseable upstream response");
                continue;
            };
            if parsed.response_code() != ResponseCode::NoError {
                debug!(upstream, rcode = ?parsed.response_code(), "upstream returned failure");
                continue;
            }
            if whitelist_on && !self.cnames_allowed(&parsed) {
                warn!(name = %question, upstream, "response cname outside whitelist, discarding");
                continue;
            }

            debug!(name = %question, upstream, "forwarded dns query");
            return response;
        }

        warn!(name = %question, "all upstream dns servers failed");
        encode_or_empty(reply_to(request, ResponseCode::ServFail))
    }

    /// One upstream attempt: UDP first, TCP when UDP errors out.
    async fn exchange(&self, raw: &[u8], upstream: &str) -> Option<Vec<u8>> {
        match self.exchange_udp(raw, upstream).await {
            Ok(response) => Some(response),
            Err(e) => {
                debug!(upstream, error = %e, "udp exchange failed, retrying over tcp");
                match self.exchange_tcp(raw, upstream).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        debug!(upstream, error = %e, "tcp exchange failed");
                        None
                    }
                }
            }
        }
    }

    async fn exchange_udp(&self, raw: &[u8], upstream: &str) -> std::io::Result<Vec<u8>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(upstream).await?;
        socket.send(raw).await?;

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "udp timeout"))??;
        buf.truncate(n);
        Ok(buf)
    }

    async fn exchange_tcp(&self, raw: &[u8], upstream: &str) -> std::io::Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(upstream).await?;
            stream.write_all(&(raw.len() as u16).to_be_bytes()).await?;
            stream.write_all(raw).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok::<Vec<u8>, std::io::Error>(buf)
        };
        tokio::time::timeout(UPSTREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "tcp timeout"))?
    }

    /// Every CNAME target in Answer and Additional must pass the
    /// whitelist, including chain hops.
    fn cnames_allowed(&self, response: &Message) -> bool {
        let wl = self.inner.whitelist.read().expect("whitelist lock");
        response
            .answers()
            .iter()
            .chain(response.additionals().iter())
            .filter_map(|record| match record.data() {
                Some(RData::CNAME(target)) => Some(target.0.to_ascii()),
                _ => None,
            })
            .all(|target| wl.allows(&target))
    }

    // ── Listener loops ─────────────────────────────────────────────

    fn spawn_udp_loop(&self, socket: Arc<UdpSocket>) {
        let server = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    recv = socket.recv_from(&mut buf) => {
                        let (n, peer) = match recv {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "dns udp receive error");
                                continue;
                            }
                        };
                        let data = buf[..n].to_vec();
                        let server = server.clone();
                        let socket = socket.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = server.handle_query(&data).await {
                                if let Err(e) = socket.send_to(&reply, peer).await {
                                    debug!(error = %e, "dns udp reply failed");
                                }
                            }
                        });
                    }
                }
            }
        });
    }

    fn spawn_tcp_loop(&self, listener: TcpListener) {
        let server = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, _) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "dns tcp accept error");
                                continue;
                            }
                        };
                        let server = server.clone();
                        tokio::spawn(async move {
                            let _ = server.serve_tcp(stream).await;
                        });
                    }
                }
            }
        });
    }

    async fn serve_tcp(&self, mut stream: TcpStream) -> std::io::Result<()> {
        loop {
            let mut len_buf = [0u8; 2];
            if stream.read_exact(&mut len_buf).await.is_err() {
                return Ok(()); // client closed
            }
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;

            if let Some(reply) = self.handle_query(&buf).await {
                stream.write_all(&(reply.len() as u16).to_be_bytes()).await?;
                stream.write_all(&reply).await?;
                stream.flush().await?;
            }
        }
    }
}

/// Drop `[.svc].{zone}` from a normalized name, when present.
fn strip_zone<'a>(name: &'a str, zone: &str) -> &'a str {
    let name = name
        .strip_suffix(&format!(".svc.{zone}"))
        .or_else(|| name.strip_suffix(&format!(".{zone}")))
        .unwrap_or(name);
    name
}

/// Start a reply mirroring the request id and questions.
fn reply_to(request: &Message, code: ResponseCode) -> Message {
    let mut reply = Message::new();
    reply
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(request.recursion_desired())
        .set_response_code(code);
    for query in request.queries() {
        reply.add_query(query.clone());
    }
    reply
}

/// The zero-TTL `0.0.0.0` stub used for AAAA and unsupported types.
fn stub_answer(name: Name) -> Record {
    Record::from_rdata(name, 0, RData::A(A(Ipv4Addr::UNSPECIFIED)))
}

fn encode_or_empty(message: Message) -> Vec<u8> {
    message.to_vec().unwrap_or_default()
}
