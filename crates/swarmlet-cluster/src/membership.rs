//! Gossip membership and the encrypted message bus.
//!
//! Every node binds one UDP socket and one TCP listener on the cluster
//! port. Peers probe each other over UDP, piggybacking their member
//! list on every ping/ack so the roster converges by union merge. A
//! peer that stays silent past the timeout is removed. Join handshakes
//! and oversized broadcasts use the TCP side with a length prefix.
//!
//! All frames — membership traffic and application payloads alike —
//! are sealed with the cluster secret when one is configured. A frame
//! that fails to open, or parses to no known shape, never reaches the
//! application handler.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use swarmlet_state::{Node, NodeStatus};

use crate::encryption::Encryptor;
use crate::error::{ClusterError, ClusterResult};
use crate::tls::TlsMaterial;
use crate::token::TokenManager;

/// The single receive hook for application payloads.
pub type MessageHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Frames larger than this go per-peer over TCP instead of UDP.
const UDP_MAX_FRAME: usize = 1200;
/// Probe every peer at this interval.
const PROBE_INTERVAL: Duration = Duration::from_secs(2);
/// A peer silent for this long is presumed failed and removed.
const PEER_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for a TCP-framed message.
const MAX_TCP_FRAME: usize = 8 * 1024 * 1024;

/// Configuration for starting the membership layer.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node name within the cluster.
    pub node_name: String,
    /// Cluster bind address (UDP and TCP), e.g. `0.0.0.0:7946`.
    pub bind_addr: SocketAddr,
    /// Address peers should reach us at. Derived from the bind address
    /// (or a route probe) when not set.
    pub advertise_ip: Option<IpAddr>,
    /// Seed addresses to join. Empty forms a new cluster.
    pub join_addrs: Vec<String>,
    /// Token presented when joining.
    pub join_token: Option<String>,
    /// Shared secret sealing every frame. None disables encryption.
    pub encryption_key: Option<Vec<u8>>,
    /// Labels advertised for this node (used by node selectors).
    pub labels: HashMap<String, String>,
}

/// Gossip wire frames. Application payloads are anything that does not
/// parse as one of these; they are handed to the message handler.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Join {
        node: String,
        addr: SocketAddr,
        labels: HashMap<String, String>,
        token: Option<String>,
    },
    JoinAck {
        accepted: bool,
        members: Vec<MemberInfo>,
    },
    Ping {
        from: MemberInfo,
        members: Vec<MemberInfo>,
    },
    Ack {
        from: MemberInfo,
        members: Vec<MemberInfo>,
    },
    Leave {
        node: String,
    },
}

/// A member as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MemberInfo {
    name: String,
    addr: SocketAddr,
    #[serde(default)]
    labels: HashMap<String, String>,
}

struct Peer {
    info: MemberInfo,
    last_seen: Instant,
}

struct ClusterInner {
    node_name: String,
    advertise: SocketAddr,
    udp: UdpSocket,
    /// Remote peers by name; the local node is not stored here.
    peers: RwLock<HashMap<String, Peer>>,
    local_labels: RwLock<HashMap<String, String>>,
    encryptor: Option<Encryptor>,
    tokens: Arc<TokenManager>,
    tls: Option<TlsMaterial>,
    handler: RwLock<Option<MessageHandler>>,
    shutdown: watch::Sender<bool>,
}

/// Handle to the cluster membership layer.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    /// Bind the cluster port, start the gossip loops and join any seeds.
    ///
    /// Fatal errors (socket bind failure, a seed explicitly rejecting
    /// the join token) are returned; an unreachable seed is only
    /// warned about, matching best-effort mesh formation.
    pub async fn start(
        config: ClusterConfig,
        tokens: Arc<TokenManager>,
        tls: Option<TlsMaterial>,
    ) -> ClusterResult<Self> {
        let tcp = TcpListener::bind(config.bind_addr).await?;
        let port = tcp.local_addr()?.port();
        let udp = UdpSocket::bind(SocketAddr::new(config.bind_addr.ip(), port)).await?;

        let advertise_ip = config
            .advertise_ip
            .unwrap_or_else(|| derive_advertise_ip(config.bind_addr.ip()));
        let advertise = SocketAddr::new(advertise_ip, port);

        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClusterInner {
            node_name: config.node_name.clone(),
            advertise,
            udp,
            peers: RwLock::new(HashMap::new()),
            local_labels: RwLock::new(config.labels.clone()),
            encryptor: config.encryption_key.as_deref().map(Encryptor::new),
            tokens,
            tls,
            handler: RwLock::new(None),
            shutdown,
        });
        let cluster = Cluster { inner };

        cluster.spawn_udp_loop();
        cluster.spawn_tcp_loop(tcp);
        cluster.spawn_probe_loop();

        if !config.join_addrs.is_empty() {
            cluster
                .join_seeds(&config.join_addrs, config.join_token.as_deref())
                .await?;
        }

        info!(node = %config.node_name, %advertise, "cluster membership started");
        Ok(cluster)
    }

    // ── Public surface ─────────────────────────────────────────────

    /// Register the single application message handler.
    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        *self.inner.handler.write().expect("handler lock") = Some(Arc::new(handler));
    }

    /// Best-effort delivery of an application payload to all peers.
    ///
    /// Small frames go as one UDP datagram per peer; large ones (full
    /// state snapshots) are sent per-peer over TCP. Per-peer failures
    /// are logged, never surfaced: anti-entropy repairs losses.
    pub async fn broadcast(&self, payload: &[u8]) -> ClusterResult<()> {
        let frame = self.seal(payload)?;
        let targets: Vec<(String, SocketAddr)> = {
            let peers = self.inner.peers.read().expect("peers lock");
            peers
                .values()
                .map(|p| (p.info.name.clone(), p.info.addr))
                .collect()
        };

        for (name, addr) in targets {
            if frame.len() <= UDP_MAX_FRAME {
                if let Err(e) = self.inner.udp.send_to(&frame, addr).await {
                    debug!(peer = %name, error = %e, "udp broadcast send failed");
                }
            } else {
                let cluster = self.clone();
                let frame = frame.clone();
                tokio::spawn(async move {
                    if let Err(e) = cluster.send_tcp_frame(addr, &frame).await {
                        debug!(peer = %name, error = %e, "tcp broadcast send failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// All known nodes, the local one included.
    pub fn members(&self) -> Vec<Node> {
        let mut nodes = vec![self.local_node()];
        let peers = self.inner.peers.read().expect("peers lock");
        nodes.extend(peers.values().map(|p| member_to_node(&p.info)));
        nodes
    }

    /// The local node record.
    pub fn local_node(&self) -> Node {
        Node {
            name: self.inner.node_name.clone(),
            address: self.inner.advertise.ip().to_string(),
            status: NodeStatus::Ready,
            labels: self.inner.local_labels.read().expect("labels lock").clone(),
        }
    }

    /// Look up a node by name.
    pub fn node(&self, name: &str) -> Option<Node> {
        if name == self.inner.node_name {
            return Some(self.local_node());
        }
        let peers = self.inner.peers.read().expect("peers lock");
        peers.get(name).map(|p| member_to_node(&p.info))
    }

    /// The IP peers and containers reach this node at.
    pub fn local_address(&self) -> String {
        self.inner.advertise.ip().to_string()
    }

    /// The full gossip address (useful as a seed for other nodes).
    pub fn gossip_addr(&self) -> SocketAddr {
        self.inner.advertise
    }

    /// Name of the local node.
    pub fn local_node_name(&self) -> &str {
        &self.inner.node_name
    }

    /// Replace the labels advertised for the local node.
    pub fn set_local_labels(&self, labels: HashMap<String, String>) {
        *self.inner.local_labels.write().expect("labels lock") = labels;
    }

    /// Broadcast a leave and stop all gossip loops.
    pub async fn shutdown(&self) {
        let leave = Frame::Leave {
            node: self.inner.node_name.clone(),
        };
        if let Ok(bytes) = serde_json::to_vec(&leave) {
            let _ = self.broadcast(&bytes).await;
        }
        let _ = self.inner.shutdown.send(true);
        info!(node = %self.inner.node_name, "cluster membership stopped");
    }

    // ── Join handshake ─────────────────────────────────────────────

    async fn join_seeds(&self, seeds: &[String], token: Option<&str>) -> ClusterResult<()> {
        // A malformed token can be rejected locally: the joiner holds
        // the shared secret too.
        if let Some(token) = token {
            if !self.inner.tokens.validate(token) {
                return Err(ClusterError::InvalidToken);
            }
        }

        let join = Frame::Join {
            node: self.inner.node_name.clone(),
            addr: self.inner.advertise,
            labels: self.inner.local_labels.read().expect("labels lock").clone(),
            token: token.map(str::to_string),
        };
        let frame = self.seal(&serde_json::to_vec(&join)?)?;

        let mut joined = false;
        for seed in seeds {
            match self.exchange_join(seed, &frame).await {
                Ok(Frame::JoinAck { accepted: true, members }) => {
                    self.merge_members(&members);
                    info!(seed, members = members.len(), "joined cluster");
                    joined = true;
                }
                Ok(Frame::JoinAck { accepted: false, .. }) => {
                    return Err(ClusterError::JoinRejected(seed.clone()));
                }
                Ok(_) => warn!(seed, "unexpected reply to join"),
                Err(e) => warn!(seed, error = %e, "failed to reach seed"),
            }
        }

        if !joined {
            warn!("no seed accepted the join; continuing as a partitioned node");
        }
        Ok(())
    }

    async fn exchange_join(&self, seed: &str, frame: &[u8]) -> ClusterResult<Frame> {
        // A seed that cannot decrypt the join frame never replies, so
        // bound the whole handshake.
        let handshake = async {
            let mut stream = self.open_stream(seed).await?;
            write_frame(&mut stream, frame).await?;
            read_frame(&mut stream).await
        };
        let reply = tokio::time::timeout(Duration::from_secs(5), handshake)
            .await
            .map_err(|_| {
                ClusterError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "join handshake timed out",
                ))
            })??;
        let plain = self.unseal(&reply)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    // ── Receive paths ──────────────────────────────────────────────

    fn spawn_udp_loop(&self) {
        let cluster = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    recv = cluster.inner.udp.recv_from(&mut buf) => {
                        match recv {
                            Ok((n, _from)) => {
                                let data = buf[..n].to_vec();
                                cluster.handle_frame(&data).await;
                            }
                            Err(e) => {
                                warn!(error = %e, "udp receive error");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_tcp_loop(&self, listener: TcpListener) {
        let cluster = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => {
                        let (stream, peer_addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "tcp accept error");
                                continue;
                            }
                        };
                        let cluster = cluster.clone();
                        tokio::spawn(async move {
                            if let Err(e) = cluster.serve_stream(stream).await {
                                debug!(%peer_addr, error = %e, "gossip stream closed");
                            }
                        });
                    }
                }
            }
        });
    }

    async fn serve_stream(&self, stream: tokio::net::TcpStream) -> ClusterResult<()> {
        let mut stream: Box<dyn Stream> = match &self.inner.tls {
            Some(tls) => Box::new(tls.acceptor.accept(stream).await?),
            None => Box::new(stream),
        };

        loop {
            let data = match read_frame(&mut stream).await {
                Ok(data) => data,
                Err(_) => return Ok(()), // peer closed
            };

            let plain = match self.unseal(&data) {
                Ok(plain) => plain,
                Err(_) => {
                    warn!("dropping undecryptable stream frame");
                    continue;
                }
            };

            match serde_json::from_slice::<Frame>(&plain) {
                Ok(Frame::Join { node, addr, labels, token }) => {
                    let accepted = self
                        .inner
                        .tokens
                        .validate(token.as_deref().unwrap_or_default());
                    if accepted {
                        self.admit(MemberInfo { name: node.clone(), addr, labels });
                        info!(%node, %addr, "node joined the cluster");
                    } else {
                        warn!(%node, %addr, "join rejected: invalid token");
                    }
                    let ack = Frame::JoinAck {
                        accepted,
                        members: self.member_snapshot(),
                    };
                    let reply = self.seal(&serde_json::to_vec(&ack)?)?;
                    write_frame(&mut stream, &reply).await?;
                }
                Ok(frame) => self.handle_gossip(frame).await,
                Err(_) => self.deliver(&plain),
            }
        }
    }

    async fn handle_frame(&self, data: &[u8]) {
        let plain = match self.unseal(data) {
            Ok(plain) => plain,
            Err(_) => {
                warn!("dropping undecryptable frame");
                return;
            }
        };

        match serde_json::from_slice::<Frame>(&plain) {
            Ok(frame) => self.handle_gossip(frame).await,
            Err(_) => self.deliver(&plain),
        }
    }

    async fn handle_gossip(&self, frame: Frame) {
        match frame {
            Frame::Ping { from, members } => {
                let reply_to = from.addr;
                self.admit(from);
                self.merge_members(&members);

                let ack = Frame::Ack {
                    from: self.local_member(),
                    members: self.member_snapshot(),
                };
                if let Err(e) = self.send_gossip(&ack, reply_to).await {
                    debug!(error = %e, "failed to ack ping");
                }
            }
            Frame::Ack { from, members } => {
                self.admit(from);
                self.merge_members(&members);
            }
            Frame::Leave { node } => {
                if self.inner.peers.write().expect("peers lock").remove(&node).is_some() {
                    info!(%node, "node left the cluster");
                }
            }
            Frame::Join { .. } | Frame::JoinAck { .. } => {
                // Handshake frames belong on the TCP path.
                debug!("ignoring stray handshake frame");
            }
        }
    }

    fn deliver(&self, payload: &[u8]) {
        let handler = self.inner.handler.read().expect("handler lock").clone();
        if let Some(handler) = handler {
            handler(payload);
        }
    }

    // ── Probing and failure detection ──────────────────────────────

    fn spawn_probe_loop(&self) {
        let cluster = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tick.tick() => {
                        cluster.sweep_failed();
                        cluster.probe_peers().await;
                    }
                }
            }
        });
    }

    async fn probe_peers(&self) {
        let targets: Vec<SocketAddr> = {
            let peers = self.inner.peers.read().expect("peers lock");
            peers.values().map(|p| p.info.addr).collect()
        };
        if targets.is_empty() {
            return;
        }

        let ping = Frame::Ping {
            from: self.local_member(),
            members: self.member_snapshot(),
        };
        for addr in targets {
            if let Err(e) = self.send_gossip(&ping, addr).await {
                debug!(%addr, error = %e, "ping send failed");
            }
        }
    }

    fn sweep_failed(&self) {
        let mut peers = self.inner.peers.write().expect("peers lock");
        peers.retain(|name, peer| {
            let alive = peer.last_seen.elapsed() <= PEER_TIMEOUT;
            if !alive {
                warn!(node = %name, "node presumed failed, removing from roster");
            }
            alive
        });
    }

    // ── Roster bookkeeping ─────────────────────────────────────────

    /// Insert or refresh a peer we heard from directly.
    fn admit(&self, info: MemberInfo) {
        if info.name == self.inner.node_name {
            return;
        }
        let mut peers = self.inner.peers.write().expect("peers lock");
        peers.insert(
            info.name.clone(),
            Peer {
                info,
                last_seen: Instant::now(),
            },
        );
    }

    /// Union-merge a gossiped member list. Unknown names are added (and
    /// will be probed directly); known peers only get address/label
    /// refreshes, never a liveness refresh — only direct traffic counts.
    fn merge_members(&self, members: &[MemberInfo]) {
        let mut peers = self.inner.peers.write().expect("peers lock");
        for member in members {
            if member.name == self.inner.node_name {
                continue;
            }
            match peers.get_mut(&member.name) {
                Some(peer) => {
                    peer.info.addr = member.addr;
                    peer.info.labels = member.labels.clone();
                }
                None => {
                    info!(node = %member.name, addr = %member.addr, "discovered node via gossip");
                    peers.insert(
                        member.name.clone(),
                        Peer {
                            info: member.clone(),
                            last_seen: Instant::now(),
                        },
                    );
                }
            }
        }
    }

    fn local_member(&self) -> MemberInfo {
        MemberInfo {
            name: self.inner.node_name.clone(),
            addr: self.inner.advertise,
            labels: self.inner.local_labels.read().expect("labels lock").clone(),
        }
    }

    fn member_snapshot(&self) -> Vec<MemberInfo> {
        let mut members = vec![self.local_member()];
        let peers = self.inner.peers.read().expect("peers lock");
        members.extend(peers.values().map(|p| p.info.clone()));
        members
    }

    // ── Wire helpers ───────────────────────────────────────────────

    fn seal(&self, payload: &[u8]) -> ClusterResult<Vec<u8>> {
        match &self.inner.encryptor {
            Some(enc) => enc.seal(payload),
            None => Ok(payload.to_vec()),
        }
    }

    fn unseal(&self, data: &[u8]) -> ClusterResult<Vec<u8>> {
        match &self.inner.encryptor {
            Some(enc) => enc.open(data),
            None => Ok(data.to_vec()),
        }
    }

    async fn send_gossip(&self, frame: &Frame, addr: SocketAddr) -> ClusterResult<()> {
        let sealed = self.seal(&serde_json::to_vec(frame)?)?;
        if sealed.len() <= UDP_MAX_FRAME {
            self.inner.udp.send_to(&sealed, addr).await?;
            Ok(())
        } else {
            self.send_tcp_frame(addr, &sealed).await
        }
    }

    async fn send_tcp_frame(&self, addr: SocketAddr, frame: &[u8]) -> ClusterResult<()> {
        let mut stream = self.open_stream(&addr.to_string()).await?;
        write_frame(&mut stream, frame).await?;
        Ok(())
    }

    async fn open_stream(&self, addr: &str) -> ClusterResult<Box<dyn Stream>> {
        let tcp = tokio::net::TcpStream::connect(addr).await?;
        match &self.inner.tls {
            Some(tls) => {
                let ip = tcp.peer_addr()?.ip();
                let server_name = tokio_rustls::rustls::pki_types::ServerName::from(ip);
                let stream = tls.connector.connect(server_name, tcp).await?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }
}

/// Both TCP stream flavors behind one object.
trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

fn member_to_node(info: &MemberInfo) -> Node {
    Node {
        name: info.name.clone(),
        address: info.addr.ip().to_string(),
        status: NodeStatus::Ready,
        labels: info.labels.clone(),
    }
}

/// Pick the IP to advertise. An explicit bind IP wins; for a wildcard
/// bind, a UDP route probe (no packets sent) selects the outbound
/// interface, falling back to loopback.
fn derive_advertise_ip(bind_ip: IpAddr) -> IpAddr {
    if !bind_ip.is_unspecified() {
        return bind_ip;
    }
    if let Ok(sock) = std::net::UdpSocket::bind("0.0.0.0:0") {
        if sock.connect("8.8.8.8:80").is_ok() {
            if let Ok(addr) = sock.local_addr() {
                return addr.ip();
            }
        }
    }
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, frame: &[u8]) -> ClusterResult<()> {
    stream.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> ClusterResult<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_TCP_FRAME {
        return Err(ClusterError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        )));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    fn loopback_config(name: &str) -> ClusterConfig {
        ClusterConfig {
            node_name: name.to_string(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_ip: None,
            join_addrs: Vec::new(),
            join_token: None,
            encryption_key: Some(b"test cluster secret".to_vec()),
            labels: HashMap::new(),
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn two_nodes_form_a_cluster() {
        let tokens_a = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        let token = tokens_a.generate();
        let a = Cluster::start(loopback_config("node-a"), tokens_a, None)
            .await
            .unwrap();

        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.join_token = Some(token);
        let tokens_b = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        let b = Cluster::start(cfg_b, tokens_b, None).await.unwrap();

        wait_for(|| a.members().len() == 2 && b.members().len() == 2, "membership").await;

        assert!(a.node("node-b").is_some());
        assert!(b.node("node-a").is_some());
    }

    #[tokio::test]
    async fn join_with_invalid_token_is_rejected() {
        let tokens_a = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        tokens_a.generate(); // seed knows a token, so bootstrap-accept is off
        let a = Cluster::start(loopback_config("node-a"), tokens_a, None)
            .await
            .unwrap();

        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.join_token = Some(base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE,
            [7u8; 32],
        ));
        let tokens_b = Arc::new(TokenManager::new(Some(b"secret".to_vec())));

        let result = Cluster::start(cfg_b, tokens_b, None).await;
        assert!(matches!(result, Err(ClusterError::JoinRejected(_))));
        assert_eq!(a.members().len(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_peer_handler() {
        let tokens_a = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        let token = tokens_a.generate();
        let a = Cluster::start(loopback_config("node-a"), tokens_a, None)
            .await
            .unwrap();

        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.join_token = Some(token);
        let b = Cluster::start(
            cfg_b,
            Arc::new(TokenManager::new(Some(b"secret".to_vec()))),
            None,
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_message_handler(move |bytes| {
            let _ = tx.send(bytes.to_vec());
        });

        wait_for(|| a.members().len() == 2, "membership").await;
        a.broadcast(br#"{"type":"service_update","action":"register"}"#)
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("broadcast delivery")
            .unwrap();
        assert!(received.starts_with(b"{\"type\":\"service_update\""));
    }

    #[tokio::test]
    async fn oversized_broadcast_goes_over_tcp() {
        let tokens_a = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        let token = tokens_a.generate();
        let a = Cluster::start(loopback_config("node-a"), tokens_a, None)
            .await
            .unwrap();

        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.join_token = Some(token);
        let b = Cluster::start(
            cfg_b,
            Arc::new(TokenManager::new(Some(b"secret".to_vec()))),
            None,
        )
        .await
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.set_message_handler(move |bytes| {
            let _ = tx.send(bytes.len());
        });

        wait_for(|| a.members().len() == 2, "membership").await;

        // Well past the UDP threshold.
        let mut payload = br#"{"type":"state_sync","blob":""#.to_vec();
        payload.extend(std::iter::repeat(b'x').take(64 * 1024));
        payload.extend_from_slice(b"\"}");
        a.broadcast(&payload).await.unwrap();

        let len = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("tcp broadcast delivery")
            .unwrap();
        assert_eq!(len, payload.len());
    }

    #[tokio::test]
    async fn peer_with_wrong_key_never_sees_payload() {
        let a = Cluster::start(
            loopback_config("node-a"),
            Arc::new(TokenManager::new(Some(b"secret".to_vec()))),
            None,
        )
        .await
        .unwrap();

        // node-b uses a different encryption key; its join frame will
        // not decrypt on node-a, so it never becomes a member there —
        // and nothing node-a says can reach node-b's handler.
        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.encryption_key = Some(b"a different secret".to_vec());
        let b = Cluster::start(
            cfg_b,
            Arc::new(TokenManager::new(Some(b"other".to_vec()))),
            None,
        )
        .await
        .unwrap();

        let seen = Arc::new(Mutex::new(0usize));
        let seen_clone = seen.clone();
        b.set_message_handler(move |_| {
            *seen_clone.lock().unwrap() += 1;
        });

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(a.members().len(), 1);
        a.broadcast(b"{\"type\":\"service_update\"}").await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn leave_removes_node_from_roster() {
        let tokens_a = Arc::new(TokenManager::new(Some(b"secret".to_vec())));
        let token = tokens_a.generate();
        let a = Cluster::start(loopback_config("node-a"), tokens_a, None)
            .await
            .unwrap();

        let mut cfg_b = loopback_config("node-b");
        cfg_b.join_addrs = vec![a.gossip_addr().to_string()];
        cfg_b.join_token = Some(token);
        let b = Cluster::start(
            cfg_b,
            Arc::new(TokenManager::new(Some(b"secret".to_vec()))),
            None,
        )
        .await
        .unwrap();

        wait_for(|| a.members().len() == 2, "membership").await;

        b.shutdown().await;
        wait_for(|| a.members().len() == 1, "leave propagation").await;
        assert!(a.node("node-b").is_none());
    }

    #[test]
    fn advertise_ip_prefers_explicit_bind() {
        let ip = derive_advertise_ip("192.168.1.10".parse().unwrap());
        assert_eq!(ip.to_string(), "192.168.1.10");
    }
}
