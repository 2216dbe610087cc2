//! SOCKS5 Relay
//!
//! One authenticated SOCKS5 listener per online node. Every relayed
//! connection leaves through that node's tunnel and nowhere else.
//!
//! # Protocol
//!
//! ```text
//! client ──▶ greeting (must offer 0x02 user/pass)
//!        ◀── 05 02
//!        ──▶ RFC 1929 auth
//!        ◀── 01 00 | 01 01 (close)
//!        ──▶ CONNECT ipv4 | domain | ipv6
//!        ◀── reply
//!        ◀─▶ relay until close or idle timeout
//! ```
//!
//! # Isolation
//!
//! A listener carries its node's [`EgressBinding`]; the dialer pins the
//! outbound socket to it. Nothing a client sends can change the binding.

use crate::config::SocksConfig;
use crate::egress::{EgressBinding, EgressDialer, TargetAddr};
use crate::routing::PolicyRouter;
use dashmap::DashMap;
use pfleet_node::NodeId;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version (RFC 1929)
const AUTH_VERSION: u8 = 0x01;

/// SOCKS5 authentication methods
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_TTL_EXPIRED: u8 = 0x06;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Relay buffer per direction
const BUFFER_SIZE: usize = 16 * 1024;

/// Consecutive accept errors after which the listener is considered dead
const MAX_ACCEPT_FAILURES: u32 = 20;

/// Pause between failed accepts
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Relay errors
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Node {0} already has a listener")]
    NodeBusy(NodeId),

    #[error("Port {port} already owned by node {owner}")]
    PortBusy { port: u16, owner: NodeId },

    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: SocketAddr, error: io::Error },

    #[error("Invalid SOCKS version")]
    InvalidVersion,

    #[error("Client offered no acceptable auth method")]
    AuthNotOffered,

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0:#04x}")]
    InvalidAddress(u8),

    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection to {target} failed: {error}")]
    ConnectionFailed { target: String, error: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Bind failed because something outside the relay holds the port
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, RelayError::Bind { error, .. } if error.kind() == io::ErrorKind::AddrInUse)
    }
}

/// Credentials and binding a listener enforces
#[derive(Clone)]
struct ListenerPolicy {
    node_id: NodeId,
    username: String,
    password: String,
    binding: EgressBinding,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

/// A running listener
struct SocksListener {
    port: u16,
    interface: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    connections: Arc<AtomicUsize>,
}

/// Snapshot of one listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub node_id: NodeId,
    pub port: u16,
    pub interface: String,
    pub active_connections: usize,
}

/// Registry of per-node SOCKS5 listeners
pub struct SocksRelay {
    config: SocksConfig,
    dialer: Arc<dyn EgressDialer>,
    listeners: DashMap<NodeId, SocksListener>,
    ports: DashMap<u16, NodeId>,
    /// Serializes start/stop so checks and inserts don't interleave
    registry: Mutex<()>,
}

impl SocksRelay {
    pub fn new(config: SocksConfig, dialer: Arc<dyn EgressDialer>) -> Self {
        Self {
            config,
            dialer,
            listeners: DashMap::new(),
            ports: DashMap::new(),
            registry: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SocksConfig {
        &self.config
    }

    /// Start a listener for `node_id` on `port` (0 picks any free port)
    ///
    /// Returns the bound port.
    pub async fn start_for_node(
        &self,
        node_id: NodeId,
        port: u16,
        interface: &str,
        username: &str,
        password: &str,
    ) -> Result<u16, RelayError> {
        let _registry = self.registry.lock().await;

        if self.listeners.contains_key(&node_id) {
            return Err(RelayError::NodeBusy(node_id));
        }
        if let Some(owner) = self.ports.get(&port).map(|o| *o) {
            return Err(RelayError::PortBusy { port, owner });
        }

        let addr = SocketAddr::new(self.config.listen_ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|error| RelayError::Bind { addr, error })?;
        let port = listener.local_addr()?.port();

        let policy = ListenerPolicy {
            node_id,
            username: username.to_string(),
            password: password.to_string(),
            binding: EgressBinding {
                interface: interface.to_string(),
                mark: PolicyRouter::mark(port),
            },
            handshake_timeout: self.config.handshake_timeout(),
            connect_timeout: self.config.connect_timeout(),
            idle_timeout: self.config.idle_timeout(),
        };

        let cancel = CancellationToken::new();
        let connections = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(accept_loop(
            listener,
            policy,
            self.dialer.clone(),
            Arc::new(Semaphore::new(self.config.max_connections_per_node)),
            cancel.clone(),
            connections.clone(),
        ));

        self.ports.insert(port, node_id);
        self.listeners.insert(
            node_id,
            SocksListener {
                port,
                interface: interface.to_string(),
                cancel,
                task,
                connections,
            },
        );

        info!(node_id, port, interface, "SOCKS5 listener started");
        Ok(port)
    }

    /// Close the node's listener; open relays keep running
    ///
    /// Returns whether a listener existed.
    pub async fn stop_for_node(&self, node_id: NodeId) -> bool {
        let _registry = self.registry.lock().await;

        let Some((_, listener)) = self.listeners.remove(&node_id) else {
            return false;
        };
        self.ports.remove(&listener.port);
        listener.cancel.cancel();
        // The accept loop owns the socket; wait for it so the port is free
        if let Err(e) = listener.task.await {
            warn!(node_id, error = %e, "Accept loop ended abnormally");
        }

        info!(node_id, port = listener.port, "SOCKS5 listener stopped");
        true
    }

    /// Listener registered and its accept loop still running
    pub fn is_listening(&self, node_id: NodeId) -> bool {
        self.listeners
            .get(&node_id)
            .is_some_and(|l| !l.task.is_finished())
    }

    /// Kill the accept loop but leave the listener registered
    #[cfg(test)]
    pub(crate) fn abort_accept_loop(&self, node_id: NodeId) -> bool {
        match self.listeners.get(&node_id) {
            Some(listener) => {
                listener.task.abort();
                true
            }
            None => false,
        }
    }

    /// Node that owns `port`
    pub fn port_owner(&self, port: u16) -> Option<NodeId> {
        self.ports.get(&port).map(|o| *o)
    }

    /// Registered listeners, ordered by node id
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        let mut out: Vec<ListenerInfo> = self
            .listeners
            .iter()
            .map(|l| ListenerInfo {
                node_id: *l.key(),
                port: l.port,
                interface: l.interface.clone(),
                active_connections: l.connections.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by_key(|l| l.node_id);
        out
    }

    /// `(node, port)` for every registered listener
    pub fn bound_ports(&self) -> Vec<(NodeId, u16)> {
        self.listeners().into_iter().map(|l| (l.node_id, l.port)).collect()
    }
}

async fn accept_loop(
    listener: TcpListener,
    policy: ListenerPolicy,
    dialer: Arc<dyn EgressDialer>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
    connections: Arc<AtomicUsize>,
) {
    let policy = Arc::new(policy);
    let mut failures = 0u32;

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => {
                failures = 0;
                pair
            }
            Err(e) if is_client_error(&e) => {
                debug!(node_id = policy.node_id, error = %e, "Client dropped before accept");
                continue;
            }
            Err(e) => {
                failures += 1;
                if failures >= MAX_ACCEPT_FAILURES {
                    error!(node_id = policy.node_id, failures, error = %e, "Listener socket failing, giving up");
                    break;
                }
                warn!(node_id = policy.node_id, failures, error = %e, "Accept error");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                }
                continue;
            }
        };

        let Ok(permit) = slots.clone().try_acquire_owned() else {
            debug!(node_id = policy.node_id, %peer, "Connection limit reached, dropping client");
            continue;
        };

        let policy = policy.clone();
        let dialer = dialer.clone();
        let connections = connections.clone();
        connections.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            debug!(node_id = policy.node_id, %peer, "SOCKS5 connection");
            if let Err(e) = handle_connection(stream, &policy, dialer.as_ref()).await {
                debug!(node_id = policy.node_id, %peer, error = %e, "Connection ended with error");
            }
            connections.fetch_sub(1, Ordering::Relaxed);
            drop(permit);
        });
    }

    debug!(node_id = policy.node_id, "Accept loop exited");
}

/// Accept errors caused by one client rather than the listening socket
fn is_client_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}

/// Run the SOCKS5 state machine for one client
async fn handle_connection(
    mut stream: TcpStream,
    policy: &ListenerPolicy,
    dialer: &dyn EgressDialer,
) -> Result<(), RelayError> {
    let target = match timeout(policy.handshake_timeout, negotiate(&mut stream, policy)).await {
        Ok(result) => result?,
        Err(_) => return Err(RelayError::HandshakeTimeout),
    };

    debug!(node_id = policy.node_id, %target, interface = %policy.binding.interface, "SOCKS5 CONNECT");

    let remote = match dialer
        .connect(&target, &policy.binding, policy.connect_timeout)
        .await
    {
        Ok(remote) => remote,
        Err(e) => {
            send_reply(&mut stream, reply_code(&e), None).await?;
            return Err(RelayError::ConnectionFailed {
                target: target.to_string(),
                error: e.to_string(),
            });
        }
    };

    send_reply(&mut stream, REPLY_SUCCESS, remote.local_addr().ok()).await?;
    relay(stream, remote, policy.idle_timeout).await;
    Ok(())
}

/// Greeting, authentication and request; returns the CONNECT target
async fn negotiate(stream: &mut TcpStream, policy: &ListenerPolicy) -> Result<TargetAddr, RelayError> {
    // ===== Method selection =====

    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(RelayError::InvalidVersion);
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_USER_PASS) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(RelayError::AuthNotOffered);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_USER_PASS]).await?;

    // ===== Username/password =====

    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != AUTH_VERSION {
        return Err(RelayError::InvalidVersion);
    }
    let username = read_short_string(stream).await?;
    let password = read_short_string(stream).await?;

    let accepted = constant_time_eq(&username, policy.username.as_bytes())
        & constant_time_eq(&password, policy.password.as_bytes());
    if !accepted {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        return Err(RelayError::AuthFailed);
    }
    stream.write_all(&[AUTH_VERSION, 0x00]).await?;

    // ===== Request =====

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(RelayError::InvalidVersion);
    }
    if header[1] != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        return Err(RelayError::UnsupportedCommand(header[1]));
    }

    let target = match header[3] {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(ip), port)))
        }
        ADDR_DOMAIN => {
            let domain = read_short_string(stream).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Domain(String::from_utf8_lossy(&domain).into_owned(), port)
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0)))
        }
        other => {
            send_reply(stream, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(RelayError::InvalidAddress(other));
        }
    };

    Ok(target)
}

/// Length-prefixed byte string
async fn read_short_string(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let len = stream.read_u8().await? as usize;
    let mut value = vec![0u8; len];
    stream.read_exact(&mut value).await?;
    Ok(value)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn reply_code(e: &io::Error) -> u8 {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        io::ErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
        io::ErrorKind::TimedOut => REPLY_TTL_EXPIRED,
        _ => REPLY_GENERAL_FAILURE,
    }
}

/// Send SOCKS5 reply
async fn send_reply(
    stream: &mut TcpStream,
    reply: u8,
    bound: Option<SocketAddr>,
) -> Result<(), RelayError> {
    let mut response = vec![SOCKS5_VERSION, reply, 0x00];
    match bound {
        Some(SocketAddr::V6(addr)) => {
            response.push(ADDR_IPV6);
            response.extend_from_slice(&addr.ip().octets());
            response.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V4(addr)) => {
            response.push(ADDR_IPV4);
            response.extend_from_slice(&addr.ip().octets());
            response.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            response.push(ADDR_IPV4);
            response.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    stream.write_all(&response).await?;
    Ok(())
}

/// Relay both directions until close, error, or shared idle timeout
async fn relay(mut client: TcpStream, mut remote: TcpStream, idle: Duration) {
    let started = Instant::now();
    let last_activity = AtomicU64::new(0);

    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let up = pump(&mut client_read, &mut remote_write, idle, started, &last_activity);
    let down = pump(&mut remote_read, &mut client_write, idle, started, &last_activity);

    let (sent, received) = tokio::join!(up, down);
    debug!(sent, received, "Relay finished");
}

/// Copy one direction; ends on EOF, error, or when both sides are idle
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    started: Instant,
    last_activity: &AtomicU64,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle, reader.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => n,
            Err(_) => {
                let last = Duration::from_millis(last_activity.load(Ordering::Relaxed));
                if started.elapsed().saturating_sub(last) >= idle {
                    break;
                }
                continue;
            }
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
        last_activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::IpAddr;

    /// Dials targets directly and records the binding of every call
    #[derive(Default)]
    pub(crate) struct RecordingDialer {
        pub calls: std::sync::Mutex<Vec<(TargetAddr, EgressBinding)>>,
    }

    #[async_trait]
    impl EgressDialer for RecordingDialer {
        async fn connect(
            &self,
            target: &TargetAddr,
            binding: &EgressBinding,
            connect_timeout: Duration,
        ) -> io::Result<TcpStream> {
            self.calls
                .lock()
                .unwrap()
                .push((target.clone(), binding.clone()));
            let addr = match target {
                TargetAddr::Ip(addr) => *addr,
                TargetAddr::Domain(_, port) => SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), *port),
            };
            match timeout(connect_timeout, TcpStream::connect(addr)).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            }
        }
    }

    pub(crate) fn test_config() -> SocksConfig {
        SocksConfig {
            listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            idle_timeout_secs: 1,
            ..Default::default()
        }
    }

    /// Echo server on loopback
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    /// Client side of greeting + auth; returns the auth status byte
    async fn authenticate(stream: &mut TcpStream, user: &str, pass: &str) -> u8 {
        stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x02]);

        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        stream.write_all(&auth).await.unwrap();

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await.unwrap();
        status[1]
    }

    async fn connect_ipv4(stream: &mut TcpStream, target: SocketAddr) -> u8 {
        let SocketAddr::V4(v4) = target else { panic!("ipv4 only") };
        let mut req = vec![0x05, CMD_CONNECT, 0x00, ADDR_IPV4];
        req.extend_from_slice(&v4.ip().octets());
        req.extend_from_slice(&v4.port().to_be_bytes());
        stream.write_all(&req).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        reply[1]
    }

    #[tokio::test]
    async fn test_authenticated_connect_and_relay() {
        let echo = echo_server().await;
        let dialer = Arc::new(RecordingDialer::default());
        let relay = SocksRelay::new(test_config(), dialer.clone());
        let port = relay.start_for_node(1, 0, "ppp1", "alice", "s3cret").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_eq!(authenticate(&mut client, "alice", "s3cret").await, 0x00);
        assert_eq!(connect_ipv4(&mut client, echo).await, REPLY_SUCCESS);

        client.write_all(b"through the tunnel").await.unwrap();
        let mut echoed = [0u8; 18];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"through the tunnel");

        let calls = dialer.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1.interface, "ppp1");
        assert_eq!(calls[0].1.mark, port as u32);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected() {
        let dialer = Arc::new(RecordingDialer::default());
        let relay = SocksRelay::new(test_config(), dialer.clone());
        let port = relay.start_for_node(1, 0, "ppp1", "alice", "s3cret").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        assert_eq!(authenticate(&mut client, "alice", "guess").await, 0x01);

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert!(dialer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_auth_client_refused() {
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "alice", "s3cret").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, AUTH_NO_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_bind_command_not_supported() {
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "alice", "s3cret").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        authenticate(&mut client, "alice", "s3cret").await;
        client
            .write_all(&[0x05, 0x02, 0x00, ADDR_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_refused_target_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);

        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "alice", "s3cret").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        authenticate(&mut client, "alice", "s3cret").await;
        assert_eq!(connect_ipv4(&mut client, target).await, REPLY_CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn test_each_listener_dials_through_its_own_interface() {
        let echo = echo_server().await;
        let dialer = Arc::new(RecordingDialer::default());
        let relay = SocksRelay::new(test_config(), dialer.clone());
        let port_a = relay.start_for_node(1, 0, "ppp1", "alice", "a-pass").await.unwrap();
        let port_b = relay.start_for_node(2, 0, "ppp2", "bob", "b-pass").await.unwrap();

        for _ in 0..3 {
            let mut client = TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
            authenticate(&mut client, "alice", "a-pass").await;
            assert_eq!(connect_ipv4(&mut client, echo).await, REPLY_SUCCESS);
        }
        // Node B's credentials do not open node A's listener
        let mut client = TcpStream::connect(("127.0.0.1", port_a)).await.unwrap();
        assert_eq!(authenticate(&mut client, "bob", "b-pass").await, 0x01);

        let mut client = TcpStream::connect(("127.0.0.1", port_b)).await.unwrap();
        authenticate(&mut client, "bob", "b-pass").await;
        assert_eq!(connect_ipv4(&mut client, echo).await, REPLY_SUCCESS);

        let calls = dialer.calls.lock().unwrap();
        let via_a: Vec<_> = calls.iter().filter(|(_, b)| b.mark == port_a as u32).collect();
        assert_eq!(via_a.len(), 3);
        assert!(via_a.iter().all(|(_, b)| b.interface == "ppp1"));
        let via_b: Vec<_> = calls.iter().filter(|(_, b)| b.mark == port_b as u32).collect();
        assert_eq!(via_b.len(), 1);
        assert_eq!(via_b[0].1.interface, "ppp2");
    }

    #[tokio::test]
    async fn test_start_refuses_busy_node_or_port() {
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "a", "b").await.unwrap();

        assert!(matches!(
            relay.start_for_node(1, 0, "ppp1", "a", "b").await,
            Err(RelayError::NodeBusy(1))
        ));
        assert!(matches!(
            relay.start_for_node(2, port, "ppp2", "a", "b").await,
            Err(RelayError::PortBusy { owner: 1, .. })
        ));
        assert_eq!(relay.port_owner(port), Some(1));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_port() {
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "a", "b").await.unwrap();
        assert!(relay.is_listening(1));

        assert!(relay.stop_for_node(1).await);
        assert!(!relay.stop_for_node(1).await);
        assert!(!relay.is_listening(1));
        assert!(relay.bound_ports().is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }

    #[tokio::test]
    async fn test_dead_accept_loop_not_listening() {
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "a", "b").await.unwrap();

        assert!(relay.abort_accept_loop(1));
        timeout(Duration::from_secs(2), async {
            while relay.is_listening(1) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Still registered, so the port stays owned until stopped
        assert_eq!(relay.port_owner(port), Some(1));
        assert!(relay.stop_for_node(1).await);
        assert_eq!(relay.port_owner(port), None);
    }

    #[test]
    fn test_client_errors_do_not_count_against_listener() {
        assert!(is_client_error(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_client_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_client_error(&io::Error::from_raw_os_error(24)));
        assert!(!is_client_error(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn test_bind_reports_port_in_use() {
        let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = squatter.local_addr().unwrap().port();
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));

        let err = relay.start_for_node(1, port, "ppp1", "a", "b").await.unwrap_err();
        assert!(err.is_addr_in_use());
        assert!(!relay.is_listening(1));
        assert!(!RelayError::AuthFailed.is_addr_in_use());
    }

    #[tokio::test]
    async fn test_stop_leaves_open_relays_running() {
        let echo = echo_server().await;
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "a", "bbbbbbbb").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        authenticate(&mut client, "a", "bbbbbbbb").await;
        assert_eq!(connect_ipv4(&mut client, echo).await, REPLY_SUCCESS);

        relay.stop_for_node(1).await;

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_idle_relay_closes() {
        let echo = echo_server().await;
        let relay = SocksRelay::new(test_config(), Arc::new(RecordingDialer::default()));
        let port = relay.start_for_node(1, 0, "ppp1", "a", "b").await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        authenticate(&mut client, "a", "b").await;
        assert_eq!(connect_ipv4(&mut client, echo).await, REPLY_SUCCESS);

        let mut buf = [0u8; 1];
        let read = timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0))));
    }
}
