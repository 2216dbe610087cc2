//! Tunnel Manager
//!
//! Owns every live PPP process and the interface it brought up.
//!
//! # Lifecycle
//!
//! ```text
//! create_tunnel
//!   ├─ allocate unit N  (interface will be pppN)
//!   ├─ write peer file  (temp + rename)
//!   ├─ spawn pppd
//!   ├─ poll: process alive? pppN up with an address?
//!   │     ├─ ready      → persist ppp_interface, register
//!   │     └─ exit/timeout → SIGTERM, SIGKILL, remove peer file
//!   └─ Tunnel handle
//!
//! destroy_tunnel
//!   └─ SIGTERM, SIGKILL after grace, remove peer file, clear ppp_interface
//! ```
//!
//! A tunnel is registered only once its interface is ready, so a
//! registered tunnel and a populated `ppp_interface` always go together.
//! Crashes after creation are detected by the watchdog through
//! [`TunnelManager::health`].

use crate::config::TunnelConfig;
use crate::iface::{InterfaceProbe, InterfaceState, SystemInterfaces};
use crate::ppp::{self, PeerFile, PppSpawner, PppdSpawner, PEER_FILE_PREFIX};
use crate::routing::{PolicyRouter, RoutingError, SystemCommandRunner};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use pfleet_node::{NodeId, NodeLock, NodePatch, NodeStore, StoreError};
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Highest PPP unit handed out
const MAX_UNIT: u32 = 1024;

/// Bytes of daemon stderr kept in errors
const STDERR_TAIL: usize = 2048;

/// Runtime handle of one node's PPP process
#[derive(Debug)]
pub struct Tunnel {
    node_id: NodeId,
    unit: u32,
    interface: String,
    local: Option<std::net::Ipv4Addr>,
    peer_file: PathBuf,
    created_at: DateTime<Utc>,
    child: tokio::sync::Mutex<Child>,
}

impl Tunnel {
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    /// OS interface name (`pppN`)
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Local tunnel address seen at creation
    pub fn local_addr(&self) -> Option<std::net::Ipv4Addr> {
        self.local
    }

    pub fn peer_file(&self) -> &std::path::Path {
        &self.peer_file
    }

    /// Time since the daemon was started
    pub fn uptime(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Non-blocking check that the daemon has not exited
    pub async fn process_alive(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }
}

/// Result of a tunnel health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelHealth {
    /// Process running, interface up
    Healthy,
    /// PPP daemon exited
    ProcessExited,
    /// Interface exists but is administratively down
    InterfaceDown,
    /// Interface is gone
    InterfaceMissing,
    /// No tunnel registered for the node
    NotFound,
}

impl TunnelHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, TunnelHealth::Healthy)
    }
}

impl std::fmt::Display for TunnelHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TunnelHealth::Healthy => "healthy",
            TunnelHealth::ProcessExited => "process exited",
            TunnelHealth::InterfaceDown => "interface down",
            TunnelHealth::InterfaceMissing => "interface missing",
            TunnelHealth::NotFound => "no tunnel",
        };
        f.write_str(s)
    }
}

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("Node {0} already has an active tunnel")]
    AlreadyActive(NodeId),

    #[error("No free PPP unit")]
    NoFreeUnit,

    #[error("Failed to write peer file: {0}")]
    PeerFile(String),

    #[error("Failed to spawn PPP daemon: {0}")]
    Spawn(String),

    #[error("PPP daemon exited ({status}): {stderr}")]
    ProcessExited { status: String, stderr: String },

    #[error("Interface {interface} did not come up within {waited_secs}s")]
    InterfaceTimeout { interface: String, waited_secs: u64 },

    #[error("Tunnel manager is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Owner of PPP processes, peer files and per-proxy routing
pub struct TunnelManager {
    config: TunnelConfig,
    store: Arc<dyn NodeStore>,
    spawner: Arc<dyn PppSpawner>,
    interfaces: Arc<dyn InterfaceProbe>,
    router: PolicyRouter,
    tunnels: DashMap<NodeId, Arc<Tunnel>>,
    units: Mutex<BTreeSet<u32>>,
    launches: Semaphore,
}

impl TunnelManager {
    pub fn new(
        config: TunnelConfig,
        store: Arc<dyn NodeStore>,
        spawner: Arc<dyn PppSpawner>,
        interfaces: Arc<dyn InterfaceProbe>,
        router: PolicyRouter,
    ) -> Self {
        let launches = Semaphore::new(config.max_concurrent_launches);
        Self {
            config,
            store,
            spawner,
            interfaces,
            router,
            tunnels: DashMap::new(),
            units: Mutex::new(BTreeSet::new()),
            launches,
        }
    }

    /// Manager backed by the real pppd, `getifaddrs` and `ip`
    pub fn system(config: TunnelConfig, store: Arc<dyn NodeStore>) -> Self {
        let spawner = Arc::new(PppdSpawner::new(config.pppd_path.clone()));
        let router = PolicyRouter::new(
            Box::new(SystemCommandRunner),
            config.ip_path.clone(),
            config.routing_table_base,
        );
        Self::new(config, store, spawner, Arc::new(SystemInterfaces), router)
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Live tunnel for a node
    pub fn tunnel(&self, node_id: NodeId) -> Option<Arc<Tunnel>> {
        self.tunnels.get(&node_id).map(|t| t.clone())
    }

    pub fn is_active(&self, node_id: NodeId) -> bool {
        self.tunnels.contains_key(&node_id)
    }

    /// Nodes with a live tunnel
    pub fn active_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.tunnels.iter().map(|t| *t.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Bring up a tunnel for the locked node
    ///
    /// On any failure the daemon is killed and its peer file removed
    /// before returning.
    pub async fn create_tunnel(
        &self,
        lock: &NodeLock,
        ip: IpAddr,
        login: &str,
        password: &str,
    ) -> Result<Arc<Tunnel>, TunnelError> {
        let node_id = lock.id();
        if self.tunnels.contains_key(&node_id) {
            return Err(TunnelError::AlreadyActive(node_id));
        }

        let _permit = self
            .launches
            .acquire()
            .await
            .map_err(|_| TunnelError::ShuttingDown)?;

        let unit = self.allocate_unit()?;
        let interface = format!("ppp{}", unit);
        let peer = PeerFile {
            node_id,
            ip,
            login: login.to_string(),
            password: password.to_string(),
            unit,
        };

        let peer_file = match peer.write(&self.config.peers_dir, &self.config.pptp_path).await {
            Ok(path) => path,
            Err(e) => {
                self.release_unit(unit);
                return Err(TunnelError::PeerFile(e.to_string()));
            }
        };

        let mut child = match self.spawner.spawn(&peer_file).await {
            Ok(child) => child,
            Err(e) => {
                error!(node_id, error = %e, "Failed to spawn PPP daemon");
                self.discard(&peer_file, unit).await;
                return Err(TunnelError::Spawn(e.to_string()));
            }
        };
        info!(node_id, %ip, %interface, pid = ?child.id(), "PPP daemon started");

        let state = match self.wait_for_interface(&mut child, &interface).await {
            Ok(state) => state,
            Err(e) => {
                error!(node_id, %interface, error = %e, "Tunnel failed to come up");
                terminate(&mut child, self.config.stop_grace()).await;
                self.discard(&peer_file, unit).await;
                return Err(e);
            }
        };

        let patch = NodePatch::new().ppp_interface(Some(interface.clone()));
        if let Err(e) = self.store.update_node(node_id, patch).await {
            terminate(&mut child, self.config.stop_grace()).await;
            self.discard(&peer_file, unit).await;
            return Err(e.into());
        }

        let tunnel = Arc::new(Tunnel {
            node_id,
            unit,
            interface,
            local: state.local,
            peer_file,
            created_at: Utc::now(),
            child: tokio::sync::Mutex::new(child),
        });
        self.tunnels.insert(node_id, tunnel.clone());

        info!(
            node_id,
            interface = %tunnel.interface,
            local = ?state.local,
            peer = ?state.peer,
            "Tunnel up"
        );
        Ok(tunnel)
    }

    /// Tear down the locked node's tunnel
    ///
    /// Returns whether a tunnel existed. Never fails: cleanup errors are
    /// logged. `ppp_interface` is cleared either way.
    pub async fn destroy_tunnel(&self, lock: &NodeLock) -> bool {
        let node_id = lock.id();
        let existed = match self.tunnels.remove(&node_id) {
            Some((_, tunnel)) => {
                {
                    let mut child = tunnel.child.lock().await;
                    terminate(&mut child, self.config.stop_grace()).await;
                }
                self.discard(&tunnel.peer_file, tunnel.unit).await;
                info!(node_id, interface = %tunnel.interface, "Tunnel destroyed");
                true
            }
            None => false,
        };

        match self.store.get_node(node_id).await {
            Ok(node) if node.ppp_interface.is_some() => {
                let patch = NodePatch::new().ppp_interface(None);
                if let Err(e) = self.store.update_node(node_id, patch).await {
                    warn!(node_id, error = %e, "Failed to clear ppp_interface");
                }
            }
            Ok(_) => {}
            Err(e) => debug!(node_id, error = %e, "Node lookup during teardown failed"),
        }

        existed
    }

    /// Process alive and interface up
    pub async fn health(&self, node_id: NodeId) -> TunnelHealth {
        let Some(tunnel) = self.tunnel(node_id) else {
            return TunnelHealth::NotFound;
        };
        if !tunnel.process_alive().await {
            return TunnelHealth::ProcessExited;
        }
        match self.interfaces.lookup(&tunnel.interface) {
            None => TunnelHealth::InterfaceMissing,
            Some(state) if !state.up => TunnelHealth::InterfaceDown,
            Some(_) => TunnelHealth::Healthy,
        }
    }

    /// Route traffic marked for `socks_port` through `interface`
    pub async fn configure_policy_routing(
        &self,
        socks_port: u16,
        interface: &str,
    ) -> Result<(), RoutingError> {
        self.router.configure(socks_port, interface).await
    }

    pub async fn verify_routing(&self, socks_port: u16, interface: &str) -> bool {
        self.router.verify(socks_port, interface).await
    }

    pub async fn repair_routing(&self, socks_port: u16, interface: &str) -> Result<bool, RoutingError> {
        self.router.repair(socks_port, interface).await
    }

    pub async fn remove_policy_routing(&self, socks_port: u16) {
        self.router.remove(socks_port).await
    }

    /// Remove generated peer files that belong to no live tunnel
    pub async fn sweep_peer_files(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.config.peers_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.config.peers_dir.display(), error = %e, "Peer directory not readable");
                return 0;
            }
        };

        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let owned = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(PEER_FILE_PREFIX));
            if !owned {
                continue;
            }
            let live = ppp::peer_file_node_id(&path).is_some_and(|id| self.tunnels.contains_key(&id));
            if live {
                continue;
            }
            match ppp::remove_peer_file(&path).await {
                Ok(()) => {
                    debug!(path = %path.display(), "Removed stale peer file");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stale peer file"),
            }
        }
        removed
    }

    async fn wait_for_interface(
        &self,
        child: &mut Child,
        interface: &str,
    ) -> Result<InterfaceState, TunnelError> {
        let startup = self.config.startup_timeout();
        let deadline = Instant::now() + startup;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let stderr = read_stderr(child).await;
                    return Err(TunnelError::ProcessExited {
                        status: status.to_string(),
                        stderr,
                    });
                }
                Ok(None) => {}
                Err(e) => return Err(TunnelError::Spawn(e.to_string())),
            }

            if let Some(state) = self.interfaces.lookup(interface) {
                if state.is_ready() {
                    return Ok(state);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(TunnelError::InterfaceTimeout {
                    interface: interface.to_string(),
                    waited_secs: startup.as_secs(),
                });
            }
            sleep(self.config.poll_interval().min(deadline - now)).await;
        }
    }

    /// Lowest unit that is neither handed out nor present on the host
    fn allocate_unit(&self) -> Result<u32, TunnelError> {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        let unit = (0..MAX_UNIT)
            .find(|u| !units.contains(u) && self.interfaces.lookup(&format!("ppp{}", u)).is_none())
            .ok_or(TunnelError::NoFreeUnit)?;
        units.insert(unit);
        Ok(unit)
    }

    fn release_unit(&self, unit: u32) {
        self.units
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&unit);
    }

    async fn discard(&self, peer_file: &std::path::Path, unit: u32) {
        if let Err(e) = ppp::remove_peer_file(peer_file).await {
            warn!(path = %peer_file.display(), error = %e, "Failed to remove peer file");
        }
        self.release_unit(unit);
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL
async fn terminate(child: &mut Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid, error = %e, "SIGTERM failed");
        }
    }
    if timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    warn!(pid = ?child.id(), "PPP daemon ignored SIGTERM, killing");
    if let Err(e) = child.kill().await {
        error!(pid = ?child.id(), error = %e, "Failed to kill PPP daemon");
    }
}

/// Tail of an exited daemon's stderr
async fn read_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = timeout(Duration::from_secs(1), stderr.read_to_end(&mut buf)).await;
    let start = buf.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&buf[start..]).trim().to_string()
}
