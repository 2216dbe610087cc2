//! Fleet Manager
//!
//! Batch entry points over the whole node set: protocol tests, launch,
//! stop, startup recovery and shutdown.
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = Arc::new(MemoryNodeStore::load_json(&config.fleet.nodes_file).await?);
//! let fleet = FleetManager::system(config, store);
//!
//! fleet.recover_stale().await?;
//! fleet.ping_nodes(&[], false).await;
//! fleet.speed_nodes(&[]).await;
//! fleet.launch_nodes(&[3, 7]).await;
//!
//! let watchdog = fleet.spawn_watchdog();
//! // ... until a signal arrives
//! fleet.shutdown().await;
//! ```
//!
//! Every batch runs at most `fleet.max_concurrent_tests` nodes at once
//! and stops dispatching when the manager is cancelled. Nodes that were
//! never dispatched come back as failed reports.

use crate::config::FleetConfig;
use crate::egress::DeviceBoundDialer;
use crate::error::FleetError;
use crate::proxy::SocksRelay;
use crate::services::NodeServices;
use crate::tunnel::TunnelManager;
use crate::watchdog::Watchdog;
use pfleet_node::{
    DemotionReason, Node, NodeId, NodeStatus, NodeStore, ProbeOutcome, StatusChange, StatusMachine,
};
use pfleet_probe::ProtocolTester;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one node in a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeReport {
    pub node_id: NodeId,
    /// Status when the node was picked, if it could be read
    pub before: Option<NodeStatus>,
    /// Status after the operation, if it could be read
    pub after: Option<NodeStatus>,
    pub success: bool,
    pub message: String,
}

impl NodeReport {
    fn from_change(change: StatusChange, success: bool, message: impl Into<String>) -> Self {
        Self {
            node_id: change.node_id,
            before: Some(change.before),
            after: Some(change.after),
            success,
            message: message.into(),
        }
    }

    fn failed(node_id: NodeId, status: Option<NodeStatus>, message: impl Into<String>) -> Self {
        Self {
            node_id,
            before: status,
            after: status,
            success: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for NodeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = |s: Option<NodeStatus>| s.map_or("?", |s| s.as_str());
        write!(
            f,
            "node {}: {} -> {} [{}] {}",
            self.node_id,
            status(self.before),
            status(self.after),
            if self.success { "ok" } else { "failed" },
            self.message
        )
    }
}

/// What `recover_stale` cleaned up
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Nodes moved from `online` to `offline`
    pub demoted: usize,
    /// Non-online nodes whose leftover bindings were cleared
    pub cleared: usize,
    /// Peer files without a tunnel
    pub peer_files_removed: usize,
}

/// Batch orchestration over probes and node services
pub struct FleetManager {
    config: FleetConfig,
    tester: Arc<ProtocolTester>,
    services: Arc<NodeServices>,
    cancel: CancellationToken,
}

impl FleetManager {
    pub fn new(config: FleetConfig, tester: Arc<ProtocolTester>, services: Arc<NodeServices>) -> Self {
        Self {
            config,
            tester,
            services,
            cancel: CancellationToken::new(),
        }
    }

    /// Manager over the real pppd, `ip` and interface-bound sockets
    pub fn system(config: FleetConfig, store: Arc<dyn NodeStore>) -> Self {
        let machine = Arc::new(StatusMachine::new(store.clone(), config.probe.slow_mbps_floor));
        let tunnels = Arc::new(TunnelManager::system(config.tunnel.clone(), store));
        let relay = Arc::new(SocksRelay::new(config.socks.clone(), Arc::new(DeviceBoundDialer)));
        let services = Arc::new(NodeServices::new(machine, tunnels, relay));
        let tester = Arc::new(ProtocolTester::new(config.probe.clone()));
        Self::new(config, tester, services)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn services(&self) -> &Arc<NodeServices> {
        &self.services
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        self.services.machine().store()
    }

    /// Stop dispatching batch work and stop the watchdog
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn watchdog(&self) -> Watchdog {
        Watchdog::new(self.services.clone(), self.config.watchdog.clone())
    }

    /// Start the watchdog loop; it ends when the manager is cancelled
    pub fn spawn_watchdog(&self) -> JoinHandle<()> {
        Arc::new(self.watchdog()).spawn(self.cancel.child_token())
    }

    /// Protocol-test nodes
    ///
    /// `light` only checks that the control port accepts connections,
    /// which never promotes a node. Empty `ids` selects every node that
    /// is not online.
    pub async fn ping_nodes(&self, ids: &[NodeId], light: bool) -> Vec<NodeReport> {
        let (nodes, mut reports) = self.select(ids, |s| !s.is_online()).await;

        let tester = self.tester.clone();
        let machine = self.services.machine().clone();
        reports.extend(
            self.run_batch("ping", nodes, move |node| {
                ping_one(tester.clone(), machine.clone(), node, light)
            })
            .await,
        );
        finish("ping", reports)
    }

    /// Measure throughput of nodes that passed a ping
    pub async fn speed_nodes(&self, ids: &[NodeId]) -> Vec<NodeReport> {
        let (nodes, mut reports) = self
            .select(ids, |s| s.accepts_speed_test() && !s.is_online())
            .await;

        let tester = self.tester.clone();
        let machine = self.services.machine().clone();
        reports.extend(
            self.run_batch("speed", nodes, move |node| {
                speed_one(tester.clone(), machine.clone(), node)
            })
            .await,
        );
        finish("speed", reports)
    }

    /// Bring nodes online; empty `ids` selects every promotable node
    pub async fn launch_nodes(&self, ids: &[NodeId]) -> Vec<NodeReport> {
        let (nodes, mut reports) = self.select(ids, |s| s.is_promotable()).await;

        let services = self.services.clone();
        reports.extend(
            self.run_batch("launch", nodes, move |node| {
                let services = services.clone();
                async move {
                    let lock = services.machine().lock(node.id).await;
                    match services.launch(&lock).await {
                        Ok(change) => NodeReport::from_change(change, true, "Tunnel and proxy started"),
                        Err(e) => NodeReport::failed(node.id, Some(node.status), e.to_string()),
                    }
                }
            })
            .await,
        );
        finish("launch", reports)
    }

    /// Take nodes out of `online`; empty `ids` selects every online node
    pub async fn stop_nodes(&self, ids: &[NodeId]) -> Vec<NodeReport> {
        let (nodes, mut reports) = self.select(ids, |s| s.is_online()).await;

        let services = self.services.clone();
        reports.extend(
            self.run_batch("stop", nodes, move |node| {
                teardown_one(services.clone(), node, DemotionReason::Stopped)
            })
            .await,
        );
        finish("stop", reports)
    }

    /// Reconcile persisted state after a restart
    ///
    /// No tunnel survives a restart, so every `online` node moves to
    /// `offline` and stray bindings on other nodes are cleared. Leftover
    /// routing for the recorded port is removed as well.
    pub async fn recover_stale(&self) -> Result<RecoveryReport, FleetError> {
        let machine = self.services.machine();
        let mut report = RecoveryReport::default();

        for node in machine.store().list_nodes().await? {
            if node.status.is_online() {
                let lock = machine.lock(node.id).await;
                self.services.release(&lock, node.socks_port).await;
                machine.demote(&lock, DemotionReason::TunnelLost).await?;
                report.demoted += 1;
            } else if node.has_bindings() {
                let lock = machine.lock(node.id).await;
                machine.clear_bindings(&lock).await?;
                report.cleared += 1;
            }
        }

        report.peer_files_removed = self.services.tunnels().sweep_peer_files().await;
        if report != RecoveryReport::default() {
            warn!(
                demoted = report.demoted,
                cleared = report.cleared,
                peer_files = report.peer_files_removed,
                "Recovered stale state"
            );
        }
        Ok(report)
    }

    /// Cancel everything, then tear down every live node
    ///
    /// Torn-down nodes are left `offline`.
    pub async fn shutdown(&self) -> Vec<NodeReport> {
        self.cancel.cancel();
        info!("Shutting down fleet");

        let online = match self.store().list_nodes_by_status(NodeStatus::Online).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Could not list online nodes for shutdown");
                Vec::new()
            }
        };

        let mut set = JoinSet::new();
        for node in online {
            set.spawn(teardown_one(self.services.clone(), node, DemotionReason::TunnelLost));
        }
        let mut reports = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(error = %e, "Shutdown task failed"),
            }
        }

        // Anything still held belongs to a node that is not online
        let machine = self.services.machine();
        for node_id in self.services.tunnels().active_ids() {
            let lock = machine.lock(node_id).await;
            let port = self.services.relay().bound_ports().into_iter().find(|(id, _)| *id == node_id);
            self.services.release(&lock, port.map(|(_, p)| p)).await;
        }
        for (node_id, port) in self.services.relay().bound_ports() {
            let lock = machine.lock(node_id).await;
            self.services.release(&lock, Some(port)).await;
        }

        finish("shutdown", reports)
    }

    /// `ip:port:login:password` for every online node, by id
    pub async fn proxy_list(&self) -> Result<Vec<String>, FleetError> {
        let mut online = self.store().list_nodes_by_status(NodeStatus::Online).await?;
        online.sort_by_key(|n| n.id);
        Ok(online.iter().filter_map(Node::proxy_tuple).collect())
    }

    /// Write the proxy list, one tuple per line; returns the count
    pub async fn write_proxy_list(&self, path: &Path) -> Result<usize, FleetError> {
        let lines = self.proxy_list().await?;
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(path, content).await?;
        info!(path = %path.display(), count = lines.len(), "Proxy list written");
        Ok(lines.len())
    }

    /// Resolve `ids`, or pick eligible nodes when empty
    async fn select(
        &self,
        ids: &[NodeId],
        eligible: impl Fn(NodeStatus) -> bool,
    ) -> (Vec<Node>, Vec<NodeReport>) {
        let store = self.store();
        let mut nodes = Vec::new();
        let mut reports = Vec::new();

        if ids.is_empty() {
            match store.list_nodes().await {
                Ok(all) => nodes.extend(all.into_iter().filter(|n| eligible(n.status))),
                Err(e) => error!(error = %e, "Could not list nodes"),
            }
        } else {
            for &id in ids {
                match store.get_node(id).await {
                    Ok(node) => nodes.push(node),
                    Err(e) => reports.push(NodeReport::failed(id, None, e.to_string())),
                }
            }
        }

        nodes.sort_by_key(|n| n.id);
        (nodes, reports)
    }

    async fn run_batch<F, Fut>(&self, what: &'static str, nodes: Vec<Node>, op: F) -> Vec<NodeReport>
    where
        F: Fn(Node) -> Fut,
        Fut: Future<Output = NodeReport> + Send + 'static,
    {
        debug!(what, nodes = nodes.len(), "Batch started");
        let permits = Arc::new(Semaphore::new(self.config.fleet.max_concurrent_tests.max(1)));
        let mut set = JoinSet::new();
        let mut reports = Vec::new();

        for node in nodes {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                reports.push(NodeReport::failed(node.id, Some(node.status), "Cancelled before start"));
                continue;
            };

            let task = op(node);
            set.spawn(async move {
                let _permit = permit;
                task.await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(e) => error!(what, error = %e, "Batch task failed"),
            }
        }
        reports
    }
}

fn finish(what: &'static str, mut reports: Vec<NodeReport>) -> Vec<NodeReport> {
    reports.sort_by_key(|r| r.node_id);
    let succeeded = reports.iter().filter(|r| r.success).count();
    info!(what, total = reports.len(), succeeded, "Batch finished");
    reports
}

async fn ping_one(
    tester: Arc<ProtocolTester>,
    machine: Arc<StatusMachine>,
    node: Node,
    light: bool,
) -> NodeReport {
    let probe = tester.config();
    let (outcome, message) = if light {
        if tester.ping_light(node.ip, node.port, probe.connect_timeout()).await {
            (ProbeOutcome::PortOpen, "Control port open".to_string())
        } else {
            (ProbeOutcome::Failed, "Control port unreachable".to_string())
        }
    } else {
        let result = tester
            .ping_auth(node.ip, node.port, &node.login, &node.password, probe.read_timeout())
            .await;
        let outcome = if result.success {
            ProbeOutcome::Accepted {
                elapsed_ms: result.elapsed_ms,
            }
        } else {
            ProbeOutcome::Failed
        };
        (outcome, result.message)
    };

    let success = !matches!(outcome, ProbeOutcome::Failed);
    let lock = machine.lock(node.id).await;
    match machine.record_ping(&lock, outcome).await {
        Ok(change) => NodeReport::from_change(change, success, message),
        Err(e) => NodeReport::failed(node.id, Some(node.status), e.to_string()),
    }
}

async fn speed_one(tester: Arc<ProtocolTester>, machine: Arc<StatusMachine>, node: Node) -> NodeReport {
    if !node.status.accepts_speed_test() {
        return NodeReport::failed(
            node.id,
            Some(node.status),
            format!("Speed test needs a passed ping, node is {}", node.status),
        );
    }

    let probe = tester.config();
    let result = tester
        .speed_estimate(node.ip, node.port, probe.speed_sample_bytes, probe.read_timeout())
        .await;
    let mbps = result.success.then_some(result.download_mbps);

    let lock = machine.lock(node.id).await;
    match machine.record_speed(&lock, mbps).await {
        Ok(change) => NodeReport::from_change(change, result.success, result.format()),
        Err(e) => NodeReport::failed(node.id, Some(node.status), e.to_string()),
    }
}

async fn teardown_one(services: Arc<NodeServices>, node: Node, reason: DemotionReason) -> NodeReport {
    let lock = services.machine().lock(node.id).await;
    match services.teardown(&lock, reason).await {
        Ok(change) => NodeReport::from_change(change, true, format!("Services stopped ({})", reason)),
        Err(e) => NodeReport::failed(node.id, Some(node.status), e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{free_port_range, harness, node, Harness};
    use pfleet_node::MemoryNodeStore;
    use pfleet_probe::ProbeConfig;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn fleet(h: &Harness) -> FleetManager {
        let probe = ProbeConfig {
            connect_timeout_ms: 500,
            read_timeout_ms: 500,
            attempts: 1,
            speed_sample_bytes: 64 * 1024,
            latency_samples: 2,
            ..ProbeConfig::default()
        };
        let mut config = FleetConfig::default();
        config.probe = probe.clone();
        config.fleet.max_concurrent_tests = 2;
        FleetManager::new(config, Arc::new(ProtocolTester::new(probe)), h.services.clone())
    }

    fn local_node(id: NodeId, port: u16, status: NodeStatus) -> Node {
        let mut node = Node::new(id, IpAddr::V4(Ipv4Addr::LOCALHOST), "user", "pass").with_port(port);
        node.status = status;
        node
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Accepts connections and discards everything sent
    async fn sink() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_light_ping_keeps_status() {
        let open = sink().await;
        let closed = closed_port().await;
        let (start, end) = free_port_range(1);
        let h = harness(
            vec![
                local_node(1, open, NodeStatus::NotTested),
                local_node(2, closed, NodeStatus::SpeedOk),
            ],
            start,
            end,
        )
        .await;

        let reports = fleet(&h).ping_nodes(&[1, 2], true).await;
        assert_eq!(reports.len(), 2);
        assert!(reports[0].success);
        assert_eq!(reports[0].after, Some(NodeStatus::NotTested));
        assert!(!reports[1].success);
        assert_eq!(reports[1].after, Some(NodeStatus::PingFailed));
    }

    #[tokio::test]
    async fn test_auth_ping_failure_records_ping_failed() {
        let closed = closed_port().await;
        let (start, end) = free_port_range(1);
        let h = harness(vec![local_node(1, closed, NodeStatus::PingOk)], start, end).await;

        let reports = fleet(&h).ping_nodes(&[], false).await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);
        assert_eq!(reports[0].before, Some(NodeStatus::PingOk));

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingFailed);
        assert!(node.last_check.is_some());
    }

    #[tokio::test]
    async fn test_unknown_id_reported() {
        let (start, end) = free_port_range(1);
        let h = harness(vec![], start, end).await;

        let reports = fleet(&h).ping_nodes(&[42], true).await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].node_id, 42);
        assert!(!reports[0].success);
        assert_eq!(reports[0].before, None);
    }

    #[tokio::test]
    async fn test_speed_promotes_ping_ok() {
        let port = sink().await;
        let (start, end) = free_port_range(1);
        let h = harness(
            vec![
                local_node(1, port, NodeStatus::PingOk),
                local_node(2, port, NodeStatus::NotTested),
            ],
            start,
            end,
        )
        .await;

        let reports = fleet(&h).speed_nodes(&[1, 2]).await;
        assert!(reports[0].success, "{}", reports[0].message);
        assert_eq!(reports[0].after, Some(NodeStatus::SpeedOk));
        assert!(h.store.get_node(1).await.unwrap().speed.unwrap() > 1.0);

        assert!(!reports[1].success);
        assert_eq!(h.store.get_node(2).await.unwrap().status, NodeStatus::NotTested);
    }

    #[tokio::test]
    async fn test_failed_speed_keeps_status() {
        let closed = closed_port().await;
        let (start, end) = free_port_range(1);
        let h = harness(vec![local_node(1, closed, NodeStatus::SpeedOk)], start, end).await;

        let reports = fleet(&h).speed_nodes(&[]).await;
        assert!(!reports[0].success);
        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::SpeedOk);
        assert!(node.speed.is_none());
    }

    #[tokio::test]
    async fn test_launch_stop_and_proxy_list() {
        let (start, end) = free_port_range(3);
        let h = harness(
            vec![
                node(1, NodeStatus::SpeedOk),
                node(2, NodeStatus::PingOk),
                node(3, NodeStatus::PingFailed),
            ],
            start,
            end,
        )
        .await;
        let fleet = fleet(&h);

        let reports = fleet.launch_nodes(&[]).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.success && r.after == Some(NodeStatus::Online)));

        let proxies = fleet.proxy_list().await.unwrap();
        assert_eq!(proxies.len(), 2);
        assert!(proxies.iter().all(|p| p.starts_with("203.0.113.10:")));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.txt");
        assert_eq!(fleet.write_proxy_list(&path).await.unwrap(), 2);
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.lines().count(), 2);

        let reports = fleet.stop_nodes(&[1]).await;
        assert_eq!(reports[0].after, Some(NodeStatus::SpeedOk));
        assert_eq!(fleet.proxy_list().await.unwrap().len(), 1);

        let reports = fleet.launch_nodes(&[3]).await;
        assert!(!reports[0].success);
        assert_eq!(reports[0].after, Some(NodeStatus::PingFailed));

        fleet.stop_nodes(&[]).await;
        assert!(h.services.tunnels().active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_batch_dispatches_nothing() {
        let (start, end) = free_port_range(1);
        let h = harness(vec![node(1, NodeStatus::SpeedOk)], start, end).await;
        let fleet = fleet(&h);

        fleet.cancel();
        let reports = fleet.launch_nodes(&[1]).await;
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].success);
        assert!(reports[0].message.contains("Cancelled"));
        assert!(h.spawner.pids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recover_stale_moves_online_to_offline() {
        let (start, end) = free_port_range(1);
        let mut stale = node(1, NodeStatus::Online);
        stale.previous_status = Some(NodeStatus::SpeedOk);
        stale.ppp_interface = Some("ppp7".to_string());
        stale.socks_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        stale.socks_port = Some(start);
        stale.socks_login = Some("a".to_string());
        stale.socks_password = Some("b".to_string());
        let mut leftover = node(2, NodeStatus::PingOk);
        leftover.ppp_interface = Some("ppp8".to_string());

        let h = harness(vec![stale, leftover, node(3, NodeStatus::SpeedOk)], start, end).await;
        let report = fleet(&h).recover_stale().await.unwrap();
        assert_eq!(report.demoted, 1);
        assert_eq!(report.cleared, 1);

        let n1 = h.store.get_node(1).await.unwrap();
        assert_eq!(n1.status, NodeStatus::Offline);
        assert!(!n1.has_bindings());
        let n2 = h.store.get_node(2).await.unwrap();
        assert_eq!(n2.status, NodeStatus::PingOk);
        assert!(!n2.has_bindings());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_nodes_offline() {
        let (start, end) = free_port_range(2);
        let h = harness(vec![node(1, NodeStatus::SpeedOk), node(2, NodeStatus::PingOk)], start, end).await;
        let fleet = fleet(&h);
        fleet.launch_nodes(&[1, 2]).await;

        let reports = fleet.shutdown().await;
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.after == Some(NodeStatus::Offline)));
        assert!(fleet.is_cancelled());
        assert!(h.services.tunnels().active_ids().is_empty());
        assert!(h.services.relay().bound_ports().is_empty());
        assert_eq!(h.services.ports().in_use(), 0);

        // offline nodes can come back
        let relaunch = FleetManager::new(fleet.config().clone(), fleet.tester.clone(), h.services.clone());
        let reports = relaunch.launch_nodes(&[1]).await;
        assert!(reports[0].success, "{}", reports[0].message);
        relaunch.shutdown().await;
    }

    #[tokio::test]
    async fn test_system_manager_wires_store() {
        let store = Arc::new(MemoryNodeStore::with_nodes(vec![node(1, NodeStatus::Online)]).unwrap());
        let fleet = FleetManager::system(FleetConfig::default(), store);
        assert_eq!(fleet.proxy_list().await.unwrap().len(), 0);
        assert_eq!(fleet.watchdog().config().attempts, 3);
    }
}
