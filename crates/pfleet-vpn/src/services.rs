//! Node Services
//!
//! Promotion and demotion: the only two flows that touch tunnel and
//! proxy bindings. Both run under the node's lock.
//!
//! ```text
//! launch:   tunnel ─▶ port ─▶ routing ─▶ listener ─▶ promote
//!              ▲                                        │
//!              └──────── rollback on any failure ◀──────┘
//!
//! teardown: stop listener ─▶ drop routing ─▶ release port
//!           ─▶ destroy tunnel ─▶ demote
//! ```
//!
//! A failed launch leaves the node at its pre-promotion status with no
//! tunnel, listener, route or port held.

use crate::allocator::{generate_credential, PortAllocator};
use crate::error::FleetError;
use crate::proxy::SocksRelay;
use crate::tunnel::{Tunnel, TunnelManager};
use pfleet_node::{DemotionReason, NodeLock, NodeStatus, ProxyBinding, StatusChange, StatusMachine};
use std::sync::Arc;
use tracing::{info, warn};

/// Launch and teardown over the tunnel and relay registries
pub struct NodeServices {
    machine: Arc<StatusMachine>,
    tunnels: Arc<TunnelManager>,
    relay: Arc<SocksRelay>,
    ports: PortAllocator,
}

impl NodeServices {
    pub fn new(machine: Arc<StatusMachine>, tunnels: Arc<TunnelManager>, relay: Arc<SocksRelay>) -> Self {
        let socks = relay.config();
        let ports = PortAllocator::new(socks.port_range_start, socks.port_range_end);
        Self {
            machine,
            tunnels,
            relay,
            ports,
        }
    }

    pub fn machine(&self) -> &Arc<StatusMachine> {
        &self.machine
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    pub fn relay(&self) -> &Arc<SocksRelay> {
        &self.relay
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Bring the locked node online
    pub async fn launch(&self, lock: &NodeLock) -> Result<StatusChange, FleetError> {
        let node_id = lock.id();
        let node = self.machine.store().get_node(node_id).await?;

        if !node.status.is_promotable() {
            return Err(FleetError::NotPromotable {
                node_id,
                status: node.status,
            });
        }
        if self.tunnels.is_active(node_id) || self.relay.is_listening(node_id) {
            return Err(FleetError::AlreadyActive(node_id));
        }

        let tunnel = self
            .tunnels
            .create_tunnel(lock, node.ip, &node.login, &node.password)
            .await?;

        // Ports squatted by other processes stay taken until the launch ends
        let mut squatted = Vec::new();
        let result = loop {
            let Some(port) = self.ports.allocate() else {
                warn!(
                    node_id,
                    capacity = self.ports.capacity(),
                    squatted = squatted.len(),
                    "No free SOCKS port"
                );
                break Err(FleetError::NoFreePort);
            };

            match self.expose(lock, &tunnel, port).await {
                Ok(change) => break Ok(change),
                Err(e) => {
                    self.relay.stop_for_node(node_id).await;
                    self.tunnels.remove_policy_routing(port).await;
                    if e.is_port_in_use() {
                        warn!(node_id, port, "SOCKS port held by another process, trying the next one");
                        squatted.push(port);
                        continue;
                    }
                    warn!(node_id, port, error = %e, "Launch failed, rolling back");
                    self.ports.release(port);
                    break Err(e);
                }
            }
        };

        for port in squatted {
            self.ports.release(port);
        }
        if result.is_err() {
            self.tunnels.destroy_tunnel(lock).await;
        }
        result
    }

    async fn expose(&self, lock: &NodeLock, tunnel: &Tunnel, port: u16) -> Result<StatusChange, FleetError> {
        let node_id = lock.id();
        let interface = tunnel.interface();
        let socks = self.relay.config();

        self.tunnels.configure_policy_routing(port, interface).await?;

        let login = generate_credential(socks.credential_length);
        let password = generate_credential(socks.credential_length);
        self.relay
            .start_for_node(node_id, port, interface, &login, &password)
            .await?;

        let binding = ProxyBinding {
            ip: socks.advertised_ip(),
            port,
            login,
            password,
        };
        let change = self.machine.promote(lock, binding).await?;

        info!(node_id, port, interface, "Node services launched");
        Ok(change)
    }

    /// Take the locked node out of `online` (or `offline`)
    ///
    /// The listener is closed before the status changes.
    pub async fn teardown(
        &self,
        lock: &NodeLock,
        reason: DemotionReason,
    ) -> Result<StatusChange, FleetError> {
        let node_id = lock.id();
        let node = self.machine.store().get_node(node_id).await?;

        if !matches!(node.status, NodeStatus::Online | NodeStatus::Offline) {
            return Err(FleetError::NotOnline {
                node_id,
                status: node.status,
            });
        }

        self.release(lock, node.socks_port).await;
        Ok(self.machine.demote(lock, reason).await?)
    }

    /// Drop listener, routing, port and tunnel without touching status
    pub async fn release(&self, lock: &NodeLock, socks_port: Option<u16>) {
        let node_id = lock.id();
        self.relay.stop_for_node(node_id).await;
        if let Some(port) = socks_port {
            self.tunnels.remove_policy_routing(port).await;
            self.ports.release(port);
        }
        self.tunnels.destroy_tunnel(lock).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::iface::StaticInterfaces;
    use crate::proxy::tests::{test_config as socks_config, RecordingDialer};
    use crate::proxy::RelayError;
    use crate::routing::tests::FakeIp;
    use crate::tunnel::tests::{manager_with_ip, ScriptSpawner};
    use pfleet_node::{MemoryNodeStore, Node, NodeStore};
    use std::net::{IpAddr, Ipv4Addr};

    pub(crate) struct Harness {
        pub _dir: tempfile::TempDir,
        pub store: Arc<MemoryNodeStore>,
        pub interfaces: Arc<StaticInterfaces>,
        pub spawner: Arc<ScriptSpawner>,
        pub ip: Arc<FakeIp>,
        pub services: Arc<NodeServices>,
    }

    /// Services over fakes; pppd is `sleep 30` and brings its interface up
    pub(crate) async fn harness(nodes: Vec<Node>, port_start: u16, port_end: u16) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryNodeStore::with_nodes(nodes).unwrap());
        let interfaces = Arc::new(StaticInterfaces::new());
        let spawner = Arc::new(ScriptSpawner::new("sleep 30", Some(interfaces.clone())));
        let ip = Arc::new(FakeIp::default());
        let tunnels = Arc::new(manager_with_ip(
            dir.path(),
            store.clone(),
            spawner.clone(),
            interfaces.clone(),
            ip.clone(),
        ));

        let mut socks = socks_config();
        socks.port_range_start = port_start;
        socks.port_range_end = port_end;
        socks.public_ip = Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        let relay = Arc::new(SocksRelay::new(socks, Arc::new(RecordingDialer::default())));

        let machine = Arc::new(StatusMachine::new(store.clone(), 1.0));
        let services = Arc::new(NodeServices::new(machine, tunnels, relay));

        Harness {
            _dir: dir,
            store,
            interfaces,
            spawner,
            ip,
            services,
        }
    }

    pub(crate) fn node(id: u64, status: NodeStatus) -> Node {
        let mut node = Node::new(id, IpAddr::V4(Ipv4Addr::new(10, 0, 0, id as u8)), "user", "pass");
        node.status = status;
        node
    }

    /// Free loopback ports for the listener range
    pub(crate) fn free_port_range(len: u16) -> (u16, u16) {
        for _ in 0..50 {
            let scratch = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let start = scratch.local_addr().unwrap().port();
            drop(scratch);
            if start.checked_add(len).is_none() {
                continue;
            }
            let all_free = (start..start + len)
                .all(|p| std::net::TcpListener::bind(("127.0.0.1", p)).is_ok());
            if all_free {
                return (start, start + len - 1);
            }
        }
        panic!("no free port range");
    }

    #[tokio::test]
    async fn test_launch_promotes_with_bindings() {
        let (start, end) = free_port_range(4);
        let h = harness(vec![node(1, NodeStatus::SpeedOk)], start, end).await;
        let machine = h.services.machine().clone();

        let lock = machine.lock(1).await;
        let change = h.services.launch(&lock).await.unwrap();
        assert_eq!(change.before, NodeStatus::SpeedOk);
        assert_eq!(change.after, NodeStatus::Online);

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.previous_status, Some(NodeStatus::SpeedOk));
        assert_eq!(node.ppp_interface.as_deref(), Some("ppp0"));
        assert_eq!(node.socks_port, Some(start));
        assert_eq!(node.socks_ip, Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10))));
        assert_ne!(node.socks_login.as_deref(), Some("user"));
        assert!(h.services.relay().is_listening(1));
        assert!(h.services.tunnels().is_active(1));

        h.services.teardown(&lock, DemotionReason::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn test_launch_rejects_unverified_node() {
        let (start, end) = free_port_range(2);
        let h = harness(vec![node(1, NodeStatus::PingFailed)], start, end).await;

        let lock = h.services.machine().lock(1).await;
        let err = h.services.launch(&lock).await.unwrap_err();
        assert!(matches!(err, FleetError::NotPromotable { .. }));
        assert!(h.spawner.pids.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_listener_rolls_back() {
        let (start, _) = free_port_range(1);
        let h = harness(vec![node(1, NodeStatus::PingOk)], start, start).await;
        // Relay registry already hands the port to another node
        h.services
            .relay()
            .start_for_node(2, start, "ppp9", "other", "other")
            .await
            .unwrap();

        let lock = h.services.machine().lock(1).await;
        let err = h.services.launch(&lock).await.unwrap_err();
        assert!(matches!(err, FleetError::Relay(RelayError::PortBusy { owner: 2, .. })));

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingOk);
        assert!(!node.has_bindings());
        assert!(!h.services.tunnels().is_active(1));
        assert!(!h.services.relay().is_listening(1));
        assert_eq!(h.services.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_launch_skips_port_held_by_other_process() {
        let (start, end) = free_port_range(2);
        let squatter = std::net::TcpListener::bind(("127.0.0.1", start)).unwrap();
        let h = harness(vec![node(1, NodeStatus::PingOk)], start, end).await;

        let lock = h.services.machine().lock(1).await;
        let change = h.services.launch(&lock).await.unwrap();
        assert_eq!(change.after, NodeStatus::Online);

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.socks_port, Some(end));
        assert_eq!(h.services.relay().port_owner(end), Some(1));
        assert_eq!(h.services.relay().port_owner(start), None);
        // Only the live listener's port stays allocated
        assert_eq!(h.services.ports().in_use(), 1);
        assert_eq!(h.ip.rules.lock().unwrap().len(), 1);

        h.services.teardown(&lock, DemotionReason::Stopped).await.unwrap();
        drop(squatter);
    }

    #[tokio::test]
    async fn test_every_port_held_rolls_back() {
        let (start, _) = free_port_range(1);
        let squatter = std::net::TcpListener::bind(("127.0.0.1", start)).unwrap();
        let h = harness(vec![node(1, NodeStatus::PingOk)], start, start).await;

        let lock = h.services.machine().lock(1).await;
        let err = h.services.launch(&lock).await.unwrap_err();
        assert!(matches!(err, FleetError::NoFreePort));

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingOk);
        assert!(!node.has_bindings());
        assert!(!h.services.tunnels().is_active(1));
        assert!(h.ip.rules.lock().unwrap().is_empty());
        assert_eq!(h.services.ports().in_use(), 0);
        drop(squatter);
    }

    #[tokio::test]
    async fn test_ports_distinct_and_reused_after_teardown() {
        let (start, end) = free_port_range(2);
        let h = harness(
            vec![
                node(1, NodeStatus::PingOk),
                node(2, NodeStatus::SpeedOk),
                node(3, NodeStatus::SpeedOk),
            ],
            start,
            end,
        )
        .await;
        let machine = h.services.machine().clone();

        let l1 = machine.lock(1).await;
        let l2 = machine.lock(2).await;
        let l3 = machine.lock(3).await;
        h.services.launch(&l1).await.unwrap();
        h.services.launch(&l2).await.unwrap();
        assert!(matches!(h.services.launch(&l3).await, Err(FleetError::NoFreePort)));
        assert!(!h.services.tunnels().is_active(3));

        let online = h.store.list_nodes_by_status(NodeStatus::Online).await.unwrap();
        assert_eq!(online.len(), 2);
        assert_ne!(online[0].socks_port, online[1].socks_port);

        let change = h.services.teardown(&l1, DemotionReason::Stopped).await.unwrap();
        assert_eq!(change.after, NodeStatus::PingOk);
        h.services.launch(&l3).await.unwrap();
        assert_eq!(h.store.get_node(3).await.unwrap().socks_port, Some(start));

        h.services.teardown(&l2, DemotionReason::Stopped).await.unwrap();
        h.services.teardown(&l3, DemotionReason::Stopped).await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_requires_online() {
        let (start, end) = free_port_range(1);
        let h = harness(vec![node(1, NodeStatus::PingOk)], start, end).await;

        let lock = h.services.machine().lock(1).await;
        assert!(matches!(
            h.services.teardown(&lock, DemotionReason::Stopped).await,
            Err(FleetError::NotOnline { .. })
        ));
    }
}
