//! Watchdog for detecting dead tunnels and listeners.
//!
//! Each cycle walks the `online` nodes under their locks:
//!
//! ```text
//! tunnel health ──fail×N──▶ teardown → ping_failed
//!      │ ok
//! listener alive? ──no──▶ teardown → ping_ok
//!      │ yes
//! routing intact? ──no──▶ repair
//! ```
//!
//! Tunnels and listeners held for nodes that are no longer `online`
//! are released at the end of the cycle.

use crate::config::WatchdogConfig;
use crate::services::NodeServices;
use crate::tunnel::TunnelHealth;
use pfleet_node::{DemotionReason, NodeId, NodeStatus};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters for one watchdog cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub healthy: usize,
    pub tunnel_failures: usize,
    pub proxy_failures: usize,
    pub routes_repaired: usize,
    pub orphans_released: usize,
}

pub struct Watchdog {
    services: Arc<NodeServices>,
    config: WatchdogConfig,
}

impl Watchdog {
    pub fn new(services: Arc<NodeServices>, config: WatchdogConfig) -> Self {
        Self { services, config }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// Run cycles until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(interval_secs = self.config.interval_secs, "Watchdog started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(self.config.interval()) => {}
                }
                let report = self.run_cycle(&cancel).await;
                debug!(?report, "Watchdog cycle finished");
            }
            debug!("Watchdog stopped");
        })
    }

    /// One pass over the online nodes followed by orphan cleanup
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();
        let store = self.services.machine().store().clone();

        let online = match store.list_nodes_by_status(NodeStatus::Online).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "Watchdog could not list online nodes");
                return report;
            }
        };

        for node in online {
            if cancel.is_cancelled() {
                return report;
            }
            self.check_node(node.id, cancel, &mut report).await;
        }

        if !cancel.is_cancelled() {
            self.release_orphans(&mut report).await;
        }
        report
    }

    async fn check_node(&self, node_id: NodeId, cancel: &CancellationToken, report: &mut CycleReport) {
        let machine = self.services.machine();
        let lock = machine.lock(node_id).await;

        // Status may have moved while we waited for the lock
        let node = match machine.store().get_node(node_id).await {
            Ok(node) if node.status == NodeStatus::Online => node,
            Ok(_) => return,
            Err(e) => {
                warn!(node_id, error = %e, "Watchdog lost track of node");
                return;
            }
        };
        report.checked += 1;

        let Some(health) = self.confirm_down(node_id, cancel).await else {
            if cancel.is_cancelled() {
                return;
            }
            if !self.services.relay().is_listening(node_id) {
                warn!(node_id, "SOCKS listener is gone, demoting");
                match self.services.teardown(&lock, DemotionReason::ProxyFailure).await {
                    Ok(change) => {
                        report.proxy_failures += 1;
                        info!(node_id, status = %change.after, "Node demoted after proxy failure");
                    }
                    Err(e) => error!(node_id, error = %e, "Proxy-failure teardown failed"),
                }
                return;
            }

            if let (Some(port), Some(interface)) = (node.socks_port, node.ppp_interface.as_deref()) {
                match self.services.tunnels().repair_routing(port, interface).await {
                    Ok(true) => {
                        report.routes_repaired += 1;
                        warn!(node_id, port, interface, "Policy routing was missing and has been restored");
                    }
                    Ok(false) => {}
                    Err(e) => error!(node_id, port, interface, error = %e, "Routing repair failed"),
                }
            }

            report.healthy += 1;
            let uptime_secs = self.services.tunnels().tunnel(node_id).map(|t| t.uptime().as_secs());
            debug!(node_id, ?uptime_secs, "Node healthy");
            return;
        };

        warn!(node_id, %health, attempts = self.config.attempts, "Tunnel confirmed down, demoting");
        match self.services.teardown(&lock, DemotionReason::TunnelFailure).await {
            Ok(change) => {
                report.tunnel_failures += 1;
                info!(node_id, status = %change.after, "Node demoted after tunnel failure");
            }
            Err(e) => error!(node_id, error = %e, "Tunnel-failure teardown failed"),
        }
    }

    /// Health after every attempt failed, or `None` if any attempt passed
    async fn confirm_down(&self, node_id: NodeId, cancel: &CancellationToken) -> Option<TunnelHealth> {
        let tunnels = self.services.tunnels();
        let mut last = TunnelHealth::NotFound;

        for attempt in 1..=self.config.attempts {
            last = tunnels.health(node_id).await;
            if last.is_healthy() {
                return None;
            }
            debug!(node_id, attempt, health = %last, "Tunnel check failed");

            if attempt < self.config.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = sleep(self.config.attempt_delay()) => {}
                }
            }
        }
        Some(last)
    }

    async fn release_orphans(&self, report: &mut CycleReport) {
        let relay = self.services.relay();
        let mut ids: BTreeSet<NodeId> = self.services.tunnels().active_ids().into_iter().collect();
        ids.extend(relay.bound_ports().into_iter().map(|(id, _)| id));

        let machine = self.services.machine();
        for node_id in ids {
            let lock = machine.lock(node_id).await;
            let status = machine.store().get_node(node_id).await.map(|n| n.status).ok();
            if status == Some(NodeStatus::Online) {
                continue;
            }

            let port = relay
                .bound_ports()
                .into_iter()
                .find(|(id, _)| *id == node_id)
                .map(|(_, port)| port);
            warn!(node_id, ?status, ?port, "Releasing services held by a node that is not online");
            self.services.release(&lock, port).await;
            if let Err(e) = machine.clear_bindings(&lock).await {
                debug!(node_id, error = %e, "Could not clear bindings of orphan");
            }
            report.orphans_released += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::tests::{free_port_range, harness, node, Harness};
    use pfleet_node::NodeStore;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn watchdog(h: &Harness, attempts: u32, attempt_delay_secs: u64) -> Watchdog {
        let config = WatchdogConfig {
            interval_secs: 3600,
            attempts,
            attempt_delay_secs,
        };
        Watchdog::new(h.services.clone(), config)
    }

    async fn launched(ids: &[u64]) -> Harness {
        let (start, end) = free_port_range(ids.len() as u16);
        let nodes = ids.iter().map(|id| node(*id, NodeStatus::SpeedOk)).collect();
        let h = harness(nodes, start, end).await;
        for id in ids {
            let lock = h.services.machine().lock(*id).await;
            h.services.launch(&lock).await.unwrap();
        }
        h
    }

    async fn cleanup(h: &Harness, ids: &[u64]) {
        for id in ids {
            let lock = h.services.machine().lock(*id).await;
            let _ = h.services.teardown(&lock, DemotionReason::Stopped).await;
        }
    }

    #[tokio::test]
    async fn test_healthy_node_untouched() {
        let h = launched(&[1]).await;
        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;

        assert_eq!(report.checked, 1);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.routes_repaired, 0);
        assert_eq!(h.store.get_node(1).await.unwrap().status, NodeStatus::Online);
        cleanup(&h, &[1]).await;
    }

    #[tokio::test]
    async fn test_dead_tunnel_demotes_to_ping_failed() {
        let h = launched(&[1, 2]).await;
        let iface = h.store.get_node(1).await.unwrap().ppp_interface.unwrap();
        h.interfaces.set_down(&iface);

        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.tunnel_failures, 1);
        assert_eq!(report.healthy, 1);

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingFailed);
        assert!(!node.has_bindings());
        assert!(!h.services.relay().is_listening(1));
        assert!(!h.services.tunnels().is_active(1));
        assert_eq!(h.services.ports().in_use(), 1);
        assert_eq!(h.store.get_node(2).await.unwrap().status, NodeStatus::Online);
        cleanup(&h, &[2]).await;
    }

    #[tokio::test]
    async fn test_flap_within_attempts_is_tolerated() {
        let h = launched(&[1]).await;
        let iface = h.store.get_node(1).await.unwrap().ppp_interface.unwrap();
        h.interfaces.set_down(&iface);

        let interfaces = h.interfaces.clone();
        let name = iface.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(300)).await;
            interfaces.set_up(&name, Ipv4Addr::new(10, 64, 0, 2), Ipv4Addr::new(10, 64, 0, 1));
        });

        let report = watchdog(&h, 3, 1).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.tunnel_failures, 0);
        assert_eq!(report.healthy, 1);
        assert_eq!(h.store.get_node(1).await.unwrap().status, NodeStatus::Online);
        cleanup(&h, &[1]).await;
    }

    #[tokio::test]
    async fn test_dead_listener_demotes_to_ping_ok() {
        let h = launched(&[1]).await;
        h.services.relay().stop_for_node(1).await;

        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.proxy_failures, 1);

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingOk);
        assert!(!node.has_bindings());
        assert!(!h.services.tunnels().is_active(1));
        assert_eq!(h.services.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_registered_listener_with_dead_accept_loop_demotes() {
        let h = launched(&[1]).await;
        let port = h.store.get_node(1).await.unwrap().socks_port.unwrap();
        assert!(h.services.relay().abort_accept_loop(1));
        tokio::time::timeout(Duration::from_secs(2), async {
            while h.services.relay().is_listening(1) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.services.relay().port_owner(port), Some(1));

        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.proxy_failures, 1);
        assert_eq!(report.healthy, 0);

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingOk);
        assert!(!node.has_bindings());
        assert_eq!(h.services.relay().port_owner(port), None);
        assert!(!h.services.tunnels().is_active(1));
        assert_eq!(h.services.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_missing_route_is_repaired() {
        let h = launched(&[1]).await;
        h.ip.routes.lock().unwrap().clear();

        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.routes_repaired, 1);
        assert_eq!(report.healthy, 1);
        assert_eq!(h.ip.routes.lock().unwrap().len(), 1);
        cleanup(&h, &[1]).await;
    }

    #[tokio::test]
    async fn test_orphan_tunnel_released() {
        let (start, end) = free_port_range(1);
        let h = harness(vec![node(1, NodeStatus::PingOk)], start, end).await;
        let lock = h.services.machine().lock(1).await;
        h.services
            .tunnels()
            .create_tunnel(&lock, "10.0.0.1".parse().unwrap(), "user", "pass")
            .await
            .unwrap();
        drop(lock);

        let report = watchdog(&h, 3, 0).run_cycle(&CancellationToken::new()).await;
        assert_eq!(report.checked, 0);
        assert_eq!(report.orphans_released, 1);
        assert!(!h.services.tunnels().is_active(1));

        let node = h.store.get_node(1).await.unwrap();
        assert_eq!(node.status, NodeStatus::PingOk);
        assert!(node.ppp_interface.is_none());
    }

    #[tokio::test]
    async fn test_cancel_during_hysteresis_keeps_node() {
        let h = launched(&[1]).await;
        let iface = h.store.get_node(1).await.unwrap().ppp_interface.unwrap();
        h.interfaces.set_down(&iface);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let report = watchdog(&h, 3, 5).run_cycle(&cancel).await;
        assert_eq!(report.tunnel_failures, 0);
        assert_eq!(h.store.get_node(1).await.unwrap().status, NodeStatus::Online);
        cleanup(&h, &[1]).await;
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_cancel() {
        let (start, end) = free_port_range(1);
        let h = harness(vec![], start, end).await;
        let cancel = CancellationToken::new();
        let handle = Arc::new(watchdog(&h, 1, 0)).spawn(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
