//! Node Status Transitions
//!
//! Pure transition table over [`NodeStatus`]. Nothing here touches storage;
//! [`StatusMachine`](crate::StatusMachine) applies the results.
//!
//! ```text
//! not_tested ─┬─▶ ping_failed ◀──────────────┐
//!             └─▶ ping_ok ─┬─▶ speed_slow    │
//!                          └─▶ speed_ok      │
//! ping_ok / speed_ok ─▶ online ─┬─▶ offline ─┤
//!                               ├────────────┘ (tunnel failure)
//!                               └─▶ ping_ok    (proxy failure)
//! ```

use serde::{Deserialize, Serialize};

/// Verification stage of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Imported, never probed
    #[default]
    NotTested,
    /// Control port closed or handshake rejected
    PingFailed,
    /// Handshake accepted
    PingOk,
    /// Throughput under the configured floor
    SpeedSlow,
    /// Throughput at or above the floor
    SpeedOk,
    /// Tunnel and proxy are live
    Online,
    /// Tunnel lost, not yet confirmed down
    Offline,
}

impl NodeStatus {
    /// Get all statuses
    pub fn all() -> &'static [NodeStatus] {
        &[
            NodeStatus::NotTested,
            NodeStatus::PingFailed,
            NodeStatus::PingOk,
            NodeStatus::SpeedSlow,
            NodeStatus::SpeedOk,
            NodeStatus::Online,
            NodeStatus::Offline,
        ]
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::NotTested => "not_tested",
            NodeStatus::PingFailed => "ping_failed",
            NodeStatus::PingOk => "ping_ok",
            NodeStatus::SpeedSlow => "speed_slow",
            NodeStatus::SpeedOk => "speed_ok",
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
        }
    }

    /// Check if the node is serving traffic
    pub fn is_online(&self) -> bool {
        matches!(self, NodeStatus::Online)
    }

    /// Check if the node may be promoted to online
    pub fn is_promotable(&self) -> bool {
        matches!(self, NodeStatus::PingOk | NodeStatus::SpeedOk | NodeStatus::Offline)
    }

    /// Check if a speed test may run against this node
    pub fn accepts_speed_test(&self) -> bool {
        matches!(
            self,
            NodeStatus::PingOk | NodeStatus::SpeedOk | NodeStatus::SpeedSlow | NodeStatus::Online
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = TransitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeStatus::all()
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| TransitionError::UnknownStatus(s.to_string()))
    }
}

/// Why a node leaves `online`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionReason {
    /// Watchdog confirmed the tunnel is down
    TunnelFailure,
    /// Tunnel is fine but the proxy listener died
    ProxyFailure,
    /// Tunnel vanished without confirmation (restart, shutdown)
    TunnelLost,
    /// Operator stopped the services
    Stopped,
}

impl std::fmt::Display for DemotionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DemotionReason::TunnelFailure => "tunnel failure",
            DemotionReason::ProxyFailure => "proxy failure",
            DemotionReason::TunnelLost => "tunnel lost",
            DemotionReason::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Something that moves a node between statuses
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// Control handshake accepted
    PingPassed,
    /// Control port closed or handshake rejected
    PingFailed,
    /// Bare connect succeeded, handshake not attempted
    PortOpen,
    /// Throughput measured
    SpeedMeasured { slow: bool },
    /// Tunnel and proxy started
    Promoted,
    /// Services torn down
    Demoted(DemotionReason),
}

/// Transition errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Transition {event} not allowed from {from}")]
    NotAllowed { from: NodeStatus, event: String },

    #[error("Unknown status: {0}")]
    UnknownStatus(String),
}

impl TransitionError {
    fn not_allowed(from: NodeStatus, event: Event) -> Self {
        TransitionError::NotAllowed {
            from,
            event: format!("{:?}", event),
        }
    }
}

/// Compute the status following `event`
///
/// Probe events never change an `online` node; only demotion moves it.
/// `previous` is the status recorded at promotion, used when an operator
/// stops a node.
pub fn next(
    current: NodeStatus,
    previous: Option<NodeStatus>,
    event: Event,
) -> Result<NodeStatus, TransitionError> {
    use NodeStatus::*;

    let to = match (event, current) {
        (Event::PingPassed | Event::PingFailed | Event::PortOpen, Online) => Online,
        (Event::SpeedMeasured { .. }, Online) => Online,

        (Event::PingPassed, SpeedOk | SpeedSlow) => current,
        (Event::PingPassed, _) => PingOk,
        (Event::PingFailed, _) => PingFailed,
        (Event::PortOpen, _) => current,

        (Event::SpeedMeasured { slow: true }, PingOk | SpeedOk | SpeedSlow) => SpeedSlow,
        (Event::SpeedMeasured { slow: false }, PingOk | SpeedOk | SpeedSlow) => SpeedOk,

        (Event::Promoted, PingOk | SpeedOk | Offline) => Online,

        (Event::Demoted(DemotionReason::TunnelFailure), Online | Offline) => PingFailed,
        (Event::Demoted(DemotionReason::ProxyFailure), Online) => PingOk,
        (Event::Demoted(DemotionReason::TunnelLost), Online | Offline) => Offline,
        (Event::Demoted(DemotionReason::Stopped), Online | Offline) => match previous {
            Some(p) if p.is_promotable() && p != Offline => p,
            _ => PingOk,
        },

        _ => return Err(TransitionError::not_allowed(current, event)),
    };

    Ok(to)
}
