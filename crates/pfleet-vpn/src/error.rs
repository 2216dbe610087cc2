//! Fleet-level errors

use crate::proxy::RelayError;
use crate::routing::RoutingError;
use crate::tunnel::TunnelError;
use pfleet_node::{MachineError, NodeId, NodeStatus, StoreError};

/// Errors from launch, teardown and batch flows
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Node {node_id} cannot be promoted from {status}")]
    NotPromotable { node_id: NodeId, status: NodeStatus },

    #[error("Node {node_id} is {status}, not online")]
    NotOnline { node_id: NodeId, status: NodeStatus },

    #[error("Node {0} already has live services")]
    AlreadyActive(NodeId),

    #[error("No free SOCKS port")]
    NoFreePort,

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Status error: {0}")]
    Machine(#[from] MachineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FleetError {
    /// The chosen SOCKS port is held by a process outside the fleet
    pub fn is_port_in_use(&self) -> bool {
        matches!(self, FleetError::Relay(e) if e.is_addr_in_use())
    }
}
