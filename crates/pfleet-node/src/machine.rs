//! Status Machine
//!
//! The single writer of node status. Every operation takes a [`NodeLock`],
//! so callers must hold the node's lock for the whole flow they run
//! (probe write, promotion, demotion). Two flows never interleave on the
//! same node.

use crate::node::{NodeId, NodePatch, ProxyBinding};
use crate::status::{self, DemotionReason, Event, NodeStatus, TransitionError};
use crate::store::{NodeStore, StoreError};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Errors from status operations
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Proof that the caller holds a node's lock
pub struct NodeLock {
    id: NodeId,
    _guard: OwnedMutexGuard<()>,
}

impl NodeLock {
    /// Locked node
    pub fn id(&self) -> NodeId {
        self.id
    }
}

impl std::fmt::Debug for NodeLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLock").field("id", &self.id).finish()
    }
}

/// Before/after status of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub node_id: NodeId,
    pub before: NodeStatus,
    pub after: NodeStatus,
}

impl StatusChange {
    /// Check if the status moved
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

/// Outcome of a reachability probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// Control handshake accepted
    Accepted { elapsed_ms: u64 },
    /// Bare connect succeeded
    PortOpen,
    /// Port closed, handshake rejected, or timed out
    Failed,
}

/// Owner of all status transitions
pub struct StatusMachine {
    store: Arc<dyn NodeStore>,
    locks: DashMap<NodeId, Arc<Mutex<()>>>,
    slow_floor_mbps: f64,
}

impl StatusMachine {
    /// Create a machine over `store`; speeds under `slow_floor_mbps` are slow
    pub fn new(store: Arc<dyn NodeStore>, slow_floor_mbps: f64) -> Self {
        Self {
            store,
            locks: DashMap::new(),
            slow_floor_mbps,
        }
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Throughput floor separating `speed_slow` from `speed_ok`
    pub fn slow_floor_mbps(&self) -> f64 {
        self.slow_floor_mbps
    }

    /// Acquire the node's lock
    pub async fn lock(&self, id: NodeId) -> NodeLock {
        let mutex = self
            .locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        NodeLock {
            id,
            _guard: mutex.lock_owned().await,
        }
    }

    /// Record a ping result
    pub async fn record_ping(
        &self,
        lock: &NodeLock,
        outcome: ProbeOutcome,
    ) -> Result<StatusChange, MachineError> {
        let event = match outcome {
            ProbeOutcome::Accepted { .. } => Event::PingPassed,
            ProbeOutcome::PortOpen => Event::PortOpen,
            ProbeOutcome::Failed => Event::PingFailed,
        };

        let now = Utc::now();
        let mut patch = NodePatch::new().last_check(now);
        if let ProbeOutcome::Accepted { elapsed_ms } = outcome {
            patch = patch.ping_ms(elapsed_ms);
        }

        self.transition(lock, event, patch).await
    }

    /// Record a speed result; `None` means no measurement could be made
    pub async fn record_speed(
        &self,
        lock: &NodeLock,
        mbps: Option<f64>,
    ) -> Result<StatusChange, MachineError> {
        let now = Utc::now();
        let Some(mbps) = mbps else {
            let node = self.store.get_node(lock.id()).await?;
            self.store
                .update_node(lock.id(), NodePatch::new().last_check(now))
                .await?;
            return Ok(StatusChange {
                node_id: lock.id(),
                before: node.status,
                after: node.status,
            });
        };

        let slow = mbps < self.slow_floor_mbps;
        let patch = NodePatch::new().speed(mbps).last_check(now);
        self.transition(lock, Event::SpeedMeasured { slow }, patch).await
    }

    /// Promote to `online` with the given proxy binding
    ///
    /// The pre-promotion status is kept in `previous_status`.
    pub async fn promote(
        &self,
        lock: &NodeLock,
        proxy: ProxyBinding,
    ) -> Result<StatusChange, MachineError> {
        let node = self.store.get_node(lock.id()).await?;
        let patch = NodePatch::new()
            .with_previous_status(Some(node.status))
            .proxy(Some(proxy));

        let change = self.transition(lock, Event::Promoted, patch).await?;
        info!(node_id = lock.id(), from = %change.before, "Node promoted to online");
        Ok(change)
    }

    /// Demote out of `online`/`offline`, clearing tunnel and proxy fields
    pub async fn demote(
        &self,
        lock: &NodeLock,
        reason: DemotionReason,
    ) -> Result<StatusChange, MachineError> {
        let patch = NodePatch::new()
            .with_previous_status(None)
            .ppp_interface(None)
            .proxy(None);

        let change = self.transition(lock, Event::Demoted(reason), patch).await?;
        warn!(
            node_id = lock.id(),
            %reason,
            from = %change.before,
            to = %change.after,
            "Node demoted"
        );
        Ok(change)
    }

    /// Clear leftover tunnel/proxy fields on a node that is not online
    pub async fn clear_bindings(&self, lock: &NodeLock) -> Result<(), MachineError> {
        let patch = NodePatch::new()
            .ppp_interface(None)
            .proxy(None)
            .last_update(Utc::now());
        self.store.update_node(lock.id(), patch).await?;
        Ok(())
    }

    async fn transition(
        &self,
        lock: &NodeLock,
        event: Event,
        patch: NodePatch,
    ) -> Result<StatusChange, MachineError> {
        let node = self.store.get_node(lock.id()).await?;
        let after = status::next(node.status, node.previous_status, event)?;

        let patch = patch.with_status(after).last_update(Utc::now());
        self.store.update_node(lock.id(), patch).await?;

        debug!(node_id = lock.id(), from = %node.status, to = %after, ?event, "Status transition");
        Ok(StatusChange {
            node_id: lock.id(),
            before: node.status,
            after,
        })
    }
}
