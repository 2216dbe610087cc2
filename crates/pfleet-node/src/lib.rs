//! pfleet Node Model
//!
//! Node records, the status state machine, and the storage seam the rest
//! of the fleet core talks to.
//!
//! # Status Ownership
//!
//! Only [`StatusMachine`] writes the status field. Probes, promotion and
//! the watchdog each go through it while holding the node's
//! [`NodeLock`], which keeps a node's transitions in order even when many
//! flows run across the fleet at once.

mod machine;
mod node;
mod status;
mod store;

pub use machine::{MachineError, NodeLock, ProbeOutcome, StatusChange, StatusMachine};
pub use node::{Node, NodeId, NodePatch, ProxyBinding, DEFAULT_PPTP_PORT};
pub use status::{next as next_status, DemotionReason, Event, NodeStatus, TransitionError};
pub use store::{MemoryNodeStore, NodeStore, StoreError};
