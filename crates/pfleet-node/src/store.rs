//! Node Storage
//!
//! The core only needs load, patch and list-by-status. Real deployments
//! back this with a database; [`MemoryNodeStore`] keeps records in memory
//! and can snapshot them to a JSON file.

use crate::node::{Node, NodeId, NodePatch};
use crate::status::NodeStatus;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Node {0} not found")]
    NotFound(NodeId),

    #[error("Duplicate node id {0}")]
    Duplicate(NodeId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Persistence of node records
///
/// Updates must be visible to the next read.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Load one node
    async fn get_node(&self, id: NodeId) -> Result<Node, StoreError>;

    /// Apply a patch and return the updated record
    async fn update_node(&self, id: NodeId, patch: NodePatch) -> Result<Node, StoreError>;

    /// All nodes currently in `status`
    async fn list_nodes_by_status(&self, status: NodeStatus) -> Result<Vec<Node>, StoreError>;

    /// Every node, ordered by id
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;
}

/// In-memory node store
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<BTreeMap<NodeId, Node>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing records
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Result<Self, StoreError> {
        let mut map = BTreeMap::new();
        for node in nodes {
            if map.contains_key(&node.id) {
                return Err(StoreError::Duplicate(node.id));
            }
            map.insert(node.id, node);
        }
        Ok(Self {
            nodes: RwLock::new(map),
        })
    }

    /// Insert a new record
    pub async fn insert(&self, node: Node) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(StoreError::Duplicate(node.id));
        }
        nodes.insert(node.id, node);
        Ok(())
    }

    /// Number of records
    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }

    /// Load a JSON array of nodes
    ///
    /// A missing file yields an empty store.
    pub async fn load_json(path: &Path) -> Result<Self, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No node snapshot, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };

        let nodes: Vec<Node> = serde_json::from_str(&content)?;
        info!(path = %path.display(), count = nodes.len(), "Loaded node snapshot");
        Self::with_nodes(nodes)
    }

    /// Write every record as a JSON array (temp file + rename)
    pub async fn save_json(&self, path: &Path) -> Result<(), StoreError> {
        let nodes: Vec<Node> = self.nodes.read().await.values().cloned().collect();
        let content = serde_json::to_string_pretty(&nodes)?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), count = nodes.len(), "Saved node snapshot");
        Ok(())
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get_node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_node(&self, id: NodeId, patch: NodePatch) -> Result<Node, StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        patch.apply(node);
        Ok(node.clone())
    }

    async fn list_nodes_by_status(&self, status: NodeStatus) -> Result<Vec<Node>, StoreError> {
        Ok(self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.status == status)
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }
}
