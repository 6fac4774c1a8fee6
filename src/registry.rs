//! Node registry — liveness tracking for `list_nodes` and heartbeat bumps.
//!
//! Protected by a read-biased `parking_lot::RwLock` per §5 ("Node
//! registry: protected by a read-biased lock; heartbeat updates take the
//! write lock briefly"). `status` is never stored — it is computed from
//! `last_seen` on every read, per §3.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

use crate::model::{NodeId, NodeRecord, NodeStatus, Precedence};

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
    heartbeat_threshold: chrono::Duration,
}

impl NodeRegistry {
    pub fn new(heartbeat_threshold: chrono::Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            heartbeat_threshold,
        }
    }

    /// Bumps `last_seen` for `node_id`, registering it with an empty
    /// capability set if unseen before. Called on every authenticated
    /// request per §4.5 ("last_seen is bumped on any authenticated
    /// request from that node").
    pub fn touch(&self, node_id: &str, source_address: &str) {
        let mut nodes = self.nodes.write();
        nodes
            .entry(node_id.to_string())
            .and_modify(|n| n.last_seen = Utc::now())
            .or_insert_with(|| NodeRecord {
                node_id: node_id.to_string(),
                address: source_address.to_string(),
                last_seen: Utc::now(),
                capabilities: Precedence::ALL.to_vec(),
            });
    }

    pub fn register_capabilities(&self, node_id: &str, address: String, capabilities: Vec<Precedence>) {
        let mut nodes = self.nodes.write();
        let entry = nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord {
                node_id: node_id.to_string(),
                address: address.clone(),
                last_seen: Utc::now(),
                capabilities: capabilities.clone(),
            });
        entry.address = address;
        entry.capabilities = capabilities;
    }

    pub fn get(&self, node_id: &str) -> Option<NodeRecord> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn list(&self) -> Vec<(NodeRecord, NodeStatus)> {
        let now = Utc::now();
        self.nodes
            .read()
            .values()
            .map(|n| {
                let status = n.status(now, self.heartbeat_threshold);
                (n.clone(), status)
            })
            .collect()
    }

    pub fn counts(&self) -> (u32, u32) {
        let now = Utc::now();
        let nodes = self.nodes.read();
        let total = nodes.len() as u32;
        let connected = nodes
            .values()
            .filter(|n| matches!(n.status(now, self.heartbeat_threshold), NodeStatus::Connected))
            .count() as u32;
        (connected, total)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub address: String,
    pub last_seen: DateTime<Utc>,
    pub capabilities: Vec<Precedence>,
    pub status: NodeStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshly_touched_node_is_connected() {
        let registry = NodeRegistry::new(chrono::Duration::seconds(60));
        registry.touch("node-a", "10.0.0.1");
        let (record, status) = registry.list().into_iter().next().unwrap();
        assert_eq!(record.node_id, "node-a");
        assert_eq!(status, NodeStatus::Connected);
    }

    #[test]
    fn stale_node_is_disconnected() {
        let registry = NodeRegistry::new(chrono::Duration::seconds(60));
        registry.register_capabilities("node-a", "10.0.0.1".to_string(), vec![]);
        {
            let mut nodes = registry.nodes.write();
            nodes.get_mut("node-a").unwrap().last_seen = Utc::now() - chrono::Duration::seconds(120);
        }
        let (_, status) = registry.list().into_iter().next().unwrap();
        assert_eq!(status, NodeStatus::Disconnected);
    }
}
