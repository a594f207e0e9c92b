//! Process-wide node client registry
//!
//! Maps `node_id → NodeClient`, constructing clients lazily from node rows
//! and the fleet CA. A separate "connecting" set keeps concurrent connect
//! attempts for the same node from overlapping.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::Node;
use crate::node_client::NodeClient;

#[derive(Default)]
pub struct NodeRegistry {
    clients: RwLock<HashMap<i64, Arc<NodeClient>>>,
    connecting: Mutex<HashSet<i64>>,
}

/// Guard marking a node's connect attempt in flight; cleared on drop paths
/// via [`NodeRegistry::end_connect`].
pub struct ConnectPermit {
    pub node_id: i64,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, node_id: i64) -> Option<Arc<NodeClient>> {
        self.clients.read().await.get(&node_id).cloned()
    }

    /// Existing client for the node, or a fresh one built from the node row
    /// and the CA bundle.
    pub async fn get_or_create(&self, node: &Node, ca_pem: &str) -> Result<Arc<NodeClient>> {
        if let Some(client) = self.get(node.id).await {
            return Ok(client);
        }
        let mut builder = NodeClient::builder()
            .node_id(node.id)
            .name(&node.name)
            .address(&node.address)
            .rpc_port(node.rpc_port)
            .stats_port(node.stats_port)
            .usage_coefficient(node.usage_coefficient)
            .ca_certificate(ca_pem);
        if let (Some(cert), Some(key)) = (&node.panel_client_cert_pem, &node.panel_client_key_pem) {
            builder = builder.client_identity(cert, key);
        }
        let client = Arc::new(builder.build()?);

        let mut clients = self.clients.write().await;
        // Another task may have raced us; keep the one already registered.
        let client = clients.entry(node.id).or_insert(client).clone();
        debug!(node_id = node.id, "node client registered");
        Ok(client)
    }

    /// Register a prebuilt client (tests wire mock-backed clients this way).
    pub async fn insert(&self, client: Arc<NodeClient>) {
        self.clients.write().await.insert(client.node_id(), client);
    }

    pub async fn all(&self) -> Vec<Arc<NodeClient>> {
        self.clients.read().await.values().cloned().collect()
    }

    /// Disconnect and drop the client for a deleted or disabled node.
    pub async fn remove(&self, node_id: i64) {
        let client = self.clients.write().await.remove(&node_id);
        if let Some(client) = client {
            client.disconnect().await;
            info!(node_id, "node client removed");
        }
    }

    /// Try to claim the connect slot for a node; `None` while another
    /// attempt is already running.
    pub async fn begin_connect(&self, node_id: i64) -> Option<ConnectPermit> {
        let mut connecting = self.connecting.lock().await;
        if connecting.contains(&node_id) {
            return None;
        }
        connecting.insert(node_id);
        Some(ConnectPermit { node_id })
    }

    pub async fn end_connect(&self, permit: ConnectPermit) {
        self.connecting.lock().await.remove(&permit.node_id);
    }
}
