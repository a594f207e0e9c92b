//! Orchestration layer
//!
//! Couples the store, the config builder and the node registry. Every
//! operation here is idempotent and safe to call redundantly: the running
//! config on a connected node always converges to the builder's output for
//! the current database snapshot, because reconciliation is always a
//! full-config restart.
//!
//! Node communication failures never escape to schedulers or HTTP
//! dispatchers; they become `Node.status = error` side-effects that the
//! health-check loop recovers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine_config::{build_engine_config, ActiveUser, EngineConfig};
use crate::error::{PanelError, Result};
use crate::models::{Node, NodeStatus};
use crate::pki::Pki;
use crate::registry::NodeRegistry;
use crate::store::Store;

#[derive(Clone)]
pub struct Operations {
    store: Store,
    registry: Arc<NodeRegistry>,
    pki: Arc<Pki>,
}

impl Operations {
    pub fn new(store: Store, registry: Arc<NodeRegistry>, pki: Arc<Pki>) -> Self {
        Operations {
            store,
            registry,
            pki,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn pki(&self) -> &Arc<Pki> {
        &self.pki
    }

    /// Build the engine config for a node from the current DB snapshot.
    pub async fn build_node_config(&self, node: &Node) -> Result<EngineConfig> {
        let users = self.store.users_on_node(node.id).await?;
        let mut active_users = Vec::with_capacity(users.len());
        for user in users {
            let proxies = self
                .store
                .proxies_for_user(user.id)
                .await?
                .into_iter()
                .map(|p| p.settings.0)
                .collect();
            active_users.push(ActiveUser { user, proxies });
        }
        let services = self.store.services_for_node(node.id).await?;
        build_engine_config(node, &active_users, &services)
    }

    /// Make sure the node row carries panel-client credentials, issuing a
    /// certificate set on first contact.
    async fn ensure_node_credentials(&self, node: Node) -> Result<Node> {
        if node.panel_client_cert_pem.is_some() && node.panel_client_key_pem.is_some() {
            return Ok(node);
        }
        let certs = self.pki.issue_node_certs(&node.name, &node.address).await?;
        self.store
            .set_node_client_credentials(
                node.id,
                &certs.panel_client.certificate_pem,
                &certs.panel_client.private_key_pem,
            )
            .await?;
        self.store.node(node.id).await
    }

    /// Connect a node and push its config. Overlapping attempts for the
    /// same node collapse into one.
    pub async fn connect_node(&self, node_id: i64) -> Result<()> {
        let Some(permit) = self.registry.begin_connect(node_id).await else {
            debug!(node_id, "connect already in progress, skipping");
            return Ok(());
        };
        let result = self.connect_node_inner(node_id).await;
        self.registry.end_connect(permit).await;
        match result {
            Err(err) if err.is_node_unavailable() => {
                // Already materialized as node status; recovered by health checks.
                Ok(())
            }
            other => other,
        }
    }

    async fn connect_node_inner(&self, node_id: i64) -> Result<()> {
        let node = self.store.node(node_id).await?;
        if node.status == NodeStatus::Disabled {
            debug!(node_id, "node is disabled, skipping connect");
            return Ok(());
        }
        self.store
            .set_node_status(node_id, NodeStatus::Connecting, Some("connecting"), None)
            .await?;

        let outcome = async {
            let (client, node) = match self.registry.get(node.id).await {
                Some(client) => (client, node),
                None => {
                    let node = self.ensure_node_credentials(node).await?;
                    let ca = self.pki.ca().await?;
                    let client = self
                        .registry
                        .get_or_create(&node, &ca.certificate_pem)
                        .await?;
                    (client, node)
                }
            };
            let config = self.build_node_config(&node).await?;
            client.connect().await?;
            client.start(&config).await?;
            let version = client.engine_version().await;
            Ok::<Option<String>, PanelError>(version)
        }
        .await;

        match outcome {
            Ok(version) => {
                self.store
                    .set_node_status(node_id, NodeStatus::Connected, None, version.as_deref())
                    .await?;
                info!(node_id, version = ?version, "node connected");
                Ok(())
            }
            Err(err) => {
                warn!(node_id, error = %err, "node connect failed");
                self.store
                    .set_node_status(node_id, NodeStatus::Error, Some(&err.to_string()), None)
                    .await?;
                if let Some(client) = self.registry.get(node_id).await {
                    client.disconnect().await;
                }
                Err(err)
            }
        }
    }

    /// Rebuild the node's config from the current snapshot and push it.
    /// Falls back to a connect when the node has no live session yet.
    pub async fn restart_node(&self, node_id: i64) -> Result<()> {
        let node = self.store.node(node_id).await?;
        if node.status == NodeStatus::Disabled {
            return Err(PanelError::Conflict("node is disabled".to_string()));
        }
        let client = match self.registry.get(node_id).await {
            Some(client) if node.status == NodeStatus::Connected && client.connected().await => {
                client
            }
            _ => return self.connect_node(node_id).await,
        };

        let result = async {
            let config = self.build_node_config(&node).await?;
            client.restart(&config).await
        }
        .await;

        match result {
            Ok(()) => {
                self.store
                    .set_node_status(node_id, NodeStatus::Connected, None, None)
                    .await?;
                Ok(())
            }
            Err(err) if err.is_node_unavailable() => {
                warn!(node_id, error = %err, "node restart failed");
                self.store
                    .set_node_status(node_id, NodeStatus::Error, Some(&err.to_string()), None)
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Materialize a user's credentials on a node. The node picks up the
    /// new client set through a full-config restart.
    pub async fn activate_user_on_node(&self, account_number: &str, node_id: i64) -> Result<()> {
        let user = self.store.user(account_number).await?;
        let node = self.store.node(node_id).await?;
        if node.status == NodeStatus::Disabled {
            return Err(PanelError::Conflict("node is disabled".to_string()));
        }
        if !user.status.is_activatable() {
            return Err(PanelError::Conflict(format!(
                "user status {:?} does not allow activation",
                user.status
            )));
        }
        let previous_node = user.active_node_id;
        self.store.set_active_node(user.id, Some(node_id)).await?;
        info!(user_id = user.id, node_id, "user activated on node");

        if let Some(previous) = previous_node {
            if previous != node_id {
                // Best effort: a disabled or dead previous node must not
                // block activation on the new one.
                if let Err(err) = self.restart_node(previous).await {
                    warn!(node_id = previous, error = %err, "previous node restart failed");
                }
            }
        }
        self.restart_node(node_id).await
    }

    /// Remove a user's credentials from their active node. The field is
    /// cleared first so the rebuilt config omits the user.
    pub async fn deactivate_user(&self, account_number: &str) -> Result<()> {
        let user = self.store.user(account_number).await?;
        let Some(node_id) = user.active_node_id else {
            debug!(user_id = user.id, "user has no active node");
            return Ok(());
        };
        self.store.set_active_node(user.id, None).await?;
        info!(user_id = user.id, node_id, "user deactivated from node");
        // The deactivation itself is committed; a node that cannot restart
        // right now is reconciled by the next health tick.
        if let Err(err) = self.restart_node(node_id).await {
            warn!(node_id, error = %err, "restart after deactivation failed");
        }
        Ok(())
    }

    /// Reconcile one user after a status or credential change.
    pub async fn reapply_user(&self, user_id: i64) -> Result<()> {
        let user = self.store.user_by_id(user_id).await?;
        match user.active_node_id {
            Some(node_id) if user.status.is_activatable() => self.restart_node(node_id).await,
            Some(_) => self.deactivate_user(&user.account_number).await,
            None => Ok(()),
        }
    }

    /// Deactivate then delete a user.
    pub async fn delete_user(&self, account_number: &str) -> Result<()> {
        let user = self.store.user(account_number).await?;
        self.deactivate_user(account_number).await?;
        self.store.delete_user(user.id).await
    }

    /// Admin-driven disable: tear the session down and park the node.
    pub async fn disable_node(&self, node_id: i64) -> Result<()> {
        self.store
            .set_node_status(node_id, NodeStatus::Disabled, Some("disabled by admin"), None)
            .await?;
        self.registry.remove(node_id).await;
        Ok(())
    }

    /// Drop a node everywhere: registry, certificates, store. Users pointing
    /// at it are detached by the store delete.
    pub async fn remove_node(&self, node_id: i64) -> Result<()> {
        let node = self.store.node(node_id).await?;
        self.registry.remove(node_id).await;
        self.store.delete_node(node_id).await?;
        self.store.delete_node_certificate(&node.name).await?;
        Ok(())
    }

    /// Reissue node certificates and force the client to pick up the new
    /// identity on its next connect.
    pub async fn rotate_node_certs(&self, node_id: i64) -> Result<()> {
        let node = self.store.node(node_id).await?;
        let certs = self.pki.rotate(&node.name, &node.address).await?;
        self.store
            .set_node_client_credentials(
                node_id,
                &certs.panel_client.certificate_pem,
                &certs.panel_client.private_key_pem,
            )
            .await?;
        self.registry.remove(node_id).await;
        if node.status != NodeStatus::Disabled {
            self.connect_node(node_id).await?;
        }
        Ok(())
    }

    /// Restart every non-disabled node (panel "core restart").
    pub async fn restart_all_nodes(&self) -> Result<()> {
        for node in self.store.enabled_nodes().await? {
            if let Err(err) = self.restart_node(node.id).await {
                warn!(node_id = node.id, error = %err, "restart failed");
            }
        }
        Ok(())
    }
}
