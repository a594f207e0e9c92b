//! Worker node CRUD and status bookkeeping

use chrono::Utc;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::{PanelError, Result};
use crate::models::{Node, NodeStatus};

use super::Store;

/// Create request for a worker node
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct NodeCreate {
    #[builder(setter(into))]
    pub name: String,
    #[builder(setter(into))]
    pub address: String,
    pub rpc_port: u16,
    pub stats_port: u16,
    #[serde(default = "default_coefficient")]
    #[builder(default = 1.0)]
    pub usage_coefficient: f64,
}

fn default_coefficient() -> f64 {
    1.0
}

/// Mutable node fields
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder)]
pub struct NodePatch {
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub address: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub rpc_port: Option<u16>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub stats_port: Option<u16>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub usage_coefficient: Option<f64>,
    /// Only `disabled` (admin off) and `connecting` (re-enable) are
    /// accepted from the outside; the rest is client-driven.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub status: Option<NodeStatus>,
}

impl Store {
    pub async fn create_node(&self, req: NodeCreate) -> Result<Node> {
        if req.usage_coefficient <= 0.0 {
            return Err(PanelError::InvalidInput(
                "usage_coefficient must be positive".to_string(),
            ));
        }
        if req.rpc_port == 0 || req.stats_port == 0 {
            return Err(PanelError::InvalidInput(
                "ports must be in 1..=65535".to_string(),
            ));
        }
        let now = Utc::now();
        let node_id: i64 = sqlx::query_scalar(
            r#"INSERT INTO nodes
               (name, address, rpc_port, stats_port, usage_coefficient, status, created_at, last_status_change)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(&req.name)
        .bind(&req.address)
        .bind(req.rpc_port)
        .bind(req.stats_port)
        .bind(req.usage_coefficient)
        .bind(NodeStatus::Connecting)
        .bind(now)
        .bind(now)
        .fetch_one(self.pool())
        .await?;
        self.node(node_id).await
    }

    pub async fn node(&self, node_id: i64) -> Result<Node> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE id = ?")
            .bind(node_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(PanelError::NotFound)
    }

    pub async fn node_by_name(&self, name: &str) -> Result<Node> {
        sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE name = ? COLLATE NOCASE")
            .bind(name)
            .fetch_optional(self.pool())
            .await?
            .ok_or(PanelError::NotFound)
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY id")
            .fetch_all(self.pool())
            .await?)
    }

    /// Nodes the panel should be driving (everything an admin has not
    /// disabled).
    pub async fn enabled_nodes(&self) -> Result<Vec<Node>> {
        Ok(
            sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE status <> ? ORDER BY id")
                .bind(NodeStatus::Disabled)
                .fetch_all(self.pool())
                .await?,
        )
    }

    pub async fn update_node(&self, node_id: i64, patch: NodePatch) -> Result<Node> {
        let mut node = self.node(node_id).await?;
        if let Some(name) = patch.name {
            node.name = name;
        }
        if let Some(address) = patch.address {
            node.address = address;
        }
        if let Some(port) = patch.rpc_port {
            node.rpc_port = port;
        }
        if let Some(port) = patch.stats_port {
            node.stats_port = port;
        }
        if let Some(coefficient) = patch.usage_coefficient {
            if coefficient <= 0.0 {
                return Err(PanelError::InvalidInput(
                    "usage_coefficient must be positive".to_string(),
                ));
            }
            node.usage_coefficient = coefficient;
        }
        if let Some(status) = patch.status {
            if !matches!(status, NodeStatus::Disabled | NodeStatus::Connecting) {
                return Err(PanelError::InvalidInput(
                    "node status can only be set to disabled or connecting".to_string(),
                ));
            }
            if node.status != status {
                node.status = status;
                node.last_status_change = Utc::now();
            }
        }
        sqlx::query(
            r#"UPDATE nodes SET
               name = ?, address = ?, rpc_port = ?, stats_port = ?, usage_coefficient = ?,
               status = ?, last_status_change = ?
               WHERE id = ?"#,
        )
        .bind(&node.name)
        .bind(&node.address)
        .bind(node.rpc_port)
        .bind(node.stats_port)
        .bind(node.usage_coefficient)
        .bind(node.status)
        .bind(node.last_status_change)
        .bind(node_id)
        .execute(self.pool())
        .await?;
        self.node(node_id).await
    }

    /// Client-driven status transition; no-ops when nothing changed.
    pub async fn set_node_status(
        &self,
        node_id: i64,
        status: NodeStatus,
        message: Option<&str>,
        engine_version: Option<&str>,
    ) -> Result<()> {
        let node = self.node(node_id).await?;
        if node.status == status
            && node.message.as_deref() == message
            && (engine_version.is_none() || node.engine_version.as_deref() == engine_version)
        {
            return Ok(());
        }
        sqlx::query(
            r#"UPDATE nodes SET
               status = ?, message = ?,
               engine_version = COALESCE(?, engine_version),
               last_status_change = ?
               WHERE id = ?"#,
        )
        .bind(status)
        .bind(message)
        .bind(engine_version)
        .bind(Utc::now())
        .bind(node_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Mirror freshly issued panel-client credentials into the node row.
    pub async fn set_node_client_credentials(
        &self,
        node_id: i64,
        cert_pem: &str,
        key_pem: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE nodes SET panel_client_cert_pem = ?, panel_client_key_pem = ? WHERE id = ?")
            .bind(cert_pem)
            .bind(key_pem)
            .bind(node_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Delete a node. Users pointing at it fall back to no active node.
    pub async fn delete_node(&self, node_id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE users SET active_node_id = NULL WHERE active_node_id = ?")
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
        let affected = sqlx::query("DELETE FROM nodes WHERE id = ?")
            .bind(node_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if affected == 0 {
            return Err(PanelError::NotFound);
        }
        Ok(())
    }
}
