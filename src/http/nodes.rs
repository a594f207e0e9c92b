//! Worker node endpoints

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use tracing::warn;

use crate::error::{PanelError, Result};
use crate::models::{Node, NodeStatus};
use crate::store::nodes::{NodeCreate, NodePatch};

use super::{ApiState, AuthAdmin, SudoAdmin};

fn spawn_connect(state: &ApiState, node_id: i64) {
    let ops = state.core.ops.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.connect_node(node_id).await {
            warn!(node_id, error = %err, "background connect failed");
        }
    });
}

pub async fn create(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Json(request): Json<NodeCreate>,
) -> Result<Json<Node>> {
    let node = state.core.store.create_node(request).await?;
    // Issue the mTLS material up front so the first connect has it.
    let certs = state
        .core
        .pki
        .issue_node_certs(&node.name, &node.address)
        .await?;
    state
        .core
        .store
        .set_node_client_credentials(
            node.id,
            &certs.panel_client.certificate_pem,
            &certs.panel_client.private_key_pem,
        )
        .await?;
    spawn_connect(&state, node.id);
    Ok(Json(state.core.store.node(node.id).await?))
}

pub async fn list(State(state): State<ApiState>, _auth: AuthAdmin) -> Result<Json<Vec<Node>>> {
    Ok(Json(state.core.store.list_nodes().await?))
}

pub async fn show(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<Node>> {
    Ok(Json(state.core.store.node(node_id).await?))
}

pub async fn update(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(node_id): Path<i64>,
    Json(patch): Json<NodePatch>,
) -> Result<Json<Node>> {
    let requested_status = patch.status;
    let node = state.core.store.update_node(node_id, patch).await?;
    match requested_status {
        Some(NodeStatus::Disabled) => {
            state.core.ops.disable_node(node_id).await?;
        }
        Some(NodeStatus::Connecting) => spawn_connect(&state, node_id),
        _ => {}
    }
    Ok(Json(node))
}

pub async fn remove(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.core.ops.remove_node(node_id).await?;
    Ok(Json(serde_json::json!({ "detail": "Node deleted" })))
}

pub async fn reconnect(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let node = state.core.store.node(node_id).await?;
    if node.status == NodeStatus::Disabled {
        return Err(PanelError::Conflict("node is disabled".to_string()));
    }
    spawn_connect(&state, node_id);
    Ok(Json(serde_json::json!({ "detail": "Reconnect scheduled" })))
}

pub async fn rotate_certs(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    state.core.store.node(node_id).await?;
    let ops = state.core.ops.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.rotate_node_certs(node_id).await {
            warn!(node_id, error = %err, "certificate rotation failed");
        }
    });
    Ok(Json(serde_json::json!({ "detail": "Rotation scheduled" })))
}

pub async fn export_certs(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let node = state.core.store.node(node_id).await?;
    let dir = std::path::Path::new(&state.core.settings.cert_export_dir).join(&node.name);
    let files = state.core.pki.export(&node.name, &dir).await?;
    Ok(Json(serde_json::json!({
        "detail": "Certificates exported",
        "files": files,
    })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_interval")]
    pub interval: f32,
}

fn default_interval() -> f32 {
    0.7
}

/// Bridge the node's log stream to an admin WebSocket.
pub async fn logs(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
    Path(node_id): Path<i64>,
    Query(query): Query<LogsQuery>,
    upgrade: WebSocketUpgrade,
) -> Result<Response> {
    let client = state
        .core
        .registry
        .get(node_id)
        .await
        .ok_or(PanelError::NotFound)?;
    let receiver = client.subscribe_logs(query.interval).await?;
    Ok(upgrade.on_upgrade(move |socket| pump_logs(socket, receiver)))
}

async fn pump_logs(
    mut socket: WebSocket,
    mut receiver: tokio::sync::broadcast::Receiver<String>,
) {
    loop {
        match receiver.recv().await {
            Ok(line) => {
                if socket.send(Message::Text(line)).await.is_err() {
                    return;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
