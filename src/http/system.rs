//! System status and core control endpoints

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::bandwidth::BandwidthSnapshot;
use crate::error::Result;
use crate::models::{NodeStatus, UserStatus};

use super::{ApiState, AuthAdmin, SudoAdmin};

#[derive(Debug, Serialize)]
pub struct SystemStatsResponse {
    pub total_users: usize,
    pub active_users: usize,
    pub online_nodes: usize,
    pub total_nodes: usize,
    pub bandwidth: BandwidthSnapshot,
}

pub async fn stats(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
) -> Result<Json<SystemStatsResponse>> {
    let store = &state.core.store;
    let users = store.list_users(None).await?;
    let nodes = store.list_nodes().await?;
    Ok(Json(SystemStatsResponse {
        total_users: users.len(),
        active_users: users
            .iter()
            .filter(|u| u.status == UserStatus::Active)
            .count(),
        online_nodes: nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Connected)
            .count(),
        total_nodes: nodes.len(),
        bandwidth: state.core.bandwidth.snapshot(),
    }))
}

/// Restart every connected node with a freshly built config.
pub async fn restart_core(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
) -> Result<Json<serde_json::Value>> {
    let ops = state.core.ops.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.restart_all_nodes().await {
            warn!(error = %err, "fleet restart failed");
        }
    });
    Ok(Json(serde_json::json!({ "detail": "Restart scheduled" })))
}
