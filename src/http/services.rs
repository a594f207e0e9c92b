//! Service configuration endpoints
//!
//! Every mutation schedules a restart of the owning node so its running
//! config converges on the new definition.

use axum::extract::{Path, State};
use axum::Json;
use tracing::warn;

use crate::error::Result;
use crate::models::ServiceConfiguration;
use crate::store::services::ServiceCreate;

use super::{ApiState, AuthAdmin, SudoAdmin};

fn spawn_restart(state: &ApiState, node_id: i64) {
    let ops = state.core.ops.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.restart_node(node_id).await {
            warn!(node_id, error = %err, "restart after service change failed");
        }
    });
}

pub async fn create(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(node_id): Path<i64>,
    Json(mut request): Json<ServiceCreate>,
) -> Result<Json<ServiceConfiguration>> {
    request.node_id = node_id;
    let service = state.core.store.create_service(request).await?;
    spawn_restart(&state, node_id);
    Ok(Json(service))
}

pub async fn list_for_node(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
    Path(node_id): Path<i64>,
) -> Result<Json<Vec<ServiceConfiguration>>> {
    state.core.store.node(node_id).await?;
    Ok(Json(state.core.store.services_for_node(node_id).await?))
}

pub async fn show(
    State(state): State<ApiState>,
    _auth: AuthAdmin,
    Path(service_id): Path<i64>,
) -> Result<Json<ServiceConfiguration>> {
    Ok(Json(state.core.store.service(service_id).await?))
}

pub async fn update(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(service_id): Path<i64>,
    Json(request): Json<ServiceCreate>,
) -> Result<Json<ServiceConfiguration>> {
    let service = state.core.store.update_service(service_id, request).await?;
    spawn_restart(&state, service.node_id);
    Ok(Json(service))
}

pub async fn remove(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Path(service_id): Path<i64>,
) -> Result<Json<serde_json::Value>> {
    let service = state.core.store.service(service_id).await?;
    state.core.store.delete_service(service_id).await?;
    spawn_restart(&state, service.node_id);
    Ok(Json(serde_json::json!({ "detail": "Service deleted" })))
}
