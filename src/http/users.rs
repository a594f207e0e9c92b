//! Subscriber endpoints
//!
//! Handlers mutate the store, then dispatch node reconciliation into the
//! background; a request never waits on a worker node.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::error::{PanelError, Result};
use crate::models::{NodeStatus, PerNodeUserUsage, User};
use crate::store::users::{UserCreate, UserPatch};

use super::{ApiState, AuthAdmin};

/// Non-sudo admins only ever see their own users.
fn authorize_user(auth: &AuthAdmin, user: &User) -> Result<()> {
    if auth.is_sudo || user.owner_admin_id == Some(auth.admin.id) {
        Ok(())
    } else {
        Err(PanelError::NotFound)
    }
}

fn spawn_reapply(state: &ApiState, user_id: i64) {
    let ops = state.core.ops.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.reapply_user(user_id).await {
            warn!(user_id, error = %err, "background reapply failed");
        }
    });
}

pub async fn create(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Json(request): Json<UserCreate>,
) -> Result<Json<User>> {
    let owner = Some(auth.admin.id);
    let user = state.core.store.create_user(request, owner).await?;
    Ok(Json(user))
}

pub async fn list(State(state): State<ApiState>, auth: AuthAdmin) -> Result<Json<Vec<User>>> {
    let owner = (!auth.is_sudo).then_some(auth.admin.id);
    Ok(Json(state.core.store.list_users(owner).await?))
}

pub async fn show(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    Ok(Json(user))
}

pub async fn update(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
    Json(patch): Json<UserPatch>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let updated = state.core.store.update_user(user.id, patch).await?;
    spawn_reapply(&state, updated.id);
    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;

    let previous_node = user.active_node_id;
    state.core.store.set_active_node(user.id, None).await?;
    state.core.store.delete_user(user.id).await?;
    if let Some(node_id) = previous_node {
        let ops = state.core.ops.clone();
        tokio::spawn(async move {
            if let Err(err) = ops.restart_node(node_id).await {
                warn!(node_id, error = %err, "restart after user delete failed");
            }
        });
    }
    Ok(Json(serde_json::json!({ "detail": "User deleted" })))
}

pub async fn reset_usage(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let updated = state.core.store.reset_user_data_usage(user.id).await?;
    spawn_reapply(&state, updated.id);
    Ok(Json(updated))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionInfo {
    pub token: String,
    pub url: String,
}

pub async fn revoke_sub(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<SubscriptionInfo>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let updated = state.core.store.revoke_user_sub(user.id).await?;
    spawn_reapply(&state, updated.id);
    let token = state
        .core
        .tokens
        .create_subscription_token(&updated.account_number);
    let url = format!("/{}/{}", state.core.settings.subscription_path, token);
    Ok(Json(SubscriptionInfo { token, url }))
}

pub async fn apply_next_plan(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let updated = state.core.store.apply_next_plan(user.id).await?;
    spawn_reapply(&state, updated.id);
    Ok(Json(updated))
}

pub async fn usage(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<Vec<PerNodeUserUsage>>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    Ok(Json(state.core.store.per_node_user_usages(user.id).await?))
}

pub async fn subscription_url(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<SubscriptionInfo>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let token = state
        .core
        .tokens
        .create_subscription_token(&user.account_number);
    let url = format!("/{}/{}", state.core.settings.subscription_path, token);
    Ok(Json(SubscriptionInfo { token, url }))
}

pub async fn activate_on_node(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path((account_number, node_id)): Path<(String, i64)>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let node = state.core.store.node(node_id).await?;
    if node.status == NodeStatus::Disabled {
        return Err(PanelError::Conflict("node is disabled".to_string()));
    }
    if !user.status.is_activatable() {
        return Err(PanelError::Conflict(format!(
            "user status {:?} does not allow activation",
            user.status
        )));
    }

    let ops = state.core.ops.clone();
    let account = user.account_number.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.activate_user_on_node(&account, node_id).await {
            warn!(node_id, error = %err, "background activation failed");
        }
    });
    Ok(Json(user))
}

pub async fn deactivate(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(account_number): Path<String>,
) -> Result<Json<User>> {
    let user = state.core.store.user(&account_number).await?;
    authorize_user(&auth, &user)?;
    let ops = state.core.ops.clone();
    let account = user.account_number.clone();
    tokio::spawn(async move {
        if let Err(err) = ops.deactivate_user(&account).await {
            warn!(error = %err, "background deactivation failed");
        }
    });
    Ok(Json(user))
}
