//! Admin account endpoints

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Admin;
use crate::store::admins::AdminCreate;

use super::{ApiState, AuthAdmin, SudoAdmin};

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
}

pub async fn issue_token(
    State(state): State<ApiState>,
    Json(request): Json<TokenRequest>,
) -> Result<Json<TokenResponse>> {
    let admin = state
        .core
        .store
        .verify_admin(&request.username, &request.password)
        .await?;
    let is_sudo = admin.is_sudo
        || state
            .core
            .settings
            .superusers
            .contains(&admin.username.to_lowercase());
    let access_token = state.core.tokens.create_admin_token(
        &admin.username,
        is_sudo,
        state.core.settings.admin_token_ttl_minutes,
    )?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

pub async fn list(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
) -> Result<Json<Vec<Admin>>> {
    Ok(Json(state.core.store.list_admins().await?))
}

pub async fn create(
    State(state): State<ApiState>,
    _auth: SudoAdmin,
    Json(request): Json<AdminCreate>,
) -> Result<Json<Admin>> {
    Ok(Json(state.core.store.create_admin(request).await?))
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub password: String,
}

pub async fn set_password(
    State(state): State<ApiState>,
    auth: AuthAdmin,
    Path(username): Path<String>,
    Json(request): Json<PasswordRequest>,
) -> Result<Json<Admin>> {
    // Admins may change their own password; anyone else's needs sudo.
    if !auth.is_sudo && !auth.admin.username.eq_ignore_ascii_case(&username) {
        return Err(crate::error::PanelError::Forbidden(
            "cannot change another admin's password".to_string(),
        ));
    }
    Ok(Json(
        state
            .core
            .store
            .set_admin_password(&username, &request.password)
            .await?,
    ))
}

pub async fn remove(
    State(state): State<ApiState>,
    SudoAdmin(auth): SudoAdmin,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if auth.admin.username.eq_ignore_ascii_case(&username) {
        return Err(crate::error::PanelError::Conflict(
            "cannot delete yourself".to_string(),
        ));
    }
    state.core.store.delete_admin(&username).await?;
    Ok(Json(serde_json::json!({ "detail": "Admin deleted" })))
}
