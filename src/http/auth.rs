//! Admin authentication extractors

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::PanelError;
use crate::models::Admin;

use super::ApiState;

/// A validated admin, resolved from the bearer token
#[derive(Debug, Clone)]
pub struct AuthAdmin {
    pub admin: Admin,
    pub is_sudo: bool,
}

/// An [`AuthAdmin`] that must be sudo
#[derive(Debug, Clone)]
pub struct SudoAdmin(pub AuthAdmin);

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[async_trait]
impl FromRequestParts<ApiState> for AuthAdmin {
    type Rejection = PanelError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(PanelError::AuthFailed)?;
        let claims = state.core.tokens.verify_admin_token(token)?;
        let admin = state
            .core
            .store
            .admin(&claims.username)
            .await
            .map_err(|_| PanelError::AuthFailed)?;

        // Tokens issued before a password reset are dead.
        if let Some(reset_at) = admin.password_reset_at {
            if claims.issued_at.timestamp() < reset_at.timestamp() {
                return Err(PanelError::AuthFailed);
            }
        }

        // Environment-declared superusers override the stored flag.
        let is_sudo = claims.is_sudo
            || admin.is_sudo
            || state
                .core
                .settings
                .superusers
                .contains(&admin.username.to_lowercase());

        Ok(AuthAdmin { admin, is_sudo })
    }
}

#[async_trait]
impl FromRequestParts<ApiState> for SudoAdmin {
    type Rejection = PanelError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ApiState,
    ) -> Result<Self, Self::Rejection> {
        let auth = AuthAdmin::from_request_parts(parts, state).await?;
        if !auth.is_sudo {
            return Err(PanelError::Forbidden(
                "sudo privileges required".to_string(),
            ));
        }
        Ok(SudoAdmin(auth))
    }
}
