//! Subscription delivery endpoints
//!
//! Unauthenticated beyond the token itself. Bodies always render: when a
//! user has no active node or no matching services, clients receive
//! human-readable placeholder text instead of an error code.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};

use crate::error::{PanelError, Result};
use crate::models::{NodeStatus, ProxySettings, User};
use crate::subscription::{
    detect_client, encode_title, render_subscription, userinfo_header, ClientFormat,
};
use crate::token::validate_subscription_claims;

use super::ApiState;

async fn validated_user(state: &ApiState, token: &str) -> Result<User> {
    let claims = state.core.tokens.verify_subscription_token(token)?;
    let user = state
        .core
        .store
        .user(&claims.account_number)
        .await
        .map_err(|_| PanelError::AuthFailed)?;
    validate_subscription_claims(&user, &claims)?;
    Ok(user)
}

async fn respond(
    state: &ApiState,
    user: &User,
    format: ClientFormat,
    reverse: bool,
    user_agent: &str,
) -> Result<Response> {
    state.core.store.update_user_sub(user.id, user_agent).await?;

    let proxies: Vec<ProxySettings> = state
        .core
        .store
        .proxies_for_user(user.id)
        .await?
        .into_iter()
        .map(|p| p.settings.0)
        .collect();

    // A disabled node is not a place to point clients at.
    let active = match user.active_node_id {
        Some(node_id) => match state.core.store.node(node_id).await {
            Ok(node) if node.status != NodeStatus::Disabled => {
                let services = state.core.store.services_for_node(node_id).await?;
                Some((node, services))
            }
            _ => None,
        },
        None => None,
    };
    let active_ref = active
        .as_ref()
        .map(|(node, services)| (node, services.as_slice()));

    let body = render_subscription(&proxies, active_ref, format, reverse)?;

    let settings = &state.core.settings;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.media_type()),
    );
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", user.account_number))
            .map_err(|e| PanelError::Internal(e.to_string()))?,
    );
    let mut insert = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    insert("subscription-userinfo", userinfo_header(user));
    insert("profile-title", encode_title(&settings.subscription_profile_title));
    insert(
        "profile-update-interval",
        settings.subscription_update_interval.to_string(),
    );
    if !settings.subscription_support_url.is_empty() {
        insert("support-url", settings.subscription_support_url.clone());
    }

    Ok((headers, body).into_response())
}

/// `GET /{sub_path}/{token}` — format chosen by User-Agent sniffing
pub async fn fetch(
    State(state): State<ApiState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let user = validated_user(&state, &token).await?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let detected = detect_client(user_agent);
    respond(&state, &user, detected.format, detected.reverse, user_agent).await
}

/// `GET /{sub_path}/{token}/{client_type}` — explicit format
pub async fn fetch_with_format(
    State(state): State<ApiState>,
    Path((token, client_type)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response> {
    let format = ClientFormat::from_name(&client_type).ok_or_else(|| {
        PanelError::InvalidInput(format!("unknown client type '{}'", client_type))
    })?;
    let user = validated_user(&state, &token).await?;
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    respond(&state, &user, format, false, user_agent).await
}
