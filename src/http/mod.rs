//! HTTP API adapter
//!
//! Thin boundary over the core: request validation, admin auth, store
//! mutation and background dispatch into [`crate::ops::Operations`].
//! Handlers never wait on worker nodes; node-facing work is spawned and
//! its failures surface through node status.

mod admins;
mod auth;
mod nodes;
mod services;
mod subscription;
mod system;
mod users;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::Core;
use crate::error::PanelError;

pub use auth::{AuthAdmin, SudoAdmin};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct ApiState {
    pub core: Arc<Core>,
}

impl IntoResponse for PanelError {
    fn into_response(self) -> Response {
        let status = match &self {
            PanelError::NotFound => StatusCode::NOT_FOUND,
            PanelError::AlreadyExists | PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            PanelError::AuthFailed => StatusCode::UNAUTHORIZED,
            PanelError::Forbidden(_) => StatusCode::FORBIDDEN,
            PanelError::NodeUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PanelError::Database(_)
            | PanelError::Serialization(_)
            | PanelError::Certificate(_)
            | PanelError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "internal error");
        }
        (status, Json(serde_json::json!({ "detail": self.to_string() }))).into_response()
    }
}

/// Build the panel router.
pub fn router(core: Arc<Core>) -> Router {
    let sub_path = core.settings.subscription_path.clone();
    let state = ApiState { core };

    let api = Router::new()
        .route("/admin/token", post(admins::issue_token))
        .route("/admins", get(admins::list).post(admins::create))
        .route("/admins/:username", delete(admins::remove))
        .route("/admins/:username/password", put(admins::set_password))
        .route("/users", get(users::list).post(users::create))
        .route(
            "/user/:account_number",
            get(users::show).put(users::update).delete(users::remove),
        )
        .route("/user/:account_number/reset", post(users::reset_usage))
        .route("/user/:account_number/revoke_sub", post(users::revoke_sub))
        .route(
            "/user/:account_number/active-next-plan",
            post(users::apply_next_plan),
        )
        .route("/user/:account_number/usage", get(users::usage))
        .route(
            "/user/:account_number/subscription",
            get(users::subscription_url),
        )
        .route(
            "/user/:account_number/node/:node_id/activate",
            post(users::activate_on_node),
        )
        .route(
            "/user/:account_number/node/deactivate",
            post(users::deactivate),
        )
        .route("/nodes", get(nodes::list).post(nodes::create))
        .route(
            "/node/:node_id",
            get(nodes::show).put(nodes::update).delete(nodes::remove),
        )
        .route("/node/:node_id/reconnect", post(nodes::reconnect))
        .route("/node/:node_id/rotate-certs", post(nodes::rotate_certs))
        .route("/node/:node_id/export-certs", post(nodes::export_certs))
        .route("/node/:node_id/logs", get(nodes::logs))
        .route(
            "/node/:node_id/services",
            get(services::list_for_node).post(services::create),
        )
        .route(
            "/service/:service_id",
            get(services::show).put(services::update).delete(services::remove),
        )
        .route("/system", get(system::stats))
        .route("/core/restart", post(system::restart_core));

    let subscription = Router::new()
        .route("/:token", get(subscription::fetch))
        .route("/:token/:client_type", get(subscription::fetch_with_format));

    Router::new()
        .nest("/api", api)
        .nest(&format!("/{}", sub_path.trim_matches('/')), subscription)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_methods(Any)
                .allow_headers(Any)
                .allow_origin(Any),
        )
        .with_state(state)
}
