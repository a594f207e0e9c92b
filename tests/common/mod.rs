//! Shared helpers for integration tests
#![allow(dead_code)]

use std::sync::Arc;

use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpn_panel::models::{NetworkType, ProtocolType, SecurityType};
use vpn_panel::node_client::NodeClient;
use vpn_panel::ops::Operations;
use vpn_panel::pki::Pki;
use vpn_panel::registry::NodeRegistry;
use vpn_panel::store::nodes::NodeCreate;
use vpn_panel::store::services::ServiceCreate;
use vpn_panel::store::users::UserCreate;
use vpn_panel::store::Store;

pub const TEST_SESSION: &str = "sess-0001";
pub const TEST_ENGINE_VERSION: &str = "1.8.24";

pub async fn memory_store() -> Store {
    Store::in_memory().await.expect("in-memory store")
}

/// Mount the standard worker-node REST surface on a mock server.
pub async fn mount_node_api(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": TEST_SESSION,
            "engine_version": TEST_ENGINE_VERSION,
            "started": false,
        })))
        .mount(server)
        .await;
    for endpoint in ["/start", "/restart"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "started": true })))
            .mount(server)
            .await;
    }
    for endpoint in ["/ping", "/stop", "/disconnect"] {
        Mock::given(method("POST"))
            .and(path(endpoint))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(server)
            .await;
    }
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "connected": true,
            "started": true,
            "engine_version": TEST_ENGINE_VERSION,
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/stats/system"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uptime_s": 42 })))
        .mount(server)
        .await;
}

/// Mount a stats payload for `POST /stats/users`.
pub async fn mount_user_stats(server: &MockServer, stats: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/stats/users"))
        .respond_with(ResponseTemplate::new(200).set_body_json(stats))
        .mount(server)
        .await;
}

/// A node client wired against a mock server (plain HTTP, no TLS).
pub fn mock_node_client(node_id: i64, name: &str, server: &MockServer) -> Arc<NodeClient> {
    Arc::new(
        NodeClient::builder()
            .node_id(node_id)
            .name(name)
            .base_url(server.uri())
            .stats_url(server.uri())
            .build()
            .expect("node client"),
    )
}

/// Operations wired to an in-memory store and an empty registry.
pub async fn test_operations(store: &Store) -> (Operations, Arc<NodeRegistry>) {
    let registry = Arc::new(NodeRegistry::new());
    let pki = Arc::new(Pki::new(store.clone()));
    let ops = Operations::new(store.clone(), Arc::clone(&registry), pki);
    (ops, registry)
}

pub fn node_create(name: &str) -> NodeCreate {
    NodeCreate::builder()
        .name(name)
        .address("10.0.0.1")
        .rpc_port(6001)
        .stats_port(62051)
        .build()
}

pub fn vless_user() -> UserCreate {
    UserCreate::builder()
        .status(vpn_panel::models::UserStatus::Active)
        .proxies(vec![vpn_panel::models::ProxySettings::generate(
            ProtocolType::Vless,
        )])
        .build()
}

pub fn vless_ws_service(node_id: i64, tag: &str) -> ServiceCreate {
    ServiceCreate::builder()
        .node_id(node_id)
        .service_name("edge-vless")
        .protocol(ProtocolType::Vless)
        .listen_port(443)
        .network_type(NetworkType::Ws)
        .security_type(SecurityType::Tls)
        .ws_path("/v")
        .sni("example.com")
        .engine_tag(tag)
        .build()
}

/// Pull the engine config JSON out of the last `/start` or `/restart`
/// request the mock node received.
pub async fn last_pushed_config(server: &MockServer) -> Option<serde_json::Value> {
    let requests = server.received_requests().await?;
    requests
        .iter()
        .rev()
        .find(|r| {
            let p = r.url.path();
            p == "/start" || p == "/restart"
        })
        .and_then(|r| {
            let body: serde_json::Value = serde_json::from_slice(&r.body).ok()?;
            let config = body.get("config")?.as_str()?;
            serde_json::from_str(config).ok()
        })
}
