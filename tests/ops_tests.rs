//! Orchestration tests: connect, activate, deactivate, reconcile

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpn_panel::error::PanelError;
use vpn_panel::models::{NodeStatus, UserStatus};
use vpn_panel::store::users::UserCreate;

#[tokio::test]
async fn create_activate_pushes_expected_config() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    store
        .create_service(vless_ws_service(node.id, "vless1"))
        .await
        .unwrap();
    let user = store.create_user(vless_user(), None).await.unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;

    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();

    // Node walked connecting → connected and recorded the engine version
    let node = store.node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Connected);
    assert_eq!(node.engine_version.as_deref(), Some(TEST_ENGINE_VERSION));

    let user = store.user_by_id(user.id).await.unwrap();
    assert_eq!(user.active_node_id, Some(node.id));

    // Exactly the API inbound plus the vless service, carrying the user
    let config = last_pushed_config(&server).await.expect("config pushed");
    let inbounds = config["inbounds"].as_array().unwrap();
    assert_eq!(inbounds.len(), 2);
    assert_eq!(inbounds[0]["tag"], "API_GRPC_INBOUND");
    assert_eq!(inbounds[1]["tag"], "vless1");
    let clients = inbounds[1]["settings"]["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(
        clients[0]["email"],
        format!("{}.{}", user.id, user.account_number)
    );
    let proxy = store.proxies_for_user(user.id).await.unwrap().remove(0);
    assert_eq!(clients[0]["id"], proxy.settings.0.secret());
}

#[tokio::test]
async fn deactivation_omits_user_from_next_config() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    store
        .create_service(vless_ws_service(node.id, "vless1"))
        .await
        .unwrap();
    let user = store.create_user(vless_user(), None).await.unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;

    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();
    ops.deactivate_user(&user.account_number).await.unwrap();

    let user = store.user_by_id(user.id).await.unwrap();
    assert!(user.active_node_id.is_none());

    // The rebuilt config omits the vless inbound entirely: no remaining
    // user matches its protocol
    let config = last_pushed_config(&server).await.expect("config pushed");
    let inbounds = config["inbounds"].as_array().unwrap();
    assert_eq!(inbounds.len(), 1);
    assert_eq!(inbounds[0]["tag"], "API_GRPC_INBOUND");
}

#[tokio::test]
async fn activation_validations() {
    let store = memory_store().await;
    let (ops, _registry) = test_operations(&store).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    let disabled_user = store
        .create_user(UserCreate::builder().build(), None)
        .await
        .unwrap();

    // Disabled (pending payment) user cannot be activated
    let err = ops
        .activate_user_on_node(&disabled_user.account_number, node.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PanelError::Conflict(_)));

    // Disabled node refuses activation
    store
        .set_node_status(node.id, NodeStatus::Disabled, None, None)
        .await
        .unwrap();
    let active_user = store.create_user(vless_user(), None).await.unwrap();
    let err = ops
        .activate_user_on_node(&active_user.account_number, node.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PanelError::Conflict(_)));

    // Unknown user is a 404-kind error
    let err = ops
        .activate_user_on_node("00000000-0000-4000-8000-00000000dead", node.id)
        .await
        .unwrap_err();
    assert!(matches!(err, PanelError::NotFound));
}

#[tokio::test]
async fn connect_failure_marks_error_and_does_not_propagate() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/connect"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({ "detail": "engine offline" })),
        )
        .mount(&server)
        .await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;

    // Background semantics: the failure becomes node state, not an error
    ops.connect_node(node.id).await.unwrap();

    let node = store.node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Error);
    assert!(node.message.unwrap().contains("engine offline"));
}

#[tokio::test]
async fn disabled_node_is_not_connected() {
    let store = memory_store().await;
    let (ops, _registry) = test_operations(&store).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_status(node.id, NodeStatus::Disabled, None, None)
        .await
        .unwrap();

    ops.connect_node(node.id).await.unwrap();
    let node = store.node(node.id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Disabled);
}

#[tokio::test]
async fn reapply_deactivates_non_activatable_users() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    store
        .create_service(vless_ws_service(node.id, "vless1"))
        .await
        .unwrap();
    let user = store.create_user(vless_user(), None).await.unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;

    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();

    store.set_user_status(user.id, UserStatus::Limited).await.unwrap();
    ops.reapply_user(user.id).await.unwrap();

    let user = store.user_by_id(user.id).await.unwrap();
    assert!(user.active_node_id.is_none());
}

#[tokio::test]
async fn delete_user_deactivates_first() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    store
        .create_service(vless_ws_service(node.id, "vless1"))
        .await
        .unwrap();
    let user = store.create_user(vless_user(), None).await.unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;

    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();
    ops.delete_user(&user.account_number).await.unwrap();

    assert!(store.user_by_id(user.id).await.is_err());
    let config = last_pushed_config(&server).await.expect("config pushed");
    assert_eq!(config["inbounds"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn node_disable_tears_down_client() {
    let store = memory_store().await;
    let (ops, registry) = test_operations(&store).await;
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = store.create_node(node_create("edge-1")).await.unwrap();
    store
        .set_node_client_credentials(node.id, "test-cert", "test-key")
        .await
        .unwrap();
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;
    ops.connect_node(node.id).await.unwrap();

    ops.disable_node(node.id).await.unwrap();
    assert_eq!(
        store.node(node.id).await.unwrap().status,
        NodeStatus::Disabled
    );
    assert!(registry.get(node.id).await.is_none());
}
