//! Worker node client tests

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vpn_panel::engine_config::build_engine_config;
use vpn_panel::error::PanelError;
use vpn_panel::models::{NodeStatus, ProxySettings};
use vpn_panel::node_client::NodeClient;

#[tokio::test]
async fn connect_claims_session_and_version() {
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let client = mock_node_client(1, "edge-1", &server);
    assert!(!client.connected().await);

    let response = client.connect().await.unwrap();
    assert_eq!(response.session_id, TEST_SESSION);
    assert_eq!(response.engine_version.as_deref(), Some(TEST_ENGINE_VERSION));
    assert!(client.connected().await);
    assert_eq!(
        client.engine_version().await.as_deref(),
        Some(TEST_ENGINE_VERSION)
    );
}

#[tokio::test]
async fn ping_carries_session_and_clears_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": TEST_SESSION,
            "started": false,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ping"))
        .and(body_partial_json(json!({ "session_id": TEST_SESSION })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_node_client(1, "edge-1", &server);
    client.connect().await.unwrap();
    client.ping().await.unwrap();

    // Node forgets the session: ping fails and drops it locally
    server.reset().await;
    Mock::given(method("POST"))
        .and(path("/ping"))
        .respond_with(
            ResponseTemplate::new(403).set_body_json(json!({ "detail": "Session ID mismatch" })),
        )
        .mount(&server)
        .await;

    let err = client.ping().await.unwrap_err();
    match err {
        PanelError::NodeUnavailable {
            status_code,
            detail,
        } => {
            assert_eq!(status_code, 403);
            assert_eq!(detail, "Session ID mismatch");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!client.connected().await);
}

fn sample_config() -> vpn_panel::engine_config::EngineConfig {
    let node = vpn_panel::models::Node {
        id: 1,
        name: "edge-1".into(),
        address: "10.0.0.1".into(),
        rpc_port: 6001,
        stats_port: 62051,
        usage_coefficient: 1.0,
        status: NodeStatus::Connecting,
        message: None,
        engine_version: None,
        panel_client_cert_pem: None,
        panel_client_key_pem: None,
        created_at: chrono::Utc::now(),
        last_status_change: chrono::Utc::now(),
    };
    build_engine_config(&node, &[], &[]).unwrap()
}

#[tokio::test]
async fn start_pushes_config_payload() {
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let client = mock_node_client(1, "edge-1", &server);
    client.start(&sample_config()).await.unwrap();

    let pushed = last_pushed_config(&server).await.expect("config pushed");
    assert_eq!(pushed["api"]["tag"], "API_GRPC_CTRL");
    assert_eq!(pushed["inbounds"][0]["tag"], "API_GRPC_INBOUND");
}

#[tokio::test]
async fn start_on_running_engine_becomes_restart() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": TEST_SESSION,
            "started": true,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(409)
                .set_body_json(json!({ "detail": "engine is started already" })),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/restart"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "started": true })))
        .expect(1)
        .mount(&server)
        .await;

    let client = mock_node_client(1, "edge-1", &server);
    client.start(&sample_config()).await.unwrap();
}

#[tokio::test]
async fn start_failure_surfaces_detail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/connect"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "session_id": TEST_SESSION,
            "started": false,
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/start"))
        .respond_with(
            ResponseTemplate::new(500).set_body_json(json!({ "detail": "config rejected" })),
        )
        .mount(&server)
        .await;

    let client = mock_node_client(1, "edge-1", &server);
    let err = client.start(&sample_config()).await.unwrap_err();
    assert!(err.is_node_unavailable());
    assert!(err.to_string().contains("config rejected"));
}

#[tokio::test]
async fn stats_fetch_parses_counters() {
    let server = MockServer::start().await;
    mount_node_api(&server).await;
    mount_user_stats(
        &server,
        json!([
            { "name": "7.acct-7", "uplink": 1000, "downlink": 2000 },
            { "name": "legacy-acct", "uplink": 5, "downlink": 0 }
        ]),
    )
    .await;

    let client = mock_node_client(1, "edge-1", &server);
    let stats = client.get_all_users_traffic(true).await.unwrap();
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].name, "7.acct-7");
    assert_eq!(stats[0].uplink, 1000);
    assert_eq!(stats[0].downlink, 2000);

    let system = client.get_system_stats().await.unwrap();
    assert_eq!(system.uptime_s, 42);
}

#[tokio::test]
async fn unreachable_node_maps_to_connection_detail() {
    let client = NodeClient::builder()
        .node_id(1)
        .name("edge-1")
        .base_url("http://127.0.0.1:1")
        .stats_url("http://127.0.0.1:1")
        .timeout(std::time::Duration::from_millis(200))
        .build()
        .unwrap();

    let err = client.connect().await.unwrap_err();
    assert!(err.is_node_unavailable());
}

#[tokio::test]
async fn disconnect_clears_local_state_even_when_node_is_gone() {
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let client = mock_node_client(1, "edge-1", &server);
    client.connect().await.unwrap();
    assert!(client.connected().await);

    server.reset().await;
    client.disconnect().await;
    assert!(!client.connected().await);
}

#[tokio::test]
async fn sample_client_proxy_fields_survive_push() {
    // A config with one user round-trips through the start payload intact
    let server = MockServer::start().await;
    mount_node_api(&server).await;

    let node = vpn_panel::models::Node {
        id: 1,
        name: "edge-1".into(),
        address: "10.0.0.1".into(),
        rpc_port: 6001,
        stats_port: 62051,
        usage_coefficient: 1.0,
        status: NodeStatus::Connecting,
        message: None,
        engine_version: None,
        panel_client_cert_pem: None,
        panel_client_key_pem: None,
        created_at: chrono::Utc::now(),
        last_status_change: chrono::Utc::now(),
    };
    let settings = ProxySettings::generate(vpn_panel::models::ProtocolType::Vless);
    let secret = settings.secret();
    let user = vpn_panel::engine_config::ActiveUser {
        user: vpn_panel::models::User {
            id: 7,
            account_number: "acct-7".into(),
            owner_admin_id: None,
            status: vpn_panel::models::UserStatus::Active,
            used_traffic: 0,
            data_limit: None,
            data_limit_reset_strategy: vpn_panel::models::DataLimitResetStrategy::NoReset,
            expire: None,
            on_hold_expire_duration: None,
            on_hold_timeout: None,
            auto_delete_in_days: None,
            active_node_id: Some(1),
            note: None,
            online_at: None,
            created_at: chrono::Utc::now(),
            edit_at: None,
            last_status_change: chrono::Utc::now(),
            sub_revoked_at: None,
            sub_updated_at: None,
            sub_last_user_agent: None,
        },
        proxies: vec![settings],
    };

    let mut service = vpn_panel::models::ServiceConfiguration {
        id: 10,
        node_id: 1,
        service_name: "edge-vless".into(),
        enabled: true,
        protocol: vpn_panel::models::ProtocolType::Vless,
        listen_address: None,
        listen_port: 443,
        network_type: Some(vpn_panel::models::NetworkType::Ws),
        security_type: vpn_panel::models::SecurityType::Tls,
        ws_path: Some("/v".into()),
        grpc_service_name: None,
        http_upgrade_path: None,
        sni: Some("example.com".into()),
        fingerprint: None,
        reality_public_key: None,
        reality_short_id: None,
        advanced_protocol_settings: None,
        advanced_stream_settings: None,
        advanced_tls_settings: None,
        advanced_reality_settings: None,
        sniffing_settings: None,
        engine_tag: Some("vless1".into()),
    };
    service.node_id = node.id;

    let config = build_engine_config(&node, &[user], &[service]).unwrap();
    let client = mock_node_client(1, "edge-1", &server);
    client.start(&config).await.unwrap();

    let pushed = last_pushed_config(&server).await.expect("config pushed");
    let clients = pushed["inbounds"][1]["settings"]["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["email"], "7.acct-7");
    assert_eq!(clients[0]["id"], secret);
}
