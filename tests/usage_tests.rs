//! Usage pipeline and review tests

mod common;

use common::*;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::MockServer;

use vpn_panel::models::{hour_bucket, NodeStatus, UserStatus};
use vpn_panel::store::users::{NextPlanSpec, UserCreate, UserPatch};
use vpn_panel::usage::UsagePipeline;

async fn pipeline_fixture() -> (
    vpn_panel::store::Store,
    UsagePipeline,
    vpn_panel::ops::Operations,
    MockServer,
    vpn_panel::models::Node,
) {
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
    registry.insert(mock_node_client(node.id, "edge-1", &server)).await;
    ops.connect_node(node.id).await.unwrap();

    let pipeline = UsagePipeline::new(ops.clone(), false, -1);
    let node = store.node(node.id).await.unwrap();
    (store, pipeline, ops, server, node)
}

#[tokio::test]
async fn quota_trip_end_to_end() {
    let (store, pipeline, ops, server, node) = pipeline_fixture().await;

    let user = store
        .create_user(
            UserCreate::builder()
                .status(UserStatus::Active)
                .data_limit(10)
                .proxies(vec![vpn_panel::models::ProxySettings::generate(
                    vpn_panel::models::ProtocolType::Vless,
                )])
                .build(),
            None,
        )
        .await
        .unwrap();
    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();

    mount_user_stats(
        &server,
        json!([{
            "name": format!("{}.{}", user.id, user.account_number),
            "uplink": 6,
            "downlink": 5,
        }]),
    )
    .await;

    // Collection attributes 11 bytes to the user's active node
    pipeline.collect_user_usages().await;
    let collected = store.user_by_id(user.id).await.unwrap();
    assert_eq!(collected.used_traffic, 11);
    assert!(collected.online_at.is_some());
    let rows = store.per_node_user_usages(user.id).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].node_id, node.id);
    assert_eq!(rows[0].used_traffic, 11);

    // Review trips the quota and removes the user from the node
    pipeline.review_users().await;
    let reviewed = store.user_by_id(user.id).await.unwrap();
    assert_eq!(reviewed.status, UserStatus::Limited);
    assert!(reviewed.active_node_id.is_none());

    let config = last_pushed_config(&server).await.expect("config pushed");
    assert_eq!(config["inbounds"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn usage_coefficient_scales_deltas() {
    let (store, pipeline, ops, server, node) = pipeline_fixture().await;

    sqlx::query("UPDATE nodes SET usage_coefficient = 2.0 WHERE id = ?")
        .bind(node.id)
        .execute(store.pool())
        .await
        .unwrap();

    let user = store.create_user(vless_user(), None).await.unwrap();
    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();

    mount_user_stats(
        &server,
        json!([{
            "name": format!("{}.{}", user.id, user.account_number),
            "uplink": 100,
            "downlink": 100,
        }]),
    )
    .await;

    pipeline.collect_user_usages().await;
    assert_eq!(store.user_by_id(user.id).await.unwrap().used_traffic, 400);
}

#[tokio::test]
async fn legacy_stat_names_map_to_users() {
    let (store, pipeline, ops, server, node) = pipeline_fixture().await;

    let user = store.create_user(vless_user(), None).await.unwrap();
    ops.activate_user_on_node(&user.account_number, node.id)
        .await
        .unwrap();

    mount_user_stats(
        &server,
        json!([
            { "name": user.account_number, "uplink": 7, "downlink": 3 },
            { "name": "nobody-knows-this", "uplink": 100, "downlink": 100 }
        ]),
    )
    .await;

    pipeline.collect_user_usages().await;
    assert_eq!(store.user_by_id(user.id).await.unwrap().used_traffic, 10);
}

#[tokio::test]
async fn aggregation_job_matches_attribution() {
    let (store, pipeline, _ops, _server, node) = pipeline_fixture().await;

    let alice = store.create_user(vless_user(), None).await.unwrap();
    let bob = store.create_user(vless_user(), None).await.unwrap();
    let now = Utc::now();
    store
        .record_per_node_user_usage(alice.id, node.id, now, 1000)
        .await
        .unwrap();
    store
        .record_per_node_user_usage(bob.id, node.id, now, 500)
        .await
        .unwrap();

    pipeline.aggregate_node_usages().await;
    let usage = store
        .per_node_usage(node.id, hour_bucket(now))
        .await
        .unwrap()
        .expect("aggregate");
    assert_eq!(usage.uplink, 0);
    assert_eq!(usage.downlink, 1500);
}

#[tokio::test]
async fn review_expires_users_at_deadline() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, -1);

    let user = store
        .create_user(UserCreate::builder().status(UserStatus::Active).build(), None)
        .await
        .unwrap();
    store
        .update_user(
            user.id,
            UserPatch::builder()
                .expire(Some(Utc::now().timestamp() + 3600))
                .build(),
        )
        .await
        .unwrap();

    pipeline.review_users().await;
    assert_eq!(
        store.user_by_id(user.id).await.unwrap().status,
        UserStatus::Active
    );

    // Move the deadline into the past: expired on the next tick
    sqlx::query("UPDATE users SET expire = ? WHERE id = ?")
        .bind(Utc::now().timestamp())
        .bind(user.id)
        .execute(store.pool())
        .await
        .unwrap();

    pipeline.review_users().await;
    assert_eq!(
        store.user_by_id(user.id).await.unwrap().status,
        UserStatus::Expired
    );
}

#[tokio::test]
async fn review_fires_pending_plan_instead_of_limiting() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, -1);

    let user = store
        .create_user(
            UserCreate::builder()
                .status(UserStatus::Active)
                .data_limit(10)
                .next_plan(NextPlanSpec {
                    data_limit: Some(1000),
                    expire: Some(30 * 86400),
                    add_remaining_traffic: false,
                    fire_on_either: true,
                })
                .build(),
            None,
        )
        .await
        .unwrap();
    store.add_user_traffic(user.id, 20).await.unwrap();

    pipeline.review_users().await;
    let user = store.user_by_id(user.id).await.unwrap();
    assert_eq!(user.status, UserStatus::Active);
    assert_eq!(user.data_limit, Some(1000));
    assert_eq!(user.used_traffic, 0);
    assert!(store.next_plan(user.id).await.unwrap().is_none());
}

#[tokio::test]
async fn on_hold_clears_on_timeout_and_converts_duration() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, -1);

    let user = store
        .create_user(
            UserCreate::builder()
                .status(UserStatus::OnHold)
                .on_hold_expire_duration(86400)
                .on_hold_timeout(Utc::now() - Duration::hours(1))
                .build(),
            None,
        )
        .await
        .unwrap();

    pipeline.review_users().await;
    let user = store.user_by_id(user.id).await.unwrap();
    assert_eq!(user.status, UserStatus::Active);
    assert!(user.on_hold_expire_duration.is_none());
    assert!(user.on_hold_timeout.is_none());
    let expire = user.expire.expect("expiry started");
    let expected = Utc::now().timestamp() + 86400;
    assert!((expire - expected).abs() < 5);
}

#[tokio::test]
async fn on_hold_clears_when_user_comes_online_after_base_time() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, -1);

    let waiting = store
        .create_user(
            UserCreate::builder()
                .status(UserStatus::OnHold)
                .on_hold_expire_duration(86400)
                .build(),
            None,
        )
        .await
        .unwrap();

    // Never online, no timeout: stays on hold
    pipeline.review_users().await;
    assert_eq!(
        store.user_by_id(waiting.id).await.unwrap().status,
        UserStatus::OnHold
    );

    store
        .record_user_online(waiting.id, Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    pipeline.review_users().await;
    let user = store.user_by_id(waiting.id).await.unwrap();
    assert_eq!(user.status, UserStatus::Active);
    assert!(user.expire.is_some());
}

#[tokio::test]
async fn periodic_reset_honors_strategy_window() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, -1);

    let user = store
        .create_user(
            UserCreate::builder()
                .status(UserStatus::Active)
                .data_limit(100)
                .data_limit_reset_strategy(Some(
                    vpn_panel::models::DataLimitResetStrategy::Day,
                ))
                .build(),
            None,
        )
        .await
        .unwrap();
    store.add_user_traffic(user.id, 50).await.unwrap();

    // Window not elapsed: usage stays
    pipeline.periodic_reset().await;
    assert_eq!(store.user_by_id(user.id).await.unwrap().used_traffic, 50);

    // Age the account past the window
    sqlx::query("UPDATE users SET created_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::days(2))
        .bind(user.id)
        .execute(store.pool())
        .await
        .unwrap();

    pipeline.periodic_reset().await;
    assert_eq!(store.user_by_id(user.id).await.unwrap().used_traffic, 0);
}

#[tokio::test]
async fn autodelete_job_removes_aged_users() {
    let store = memory_store().await;
    let (ops, _) = test_operations(&store).await;
    let pipeline = UsagePipeline::new(ops, false, 1);

    let user = store.create_user(UserCreate::builder().build(), None).await.unwrap();
    store.set_user_status(user.id, UserStatus::Expired).await.unwrap();
    sqlx::query("UPDATE users SET last_status_change = ? WHERE id = ?")
        .bind(Utc::now() - Duration::days(2))
        .bind(user.id)
        .execute(store.pool())
        .await
        .unwrap();

    pipeline.autodelete_expired().await;
    assert!(store.user_by_id(user.id).await.is_err());
}

#[tokio::test]
async fn health_check_recovers_errored_nodes() {
    let (store, pipeline, _ops, _server, node) = pipeline_fixture().await;

    store
        .set_node_status(node.id, NodeStatus::Error, Some("probe failed"), None)
        .await
        .unwrap();

    pipeline.health_check().await;
    assert_eq!(
        store.node(node.id).await.unwrap().status,
        NodeStatus::Connected
    );
}
