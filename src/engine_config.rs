//! Forwarding-engine configuration builder
//!
//! Pure and deterministic: the same node, user set and service list always
//! produce byte-identical output. Keys serialize in sorted order and client
//! lists are ordered by user id, so the orchestration layer can compare
//! configs textually.

use serde_json::{json, Map, Value};
use std::collections::HashSet;

use crate::error::{PanelError, Result};
use crate::models::{
    NetworkType, Node, ProtocolType, ProxySettings, SecurityType, ServiceConfiguration, User,
};

pub const API_TAG: &str = "API_GRPC_CTRL";
pub const API_INBOUND_TAG: &str = "API_GRPC_INBOUND";

/// A user together with the credentials to materialize
#[derive(Debug, Clone)]
pub struct ActiveUser {
    pub user: User,
    pub proxies: Vec<ProxySettings>,
}

/// Built engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    value: Value,
}

impl EngineConfig {
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.value)?)
    }

    /// Inbound object carrying the given tag, if present
    pub fn inbound(&self, tag: &str) -> Option<&Value> {
        self.value
            .get("inbounds")?
            .as_array()?
            .iter()
            .find(|inbound| inbound.get("tag").and_then(Value::as_str) == Some(tag))
    }
}

/// Deep-merge `overlay` into `base`; overlay wins on conflicts.
fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn tcp_header_type(service: &ServiceConfiguration) -> String {
    service
        .advanced_stream_settings
        .as_ref()
        .and_then(|adv| adv.0.get("tcpSettings"))
        .and_then(|tcp| tcp.get("header"))
        .and_then(|header| header.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// XTLS flow survives only on plain stream transports under TLS/REALITY
/// without an HTTP obfuscation header.
fn flow_allowed(service: &ServiceConfiguration) -> bool {
    let network_ok = matches!(
        service.network(),
        NetworkType::Tcp | NetworkType::Kcp | NetworkType::Raw
    );
    let security_ok = matches!(
        service.security_type,
        SecurityType::Tls | SecurityType::Reality
    );
    network_ok && security_ok && tcp_header_type(service) != "http"
}

fn build_clients(service: &ServiceConfiguration, users: &[ActiveUser]) -> Vec<Value> {
    let mut ordered: Vec<&ActiveUser> = users.iter().collect();
    ordered.sort_by_key(|entry| entry.user.id);

    let mut clients = Vec::new();
    for entry in ordered {
        let Some(proxy) = entry
            .proxies
            .iter()
            .find(|p| p.protocol() == service.protocol)
        else {
            continue;
        };
        let mut fields = proxy.client_fields();
        if fields.contains_key("flow") && !flow_allowed(service) {
            fields.remove("flow");
        }
        let mut client = Map::new();
        client.insert("email".to_string(), json!(entry.user.stats_name()));
        for (key, value) in fields {
            client.insert(key, value);
        }
        clients.push(Value::Object(client));
    }
    clients
}

fn build_protocol_settings(
    service: &ServiceConfiguration,
    clients: Vec<Value>,
) -> Value {
    let advanced = service
        .advanced_protocol_settings
        .as_ref()
        .map(|j| j.0.clone());

    if service.protocol == ProtocolType::Shadowsocks {
        // Shadowsocks inbound settings come wholesale from the advanced
        // column; a missing column falls back to a placeholder secret.
        return advanced.unwrap_or_else(|| {
            tracing::warn!(
                service_id = service.id,
                "shadowsocks service has no protocol settings, using placeholder credentials"
            );
            json!({
                "method": "aes-256-gcm",
                "password": "changeme_ss_password"
            })
        });
    }

    let mut settings = Map::new();
    if !clients.is_empty() {
        settings.insert("clients".to_string(), Value::Array(clients));
    }
    if service.protocol == ProtocolType::Vless {
        settings.insert("decryption".to_string(), json!("none"));
    }
    let mut settings = Value::Object(settings);
    if let Some(advanced) = advanced {
        merge_values(&mut settings, &advanced);
    }
    settings
}

fn build_stream_settings(service: &ServiceConfiguration) -> Value {
    let network = service.network();
    let mut stream = Map::new();
    stream.insert("network".to_string(), json!(network.as_str()));
    if service.security_type != SecurityType::None {
        stream.insert("security".to_string(), json!(service.security_type.as_str()));
    }

    let mut network_block = Map::new();
    match network {
        NetworkType::Ws => {
            network_block.insert(
                "path".to_string(),
                json!(service.ws_path.as_deref().unwrap_or("/")),
            );
        }
        NetworkType::Grpc => {
            network_block.insert(
                "serviceName".to_string(),
                json!(service.grpc_service_name.as_deref().unwrap_or("grpc")),
            );
        }
        NetworkType::Http => {
            network_block.insert(
                "path".to_string(),
                json!(service.http_upgrade_path.as_deref().unwrap_or("/")),
            );
        }
        _ => {}
    }

    let network_key = format!("{}Settings", network.as_str());
    let mut network_block = Value::Object(network_block);
    if let Some(advanced) = &service.advanced_stream_settings {
        if let Some(overlay) = advanced.0.get(&network_key) {
            merge_values(&mut network_block, overlay);
        }
        // Non-block keys of the advanced column ride along at the top level
        if let Some(map) = advanced.0.as_object() {
            for (key, value) in map {
                if !key.ends_with("Settings") {
                    stream.insert(key.clone(), value.clone());
                }
            }
        }
    }
    if !network_block.as_object().map(Map::is_empty).unwrap_or(true) {
        stream.insert(network_key, network_block);
    }

    match service.security_type {
        SecurityType::Tls => {
            let mut tls = Map::new();
            tls.insert("serverName".to_string(), json!(service.sni));
            if let Some(fingerprint) = &service.fingerprint {
                tls.insert("fingerprint".to_string(), json!(fingerprint));
            }
            let mut tls = Value::Object(tls);
            if let Some(advanced) = &service.advanced_tls_settings {
                merge_values(&mut tls, &advanced.0);
            }
            stream.insert("tlsSettings".to_string(), tls);
        }
        SecurityType::Reality => {
            let mut reality = Map::new();
            reality.insert("serverName".to_string(), json!(service.sni));
            reality.insert("publicKey".to_string(), json!(service.reality_public_key));
            let short_ids: Vec<&String> = service.reality_short_id.iter().collect();
            reality.insert("shortIds".to_string(), json!(short_ids));
            if let Some(fingerprint) = &service.fingerprint {
                reality.insert("fingerprint".to_string(), json!(fingerprint));
            }
            let mut reality = Value::Object(reality);
            if let Some(advanced) = &service.advanced_reality_settings {
                merge_values(&mut reality, &advanced.0);
            }
            stream.insert("realitySettings".to_string(), reality);
        }
        SecurityType::None => {}
    }

    Value::Object(stream)
}

fn build_inbound(service: &ServiceConfiguration, users: &[ActiveUser]) -> Value {
    let clients = build_clients(service, users);
    let settings = build_protocol_settings(service, clients);
    let stream_settings = build_stream_settings(service);
    let sniffing = service
        .sniffing_settings
        .as_ref()
        .map(|j| j.0.clone())
        .unwrap_or_else(|| {
            json!({
                "enabled": true,
                "destOverride": ["http", "tls", "quic", "fakedns"]
            })
        });

    json!({
        "tag": service.effective_tag(),
        "protocol": service.protocol.as_str(),
        "listen": service.listen_address.as_deref().unwrap_or("0.0.0.0"),
        "port": service.listen_port,
        "settings": settings,
        "streamSettings": stream_settings,
        "sniffing": sniffing,
    })
}

/// Build the complete engine configuration for one node.
///
/// `users` is the set whose `active_node_id` points at `node`; `services`
/// are the node's inbound definitions (disabled ones are skipped here).
pub fn build_engine_config(
    node: &Node,
    users: &[ActiveUser],
    services: &[ServiceConfiguration],
) -> Result<EngineConfig> {
    let api_inbound = json!({
        "tag": API_INBOUND_TAG,
        "listen": "127.0.0.1",
        "port": node.stats_port,
        "protocol": "dokodemo-door",
        "settings": {
            "address": "127.0.0.1",
            "followRedirect": false
        }
    });

    let mut inbounds = vec![api_inbound];
    let mut seen_tags: HashSet<String> = HashSet::from([API_INBOUND_TAG.to_string()]);

    for service in services {
        if !service.enabled {
            continue;
        }
        let tag = service.effective_tag();
        if !seen_tags.insert(tag.clone()) {
            return Err(PanelError::InvalidInput(format!(
                "duplicate engine tag '{}' on node {}",
                tag, node.id
            )));
        }
        let has_users = users.iter().any(|entry| {
            entry
                .proxies
                .iter()
                .any(|p| p.protocol() == service.protocol)
        });
        if !has_users
            && !matches!(service.protocol, ProtocolType::Http | ProtocolType::Socks)
        {
            continue;
        }
        inbounds.push(build_inbound(service, users));
    }

    let value = json!({
        "log": { "loglevel": "warning" },
        "api": {
            "services": ["HandlerService", "StatsService", "LoggerService"],
            "tag": API_TAG
        },
        "stats": {},
        "policy": {
            "levels": {
                "0": {
                    "statsUserUplink": true,
                    "statsUserDownlink": true
                }
            },
            "system": {
                "statsInboundDownlink": true,
                "statsInboundUplink": true
            }
        },
        "inbounds": inbounds,
        "outbounds": [
            { "protocol": "freedom", "settings": {}, "tag": "direct" },
            { "protocol": "blackhole", "settings": {}, "tag": "block" }
        ],
        "routing": {
            "rules": [
                {
                    "type": "field",
                    "inboundTag": [API_INBOUND_TAG],
                    "outboundTag": API_TAG
                }
            ]
        }
    });

    Ok(EngineConfig { value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DataLimitResetStrategy, NodeStatus, UserStatus};
    use chrono::Utc;
    use sqlx::types::Json;
    use uuid::Uuid;

    fn test_node() -> Node {
        Node {
            id: 1,
            name: "edge-1".into(),
            address: "10.0.0.1".into(),
            rpc_port: 6001,
            stats_port: 62051,
            usage_coefficient: 1.0,
            status: NodeStatus::Connected,
            message: None,
            engine_version: None,
            panel_client_cert_pem: None,
            panel_client_key_pem: None,
            created_at: Utc::now(),
            last_status_change: Utc::now(),
        }
    }

    fn test_user(id: i64, proxies: Vec<ProxySettings>) -> ActiveUser {
        ActiveUser {
            user: User {
                id,
                account_number: format!("acct-{}", id),
                owner_admin_id: None,
                status: UserStatus::Active,
                used_traffic: 0,
                data_limit: None,
                data_limit_reset_strategy: DataLimitResetStrategy::NoReset,
                expire: None,
                on_hold_expire_duration: None,
                on_hold_timeout: None,
                auto_delete_in_days: None,
                active_node_id: Some(1),
                note: None,
                online_at: None,
                created_at: Utc::now(),
                edit_at: None,
                last_status_change: Utc::now(),
                sub_revoked_at: None,
                sub_updated_at: None,
                sub_last_user_agent: None,
            },
            proxies,
        }
    }

    fn vless_ws_service(tag: &str) -> ServiceConfiguration {
        ServiceConfiguration {
            id: 10,
            node_id: 1,
            service_name: "edge-vless".into(),
            enabled: true,
            protocol: ProtocolType::Vless,
            listen_address: None,
            listen_port: 443,
            network_type: Some(NetworkType::Ws),
            security_type: SecurityType::Tls,
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
            engine_tag: Some(tag.into()),
        }
    }

    #[test]
    fn build_is_deterministic() {
        let node = test_node();
        let uuid = Uuid::new_v4();
        let users = vec![test_user(
            7,
            vec![ProxySettings::Vless {
                id: uuid,
                flow: None,
            }],
        )];
        let services = vec![vless_ws_service("vless1")];

        let a = build_engine_config(&node, &users, &services).unwrap();
        let b = build_engine_config(&node, &users, &services).unwrap();
        assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
    }

    #[test]
    fn api_inbound_comes_first_and_service_follows() {
        let node = test_node();
        let users = vec![test_user(
            7,
            vec![ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: None,
            }],
        )];
        let services = vec![vless_ws_service("vless1")];

        let config = build_engine_config(&node, &users, &services).unwrap();
        let inbounds = config.as_value()["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["tag"], API_INBOUND_TAG);
        assert_eq!(inbounds[0]["port"], 62051);
        assert_eq!(inbounds[1]["tag"], "vless1");
        assert_eq!(inbounds[1]["settings"]["decryption"], "none");
        assert_eq!(
            inbounds[1]["streamSettings"]["wsSettings"]["path"],
            "/v"
        );
        assert_eq!(
            inbounds[1]["streamSettings"]["tlsSettings"]["serverName"],
            "example.com"
        );
    }

    #[test]
    fn client_email_and_order() {
        let node = test_node();
        let users = vec![
            test_user(
                9,
                vec![ProxySettings::Vless {
                    id: Uuid::new_v4(),
                    flow: None,
                }],
            ),
            test_user(
                3,
                vec![ProxySettings::Vless {
                    id: Uuid::new_v4(),
                    flow: None,
                }],
            ),
        ];
        let services = vec![vless_ws_service("vless1")];

        let config = build_engine_config(&node, &users, &services).unwrap();
        let clients = config.inbound("vless1").unwrap()["settings"]["clients"]
            .as_array()
            .unwrap();
        assert_eq!(clients[0]["email"], "3.acct-3");
        assert_eq!(clients[1]["email"], "9.acct-9");
    }

    #[test]
    fn flow_dropped_on_ws_transport() {
        let node = test_node();
        let users = vec![test_user(
            1,
            vec![ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: Some("xtls-rprx-vision".into()),
            }],
        )];
        let services = vec![vless_ws_service("vless1")];

        let config = build_engine_config(&node, &users, &services).unwrap();
        let client = &config.inbound("vless1").unwrap()["settings"]["clients"][0];
        assert!(client.get("flow").is_none());

        // Plain TCP under TLS keeps the flow
        let mut tcp_service = vless_ws_service("vless2");
        tcp_service.network_type = Some(NetworkType::Tcp);
        tcp_service.ws_path = None;
        let config = build_engine_config(&node, &users, &[tcp_service]).unwrap();
        let client = &config.inbound("vless2").unwrap()["settings"]["clients"][0];
        assert_eq!(client["flow"], "xtls-rprx-vision");
    }

    #[test]
    fn http_header_obfuscation_strips_flow() {
        let node = test_node();
        let users = vec![test_user(
            1,
            vec![ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: Some("xtls-rprx-vision".into()),
            }],
        )];
        let mut service = vless_ws_service("vless1");
        service.network_type = Some(NetworkType::Tcp);
        service.ws_path = None;
        service.advanced_stream_settings = Some(Json(serde_json::json!({
            "tcpSettings": { "header": { "type": "http" } }
        })));

        let config = build_engine_config(&node, &users, &[service]).unwrap();
        let client = &config.inbound("vless1").unwrap()["settings"]["clients"][0];
        assert!(client.get("flow").is_none());
    }

    #[test]
    fn duplicate_tags_fail_the_build() {
        let node = test_node();
        let users = vec![test_user(
            1,
            vec![ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: None,
            }],
        )];
        let mut second = vless_ws_service("vless1");
        second.id = 11;
        let services = vec![vless_ws_service("vless1"), second];

        let err = build_engine_config(&node, &users, &services).unwrap_err();
        assert!(matches!(err, PanelError::InvalidInput(_)));
    }

    #[test]
    fn advanced_stream_settings_deep_merge() {
        let node = test_node();
        let users = vec![test_user(
            1,
            vec![ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: None,
            }],
        )];
        let mut service = vless_ws_service("vless1");
        service.advanced_stream_settings = Some(Json(serde_json::json!({
            "wsSettings": { "headers": { "Host": "cdn.example.com" } },
            "sockopt": { "tcpFastOpen": true }
        })));

        let config = build_engine_config(&node, &users, &[service]).unwrap();
        let stream = &config.inbound("vless1").unwrap()["streamSettings"];
        assert_eq!(stream["wsSettings"]["path"], "/v");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
        assert_eq!(stream["sockopt"]["tcpFastOpen"], true);
    }

    #[test]
    fn services_without_matching_users_are_skipped() {
        let node = test_node();
        let users = vec![test_user(
            1,
            vec![ProxySettings::Trojan {
                password: "pw".into(),
            }],
        )];
        let services = vec![vless_ws_service("vless1")];

        let config = build_engine_config(&node, &users, &services).unwrap();
        assert!(config.inbound("vless1").is_none());
        let inbounds = config.as_value()["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 1);
    }
}
