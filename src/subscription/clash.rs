//! Clash and Clash-Meta YAML documents

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::models::{NetworkType, ProxySettings, SecurityType};

use super::LinkEntry;

fn proxy_value(entry: &LinkEntry, meta: bool) -> Option<Value> {
    let service = &entry.service;
    let mut proxy = Map::new();
    proxy.insert("name".into(), json!(entry.remark));
    proxy.insert("server".into(), json!(entry.address));
    proxy.insert("port".into(), json!(service.listen_port));

    match &entry.settings {
        ProxySettings::Vless { id, flow } => {
            // Plain Clash has no VLESS support
            if !meta {
                return None;
            }
            proxy.insert("type".into(), json!("vless"));
            proxy.insert("uuid".into(), json!(id.to_string()));
            if let Some(flow) = flow {
                proxy.insert("flow".into(), json!(flow));
            }
        }
        ProxySettings::Vmess { id } => {
            proxy.insert("type".into(), json!("vmess"));
            proxy.insert("uuid".into(), json!(id.to_string()));
            proxy.insert("alterId".into(), json!(0));
            proxy.insert("cipher".into(), json!("auto"));
        }
        ProxySettings::Trojan { password } => {
            proxy.insert("type".into(), json!("trojan"));
            proxy.insert("password".into(), json!(password));
        }
        ProxySettings::Shadowsocks { password, method } => {
            proxy.insert("type".into(), json!("ss"));
            proxy.insert("cipher".into(), json!(method));
            proxy.insert("password".into(), json!(password));
        }
        ProxySettings::Http { username, password } => {
            proxy.insert("type".into(), json!("http"));
            if let Some(username) = username {
                proxy.insert("username".into(), json!(username));
            }
            if let Some(password) = password {
                proxy.insert("password".into(), json!(password));
            }
        }
        ProxySettings::Socks { username, password } => {
            proxy.insert("type".into(), json!("socks5"));
            if let Some(username) = username {
                proxy.insert("username".into(), json!(username));
            }
            if let Some(password) = password {
                proxy.insert("password".into(), json!(password));
            }
        }
    }

    match service.security_type {
        SecurityType::Tls => {
            proxy.insert("tls".into(), json!(true));
            if let Some(sni) = &service.sni {
                proxy.insert("servername".into(), json!(sni));
            }
        }
        SecurityType::Reality => {
            if !meta {
                return None;
            }
            proxy.insert("tls".into(), json!(true));
            if let Some(sni) = &service.sni {
                proxy.insert("servername".into(), json!(sni));
            }
            let mut reality = Map::new();
            if let Some(pbk) = &service.reality_public_key {
                reality.insert("public-key".into(), json!(pbk));
            }
            if let Some(sid) = &service.reality_short_id {
                reality.insert("short-id".into(), json!(sid));
            }
            proxy.insert("reality-opts".into(), Value::Object(reality));
            if let Some(fingerprint) = &service.fingerprint {
                proxy.insert("client-fingerprint".into(), json!(fingerprint));
            }
        }
        SecurityType::None => {}
    }

    match service.network() {
        NetworkType::Ws => {
            proxy.insert("network".into(), json!("ws"));
            proxy.insert(
                "ws-opts".into(),
                json!({ "path": service.ws_path.as_deref().unwrap_or("/") }),
            );
        }
        NetworkType::Grpc => {
            proxy.insert("network".into(), json!("grpc"));
            proxy.insert(
                "grpc-opts".into(),
                json!({
                    "grpc-service-name": service.grpc_service_name.as_deref().unwrap_or("grpc")
                }),
            );
        }
        NetworkType::Http => {
            proxy.insert("network".into(), json!("h2"));
            proxy.insert(
                "h2-opts".into(),
                json!({ "path": service.http_upgrade_path.as_deref().unwrap_or("/") }),
            );
        }
        _ => {}
    }

    Some(Value::Object(proxy))
}

pub fn render(entries: &[LinkEntry], meta: bool) -> Result<String> {
    let proxies: Vec<Value> = entries
        .iter()
        .filter_map(|entry| proxy_value(entry, meta))
        .collect();
    let names: Vec<Value> = proxies
        .iter()
        .filter_map(|p| p.get("name").cloned())
        .collect();
    let document = json!({
        "proxies": proxies,
        "proxy-groups": [{
            "name": "Select",
            "type": "select",
            "proxies": names,
        }],
        "rules": ["MATCH,Select"],
    });
    serde_yaml::to_string(&document)
        .map_err(|e| crate::error::PanelError::Serialization(e.to_string()))
}
