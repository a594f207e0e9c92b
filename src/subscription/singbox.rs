//! sing-box JSON documents

use serde_json::{json, Map, Value};

use crate::error::Result;
use crate::models::{NetworkType, ProxySettings, SecurityType};

use super::LinkEntry;

fn transport_value(entry: &LinkEntry) -> Option<Value> {
    let service = &entry.service;
    match service.network() {
        NetworkType::Ws => Some(json!({
            "type": "ws",
            "path": service.ws_path.as_deref().unwrap_or("/"),
        })),
        NetworkType::Grpc => Some(json!({
            "type": "grpc",
            "service_name": service.grpc_service_name.as_deref().unwrap_or("grpc"),
        })),
        NetworkType::Http => Some(json!({
            "type": "http",
            "path": service.http_upgrade_path.as_deref().unwrap_or("/"),
        })),
        _ => None,
    }
}

fn tls_value(entry: &LinkEntry) -> Option<Value> {
    let service = &entry.service;
    match service.security_type {
        SecurityType::None => None,
        SecurityType::Tls => Some(json!({
            "enabled": true,
            "server_name": service.sni,
        })),
        SecurityType::Reality => Some(json!({
            "enabled": true,
            "server_name": service.sni,
            "reality": {
                "enabled": true,
                "public_key": service.reality_public_key,
                "short_id": service.reality_short_id,
            },
            "utls": {
                "enabled": service.fingerprint.is_some(),
                "fingerprint": service.fingerprint,
            },
        })),
    }
}

fn outbound_value(entry: &LinkEntry) -> Value {
    let service = &entry.service;
    let mut outbound = Map::new();
    outbound.insert("tag".into(), json!(entry.remark));
    outbound.insert("server".into(), json!(entry.address));
    outbound.insert("server_port".into(), json!(service.listen_port));

    match &entry.settings {
        ProxySettings::Vless { id, flow } => {
            outbound.insert("type".into(), json!("vless"));
            outbound.insert("uuid".into(), json!(id.to_string()));
            if let Some(flow) = flow {
                outbound.insert("flow".into(), json!(flow));
            }
        }
        ProxySettings::Vmess { id } => {
            outbound.insert("type".into(), json!("vmess"));
            outbound.insert("uuid".into(), json!(id.to_string()));
            outbound.insert("security".into(), json!("auto"));
        }
        ProxySettings::Trojan { password } => {
            outbound.insert("type".into(), json!("trojan"));
            outbound.insert("password".into(), json!(password));
        }
        ProxySettings::Shadowsocks { password, method } => {
            outbound.insert("type".into(), json!("shadowsocks"));
            outbound.insert("method".into(), json!(method));
            outbound.insert("password".into(), json!(password));
        }
        ProxySettings::Http { username, password } => {
            outbound.insert("type".into(), json!("http"));
            outbound.insert("username".into(), json!(username));
            outbound.insert("password".into(), json!(password));
        }
        ProxySettings::Socks { username, password } => {
            outbound.insert("type".into(), json!("socks"));
            outbound.insert("username".into(), json!(username));
            outbound.insert("password".into(), json!(password));
        }
    }

    if let Some(tls) = tls_value(entry) {
        outbound.insert("tls".into(), tls);
    }
    if let Some(transport) = transport_value(entry) {
        outbound.insert("transport".into(), transport);
    }
    Value::Object(outbound)
}

pub fn render(entries: &[LinkEntry]) -> Result<String> {
    let mut outbounds: Vec<Value> = vec![json!({
        "type": "selector",
        "tag": "Select",
        "outbounds": entries.iter().map(|e| e.remark.clone()).collect::<Vec<_>>(),
    })];
    outbounds.extend(entries.iter().map(outbound_value));
    let document = json!({ "outbounds": outbounds });
    Ok(serde_json::to_string_pretty(&document)?)
}
