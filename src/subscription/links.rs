//! v2ray-style share links and the JSON config flavor

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use url::form_urlencoded;

use crate::error::Result;
use crate::models::{NetworkType, ProxySettings, SecurityType};

use super::LinkEntry;

fn encode_fragment(remark: &str) -> String {
    url::form_urlencoded::byte_serialize(remark.as_bytes()).collect()
}

fn stream_query(entry: &LinkEntry, pairs: &mut form_urlencoded::Serializer<'_, String>) {
    let service = &entry.service;
    let network = service.network();
    pairs.append_pair("type", network.as_str());
    if service.security_type != SecurityType::None {
        pairs.append_pair("security", service.security_type.as_str());
    }
    match network {
        NetworkType::Ws | NetworkType::Http => {
            let path = match network {
                NetworkType::Ws => service.ws_path.as_deref(),
                _ => service.http_upgrade_path.as_deref(),
            };
            pairs.append_pair("path", path.unwrap_or("/"));
        }
        NetworkType::Grpc => {
            pairs.append_pair(
                "serviceName",
                service.grpc_service_name.as_deref().unwrap_or("grpc"),
            );
        }
        _ => {}
    }
    if let Some(sni) = &service.sni {
        pairs.append_pair("sni", sni);
    }
    if let Some(fingerprint) = &service.fingerprint {
        pairs.append_pair("fp", fingerprint);
    }
    if service.security_type == SecurityType::Reality {
        if let Some(pbk) = &service.reality_public_key {
            pairs.append_pair("pbk", pbk);
        }
        if let Some(sid) = &service.reality_short_id {
            pairs.append_pair("sid", sid);
        }
    }
}

fn vless_link(entry: &LinkEntry, uuid: &str, flow: Option<&str>) -> String {
    let mut pairs = form_urlencoded::Serializer::new(String::new());
    stream_query(entry, &mut pairs);
    if let Some(flow) = flow {
        pairs.append_pair("flow", flow);
    }
    format!(
        "vless://{}@{}:{}?{}#{}",
        uuid,
        entry.address,
        entry.service.listen_port,
        pairs.finish(),
        encode_fragment(&entry.remark)
    )
}

fn vmess_link(entry: &LinkEntry, uuid: &str) -> String {
    let service = &entry.service;
    let network = service.network();
    let path = match network {
        NetworkType::Ws => service.ws_path.clone().unwrap_or_else(|| "/".into()),
        NetworkType::Grpc => service.grpc_service_name.clone().unwrap_or_default(),
        NetworkType::Http => service.http_upgrade_path.clone().unwrap_or_else(|| "/".into()),
        _ => String::new(),
    };
    let payload = json!({
        "v": "2",
        "ps": entry.remark,
        "add": entry.address,
        "port": service.listen_port.to_string(),
        "id": uuid,
        "aid": "0",
        "scy": "auto",
        "net": network.as_str(),
        "type": "none",
        "host": "",
        "path": path,
        "tls": if service.security_type == SecurityType::None { "" } else { service.security_type.as_str() },
        "sni": service.sni.clone().unwrap_or_default(),
        "fp": service.fingerprint.clone().unwrap_or_default(),
    });
    format!("vmess://{}", BASE64.encode(payload.to_string()))
}

fn trojan_link(entry: &LinkEntry, password: &str) -> String {
    let mut pairs = form_urlencoded::Serializer::new(String::new());
    stream_query(entry, &mut pairs);
    format!(
        "trojan://{}@{}:{}?{}#{}",
        password,
        entry.address,
        entry.service.listen_port,
        pairs.finish(),
        encode_fragment(&entry.remark)
    )
}

fn shadowsocks_link(entry: &LinkEntry, method: &str, password: &str) -> String {
    let userinfo = BASE64.encode(format!("{}:{}", method, password));
    format!(
        "ss://{}@{}:{}#{}",
        userinfo,
        entry.address,
        entry.service.listen_port,
        encode_fragment(&entry.remark)
    )
}

/// One share link per entry. HTTP and SOCKS carry no standard link scheme
/// and are omitted.
pub fn render_links(entries: &[LinkEntry]) -> Vec<String> {
    entries
        .iter()
        .filter_map(|entry| match &entry.settings {
            ProxySettings::Vless { id, flow } => Some(vless_link(
                entry,
                &id.to_string(),
                flow.as_deref().filter(|f| !f.is_empty()),
            )),
            ProxySettings::Vmess { id } => Some(vmess_link(entry, &id.to_string())),
            ProxySettings::Trojan { password } => Some(trojan_link(entry, password)),
            ProxySettings::Shadowsocks { password, method } => {
                Some(shadowsocks_link(entry, method, password))
            }
            ProxySettings::Http { .. } | ProxySettings::Socks { .. } => None,
        })
        .collect()
}

fn stream_settings_value(entry: &LinkEntry) -> Value {
    let service = &entry.service;
    let network = service.network();
    let mut stream = serde_json::Map::new();
    stream.insert("network".into(), json!(network.as_str()));
    if service.security_type != SecurityType::None {
        stream.insert("security".into(), json!(service.security_type.as_str()));
        match service.security_type {
            SecurityType::Tls => {
                stream.insert(
                    "tlsSettings".into(),
                    json!({
                        "serverName": service.sni,
                        "fingerprint": service.fingerprint,
                    }),
                );
            }
            SecurityType::Reality => {
                stream.insert(
                    "realitySettings".into(),
                    json!({
                        "serverName": service.sni,
                        "publicKey": service.reality_public_key,
                        "shortId": service.reality_short_id,
                        "fingerprint": service.fingerprint,
                    }),
                );
            }
            SecurityType::None => {}
        }
    }
    match network {
        NetworkType::Ws => {
            stream.insert(
                "wsSettings".into(),
                json!({ "path": service.ws_path.as_deref().unwrap_or("/") }),
            );
        }
        NetworkType::Grpc => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": service.grpc_service_name.as_deref().unwrap_or("grpc") }),
            );
        }
        NetworkType::Http => {
            stream.insert(
                "httpSettings".into(),
                json!({ "path": service.http_upgrade_path.as_deref().unwrap_or("/") }),
            );
        }
        _ => {}
    }
    Value::Object(stream)
}

fn outbound_value(entry: &LinkEntry) -> Value {
    let port = entry.service.listen_port;
    let (protocol, settings) = match &entry.settings {
        ProxySettings::Vless { id, flow } => (
            "vless",
            json!({
                "vnext": [{
                    "address": entry.address,
                    "port": port,
                    "users": [{
                        "id": id.to_string(),
                        "flow": flow.clone().unwrap_or_default(),
                        "encryption": "none"
                    }]
                }]
            }),
        ),
        ProxySettings::Vmess { id } => (
            "vmess",
            json!({
                "vnext": [{
                    "address": entry.address,
                    "port": port,
                    "users": [{ "id": id.to_string(), "security": "auto" }]
                }]
            }),
        ),
        ProxySettings::Trojan { password } => (
            "trojan",
            json!({
                "servers": [{ "address": entry.address, "port": port, "password": password }]
            }),
        ),
        ProxySettings::Shadowsocks { password, method } => (
            "shadowsocks",
            json!({
                "servers": [{
                    "address": entry.address,
                    "port": port,
                    "method": method,
                    "password": password
                }]
            }),
        ),
        ProxySettings::Http { username, password } => (
            "http",
            json!({
                "servers": [{
                    "address": entry.address,
                    "port": port,
                    "users": [{ "user": username, "pass": password }]
                }]
            }),
        ),
        ProxySettings::Socks { username, password } => (
            "socks",
            json!({
                "servers": [{
                    "address": entry.address,
                    "port": port,
                    "users": [{ "user": username, "pass": password }]
                }]
            }),
        ),
    };
    json!({
        "tag": "proxy",
        "protocol": protocol,
        "settings": settings,
        "streamSettings": stream_settings_value(entry),
    })
}

/// Full client configs, one JSON document per entry, for clients that
/// consume raw engine configuration.
pub fn render_v2ray_json(entries: &[LinkEntry]) -> Result<String> {
    let configs: Vec<Value> = entries
        .iter()
        .map(|entry| {
            json!({
                "remarks": entry.remark,
                "log": { "loglevel": "warning" },
                "outbounds": [
                    outbound_value(entry),
                    { "protocol": "freedom", "tag": "direct" },
                    { "protocol": "blackhole", "tag": "block" }
                ],
            })
        })
        .collect();
    Ok(serde_json::to_string_pretty(&configs)?)
}
