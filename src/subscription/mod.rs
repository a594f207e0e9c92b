//! Subscription materialization
//!
//! Renders a user's active-node credentials into the config format the
//! requesting client expects. Detection is User-Agent based; the fallback
//! is a base64 link list every client understands. Rendering is
//! deterministic and never fails user-visibly: bodies carry human-readable
//! placeholder lines when there is nothing to render.

mod clash;
mod links;
mod outline;
mod singbox;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::Result;
use crate::models::{Node, ProxySettings, ServiceConfiguration, User};

/// Client-facing output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFormat {
    V2ray,
    V2rayJson,
    Clash,
    ClashMeta,
    SingBox,
    Outline,
}

impl ClientFormat {
    pub fn media_type(self) -> &'static str {
        match self {
            ClientFormat::V2ray => "text/plain",
            ClientFormat::V2rayJson => "application/json",
            ClientFormat::Clash | ClientFormat::ClashMeta => "text/yaml",
            ClientFormat::SingBox => "application/json",
            ClientFormat::Outline => "application/json",
        }
    }

    pub fn as_base64(self) -> bool {
        matches!(self, ClientFormat::V2ray)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "v2ray" => Some(ClientFormat::V2ray),
            "v2ray-json" => Some(ClientFormat::V2rayJson),
            "clash" => Some(ClientFormat::Clash),
            "clash-meta" => Some(ClientFormat::ClashMeta),
            "sing-box" => Some(ClientFormat::SingBox),
            "outline" => Some(ClientFormat::Outline),
            _ => None,
        }
    }
}

/// Format choice plus serialization quirks derived from the User-Agent
#[derive(Debug, Clone, Copy)]
pub struct DetectedClient {
    pub format: ClientFormat,
    pub reverse: bool,
}

fn version_at_least(version: &str, minimum: &[u32]) -> bool {
    let parts: Vec<u32> = version
        .split('.')
        .map(|p| p.parse().unwrap_or(0))
        .collect();
    for (have, want) in parts.iter().zip(minimum.iter()) {
        if have > want {
            return true;
        }
        if have < want {
            return false;
        }
    }
    parts.len() >= minimum.len()
}

macro_rules! ua_regex {
    ($name:ident, $pattern:literal) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("static regex"))
        }
    };
}

ua_regex!(re_clash_meta, r"^([Cc]lash-verge|[Cc]lash[-\.]?[Mm]eta|[Ff][Ll][Cc]lash|[Mm]ihomo)");
ua_regex!(re_clash, r"^([Cc]lash|[Ss]tash)");
ua_regex!(re_singbox, r"^(SFA|SFI|SFM|SFT|[Kk]aring|[Hh]iddify[Nn]ext)");
ua_regex!(re_outline, r"^(SS|SSR|SSD|SSS|Outline|Shadowsocks|SSconf)");
ua_regex!(re_v2rayn, r"^v2rayN/(\d+\.\d+)");
ua_regex!(re_v2rayng, r"^v2rayNG/(\d+\.\d+\.\d+)");
ua_regex!(re_streisand, r"^[Ss]treisand");
ua_regex!(re_happ, r"^Happ/(\d+\.\d+\.\d+)");

/// Pick an output format from the requesting client's User-Agent.
pub fn detect_client(user_agent: &str) -> DetectedClient {
    if re_clash_meta().is_match(user_agent) {
        return DetectedClient {
            format: ClientFormat::ClashMeta,
            reverse: false,
        };
    }
    if re_clash().is_match(user_agent) {
        return DetectedClient {
            format: ClientFormat::Clash,
            reverse: false,
        };
    }
    if re_singbox().is_match(user_agent) {
        return DetectedClient {
            format: ClientFormat::SingBox,
            reverse: false,
        };
    }
    if re_outline().is_match(user_agent) {
        return DetectedClient {
            format: ClientFormat::Outline,
            reverse: false,
        };
    }
    if let Some(captures) = re_v2rayn().captures(user_agent) {
        if version_at_least(&captures[1], &[6, 40]) {
            return DetectedClient {
                format: ClientFormat::V2rayJson,
                reverse: false,
            };
        }
    }
    if let Some(captures) = re_v2rayng().captures(user_agent) {
        if version_at_least(&captures[1], &[1, 8, 29]) {
            return DetectedClient {
                format: ClientFormat::V2rayJson,
                reverse: false,
            };
        }
        if version_at_least(&captures[1], &[1, 8, 18]) {
            return DetectedClient {
                format: ClientFormat::V2rayJson,
                reverse: true,
            };
        }
    }
    if re_streisand().is_match(user_agent) {
        return DetectedClient {
            format: ClientFormat::V2rayJson,
            reverse: false,
        };
    }
    if let Some(captures) = re_happ().captures(user_agent) {
        if version_at_least(&captures[1], &[1, 63, 1]) {
            return DetectedClient {
                format: ClientFormat::V2rayJson,
                reverse: false,
            };
        }
    }
    DetectedClient {
        format: ClientFormat::V2ray,
        reverse: false,
    }
}

/// One renderable server entry: a service on the user's active node plus
/// the user's credentials for its protocol.
#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub remark: String,
    pub address: String,
    pub settings: ProxySettings,
    pub service: ServiceConfiguration,
}

/// Collect renderable entries for a user against their active node.
/// Placeholder text is returned instead when nothing can be rendered.
pub fn collect_entries(
    proxies: &[ProxySettings],
    active: Option<(&Node, &[ServiceConfiguration])>,
) -> std::result::Result<Vec<LinkEntry>, Vec<String>> {
    let Some((node, services)) = active else {
        let placeholders = proxies
            .iter()
            .map(|proxy| {
                format!(
                    "{}: Select a server first",
                    proxy.protocol().as_str().to_uppercase()
                )
            })
            .collect();
        return Err(placeholders);
    };

    let mut entries = Vec::new();
    for proxy in proxies {
        for service in services {
            if !service.enabled
                || service.protocol != proxy.protocol()
                || service.engine_tag.is_none()
            {
                continue;
            }
            entries.push(LinkEntry {
                remark: format!("{} {}", node.name, service.service_name),
                address: node.address.clone(),
                settings: proxy.clone(),
                service: service.clone(),
            });
        }
    }
    if entries.is_empty() {
        return Err(vec![format!("No server configurations for node {}", node.id)]);
    }
    Ok(entries)
}

/// Render a subscription body for the chosen format. Output is already
/// base64-wrapped where the format calls for it.
pub fn render_subscription(
    proxies: &[ProxySettings],
    active: Option<(&Node, &[ServiceConfiguration])>,
    format: ClientFormat,
    reverse: bool,
) -> Result<String> {
    let entries = match collect_entries(proxies, active) {
        Ok(entries) => entries,
        Err(placeholders) => {
            let body = placeholders.join("\n");
            return Ok(if format.as_base64() {
                BASE64.encode(body)
            } else {
                body
            });
        }
    };
    let mut entries = entries;
    if reverse {
        entries.reverse();
    }

    let body = match format {
        ClientFormat::V2ray => links::render_links(&entries).join("\n"),
        ClientFormat::V2rayJson => links::render_v2ray_json(&entries)?,
        ClientFormat::Clash => clash::render(&entries, false)?,
        ClientFormat::ClashMeta => clash::render(&entries, true)?,
        ClientFormat::SingBox => singbox::render(&entries)?,
        ClientFormat::Outline => outline::render(&entries)?,
    };
    Ok(if format.as_base64() {
        BASE64.encode(body)
    } else {
        body
    })
}

/// `subscription-userinfo` header value
pub fn userinfo_header(user: &User) -> String {
    format!(
        "upload=0; download={}; total={}; expire={}",
        user.used_traffic,
        user.data_limit.unwrap_or(0),
        user.expire.unwrap_or(0),
    )
}

/// Profile titles travel base64-wrapped so header encoding stays ASCII
pub fn encode_title(title: &str) -> String {
    format!("base64:{}", BASE64.encode(title))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ua_detection_matches_known_clients() {
        assert_eq!(
            detect_client("Clash-Verge/1.5.1").format,
            ClientFormat::ClashMeta
        );
        assert_eq!(detect_client("mihomo/1.18").format, ClientFormat::ClashMeta);
        assert_eq!(detect_client("clash 1.0").format, ClientFormat::Clash);
        assert_eq!(detect_client("Stash/2.0").format, ClientFormat::Clash);
        assert_eq!(detect_client("SFA/1.9").format, ClientFormat::SingBox);
        assert_eq!(detect_client("karing/1.0").format, ClientFormat::SingBox);
        assert_eq!(detect_client("Outline/1.0").format, ClientFormat::Outline);
        assert_eq!(detect_client("curl/8.0").format, ClientFormat::V2ray);
        assert_eq!(detect_client("").format, ClientFormat::V2ray);
    }

    #[test]
    fn versioned_clients_gate_json_output() {
        assert_eq!(detect_client("v2rayN/6.40").format, ClientFormat::V2rayJson);
        assert_eq!(detect_client("v2rayN/6.39").format, ClientFormat::V2ray);
        assert_eq!(
            detect_client("v2rayNG/1.8.29").format,
            ClientFormat::V2rayJson
        );
        let mid = detect_client("v2rayNG/1.8.20");
        assert_eq!(mid.format, ClientFormat::V2rayJson);
        assert!(mid.reverse);
        assert_eq!(detect_client("v2rayNG/1.8.17").format, ClientFormat::V2ray);
        assert_eq!(
            detect_client("Streisand/1.0").format,
            ClientFormat::V2rayJson
        );
        assert_eq!(detect_client("Happ/1.63.1").format, ClientFormat::V2rayJson);
        assert_eq!(detect_client("Happ/1.62.0").format, ClientFormat::V2ray);
    }
}
