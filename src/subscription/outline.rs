//! Outline (Shadowsocks-only) JSON documents

use serde_json::json;

use crate::error::Result;
use crate::models::ProxySettings;

use super::LinkEntry;

/// Outline consumes a single server definition; the first Shadowsocks
/// entry wins and other protocols are invisible to it.
pub fn render(entries: &[LinkEntry]) -> Result<String> {
    let document = entries
        .iter()
        .find_map(|entry| match &entry.settings {
            ProxySettings::Shadowsocks { password, method } => Some(json!({
                "server": entry.address,
                "server_port": entry.service.listen_port,
                "password": password,
                "method": method,
                "remarks": entry.remark,
            })),
            _ => None,
        })
        .unwrap_or_else(|| json!({}));
    Ok(serde_json::to_string_pretty(&document)?)
}
