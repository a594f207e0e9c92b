//! Core entity types for the panel
//!
//! ## Overview
//! - Subscriber, admin, node and service records as stored
//! - Protocol-tagged proxy credentials
//! - Status enums and their transition helpers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::{PanelError, Result};

/// Subscriber lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Disabled,
    Limited,
    Expired,
    OnHold,
}

impl UserStatus {
    /// Statuses whose credentials may be materialized into a worker
    pub fn is_activatable(self) -> bool {
        matches!(self, UserStatus::Active | UserStatus::OnHold)
    }
}

/// Worker node status, driven by the node client state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NodeStatus {
    Disabled,
    Connecting,
    Connected,
    Error,
}

/// Inbound protocols supported by the forwarding engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProtocolType {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Http,
    Socks,
}

impl ProtocolType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolType::Vless => "vless",
            ProtocolType::Vmess => "vmess",
            ProtocolType::Trojan => "trojan",
            ProtocolType::Shadowsocks => "shadowsocks",
            ProtocolType::Http => "http",
            ProtocolType::Socks => "socks",
        }
    }
}

/// Stream transport for a service inbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum NetworkType {
    Tcp,
    Ws,
    Grpc,
    Http,
    Kcp,
    Quic,
    Raw,
}

impl NetworkType {
    pub fn as_str(self) -> &'static str {
        match self {
            NetworkType::Tcp => "tcp",
            NetworkType::Ws => "ws",
            NetworkType::Grpc => "grpc",
            NetworkType::Http => "http",
            NetworkType::Kcp => "kcp",
            NetworkType::Quic => "quic",
            NetworkType::Raw => "raw",
        }
    }
}

/// Stream security for a service inbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SecurityType {
    None,
    Tls,
    Reality,
}

impl SecurityType {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityType::None => "none",
            SecurityType::Tls => "tls",
            SecurityType::Reality => "reality",
        }
    }
}

/// Periodic usage reset cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DataLimitResetStrategy {
    #[serde(rename = "none")]
    #[sqlx(rename = "none")]
    NoReset,
    Day,
    Week,
    Month,
    Year,
}

impl DataLimitResetStrategy {
    /// Reset period in days; `None` for the no-reset strategy
    pub fn period_days(self) -> Option<i64> {
        match self {
            DataLimitResetStrategy::NoReset => None,
            DataLimitResetStrategy::Day => Some(1),
            DataLimitResetStrategy::Week => Some(7),
            DataLimitResetStrategy::Month => Some(30),
            DataLimitResetStrategy::Year => Some(365),
        }
    }
}

/// Notification reminder category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ReminderType {
    ExpirationDate,
    DataUsage,
}

/// Protocol-tagged proxy credentials
///
/// Serialized as the protocol tag plus its payload; revocation regenerates
/// the secret in place while keeping every other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProxySettings {
    Vless {
        id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        flow: Option<String>,
    },
    Vmess {
        id: Uuid,
    },
    Trojan {
        password: String,
    },
    Shadowsocks {
        password: String,
        method: String,
    },
    Http {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    Socks {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
}

fn generate_password() -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..22)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

impl ProxySettings {
    /// Fresh credentials for a protocol
    pub fn generate(protocol: ProtocolType) -> Self {
        match protocol {
            ProtocolType::Vless => ProxySettings::Vless {
                id: Uuid::new_v4(),
                flow: None,
            },
            ProtocolType::Vmess => ProxySettings::Vmess { id: Uuid::new_v4() },
            ProtocolType::Trojan => ProxySettings::Trojan {
                password: generate_password(),
            },
            ProtocolType::Shadowsocks => ProxySettings::Shadowsocks {
                password: generate_password(),
                method: "chacha20-ietf-poly1305".to_string(),
            },
            ProtocolType::Http => ProxySettings::Http {
                username: None,
                password: None,
            },
            ProtocolType::Socks => ProxySettings::Socks {
                username: None,
                password: None,
            },
        }
    }

    pub fn protocol(&self) -> ProtocolType {
        match self {
            ProxySettings::Vless { .. } => ProtocolType::Vless,
            ProxySettings::Vmess { .. } => ProtocolType::Vmess,
            ProxySettings::Trojan { .. } => ProtocolType::Trojan,
            ProxySettings::Shadowsocks { .. } => ProtocolType::Shadowsocks,
            ProxySettings::Http { .. } => ProtocolType::Http,
            ProxySettings::Socks { .. } => ProtocolType::Socks,
        }
    }

    /// Regenerate the secret in place, keeping all other fields
    pub fn revoke(&mut self) {
        match self {
            ProxySettings::Vless { id, .. } => *id = Uuid::new_v4(),
            ProxySettings::Vmess { id } => *id = Uuid::new_v4(),
            ProxySettings::Trojan { password } => *password = generate_password(),
            ProxySettings::Shadowsocks { password, .. } => *password = generate_password(),
            ProxySettings::Http { password, .. } | ProxySettings::Socks { password, .. } => {
                if password.is_some() {
                    *password = Some(generate_password());
                }
            }
        }
    }

    /// The credential string clients present (uuid or password)
    pub fn secret(&self) -> String {
        match self {
            ProxySettings::Vless { id, .. } | ProxySettings::Vmess { id } => id.to_string(),
            ProxySettings::Trojan { password } => password.clone(),
            ProxySettings::Shadowsocks { password, .. } => password.clone(),
            ProxySettings::Http { password, .. } | ProxySettings::Socks { password, .. } => {
                password.clone().unwrap_or_default()
            }
        }
    }

    /// Payload fields without the protocol tag, as emitted into engine
    /// client entries.
    pub fn client_fields(&self) -> serde_json::Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        map.remove("protocol");
        map
    }
}

/// Panel administrator
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Admin {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_sudo: bool,
    pub created_at: DateTime<Utc>,
    pub password_reset_at: Option<DateTime<Utc>>,
}

/// Subscriber record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub account_number: String,
    pub owner_admin_id: Option<i64>,
    pub status: UserStatus,
    pub used_traffic: i64,
    pub data_limit: Option<i64>,
    pub data_limit_reset_strategy: DataLimitResetStrategy,
    /// UNIX seconds; `None` means no expiry
    pub expire: Option<i64>,
    pub on_hold_expire_duration: Option<i64>,
    pub on_hold_timeout: Option<DateTime<Utc>>,
    pub auto_delete_in_days: Option<i64>,
    pub active_node_id: Option<i64>,
    pub note: Option<String>,
    pub online_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub edit_at: Option<DateTime<Utc>>,
    pub last_status_change: DateTime<Utc>,
    pub sub_revoked_at: Option<DateTime<Utc>>,
    pub sub_updated_at: Option<DateTime<Utc>>,
    pub sub_last_user_agent: Option<String>,
}

impl User {
    /// Identifier workers report traffic under
    pub fn stats_name(&self) -> String {
        format!("{}.{}", self.id, self.account_number)
    }

    /// Quota check; a zero limit only trips once traffic has flowed.
    pub fn is_limited_by(&self, used: i64) -> bool {
        self.data_limit
            .map(|limit| used >= limit && used > 0)
            .unwrap_or(false)
    }

    pub fn is_expired_at(&self, now_ts: i64) -> bool {
        self.expire.map(|e| e <= now_ts).unwrap_or(false)
    }
}

/// Per-user proxy credentials row; one per (user, protocol)
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Proxy {
    pub id: i64,
    pub user_id: i64,
    pub protocol: ProtocolType,
    pub settings: Json<ProxySettings>,
}

/// Worker node record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub rpc_port: u16,
    pub stats_port: u16,
    pub usage_coefficient: f64,
    pub status: NodeStatus,
    pub message: Option<String>,
    pub engine_version: Option<String>,
    #[serde(skip_serializing)]
    pub panel_client_cert_pem: Option<String>,
    #[serde(skip_serializing)]
    pub panel_client_key_pem: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_status_change: DateTime<Utc>,
}

/// Per-node inbound definition users' credentials attach to
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ServiceConfiguration {
    pub id: i64,
    pub node_id: i64,
    pub service_name: String,
    pub enabled: bool,
    pub protocol: ProtocolType,
    pub listen_address: Option<String>,
    pub listen_port: u16,
    pub network_type: Option<NetworkType>,
    pub security_type: SecurityType,
    pub ws_path: Option<String>,
    pub grpc_service_name: Option<String>,
    pub http_upgrade_path: Option<String>,
    pub sni: Option<String>,
    pub fingerprint: Option<String>,
    pub reality_public_key: Option<String>,
    pub reality_short_id: Option<String>,
    pub advanced_protocol_settings: Option<Json<Value>>,
    pub advanced_stream_settings: Option<Json<Value>>,
    pub advanced_tls_settings: Option<Json<Value>>,
    pub advanced_reality_settings: Option<Json<Value>>,
    pub sniffing_settings: Option<Json<Value>>,
    /// Unique per node; generated when omitted
    pub engine_tag: Option<String>,
}

impl ServiceConfiguration {
    /// Tag this service's inbound carries inside the engine config
    pub fn effective_tag(&self) -> String {
        self.engine_tag
            .clone()
            .unwrap_or_else(|| format!("service_{}", self.id))
    }

    pub fn network(&self) -> NetworkType {
        self.network_type.unwrap_or(NetworkType::Tcp)
    }

    /// Validate coupled fields. Mirrors the input validation the API layer
    /// performs before persisting.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(PanelError::InvalidInput(
                "listen_port must be in 1..=65535".to_string(),
            ));
        }
        match self.network_type {
            Some(NetworkType::Ws) => {
                match &self.ws_path {
                    Some(path) if path.starts_with('/') => {}
                    Some(_) => {
                        return Err(PanelError::InvalidInput(
                            "ws_path must start with '/'".to_string(),
                        ))
                    }
                    None => {
                        return Err(PanelError::InvalidInput(
                            "ws_path is required for ws network".to_string(),
                        ))
                    }
                }
                if self.http_upgrade_path.is_some() {
                    return Err(PanelError::InvalidInput(
                        "http_upgrade_path is not applicable to ws network".to_string(),
                    ));
                }
            }
            Some(NetworkType::Grpc) => {
                if self.grpc_service_name.is_none() {
                    return Err(PanelError::InvalidInput(
                        "grpc_service_name is required for grpc network".to_string(),
                    ));
                }
            }
            Some(NetworkType::Http) => {
                if let Some(path) = &self.http_upgrade_path {
                    if !path.starts_with('/') {
                        return Err(PanelError::InvalidInput(
                            "http_upgrade_path must start with '/'".to_string(),
                        ));
                    }
                }
                if self.ws_path.is_some() {
                    return Err(PanelError::InvalidInput(
                        "ws_path is not applicable to http network".to_string(),
                    ));
                }
            }
            _ => {
                if self.ws_path.is_some() {
                    return Err(PanelError::InvalidInput(
                        "ws_path is only applicable to ws network".to_string(),
                    ));
                }
                if self.grpc_service_name.is_some() {
                    return Err(PanelError::InvalidInput(
                        "grpc_service_name is only applicable to grpc network".to_string(),
                    ));
                }
            }
        }
        if self.security_type == SecurityType::Reality
            && (self.sni.is_none() || self.reality_public_key.is_none())
        {
            return Err(PanelError::InvalidInput(
                "reality security requires sni and reality_public_key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Pending plan applied when the current one runs out
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NextPlan {
    pub user_id: i64,
    pub data_limit: Option<i64>,
    /// Expiry in UNIX seconds once fired; `None` keeps the user unexpiring
    pub expire: Option<i64>,
    pub add_remaining_traffic: bool,
    pub fire_on_either: bool,
}

/// Hourly per-user traffic attribution
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PerNodeUserUsage {
    pub id: i64,
    pub user_id: i64,
    pub node_id: i64,
    pub hour_bucket: DateTime<Utc>,
    pub used_traffic: i64,
}

/// Hourly per-node aggregate
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PerNodeUsage {
    pub id: i64,
    pub node_id: i64,
    pub hour_bucket: DateTime<Utc>,
    pub uplink: i64,
    pub downlink: i64,
}

/// Usage-reset audit row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UsageResetLog {
    pub id: i64,
    pub user_id: i64,
    pub used_traffic_at_reset: i64,
    pub reset_at: DateTime<Utc>,
}

/// Pending notification marker
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct NotificationReminder {
    pub id: i64,
    pub user_id: i64,
    pub reminder_type: ReminderType,
    pub threshold: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Stored certificate authority material
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CertificateAuthorityRecord {
    pub id: i64,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub subject_name: String,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Stored per-node certificate set (server + panel client)
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeCertificateRecord {
    pub id: i64,
    pub node_name: String,
    pub server_certificate_pem: String,
    pub server_private_key_pem: String,
    pub panel_client_certificate_pem: String,
    pub panel_client_private_key_pem: String,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Truncate a timestamp to its hour bucket (UTC)
pub fn hour_bucket(ts: DateTime<Utc>) -> DateTime<Utc> {
    use chrono::{DurationRound, TimeDelta};
    ts.duration_trunc(TimeDelta::hours(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revoke_changes_secret_and_keeps_shape() {
        let mut settings = ProxySettings::generate(ProtocolType::Vless);
        let before = settings.secret();
        settings.revoke();
        assert_ne!(settings.secret(), before);
        assert_eq!(settings.protocol(), ProtocolType::Vless);

        let mut ss = ProxySettings::Shadowsocks {
            password: "old".into(),
            method: "aes-256-gcm".into(),
        };
        ss.revoke();
        match ss {
            ProxySettings::Shadowsocks { password, method } => {
                assert_ne!(password, "old");
                assert_eq!(method, "aes-256-gcm");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn client_fields_drop_protocol_tag() {
        let settings = ProxySettings::generate(ProtocolType::Vmess);
        let fields = settings.client_fields();
        assert!(fields.contains_key("id"));
        assert!(!fields.contains_key("protocol"));
    }

    #[test]
    fn service_validation_couples_fields() {
        let mut svc = ServiceConfiguration {
            id: 1,
            node_id: 1,
            service_name: "edge".into(),
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
            engine_tag: Some("vless1".into()),
        };
        assert!(svc.validate().is_ok());

        svc.ws_path = Some("v".into());
        assert!(svc.validate().is_err());

        svc.ws_path = None;
        assert!(svc.validate().is_err());

        svc.network_type = Some(NetworkType::Grpc);
        assert!(svc.validate().is_err());
        svc.grpc_service_name = Some("tunnel".into());
        assert!(svc.validate().is_ok());

        svc.security_type = SecurityType::Reality;
        assert!(svc.validate().is_err());
        svc.reality_public_key = Some("pbk".into());
        assert!(svc.validate().is_ok());

        svc.listen_port = 0;
        assert!(svc.validate().is_err());
    }

    #[test]
    fn hour_bucket_truncates() {
        use chrono::TimeZone;
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 14, 37, 22).unwrap();
        let bucket = hour_bucket(ts);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2025, 6, 1, 14, 0, 0).unwrap());
    }
}
