//! Service configuration CRUD
//!
//! A service configuration is a node-local inbound definition. Engine tags
//! must stay unique per node; a generated tag is stamped at creation so it
//! stays stable across restarts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use typed_builder::TypedBuilder;

use crate::error::{PanelError, Result};
use crate::models::{NetworkType, ProtocolType, SecurityType, ServiceConfiguration};

use super::Store;

/// Create request for a node service
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ServiceCreate {
    /// Owning node; the HTTP layer fills this from the route
    #[serde(default)]
    pub node_id: i64,
    #[builder(setter(into))]
    pub service_name: String,
    #[serde(default = "default_enabled")]
    #[builder(default = true)]
    pub enabled: bool,
    pub protocol: ProtocolType,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub listen_address: Option<String>,
    pub listen_port: u16,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub network_type: Option<NetworkType>,
    #[serde(default = "default_security")]
    #[builder(default = SecurityType::None)]
    pub security_type: SecurityType,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub ws_path: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub grpc_service_name: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub http_upgrade_path: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub sni: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub fingerprint: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub reality_public_key: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub reality_short_id: Option<String>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub advanced_protocol_settings: Option<Value>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub advanced_stream_settings: Option<Value>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub advanced_tls_settings: Option<Value>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub advanced_reality_settings: Option<Value>,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub sniffing_settings: Option<Value>,
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub engine_tag: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_security() -> SecurityType {
    SecurityType::None
}

impl ServiceCreate {
    fn as_unvalidated(&self) -> ServiceConfiguration {
        ServiceConfiguration {
            id: 0,
            node_id: self.node_id,
            service_name: self.service_name.clone(),
            enabled: self.enabled,
            protocol: self.protocol,
            listen_address: self.listen_address.clone(),
            listen_port: self.listen_port,
            network_type: self.network_type,
            security_type: self.security_type,
            ws_path: self.ws_path.clone(),
            grpc_service_name: self.grpc_service_name.clone(),
            http_upgrade_path: self.http_upgrade_path.clone(),
            sni: self.sni.clone(),
            fingerprint: self.fingerprint.clone(),
            reality_public_key: self.reality_public_key.clone(),
            reality_short_id: self.reality_short_id.clone(),
            advanced_protocol_settings: self.advanced_protocol_settings.clone().map(Json),
            advanced_stream_settings: self.advanced_stream_settings.clone().map(Json),
            advanced_tls_settings: self.advanced_tls_settings.clone().map(Json),
            advanced_reality_settings: self.advanced_reality_settings.clone().map(Json),
            sniffing_settings: self.sniffing_settings.clone().map(Json),
            engine_tag: self.engine_tag.clone(),
        }
    }
}

impl Store {
    pub async fn create_service(&self, req: ServiceCreate) -> Result<ServiceConfiguration> {
        req.as_unvalidated().validate()?;
        self.node(req.node_id).await?;

        let mut tx = self.pool().begin().await?;
        let service_id: i64 = sqlx::query_scalar(
            r#"INSERT INTO service_configurations
               (node_id, service_name, enabled, protocol, listen_address, listen_port,
                network_type, security_type, ws_path, grpc_service_name, http_upgrade_path,
                sni, fingerprint, reality_public_key, reality_short_id,
                advanced_protocol_settings, advanced_stream_settings, advanced_tls_settings,
                advanced_reality_settings, sniffing_settings, engine_tag)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING id"#,
        )
        .bind(req.node_id)
        .bind(&req.service_name)
        .bind(req.enabled)
        .bind(req.protocol)
        .bind(&req.listen_address)
        .bind(req.listen_port)
        .bind(req.network_type)
        .bind(req.security_type)
        .bind(&req.ws_path)
        .bind(&req.grpc_service_name)
        .bind(&req.http_upgrade_path)
        .bind(&req.sni)
        .bind(&req.fingerprint)
        .bind(&req.reality_public_key)
        .bind(&req.reality_short_id)
        .bind(req.advanced_protocol_settings.as_ref().map(Json))
        .bind(req.advanced_stream_settings.as_ref().map(Json))
        .bind(req.advanced_tls_settings.as_ref().map(Json))
        .bind(req.advanced_reality_settings.as_ref().map(Json))
        .bind(req.sniffing_settings.as_ref().map(Json))
        .bind(&req.engine_tag)
        .fetch_one(&mut *tx)
        .await?;

        if req.engine_tag.is_none() {
            sqlx::query("UPDATE service_configurations SET engine_tag = ? WHERE id = ?")
                .bind(format!("service_{}", service_id))
                .bind(service_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        self.service(service_id).await
    }

    pub async fn service(&self, service_id: i64) -> Result<ServiceConfiguration> {
        sqlx::query_as::<_, ServiceConfiguration>(
            "SELECT * FROM service_configurations WHERE id = ?",
        )
        .bind(service_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or(PanelError::NotFound)
    }

    pub async fn services_for_node(&self, node_id: i64) -> Result<Vec<ServiceConfiguration>> {
        Ok(sqlx::query_as::<_, ServiceConfiguration>(
            "SELECT * FROM service_configurations WHERE node_id = ? ORDER BY id",
        )
        .bind(node_id)
        .fetch_all(self.pool())
        .await?)
    }

    /// Replace a service definition wholesale; partial patches are not
    /// meaningful for coupled inbound fields.
    pub async fn update_service(
        &self,
        service_id: i64,
        req: ServiceCreate,
    ) -> Result<ServiceConfiguration> {
        req.as_unvalidated().validate()?;
        let existing = self.service(service_id).await?;
        let engine_tag = req
            .engine_tag
            .clone()
            .or(existing.engine_tag)
            .unwrap_or_else(|| format!("service_{}", service_id));
        sqlx::query(
            r#"UPDATE service_configurations SET
               service_name = ?, enabled = ?, protocol = ?, listen_address = ?, listen_port = ?,
               network_type = ?, security_type = ?, ws_path = ?, grpc_service_name = ?,
               http_upgrade_path = ?, sni = ?, fingerprint = ?, reality_public_key = ?,
               reality_short_id = ?, advanced_protocol_settings = ?, advanced_stream_settings = ?,
               advanced_tls_settings = ?, advanced_reality_settings = ?, sniffing_settings = ?,
               engine_tag = ?
               WHERE id = ?"#,
        )
        .bind(&req.service_name)
        .bind(req.enabled)
        .bind(req.protocol)
        .bind(&req.listen_address)
        .bind(req.listen_port)
        .bind(req.network_type)
        .bind(req.security_type)
        .bind(&req.ws_path)
        .bind(&req.grpc_service_name)
        .bind(&req.http_upgrade_path)
        .bind(&req.sni)
        .bind(&req.fingerprint)
        .bind(&req.reality_public_key)
        .bind(&req.reality_short_id)
        .bind(req.advanced_protocol_settings.as_ref().map(Json))
        .bind(req.advanced_stream_settings.as_ref().map(Json))
        .bind(req.advanced_tls_settings.as_ref().map(Json))
        .bind(req.advanced_reality_settings.as_ref().map(Json))
        .bind(req.sniffing_settings.as_ref().map(Json))
        .bind(engine_tag)
        .bind(service_id)
        .execute(self.pool())
        .await?;
        self.service(service_id).await
    }

    pub async fn delete_service(&self, service_id: i64) -> Result<()> {
        let affected = sqlx::query("DELETE FROM service_configurations WHERE id = ?")
            .bind(service_id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(PanelError::NotFound);
        }
        Ok(())
    }
}
