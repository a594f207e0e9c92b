//! Stored PKI material

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{CertificateAuthorityRecord, NodeCertificateRecord};

use super::Store;

impl Store {
    pub async fn certificate_authority(&self) -> Result<Option<CertificateAuthorityRecord>> {
        Ok(sqlx::query_as::<_, CertificateAuthorityRecord>(
            "SELECT * FROM certificate_authorities ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store_certificate_authority(
        &self,
        certificate_pem: &str,
        private_key_pem: &str,
        subject_name: &str,
        serial_number: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Result<CertificateAuthorityRecord> {
        // A replacement CA supersedes the previous one.
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM certificate_authorities")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"INSERT INTO certificate_authorities
               (certificate_pem, private_key_pem, subject_name, serial_number, valid_from, valid_until)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(certificate_pem)
        .bind(private_key_pem)
        .bind(subject_name)
        .bind(serial_number)
        .bind(valid_from)
        .bind(valid_until)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.certificate_authority()
            .await?
            .ok_or_else(|| crate::error::PanelError::Internal("CA row vanished".to_string()))
    }

    pub async fn node_certificate(&self, node_name: &str) -> Result<Option<NodeCertificateRecord>> {
        Ok(sqlx::query_as::<_, NodeCertificateRecord>(
            "SELECT * FROM node_certificates WHERE node_name = ?",
        )
        .bind(node_name)
        .fetch_optional(self.pool())
        .await?)
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn store_node_certificate(
        &self,
        node_name: &str,
        server_certificate_pem: &str,
        server_private_key_pem: &str,
        panel_client_certificate_pem: &str,
        panel_client_private_key_pem: &str,
        serial_number: &str,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO node_certificates
               (node_name, server_certificate_pem, server_private_key_pem,
                panel_client_certificate_pem, panel_client_private_key_pem,
                serial_number, valid_from, valid_until)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT (node_name) DO UPDATE SET
                 server_certificate_pem = excluded.server_certificate_pem,
                 server_private_key_pem = excluded.server_private_key_pem,
                 panel_client_certificate_pem = excluded.panel_client_certificate_pem,
                 panel_client_private_key_pem = excluded.panel_client_private_key_pem,
                 serial_number = excluded.serial_number,
                 valid_from = excluded.valid_from,
                 valid_until = excluded.valid_until"#,
        )
        .bind(node_name)
        .bind(server_certificate_pem)
        .bind(server_private_key_pem)
        .bind(panel_client_certificate_pem)
        .bind(panel_client_private_key_pem)
        .bind(serial_number)
        .bind(valid_from)
        .bind(valid_until)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn delete_node_certificate(&self, node_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM node_certificates WHERE node_name = ?")
            .bind(node_name)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
