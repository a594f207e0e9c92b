//! Fleet PKI
//!
//! ## Overview
//! - Self-signed CA, regenerated when missing or close to expiry
//! - Per-node server certificates (serverAuth, SAN from name + address)
//! - Panel client certificates (clientAuth) for the mTLS channel to nodes
//! - Rotation and filesystem export for node provisioning

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PanelError, Result};
use crate::store::Store;

const CA_SUBJECT_NAME: &str = "VPN Fleet Certificate Authority";
const CA_VALIDITY_DAYS: i64 = 3650;
const CERT_VALIDITY_DAYS: i64 = 365;
const CA_RENEWAL_WINDOW_DAYS: i64 = 30;

const CA_KEY_BITS: usize = 4096;
const NODE_KEY_BITS: usize = 2048;

/// One issued certificate with its key material
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub subject_name: String,
    pub serial_number: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
}

/// Complete certificate set for one node
#[derive(Debug, Clone)]
pub struct NodeCertSet {
    pub ca: CertificateInfo,
    pub server: CertificateInfo,
    pub panel_client: CertificateInfo,
}

/// Certificate authority and node certificate issuance
pub struct Pki {
    store: Store,
    // Guards first-boot CA generation against duplicate CAs
    ca_lock: Mutex<()>,
}

fn generate_rsa_key(bits: usize) -> Result<(KeyPair, String)> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
        .map_err(|e| PanelError::Certificate(format!("RSA key generation failed: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PanelError::Certificate(format!("key serialization failed: {}", e)))?
        .to_string();
    let key_pair = KeyPair::from_pem(&pem)
        .map_err(|e| PanelError::Certificate(format!("key import failed: {}", e)))?;
    Ok((key_pair, pem))
}

fn random_serial() -> (SerialNumber, String) {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f; // keep the serial positive
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    (SerialNumber::from_slice(&bytes), hex)
}

fn to_offset(ts: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
}

fn distinguished_name(common_name: &str, unit: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "VPN Fleet");
    dn.push(DnType::OrganizationalUnitName, unit);
    dn.push(DnType::CommonName, common_name);
    dn
}

/// SAN list for a node server certificate: the node's name, its address
/// (as IP when parseable, DNS otherwise), and the localhost pair.
fn node_san_list(node_name: &str, node_address: &str) -> Vec<SanType> {
    let mut sans: Vec<SanType> = Vec::new();
    if let Ok(name) = node_name.to_string().try_into() {
        sans.push(SanType::DnsName(name));
    }
    match node_address.parse::<IpAddr>() {
        Ok(ip) => sans.push(SanType::IpAddress(ip)),
        Err(_) => {
            if node_address != node_name {
                if let Ok(addr) = node_address.to_string().try_into() {
                    sans.push(SanType::DnsName(addr));
                }
            }
        }
    }
    sans.push(SanType::IpAddress(IpAddr::from([127, 0, 0, 1])));
    if let Ok(localhost) = "localhost".to_string().try_into() {
        sans.push(SanType::DnsName(localhost));
    }
    sans
}

fn parse_validity(cert_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>, String)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| PanelError::Certificate(format!("invalid PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| PanelError::Certificate(format!("invalid certificate: {}", e)))?;
    let validity = cert.validity();
    let from = DateTime::<Utc>::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| PanelError::Certificate("certificate not_before out of range".to_string()))?;
    let until = DateTime::<Utc>::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| PanelError::Certificate("certificate not_after out of range".to_string()))?;
    Ok((from, until, cert.raw_serial_as_string().replace(':', "")))
}

impl Pki {
    pub fn new(store: Store) -> Self {
        Pki {
            store,
            ca_lock: Mutex::new(()),
        }
    }

    /// The fleet CA, generated on first use and regenerated when it expires
    /// within the renewal window.
    pub async fn ca(&self) -> Result<CertificateInfo> {
        let _guard = self.ca_lock.lock().await;
        if let Some(record) = self.store.certificate_authority().await? {
            let threshold = Utc::now() + Duration::days(CA_RENEWAL_WINDOW_DAYS);
            if record.valid_until > threshold {
                return Ok(CertificateInfo {
                    certificate_pem: record.certificate_pem,
                    private_key_pem: record.private_key_pem,
                    subject_name: record.subject_name,
                    serial_number: record.serial_number,
                    valid_from: record.valid_from,
                    valid_until: record.valid_until,
                });
            }
            warn!(
                valid_until = %record.valid_until,
                "CA certificate expires within {} days, regenerating",
                CA_RENEWAL_WINDOW_DAYS
            );
        }
        let ca = self.generate_ca()?;
        self.store
            .store_certificate_authority(
                &ca.certificate_pem,
                &ca.private_key_pem,
                &ca.subject_name,
                &ca.serial_number,
                ca.valid_from,
                ca.valid_until,
            )
            .await?;
        info!(valid_until = %ca.valid_until, "generated new fleet CA");
        Ok(ca)
    }

    fn generate_ca(&self) -> Result<CertificateInfo> {
        let (key_pair, key_pem) = generate_rsa_key(CA_KEY_BITS)?;
        let valid_from = Utc::now();
        let valid_until = valid_from + Duration::days(CA_VALIDITY_DAYS);
        let (serial, serial_hex) = random_serial();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(CA_SUBJECT_NAME, "Certificate Authority");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.serial_number = Some(serial);
        params.not_before = to_offset(valid_from);
        params.not_after = to_offset(valid_until);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| PanelError::Certificate(format!("CA self-sign failed: {}", e)))?;

        Ok(CertificateInfo {
            certificate_pem: cert.pem(),
            private_key_pem: key_pem,
            subject_name: CA_SUBJECT_NAME.to_string(),
            serial_number: serial_hex,
            valid_from,
            valid_until,
        })
    }

    fn issue_signed(
        &self,
        ca: &CertificateInfo,
        common_name: &str,
        unit: &str,
        eku: ExtendedKeyUsagePurpose,
        sans: Vec<SanType>,
    ) -> Result<CertificateInfo> {
        let ca_key = KeyPair::from_pem(&ca.private_key_pem)
            .map_err(|e| PanelError::Certificate(format!("CA key import failed: {}", e)))?;
        let ca_params = CertificateParams::from_ca_cert_pem(&ca.certificate_pem)
            .map_err(|e| PanelError::Certificate(format!("CA certificate parse failed: {}", e)))?;
        let ca_cert = ca_params
            .self_signed(&ca_key)
            .map_err(|e| PanelError::Certificate(format!("CA reconstruction failed: {}", e)))?;

        let (key_pair, key_pem) = generate_rsa_key(NODE_KEY_BITS)?;
        let valid_from = Utc::now();
        let valid_until = valid_from + Duration::days(CERT_VALIDITY_DAYS);
        let (serial, serial_hex) = random_serial();

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, unit);
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![eku];
        params.subject_alt_names = sans;
        params.serial_number = Some(serial);
        params.not_before = to_offset(valid_from);
        params.not_after = to_offset(valid_until);

        let cert = params
            .signed_by(&key_pair, &ca_cert, &ca_key)
            .map_err(|e| PanelError::Certificate(format!("certificate signing failed: {}", e)))?;

        Ok(CertificateInfo {
            certificate_pem: cert.pem(),
            private_key_pem: key_pem,
            subject_name: common_name.to_string(),
            serial_number: serial_hex,
            valid_from,
            valid_until,
        })
    }

    /// Issue (and store) the server + panel-client pair for a node.
    pub async fn issue_node_certs(
        &self,
        node_name: &str,
        node_address: &str,
    ) -> Result<NodeCertSet> {
        let ca = self.ca().await?;
        let server = self.issue_signed(
            &ca,
            node_name,
            "Node",
            ExtendedKeyUsagePurpose::ServerAuth,
            node_san_list(node_name, node_address),
        )?;
        let panel_client = self.issue_signed(
            &ca,
            &format!("panel-client-{}", node_name),
            "Panel",
            ExtendedKeyUsagePurpose::ClientAuth,
            Vec::new(),
        )?;
        self.store
            .store_node_certificate(
                node_name,
                &server.certificate_pem,
                &server.private_key_pem,
                &panel_client.certificate_pem,
                &panel_client.private_key_pem,
                &server.serial_number,
                server.valid_from,
                server.valid_until,
            )
            .await?;
        info!(node = node_name, "issued node certificate set");
        Ok(NodeCertSet {
            ca,
            server,
            panel_client,
        })
    }

    /// Stored certificate set for a node, if one was issued.
    pub async fn node_certs(&self, node_name: &str) -> Result<Option<NodeCertSet>> {
        let Some(record) = self.store.node_certificate(node_name).await? else {
            return Ok(None);
        };
        let ca = self.ca().await?;
        let server = {
            let (valid_from, valid_until, _) = parse_validity(&record.server_certificate_pem)?;
            CertificateInfo {
                certificate_pem: record.server_certificate_pem.clone(),
                private_key_pem: record.server_private_key_pem.clone(),
                subject_name: node_name.to_string(),
                serial_number: record.serial_number.clone(),
                valid_from,
                valid_until,
            }
        };
        let panel_client = {
            let (valid_from, valid_until, serial) =
                parse_validity(&record.panel_client_certificate_pem)?;
            CertificateInfo {
                certificate_pem: record.panel_client_certificate_pem,
                private_key_pem: record.panel_client_private_key_pem,
                subject_name: format!("panel-client-{}", node_name),
                serial_number: serial,
                valid_from,
                valid_until,
            }
        };
        Ok(Some(NodeCertSet {
            ca,
            server,
            panel_client,
        }))
    }

    /// Reissue both node certificates. The caller propagates the new
    /// material to the worker.
    pub async fn rotate(&self, node_name: &str, node_address: &str) -> Result<NodeCertSet> {
        info!(node = node_name, "rotating node certificates");
        self.issue_node_certs(node_name, node_address).await
    }

    /// Write `ca.crt`, `server.crt`, `server.key`, `panel-client.crt` and
    /// `panel-client.key` for provisioning; keys are owner-readable only.
    pub async fn export(&self, node_name: &str, dir: &Path) -> Result<Vec<PathBuf>> {
        let certs = self
            .node_certs(node_name)
            .await?
            .ok_or(PanelError::NotFound)?;
        std::fs::create_dir_all(dir)
            .map_err(|e| PanelError::Internal(format!("cannot create {}: {}", dir.display(), e)))?;

        let entries: [(&str, &str, bool); 5] = [
            ("ca.crt", certs.ca.certificate_pem.as_str(), false),
            ("server.crt", certs.server.certificate_pem.as_str(), false),
            ("server.key", certs.server.private_key_pem.as_str(), true),
            (
                "panel-client.crt",
                certs.panel_client.certificate_pem.as_str(),
                false,
            ),
            (
                "panel-client.key",
                certs.panel_client.private_key_pem.as_str(),
                true,
            ),
        ];

        let mut written = Vec::new();
        for (name, content, is_key) in entries {
            let path = dir.join(name);
            std::fs::write(&path, content)
                .map_err(|e| PanelError::Internal(format!("cannot write {}: {}", path.display(), e)))?;
            #[cfg(unix)]
            if is_key {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).map_err(
                    |e| PanelError::Internal(format!("cannot chmod {}: {}", path.display(), e)),
                )?;
            }
            #[cfg(not(unix))]
            let _ = is_key;
            written.push(path);
        }
        info!(node = node_name, dir = %dir.display(), "exported node certificates");
        Ok(written)
    }
}
