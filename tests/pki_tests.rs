//! PKI issuance, rotation and export tests
//!
//! Key generation is expensive, so each test exercises a whole flow
//! against one CA instead of regenerating per assertion.

mod common;

use common::memory_store;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate};

use vpn_panel::pki::Pki;

fn parse_cert(pem: &str) -> Vec<u8> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).expect("valid PEM");
    parsed.contents
}

fn san_entries(cert_der: &[u8]) -> Vec<String> {
    let (_, cert) = X509Certificate::from_der(cert_der).expect("valid certificate");
    let mut entries = Vec::new();
    for ext in cert.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => entries.push(dns.to_string()),
                    GeneralName::IPAddress(ip) => {
                        if ip.len() == 4 {
                            entries.push(format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]));
                        }
                    }
                    _ => {}
                }
            }
        }
    }
    entries
}

#[tokio::test]
async fn ca_is_created_once_and_reused() {
    let store = memory_store().await;
    let pki = Pki::new(store.clone());

    let first = pki.ca().await.unwrap();
    let second = pki.ca().await.unwrap();
    assert_eq!(first.serial_number, second.serial_number);
    assert_eq!(first.certificate_pem, second.certificate_pem);

    // Ten-year validity window
    let lifetime_days = (first.valid_until - first.valid_from).num_days();
    assert!((3640..=3660).contains(&lifetime_days));

    let der = parse_cert(&first.certificate_pem);
    let (_, cert) = X509Certificate::from_der(&der).expect("CA parses");
    let basic_constraints = cert
        .basic_constraints()
        .expect("extension parses")
        .expect("basic constraints present");
    assert!(basic_constraints.value.ca);
    assert_eq!(cert.issuer().to_string(), cert.subject().to_string());
}

#[tokio::test]
async fn node_certs_carry_san_and_rotation_replaces_them() {
    let store = memory_store().await;
    let pki = Pki::new(store.clone());

    let issued = pki.issue_node_certs("edge-1", "10.0.0.1").await.unwrap();

    // Server certificate: one-year validity, SAN covers name, address and
    // the localhost pair
    let lifetime_days = (issued.server.valid_until - issued.server.valid_from).num_days();
    assert!((364..=366).contains(&lifetime_days));
    let sans = san_entries(&parse_cert(&issued.server.certificate_pem));
    assert!(sans.contains(&"edge-1".to_string()));
    assert!(sans.contains(&"10.0.0.1".to_string()));
    assert!(sans.contains(&"127.0.0.1".to_string()));
    assert!(sans.contains(&"localhost".to_string()));

    // A DNS-style address lands in the SAN as a DNS name
    let dns_issued = pki
        .issue_node_certs("edge-2", "edge-2.example.com")
        .await
        .unwrap();
    let sans = san_entries(&parse_cert(&dns_issued.server.certificate_pem));
    assert!(sans.contains(&"edge-2.example.com".to_string()));

    // Stored set round-trips
    let fetched = pki.node_certs("edge-1").await.unwrap().expect("stored");
    assert_eq!(
        fetched.server.certificate_pem,
        issued.server.certificate_pem
    );
    assert_eq!(fetched.server.serial_number, issued.server.serial_number);

    // Rotation issues fresh serials and replaces the stored PEMs
    let rotated = pki.rotate("edge-1", "10.0.0.1").await.unwrap();
    assert_ne!(
        rotated.server.serial_number,
        issued.server.serial_number
    );
    assert_ne!(
        rotated.panel_client.certificate_pem,
        issued.panel_client.certificate_pem
    );
    let fetched = pki.node_certs("edge-1").await.unwrap().expect("stored");
    assert_eq!(
        fetched.server.certificate_pem,
        rotated.server.certificate_pem
    );

    let lifetime_days = (rotated.server.valid_until - rotated.server.valid_from).num_days();
    assert!((364..=366).contains(&lifetime_days));
}

#[tokio::test]
async fn export_writes_bundle_with_private_keys_locked_down() {
    let store = memory_store().await;
    let pki = Pki::new(store.clone());
    pki.issue_node_certs("edge-1", "10.0.0.1").await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let files = pki.export("edge-1", dir.path()).await.unwrap();
    assert_eq!(files.len(), 5);

    for name in [
        "ca.crt",
        "server.crt",
        "server.key",
        "panel-client.crt",
        "panel-client.key",
    ] {
        let path = dir.path().join(name);
        assert!(path.exists(), "{} missing", name);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("BEGIN"), "{} is not PEM", name);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for key in ["server.key", "panel-client.key"] {
            let mode = std::fs::metadata(dir.path().join(key))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600, "{} permissions too broad", key);
        }
    }

    // Unknown node: nothing to export
    assert!(pki.export("ghost", dir.path()).await.is_err());
}
