//! TLS credential bundles authenticating links
//!
//! A site that publishes a [`RouterAccess`] acts as the issuing authority
//! for the links that connect to it. This module issues leaf certificate
//! chains scoped to an access's TLS profile, exports them as portable
//! artifacts a remote site can redeem, and tracks forward-only revocation.
//!
//! # Security Model
//!
//! - Each router access carries its own CA material; bundles issued by
//!   one access never authenticate against another
//! - Revocation is forward-only: a revoked bundle cannot create new
//!   links, but links already established with it stay up
//! - Bundle metadata is kept so a link delete can purge the credential

pub mod grant;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use x509_parser::prelude::*;

use crate::model::{AccessRole, Endpoint, IssuerMaterial, RouterAccess};
use crate::{Error, Result};

/// Generate an identifier for a freshly issued bundle
fn new_bundle_id() -> String {
    let mut raw = [0u8; 16];
    aws_lc_rs::rand::fill(&mut raw).expect("random generation failed");
    URL_SAFE_NO_PAD.encode(raw)
}

/// Parse PEM-encoded data and return the DER bytes
fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| Error::issuance(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A certificate chain authenticating exactly one link
///
/// Exclusively owned by the issuing site until exported; the exported
/// artifact is what a remote site redeems to create a link. A bundle is
/// valid for exactly one router access endpoint set and carries no cost
/// or retry policy - those live on the link spec.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct CredentialBundle {
    /// Unique bundle id; referenced from link specs
    pub id: String,
    /// PEM-encoded leaf certificate
    pub certificate_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// PEM-encoded CA certificate of the issuing router access
    pub ca_pem: String,
    /// Connection endpoint embedded at issue time, if the access declared one
    pub endpoint: Option<Endpoint>,
    /// Name of the router access this bundle authenticates against
    pub router_access: String,
    /// Forward-only revocation marker
    pub revoked: bool,
}

/// Portable serialization of a bundle, for transfer to a remote site
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortableBundle {
    /// Id of the source bundle; never rotated by export
    pub id: String,
    /// Issuing router access name
    pub router_access: String,
    /// When the artifact was produced
    pub issued_at: DateTime<Utc>,
    /// PEM-encoded leaf certificate
    pub certificate_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// PEM-encoded CA certificate
    pub ca_pem: String,
    /// Embedded connection endpoint, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
}

/// Issues and tracks credential bundles
///
/// Thread-safe; bundle metadata lives in memory for the lifetime of the
/// store so later link deletes can revoke or purge it.
pub struct CredentialStore {
    bundles: DashMap<String, CredentialBundle>,
}

impl CredentialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            bundles: DashMap::new(),
        }
    }

    /// Issue a fresh certificate chain scoped to the access's TLS profile
    ///
    /// The leaf's SANs cover every host the access declares, so the same
    /// bundle authenticates whichever candidate endpoint the peer ends up
    /// connecting to. Fails when the access has no CA material.
    pub fn issue(&self, access: &RouterAccess) -> Result<CredentialBundle> {
        let issuer_material = access.issuer.as_ref().ok_or_else(|| {
            Error::issuance(format!(
                "router access '{}' has no CA material",
                access.name
            ))
        })?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::issuance(format!("failed to generate link key: {}", e)))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(format!("{}-{}", access.name, access.tls_profile)),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String("Trellis".to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        // 5 year validity
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2029, 1, 1);

        // One SAN per declared host, deduplicated in declaration order
        let mut hosts: Vec<&str> = Vec::new();
        for endpoint in &access.endpoints {
            if !hosts.contains(&endpoint.host.as_str()) {
                hosts.push(&endpoint.host);
            }
        }
        if hosts.is_empty() {
            return Err(Error::issuance(format!(
                "router access '{}' declares no endpoints",
                access.name
            )));
        }
        params.subject_alt_names = hosts
            .iter()
            .map(|h| {
                Ia5String::try_from(h.to_string())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::issuance(format!("invalid endpoint host '{}': {}", h, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let ca_key = KeyPair::from_pem(&issuer_material.ca_key_pem)
            .map_err(|e| Error::issuance(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&issuer_material.ca_cert_pem, &ca_key)
            .map_err(|e| Error::issuance(format!("failed to load CA certificate: {}", e)))?;

        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(|e| Error::issuance(format!("failed to sign link certificate: {}", e)))?;

        let endpoint = access
            .endpoints_for(AccessRole::InterRouter)
            .next()
            .map(|e| Endpoint {
                host: e.host.clone(),
                port: e.port,
            });

        let bundle = CredentialBundle {
            id: new_bundle_id(),
            certificate_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            ca_pem: issuer_material.ca_cert_pem.clone(),
            endpoint,
            router_access: access.name.clone(),
            revoked: false,
        };

        info!(
            bundle = %bundle.id,
            access = %access.name,
            "Issued link credential bundle"
        );

        self.bundles.insert(bundle.id.clone(), bundle.clone());
        Ok(bundle)
    }

    /// Serialize a bundle for transfer to a remote site
    ///
    /// Supported formats are `yaml` and `json`; anything else is an
    /// export error. Export does not consume or alter the bundle.
    pub fn export(&self, bundle_id: &str, format: &str) -> Result<String> {
        let bundle = self
            .bundles
            .get(bundle_id)
            .ok_or_else(|| Error::export(format!("unknown bundle id: {}", bundle_id)))?;

        let portable = PortableBundle {
            id: bundle.id.clone(),
            router_access: bundle.router_access.clone(),
            issued_at: Utc::now(),
            certificate_pem: bundle.certificate_pem.clone(),
            key_pem: bundle.key_pem.clone(),
            ca_pem: bundle.ca_pem.clone(),
            endpoint: bundle.endpoint.clone(),
        };

        match format {
            "yaml" => serde_yaml::to_string(&portable)
                .map_err(|e| Error::export(format!("yaml serialization failed: {}", e))),
            "json" => serde_json::to_string_pretty(&portable)
                .map_err(|e| Error::export(format!("json serialization failed: {}", e))),
            other => Err(Error::export(format!("unsupported format: {}", other))),
        }
    }

    /// Mark a bundle unusable for future link creation
    ///
    /// Forward-only: links already established with this bundle are not
    /// disconnected. Returns false when the id is unknown.
    pub fn revoke(&self, bundle_id: &str) -> bool {
        match self.bundles.get_mut(bundle_id) {
            Some(mut bundle) => {
                bundle.revoked = true;
                info!(bundle = %bundle_id, "Revoked credential bundle");
                true
            }
            None => false,
        }
    }

    /// Whether a bundle exists and has not been revoked
    pub fn is_usable(&self, bundle_id: &str) -> bool {
        self.bundles
            .get(bundle_id)
            .map(|b| !b.revoked)
            .unwrap_or(false)
    }

    /// Fetch a bundle by id
    pub fn get(&self, bundle_id: &str) -> Option<CredentialBundle> {
        self.bundles.get(bundle_id).map(|b| b.clone())
    }

    /// Remove a bundle and its metadata entirely
    pub fn purge(&self, bundle_id: &str) -> bool {
        self.bundles.remove(bundle_id).is_some()
    }

    /// Number of bundles tracked by the store
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    /// Whether the store tracks no bundles
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate fresh CA material for a router access
///
/// The site that publishes an access mints its issuing authority once,
/// at access creation time.
pub fn generate_issuer(common_name: &str) -> Result<IssuerMaterial> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("Trellis".to_string()),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    // 10 year validity
    params.not_before = rcgen::date_time_ymd(2024, 1, 1);
    params.not_after = rcgen::date_time_ymd(2034, 1, 1);

    let key_pair = KeyPair::generate()
        .map_err(|e| Error::issuance(format!("failed to generate CA key: {}", e)))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::issuance(format!("failed to create CA certificate: {}", e)))?;

    Ok(IssuerMaterial {
        ca_cert_pem: cert.pem(),
        ca_key_pem: key_pair.serialize_pem(),
    })
}

/// Verify that a bundle's certificate was signed by the given CA and is
/// within its validity period
pub fn verify_bundle_cert(certificate_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(certificate_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| Error::issuance(format!("failed to parse link certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| Error::issuance(format!("failed to parse CA certificate: {}", e)))?;

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(false);
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64;

    Ok(now >= cert.validity().not_before.timestamp()
        && now <= cert.validity().not_after.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AccessEndpoint;

    fn access_with_issuer(name: &str) -> RouterAccess {
        RouterAccess {
            name: name.into(),
            tls_profile: format!("{name}-profile"),
            issuer: Some(generate_issuer(&format!("{name} CA")).unwrap()),
            endpoints: vec![
                AccessEndpoint {
                    role: AccessRole::InterRouter,
                    host: "east.example.com".into(),
                    port: 55671,
                    cost_class: 0,
                },
                AccessEndpoint {
                    role: AccessRole::Edge,
                    host: "east.example.com".into(),
                    port: 45671,
                    cost_class: 0,
                },
            ],
        }
    }

    #[test]
    fn issue_requires_ca_material() {
        let store = CredentialStore::new();
        let mut access = access_with_issuer("east-ra");
        access.issuer = None;

        let err = store.issue(&access).unwrap_err();
        assert!(matches!(err, Error::Issuance(_)));
        assert!(err.to_string().contains("no CA material"));
    }

    #[test]
    fn issue_requires_declared_endpoints() {
        let store = CredentialStore::new();
        let mut access = access_with_issuer("east-ra");
        access.endpoints.clear();

        let err = store.issue(&access).unwrap_err();
        assert!(err.to_string().contains("declares no endpoints"));
    }

    #[test]
    fn issued_bundle_embeds_inter_router_endpoint() {
        let store = CredentialStore::new();
        let bundle = store.issue(&access_with_issuer("east-ra")).unwrap();

        let endpoint = bundle.endpoint.expect("endpoint embedded");
        assert_eq!(endpoint.host, "east.example.com");
        assert_eq!(endpoint.port, 55671, "inter-router port, not edge");
        assert_eq!(bundle.router_access, "east-ra");
        assert!(!bundle.revoked);
    }

    /// Story: a bundle authenticates only against its issuing access
    ///
    /// Two accesses with independent CAs issue bundles; each verifies
    /// against its own CA and fails against the other's.
    #[test]
    fn story_bundle_is_bound_to_one_router_access() {
        let store = CredentialStore::new();
        let east = access_with_issuer("east-ra");
        let west = access_with_issuer("west-ra");

        let east_bundle = store.issue(&east).unwrap();

        assert!(verify_bundle_cert(
            &east_bundle.certificate_pem,
            &east.issuer.as_ref().unwrap().ca_cert_pem
        )
        .unwrap());
        assert!(!verify_bundle_cert(
            &east_bundle.certificate_pem,
            &west.issuer.as_ref().unwrap().ca_cert_pem
        )
        .unwrap());
    }

    #[test]
    fn export_supports_yaml_and_json() {
        let store = CredentialStore::new();
        let bundle = store.issue(&access_with_issuer("east-ra")).unwrap();

        let yaml = store.export(&bundle.id, "yaml").unwrap();
        assert!(yaml.contains("BEGIN CERTIFICATE"));
        assert!(yaml.contains("routerAccess: east-ra"));

        let json = store.export(&bundle.id, "json").unwrap();
        let parsed: PortableBundle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, bundle.id);
        assert_eq!(parsed.ca_pem, bundle.ca_pem);
    }

    #[test]
    fn export_rejects_unsupported_format() {
        let store = CredentialStore::new();
        let bundle = store.issue(&access_with_issuer("east-ra")).unwrap();

        let err = store.export(&bundle.id, "toml").unwrap_err();
        assert!(matches!(err, Error::Export(_)));
        assert!(err.to_string().contains("unsupported format: toml"));
    }

    #[test]
    fn export_rejects_unknown_bundle() {
        let store = CredentialStore::new();
        let err = store.export("no-such-bundle", "yaml").unwrap_err();
        assert!(matches!(err, Error::Export(_)));
    }

    /// Story: revocation is forward-only
    ///
    /// A revoked bundle can no longer back new links, but it is not
    /// erased - its metadata survives until an explicit purge, and its
    /// certificate would still verify (existing links stay up).
    #[test]
    fn story_revocation_is_forward_only() {
        let store = CredentialStore::new();
        let access = access_with_issuer("east-ra");
        let bundle = store.issue(&access).unwrap();

        assert!(store.is_usable(&bundle.id));
        assert!(store.revoke(&bundle.id));
        assert!(!store.is_usable(&bundle.id));

        // Metadata survives revocation
        assert!(store.get(&bundle.id).is_some());

        // The certificate itself is untouched
        assert!(verify_bundle_cert(
            &bundle.certificate_pem,
            &access.issuer.as_ref().unwrap().ca_cert_pem
        )
        .unwrap());
    }

    #[test]
    fn revoke_of_unknown_bundle_is_a_noop() {
        let store = CredentialStore::new();
        assert!(!store.revoke("no-such-bundle"));
    }

    #[test]
    fn purge_removes_metadata() {
        let store = CredentialStore::new();
        let bundle = store.issue(&access_with_issuer("east-ra")).unwrap();

        assert!(store.purge(&bundle.id));
        assert!(store.get(&bundle.id).is_none());
        assert!(!store.purge(&bundle.id));
        assert!(store.is_empty());
    }

    #[test]
    fn bundle_ids_are_unique() {
        let store = CredentialStore::new();
        let access = access_with_issuer("east-ra");
        let a = store.issue(&access).unwrap();
        let b = store.issue(&access).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.len(), 2);
    }
}
