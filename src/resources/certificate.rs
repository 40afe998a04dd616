//! TLS material for Elasticsearch nodes
//!
//! A database gets one certificate bundle secret holding a self-signed root
//! plus node and sgadmin leaves, both as PEM and as the PKCS-12 key stores
//! the JVM reads (`truststore.jks`, `keystore.jks`, `node.jks`,
//! `sgadmin.jks`, all opened with `key_pass`). Each TLS alias the spec asks
//! for gets its own `<name>-<alias>-cert` secret. Subject DNs of the transport and admin
//! certificates are rendered the way the security plugin expects them in
//! `nodes_dn`/`admin_dn`.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use p12_keystore::{Certificate as StoreCertificate, KeyStore, KeyStoreEntry, PrivateKeyChain};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, string::Ia5String,
};

use crate::controller::error::{Error, Result};
use crate::crd::{CertificateAlias, Elasticsearch};
use crate::resources::common::{offshoot_labels, owner_reference};
use crate::resources::secret::generate_password;

pub const ROOT_CERT: &str = "root.pem";
pub const ROOT_KEY: &str = "root-key.pem";
pub const NODE_CERT: &str = "node.pem";
pub const NODE_KEY: &str = "node-key.pem";
pub const SGADMIN_CERT: &str = "sgadmin.pem";
pub const SGADMIN_KEY: &str = "sgadmin-key.pem";

pub const TRUSTSTORE: &str = "truststore.jks";
pub const KEYSTORE: &str = "keystore.jks";
pub const NODE_KEYSTORE: &str = "node.jks";
pub const SGADMIN_KEYSTORE: &str = "sgadmin.jks";
/// Password of every key store in the bundle
pub const KEY_PASS: &str = "key_pass";

pub const TLS_CERT: &str = "tls.crt";
pub const TLS_KEY: &str = "tls.key";
pub const CA_CERT: &str = "ca.crt";

const ORGANIZATION: &str = "kubedb";

/// Name of the certificate bundle secret
pub fn cert_secret_name(es: &Elasticsearch) -> String {
    es.spec
        .certificate_secret
        .as_ref()
        .map(|s| s.secret_name.clone())
        .unwrap_or_else(|| format!("{}-cert", es.name_any()))
}

/// Secret holding the certificate for one alias
pub fn alias_secret_name(es: &Elasticsearch, alias: CertificateAlias) -> String {
    es.spec
        .tls
        .as_ref()
        .and_then(|tls| tls.certificate(alias))
        .and_then(|c| c.secret_name.clone())
        .unwrap_or_else(|| format!("{}-{}-cert", es.name_any(), alias))
}

/// Self-signed root used to sign every leaf of one database
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl CertificateAuthority {
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().map_err(cert_err("generate root key"))?;
        let cert = params.self_signed(&key).map_err(cert_err("self-sign root"))?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem).map_err(cert_err("parse root key"))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issue a leaf usable for both TLS server and client authentication
    pub fn issue(
        &self,
        common_name: &str,
        org_unit: Option<&str>,
        dns_names: &[String],
    ) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name, org_unit);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = dns_names
            .iter()
            .map(|name| {
                Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| Error::CertificateError(format!("invalid DNS name '{name}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = KeyPair::generate().map_err(cert_err("generate leaf key"))?;
        let ca_key = KeyPair::from_pem(&self.key_pem).map_err(cert_err("load root key"))?;
        let issuer =
            Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(cert_err("load issuer"))?;
        let cert = params
            .signed_by(&leaf_key, &issuer)
            .map_err(cert_err("sign leaf"))?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }
}

fn cert_err<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::CertificateError(format!("failed to {what}: {e}"))
}

fn distinguished_name(common_name: &str, org_unit: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    if let Some(ou) = org_unit {
        dn.push(
            DnType::OrganizationalUnitName,
            DnValue::Utf8String(ou.to_string()),
        );
    }
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

/// DNS names a node certificate is valid for
pub fn node_dns_names(es: &Elasticsearch, governing_service: &str) -> Vec<String> {
    let name = es.name_any();
    let ns = es.namespace().unwrap_or_default();
    vec![
        "localhost".to_string(),
        name.clone(),
        format!("{name}.{ns}"),
        format!("{name}.{ns}.svc"),
        format!("{name}-master"),
        format!("{name}-master.{ns}.svc"),
        format!("*.{governing_service}.{ns}.svc"),
    ]
}

fn certificate_der(pem: &str) -> Result<Vec<u8>> {
    let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::CertificateError(format!("failed to parse PEM: {e}")))?;
    Ok(parsed.contents)
}

fn store_certificate(pem: &str) -> Result<StoreCertificate> {
    StoreCertificate::from_der(&certificate_der(pem)?).map_err(cert_err("load certificate"))
}

/// PKCS-12 store holding one private key with its chain up to `ca_pem`
fn key_store(alias: &str, cert_pem: &str, key_pem: &str, ca_pem: &str, password: &str) -> Result<Vec<u8>> {
    let key = KeyPair::from_pem(key_pem).map_err(cert_err("parse leaf key"))?;
    let chain = vec![store_certificate(cert_pem)?, store_certificate(ca_pem)?];
    let mut store = KeyStore::new();
    store.add_entry(
        alias,
        KeyStoreEntry::PrivateKeyChain(PrivateKeyChain::new(
            key.serialize_der(),
            alias.as_bytes(),
            chain,
        )),
    );
    store.writer(password).write().map_err(cert_err("encode key store"))
}

/// PKCS-12 store trusting only the root
fn trust_store(ca_pem: &str, password: &str) -> Result<Vec<u8>> {
    let mut store = KeyStore::new();
    store.add_entry("root", KeyStoreEntry::Certificate(store_certificate(ca_pem)?));
    store.writer(password).write().map_err(cert_err("encode trust store"))
}

/// Generate the certificate bundle for a database
pub fn generate_bundle(
    es: &Elasticsearch,
    governing_service: &str,
) -> Result<BTreeMap<String, ByteString>> {
    let name = es.name_any();
    let ca = CertificateAuthority::new(&format!("{name}-root"))?;
    let (node_cert, node_key) = ca.issue(
        &format!("{name}-node"),
        Some("elasticsearch"),
        &node_dns_names(es, governing_service),
    )?;
    let (admin_cert, admin_key) = ca.issue("sgadmin", Some("client"), &[])?;

    let password = generate_password(16);
    let node_store = key_store("node", &node_cert, &node_key, ca.cert_pem(), &password)?;
    let admin_store = key_store("sgadmin", &admin_cert, &admin_key, ca.cert_pem(), &password)?;
    let truststore = trust_store(ca.cert_pem(), &password)?;

    Ok(BTreeMap::from([
        (ROOT_CERT.to_string(), ByteString(ca.cert_pem().as_bytes().to_vec())),
        (ROOT_KEY.to_string(), ByteString(ca.key_pem().as_bytes().to_vec())),
        (NODE_CERT.to_string(), ByteString(node_cert.into_bytes())),
        (NODE_KEY.to_string(), ByteString(node_key.into_bytes())),
        (SGADMIN_CERT.to_string(), ByteString(admin_cert.into_bytes())),
        (SGADMIN_KEY.to_string(), ByteString(admin_key.into_bytes())),
        (TRUSTSTORE.to_string(), ByteString(truststore)),
        (KEYSTORE.to_string(), ByteString(node_store.clone())),
        (NODE_KEYSTORE.to_string(), ByteString(node_store)),
        (SGADMIN_KEYSTORE.to_string(), ByteString(admin_store)),
        (KEY_PASS.to_string(), ByteString(password.into_bytes())),
    ]))
}

/// Certificate and key for one alias, signed by the bundle root
pub fn generate_alias(
    es: &Elasticsearch,
    ca: &CertificateAuthority,
    alias: CertificateAlias,
    governing_service: &str,
) -> Result<BTreeMap<String, String>> {
    let name = es.name_any();
    let (cert, key) = match alias {
        CertificateAlias::Root => (ca.cert_pem().to_string(), ca.key_pem().to_string()),
        CertificateAlias::Admin => ca.issue(&format!("{name}-admin"), Some("client"), &[])?,
        CertificateAlias::Archiver | CertificateAlias::MetricsExporter => {
            ca.issue(&format!("{name}-{alias}"), Some("client"), &[])?
        }
        CertificateAlias::Transport | CertificateAlias::Http => ca.issue(
            &format!("{name}-{alias}"),
            Some("elasticsearch"),
            &node_dns_names(es, governing_service),
        )?,
    };
    Ok(BTreeMap::from([
        (TLS_CERT.to_string(), cert),
        (TLS_KEY.to_string(), key),
        (CA_CERT.to_string(), ca.cert_pem().to_string()),
    ]))
}

fn owned_secret(es: &Elasticsearch, name: String, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: es.namespace(),
            labels: Some(offshoot_labels(&es.name_any())),
            owner_references: Some(vec![owner_reference(es)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}

pub fn bundle_secret(es: &Elasticsearch, data: BTreeMap<String, ByteString>) -> Secret {
    let mut secret = owned_secret(es, cert_secret_name(es), BTreeMap::new());
    secret.string_data = None;
    secret.data = Some(data);
    secret
}

pub fn alias_secret(
    es: &Elasticsearch,
    alias: CertificateAlias,
    data: BTreeMap<String, String>,
) -> Secret {
    let mut secret = owned_secret(es, alias_secret_name(es, alias), data);
    secret.type_ = Some("kubernetes.io/tls".to_string());
    secret
}

/// Subject of a PEM certificate, most specific RDN first (`CN=..,O=..`)
pub fn subject_dn(pem_bytes: &[u8]) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem_bytes)
        .map_err(|e| Error::CertificateError(format!("failed to parse PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::CertificateError(format!("failed to parse certificate: {e}")))?;

    let mut rdns = Vec::new();
    for rdn in cert.subject().iter_rdn() {
        let mut parts = Vec::new();
        for attr in rdn.iter() {
            let oid = attr.attr_type().to_id_string();
            let value = attr
                .as_str()
                .map_err(|e| Error::CertificateError(format!("unreadable subject {oid}: {e}")))?;
            let key = match oid.as_str() {
                "2.5.4.3" => "CN",
                "2.5.4.6" => "C",
                "2.5.4.7" => "L",
                "2.5.4.8" => "ST",
                "2.5.4.9" => "STREET",
                "2.5.4.10" => "O",
                "2.5.4.11" => "OU",
                "2.5.4.17" => "POSTALCODE",
                "2.5.4.5" => "SERIALNUMBER",
                _ => oid.as_str(),
            }
            .to_string();
            parts.push(format!("{key}={value}"));
        }
        rdns.push(parts.join("+"));
    }
    rdns.reverse();
    Ok(rdns.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{CertificateSpec, ElasticsearchSpec, SecretReference, TlsConfig};

    fn es() -> Elasticsearch {
        let spec: ElasticsearchSpec =
            serde_json::from_value(serde_json::json!({"version": "6.3"})).unwrap();
        let mut es = Elasticsearch::new("quick-es", spec);
        es.metadata.namespace = Some("demo".to_string());
        es
    }

    #[test]
    fn test_secret_names() {
        let mut es = es();
        assert_eq!(cert_secret_name(&es), "quick-es-cert");
        assert_eq!(
            alias_secret_name(&es, CertificateAlias::Transport),
            "quick-es-transport-cert"
        );
        es.spec.certificate_secret = Some(SecretReference::new("mine"));
        es.spec.tls = Some(TlsConfig {
            certificates: vec![CertificateSpec {
                alias: CertificateAlias::Admin,
                secret_name: Some("admin-tls".to_string()),
            }],
        });
        assert_eq!(cert_secret_name(&es), "mine");
        assert_eq!(alias_secret_name(&es, CertificateAlias::Admin), "admin-tls");
    }

    #[test]
    fn test_bundle_keys_and_subjects() {
        let bundle = generate_bundle(&es(), "kubedb").unwrap();
        for key in [ROOT_CERT, ROOT_KEY, NODE_CERT, NODE_KEY, SGADMIN_CERT, SGADMIN_KEY] {
            assert!(bundle.contains_key(key), "missing {key}");
        }
        let node = bundle.get(NODE_CERT).unwrap();
        assert_eq!(
            subject_dn(&node.0).unwrap(),
            "CN=quick-es-node,OU=elasticsearch,O=kubedb"
        );
        let admin = bundle.get(SGADMIN_CERT).unwrap();
        assert_eq!(subject_dn(&admin.0).unwrap(), "CN=sgadmin,OU=client,O=kubedb");
    }

    #[test]
    fn test_bundle_carries_jvm_key_stores() {
        let bundle = generate_bundle(&es(), "kubedb").unwrap();
        for key in [TRUSTSTORE, KEYSTORE, NODE_KEYSTORE, SGADMIN_KEYSTORE] {
            let store = bundle.get(key).unwrap_or_else(|| panic!("missing {key}"));
            // DER-encoded PFX is a SEQUENCE
            assert_eq!(store.0.first(), Some(&0x30), "{key} is not DER");
        }
        assert_eq!(bundle.get(KEY_PASS).unwrap().0.len(), 16);
        assert_eq!(bundle.get(KEYSTORE), bundle.get(NODE_KEYSTORE));
        assert_ne!(bundle.get(KEYSTORE), bundle.get(SGADMIN_KEYSTORE));

        let secret = bundle_secret(&es(), bundle);
        assert!(secret.string_data.is_none());
        assert_eq!(secret.metadata.name.as_deref(), Some("quick-es-cert"));
        assert!(secret.data.unwrap().contains_key(TRUSTSTORE));
    }

    #[test]
    fn test_alias_signed_by_root() {
        let es = es();
        let ca = CertificateAuthority::new("quick-es-root").unwrap();
        let data = generate_alias(&es, &ca, CertificateAlias::Transport, "kubedb").unwrap();
        assert_eq!(data.get(CA_CERT).map(String::as_str), Some(ca.cert_pem()));
        let dn = subject_dn(data.get(TLS_CERT).unwrap().as_bytes()).unwrap();
        assert_eq!(dn, "CN=quick-es-transport,OU=elasticsearch,O=kubedb");

        let secret = alias_secret(&es, CertificateAlias::Transport, data);
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        assert_eq!(secret.metadata.name.as_deref(), Some("quick-es-transport-cert"));
    }

    #[test]
    fn test_subject_dn_rejects_garbage() {
        assert!(subject_dn(b"not a certificate").is_err());
    }
}
