//! Auth and config secrets
//!
//! The auth secret carries a random password for each built-in security
//! plugin user. The config secret carries `elasticsearch.yml` and the
//! internal user database with bcrypt hashes of those passwords.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use rand::Rng;
use serde::Serialize;

use crate::controller::error::{Error, Result};
use crate::crd::Elasticsearch;
use crate::resources::common::{offshoot_labels, owner_reference};

pub const CONFIG_FILE: &str = "elasticsearch.yml";
pub const INTERNAL_USERS_FILE: &str = "sg_internal_users.yml";

/// Security plugin files passed through from a user supplied config secret
pub const SEARCH_GUARD_FILES: [&str; 4] = [
    "sg_action_groups.yml",
    "sg_roles.yml",
    "sg_roles_mapping.yml",
    "sg_config.yml",
];

/// Built-in users of the security plugin
pub const DEFAULT_USERS: [&str; 6] = [
    "admin",
    "kibanaserver",
    "kibanaro",
    "logstash",
    "readall",
    "snapshotrestore",
];

/// Cost of the bcrypt hashes the security plugin reads
pub const BCRYPT_COST: u32 = 12;

const PASSWORD_LENGTH: usize = 16;

const SECURITY_DISABLED: &str = "
searchguard.disabled: true
";

const SECURITY_ENABLED: &str = "
searchguard.enterprise_modules_enabled: false

searchguard.ssl.transport.enforce_hostname_verification: false
searchguard.ssl.transport.pemkey_filepath: certs/transport/tls.key
searchguard.ssl.transport.pemcert_filepath: certs/transport/tls.crt
searchguard.ssl.transport.pemtrustedcas_filepath: certs/transport/ca.crt

searchguard.allow_unsafe_democertificates: true
searchguard.allow_default_init_sgindex: true
searchguard.enable_snapshot_restore_privilege: true
searchguard.check_snapshot_restore_write_privileges: true
searchguard.audit.type: internal_elasticsearch

searchguard.restapi.roles_enabled: [\"SGS_ALL_ACCESS\",\"sg_all_access\"]
";

const HTTPS_DISABLED: &str = "
searchguard.ssl.http.enabled: false
";

/// Generate a random alphanumeric password
pub fn generate_password(len: usize) -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn auth_secret_name(es: &Elasticsearch) -> String {
    es.spec
        .auth_secret
        .as_ref()
        .map(|s| s.secret_name.clone())
        .unwrap_or_else(|| format!("{}-auth", es.name_any()))
}

pub fn config_secret_name(es: &Elasticsearch) -> String {
    es.spec
        .config_secret
        .as_ref()
        .map(|s| s.secret_name.clone())
        .unwrap_or_else(|| format!("{}-config", es.name_any()))
}

fn username_key(user: &str) -> String {
    format!("{}_USERNAME", user.to_uppercase())
}

fn password_key(user: &str) -> String {
    format!("{}_PASSWORD", user.to_uppercase())
}

/// Auth secret with fresh random passwords for every built-in user
pub fn generate_auth_secret(es: &Elasticsearch) -> Secret {
    let mut data = BTreeMap::new();
    for user in DEFAULT_USERS {
        data.insert(username_key(user), user.to_string());
        data.insert(password_key(user), generate_password(PASSWORD_LENGTH));
    }

    Secret {
        metadata: ObjectMeta {
            name: Some(auth_secret_name(es)),
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

/// Passwords keyed by user name, read from an auth secret
///
/// Users without an entry fall back to their own name.
pub fn user_passwords(es: &Elasticsearch, auth: Option<&Secret>) -> BTreeMap<String, String> {
    let read = |key: &str| auth.and_then(|secret| secret_value(secret, key));

    DEFAULT_USERS
        .iter()
        .map(|u| u.to_string())
        .chain(es.spec.internal_users.keys().cloned())
        .map(|user| {
            let password = read(&password_key(&user)).unwrap_or_else(|| user.clone());
            (user, password)
        })
        .collect()
}

#[derive(Serialize)]
struct InternalUserEntry<'a> {
    hash: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reserved: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    hidden: bool,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    backend_roles: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

/// Render `sg_internal_users.yml`
pub fn internal_users_yml(
    es: &Elasticsearch,
    passwords: &BTreeMap<String, String>,
) -> Result<String> {
    let mut users = BTreeMap::new();
    for (user, password) in passwords {
        let hash = bcrypt::hash(password, BCRYPT_COST)
            .map_err(|e| Error::PermanentError(format!("failed to hash password of {user}: {e}")))?;
        let attrs = es.spec.internal_users.get(user);
        users.insert(
            user.as_str(),
            InternalUserEntry {
                hash,
                reserved: attrs.is_some_and(|a| a.reserved),
                hidden: attrs.is_some_and(|a| a.hidden),
                backend_roles: attrs.map(|a| a.backend_roles.as_slice()).unwrap_or(&[]),
                description: attrs.and_then(|a| a.description.as_deref()),
            },
        );
    }
    Ok(serde_yaml::to_string(&users)?)
}

/// Subject DNs of the transport and admin certificates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SecurityDns {
    pub nodes_dn: Option<String>,
    pub admin_dn: Option<String>,
}

/// Render `elasticsearch.yml`
pub fn elasticsearch_yml(es: &Elasticsearch, dns: &SecurityDns) -> String {
    if es.spec.disable_security {
        return SECURITY_DISABLED.to_string();
    }

    let mut config = SECURITY_ENABLED.to_string();
    if es.spec.enable_ssl {
        let admin = dns
            .admin_dn
            .as_ref()
            .map(|dn| format!("\nsearchguard.authcz.admin_dn:\n- \"{dn}\"\n"))
            .unwrap_or_default();
        let nodes = dns
            .nodes_dn
            .as_ref()
            .map(|dn| format!("\nsearchguard.nodes_dn:\n- \"{dn}\"\n"))
            .unwrap_or_default();
        config.push_str(&format!(
            "
searchguard.ssl.http.enabled: true
searchguard.ssl.http.pemkey_filepath: certs/http/tls.key
searchguard.ssl.http.pemcert_filepath: certs/http/tls.crt
searchguard.ssl.http.pemtrustedcas_filepath: certs/http/ca.crt
{admin}{nodes}"
        ));
    } else {
        config.push_str(HTTPS_DISABLED);
    }
    config
}

/// Config secret owned by the database
pub fn generate_config_secret(es: &Elasticsearch, data: BTreeMap<String, String>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(config_secret_name(es)),
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

/// True if the secret's controller reference points at this database
pub fn is_owned_by(secret: &Secret, es: &Elasticsearch) -> bool {
    secret.owner_references().iter().any(|r| {
        r.controller == Some(true) && r.kind == crate::resources::common::KIND && r.name == es.name_any()
    })
}

/// UTF-8 value of `key`, from `data` or `stringData`
pub fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    if let Some(v) = secret.data.as_ref().and_then(|d| d.get(key)) {
        return String::from_utf8(v.0.clone()).ok();
    }
    secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
}

/// True if the secret carries a non-empty value for `key`
pub fn has_key(secret: &Secret, key: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .is_some_and(|v| !v.0.is_empty())
        || secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(key))
            .is_some_and(|v| !v.is_empty())
}
