//! Shared pieces for every offshoot of an Elasticsearch database
//!
//! Labels, owner references and the create-or-patch engine that reports
//! what happened to each dependent as a [`Verb`].

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::Elasticsearch;

/// API version for the Elasticsearch CRD
pub const API_VERSION: &str = "kubedb.com/v1alpha1";

/// Kind for the Elasticsearch CRD
pub const KIND: &str = "Elasticsearch";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "elasticsearch-operator";

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_DATABASE_KIND: &str = "kubedb.com/kind";
pub const LABEL_DATABASE_NAME: &str = "kubedb.com/name";

/// Set on every snapshot by the snapshot controller
pub const LABEL_SNAPSHOT_STATUS: &str = "snapshot.kubedb.com/status";

pub const LABEL_ROLE_MASTER: &str = "node.role.master";
pub const LABEL_ROLE_DATA: &str = "node.role.data";
pub const LABEL_ROLE_CLIENT: &str = "node.role.client";

/// Value of a role label on pods that carry the role
pub const ROLE_SET: &str = "set";

/// Objects carrying this annotation are skipped by the reconciler
pub const ANNOTATION_IGNORE: &str = "kubedb.com/ignore";

/// Present (empty) once the initial restore has been requested
pub const ANNOTATION_INITIALIZED: &str = "kubedb.com/initialized";

/// Owner reference making the database the controller of an offshoot
pub fn owner_reference(es: &Elasticsearch) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: es.name_any(),
        uid: es.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels identifying objects that belong to a database
pub fn database_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_DATABASE_KIND.to_string(), KIND.to_string()),
        (LABEL_DATABASE_NAME.to_string(), name.to_string()),
    ])
}

/// Labels stamped on every offshoot
pub fn offshoot_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = database_selector(name);
    labels.insert(LABEL_APP_NAME.to_string(), "elasticsearch".to_string());
    labels.insert(LABEL_APP_INSTANCE.to_string(), name.to_string());
    labels
}

/// Offshoot labels merged under user supplied ones; identity keys always win
pub fn merged_labels(
    name: &str,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = extra.clone();
    labels.extend(offshoot_labels(name));
    labels
}

/// Label selector string for list calls
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Outcome of one dependent reconciler
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Unchanged,
    Created,
    Patched,
}

impl Verb {
    /// `Created` if all created, `Patched` if any patched, else `Unchanged`
    pub fn compose(verbs: &[Verb]) -> Verb {
        if !verbs.is_empty() && verbs.iter().all(|v| *v == Verb::Created) {
            Verb::Created
        } else if verbs.contains(&Verb::Patched) {
            Verb::Patched
        } else {
            Verb::Unchanged
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verb::Unchanged => write!(f, "unchanged"),
            Verb::Created => write!(f, "created"),
            Verb::Patched => write!(f, "patched"),
        }
    }
}

/// True if every field set in `desired` has the same value in `observed`
///
/// Fields the API server defaults are ignored because they only appear on
/// the observed side.
pub fn json_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Null, _) => true,
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(k, v)| match have.get(k) {
            Some(o) => json_subset(v, o),
            None => is_empty_value(v),
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| json_subset(w, h))
        }
        (want, have) => want == have,
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Decide what applying `desired` over `existing` would do
pub fn decide_verb(existing: Option<&Value>, desired: &Value) -> Verb {
    match existing {
        None => Verb::Created,
        Some(observed) if json_subset(desired, observed) => Verb::Unchanged,
        Some(_) => Verb::Patched,
    }
}

/// Error unless `labels` mark the object as an offshoot of database `name`
pub fn check_owned(
    kind: &str,
    object_name: &str,
    labels: &BTreeMap<String, String>,
    name: &str,
) -> Result<()> {
    let owned = labels.get(LABEL_DATABASE_KIND).map(String::as_str) == Some(KIND)
        && labels.get(LABEL_DATABASE_NAME).map(String::as_str) == Some(name);
    if owned {
        Ok(())
    } else {
        Err(Error::ValidationError(format!(
            "intended {kind} \"{object_name}\" already exists"
        )))
    }
}

/// Server-side apply `desired` unless the live object already matches it
///
/// With `owner` set, an existing object must carry that database's labels.
pub async fn create_or_patch<T>(api: &Api<T>, desired: &T, owner: Option<&str>) -> Result<Verb>
where
    T: Resource<Scope = NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
    <T as Resource>::DynamicType: Default,
{
    let name = desired.name_any();
    let kind = T::kind(&Default::default()).to_string();
    let existing = api.get_opt(&name).await?;

    if let (Some(obj), Some(db)) = (existing.as_ref(), owner) {
        check_owned(&kind, &name, obj.labels(), db)?;
    }

    let desired_value = serde_json::to_value(desired)?;
    let existing_value = existing.as_ref().map(serde_json::to_value).transpose()?;
    let verb = decide_verb(existing_value.as_ref(), &desired_value);

    if verb != Verb::Unchanged {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&name, &params, &Patch::Apply(desired)).await?;
    }
    debug!(kind = %kind, name = %name, verb = %verb, "applied offshoot");

    Ok(verb)
}

/// Create `desired` only when nothing with its name exists yet
///
/// Existing objects are left untouched, so generated material such as
/// passwords and keys survives later reconciles.
pub async fn create_if_absent<T>(api: &Api<T>, desired: &T) -> Result<Verb>
where
    T: Resource + Serialize + DeserializeOwned + Clone + Debug,
{
    let name = desired.name_any();
    if api.get_opt(&name).await?.is_some() {
        return Ok(Verb::Unchanged);
    }
    match api.create(&PostParams::default(), desired).await {
        Ok(_) => Ok(Verb::Created),
        // lost a race with another writer
        Err(kube::Error::Api(e)) if e.code == 409 => Ok(Verb::Unchanged),
        Err(e) => Err(e.into()),
    }
}

/// Delete a namespaced object, treating absence as success
pub async fn delete_if_exists<T>(api: &Api<T>, name: &str) -> Result<bool>
where
    T: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}
