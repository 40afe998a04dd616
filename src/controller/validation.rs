//! Reconcile-time validation of Elasticsearch specs
//!
//! The admission policies are pure; this module gathers the cluster state
//! they need through [`ClusterLookup`] and adds the checks that need I/O,
//! such as probing the backup bucket.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::{Api, Client};
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::controller::probe::sleep_or_cancel;
use crate::crd::{DormantDatabase, Elasticsearch, ElasticsearchVersion};
use crate::resources::statefulset::node_groups;
use crate::storage::{check_bucket_access, container_from_secret, require_location};
use crate::webhooks::policies::{ValidationContext, ValidationFacts, validate_all};

use super::context::Context;

const BUCKET_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Point reads of the objects validation and defaulting depend on
#[async_trait]
pub trait ClusterLookup: Send + Sync {
    async fn version(&self, name: &str) -> Result<Option<ElasticsearchVersion>>;
    async fn storage_class_exists(&self, name: &str) -> Result<bool>;
    async fn elasticsearch(&self, namespace: &str, name: &str) -> Result<Option<Elasticsearch>>;
    async fn dormant(&self, namespace: &str, name: &str) -> Result<Option<DormantDatabase>>;
    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
}

pub struct KubeLookup {
    client: Client,
}

impl KubeLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterLookup for KubeLookup {
    async fn version(&self, name: &str) -> Result<Option<ElasticsearchVersion>> {
        let api: Api<ElasticsearchVersion> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn storage_class_exists(&self, name: &str) -> Result<bool> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn elasticsearch(&self, namespace: &str, name: &str) -> Result<Option<Elasticsearch>> {
        let api: Api<Elasticsearch> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn dormant(&self, namespace: &str, name: &str) -> Result<Option<DormantDatabase>> {
        let api: Api<DormantDatabase> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

/// Storage classes named anywhere in the spec, deduplicated
fn storage_classes(es: &Elasticsearch) -> Vec<String> {
    let mut classes: Vec<String> = node_groups(es)
        .into_iter()
        .filter_map(|g| g.storage.and_then(|s| s.storage_class_name))
        .filter(|c| !c.is_empty())
        .collect();
    classes.sort();
    classes.dedup();
    classes
}

/// Collect what the admission policies need to know about the cluster
pub async fn gather_facts(lookup: &dyn ClusterLookup, es: &Elasticsearch) -> Result<ValidationFacts> {
    let version = if es.spec.version.is_empty() {
        None
    } else {
        lookup.version(&es.spec.version).await?
    };

    let mut unknown_storage_classes = Vec::new();
    for class in storage_classes(es) {
        if !lookup.storage_class_exists(&class).await? {
            unknown_storage_classes.push(class);
        }
    }

    Ok(ValidationFacts {
        version,
        unknown_storage_classes,
    })
}

/// Validate a database before the reconciler acts on it
///
/// Denials surface as [`Error::ValidationError`]; the reconciler reports
/// them as a warning event and does not retry.
pub async fn validate(ctx: &Context, es: &Elasticsearch) -> Result<()> {
    let facts = gather_facts(ctx.lookup.as_ref(), es).await?;
    let result = validate_all(&ValidationContext::new(
        es,
        None,
        &facts,
        &ctx.config.min_memory_request,
    ));
    if !result.allowed {
        return Err(Error::ValidationError(
            result
                .message
                .or(result.reason)
                .unwrap_or_else(|| "spec rejected".to_string()),
        ));
    }

    if let Some(schedule) = &es.spec.backup_schedule {
        let namespace = es
            .metadata
            .namespace
            .as_deref()
            .ok_or(Error::MissingObjectKey("namespace"))?;
        let (secret_name, bucket) = require_location(&schedule.storage)?;
        let secret = ctx
            .lookup
            .secret(namespace, secret_name)
            .await?
            .ok_or_else(|| {
                Error::ValidationError(format!("storage secret {namespace}/{secret_name} not found"))
            })?;
        let container = container_from_secret(&secret, bucket)?;
        tokio::select! {
            checked = check_bucket_access(container.as_ref()) => checked.map_err(|e| {
                Error::ValidationError(format!("bucket {bucket} is not accessible: {e}"))
            })?,
            cancelled = sleep_or_cancel(BUCKET_CHECK_TIMEOUT, &ctx.shutdown) => {
                cancelled?;
                return Err(Error::TransientError(format!("bucket {bucket} access check timed out")));
            }
        }
        debug!(bucket, "backup bucket is accessible");
    }

    Ok(())
}

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 7] = [
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a Kubernetes resource quantity into base units
///
/// Accepts binary suffixes (`Ki`..`Ei`), decimal suffixes (`m`, `k`..`E`)
/// and plain or exponent notation (`1e3`).
pub fn parse_quantity(quantity: &str) -> Result<f64> {
    let q = quantity.trim();
    let invalid = || Error::ValidationError(format!("invalid quantity {quantity:?}"));
    if q.is_empty() {
        return Err(invalid());
    }

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES.iter())
        .find_map(|(suffix, m)| q.strip_suffix(*suffix).map(|n| (n, *m)))
        .unwrap_or((q, 1.0));

    // "1E" is an exa suffix, "1e3" is exponent notation
    if number.is_empty() || number.ends_with(['e', 'E']) {
        return Err(invalid());
    }
    let value: f64 = number.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok(value * multiplier)
}
