//! Object-store adapter for snapshot data
//!
//! A storage secret names a `provider` and carries a YAML `config` map of
//! backend options. [`container_from_secret`] turns that into a [`Container`]
//! scoped to one bucket, backed by the `object_store` crate.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use kube::core::ObjectMeta;
use object_store::ObjectStore;
use object_store::aws::{AmazonS3Builder, AmazonS3ConfigKey};
use object_store::azure::{AzureConfigKey, MicrosoftAzureBuilder};
use object_store::gcp::{GoogleCloudStorageBuilder, GoogleConfigKey};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::{Error, Result};
use crate::crd::{Snapshot, SnapshotStorageSpec};
use crate::resources::jobs::snapshot_owner_reference;

pub const PROVIDER_KEY: &str = "provider";
pub const CONFIG_KEY: &str = "config";

/// Key prefix every snapshot lives under
pub const DATABASE_NAME_PREFIX: &str = "kubedb";

const ACCESS_CHECK_KEY: &str = ".k8sdb";
const ACCESS_CHECK_BODY: &str = "CheckBucketAccess";

/// Blob backend holding snapshot objects
#[async_trait]
pub trait Container: Send + Sync {
    /// Keys of every object under `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    S3,
    Gcs,
    Azure,
    Local,
    Memory,
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s3" => Ok(Provider::S3),
            "gcs" | "google" => Ok(Provider::Gcs),
            "azure" => Ok(Provider::Azure),
            "local" => Ok(Provider::Local),
            "memory" => Ok(Provider::Memory),
            other => Err(Error::InvalidConfig(format!(
                "unknown storage provider {other:?}"
            ))),
        }
    }
}

/// Backend selection parsed from a storage secret
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub provider: Provider,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl StorageConfig {
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret.data.as_ref();
        let read = |key: &str| {
            data.and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        };

        let provider = read(PROVIDER_KEY).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "storage secret {} has no {PROVIDER_KEY:?} key",
                secret.name_any()
            ))
        })?;
        let options = match read(CONFIG_KEY) {
            Some(raw) if !raw.trim().is_empty() => serde_yaml::from_str(&raw)?,
            _ => BTreeMap::new(),
        };

        Ok(Self {
            provider: provider.parse()?,
            options,
        })
    }
}

/// `object_store`-backed [`Container`]
pub struct ObjectStoreContainer {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreContainer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()))
    }
}

fn store_error(err: object_store::Error) -> Error {
    Error::StorageError(err.to_string())
}

#[async_trait]
impl Container for ObjectStoreContainer {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = Path::from(prefix);
        let objects: Vec<_> = self
            .store
            .list(Some(&prefix))
            .try_collect()
            .await
            .map_err(store_error)?;
        Ok(objects.into_iter().map(|o| o.location.to_string()).collect())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.store
            .put(&Path::from(key), data.into())
            .await
            .map_err(store_error)?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.store
            .delete(&Path::from(key))
            .await
            .map_err(store_error)
    }
}

fn build_store(config: &StorageConfig, bucket: &str) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match config.provider {
        Provider::S3 => {
            let mut builder = AmazonS3Builder::new().with_bucket_name(bucket);
            for (key, value) in &config.options {
                builder = builder.with_config(
                    AmazonS3ConfigKey::from_str(key).map_err(store_error)?,
                    value,
                );
            }
            Arc::new(builder.build().map_err(store_error)?)
        }
        Provider::Gcs => {
            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);
            for (key, value) in &config.options {
                builder =
                    builder.with_config(GoogleConfigKey::from_str(key).map_err(store_error)?, value);
            }
            Arc::new(builder.build().map_err(store_error)?)
        }
        Provider::Azure => {
            let mut builder = MicrosoftAzureBuilder::new().with_container_name(bucket);
            for (key, value) in &config.options {
                builder =
                    builder.with_config(AzureConfigKey::from_str(key).map_err(store_error)?, value);
            }
            Arc::new(builder.build().map_err(store_error)?)
        }
        Provider::Local => {
            let root = config
                .options
                .get("root")
                .map(String::as_str)
                .unwrap_or("/tmp");
            let path = std::path::Path::new(root).join(bucket);
            std::fs::create_dir_all(&path)
                .map_err(|e| Error::StorageError(format!("{}: {e}", path.display())))?;
            Arc::new(LocalFileSystem::new_with_prefix(path).map_err(store_error)?)
        }
        Provider::Memory => Arc::new(InMemory::new()),
    };
    Ok(store)
}

/// Container for `bucket`, configured by a storage secret
pub fn container_from_secret(secret: &Secret, bucket: &str) -> Result<Box<dyn Container>> {
    let config = StorageConfig::from_secret(secret)?;
    debug!(provider = ?config.provider, bucket, "opening object store");
    Ok(Box::new(ObjectStoreContainer::new(build_store(
        &config, bucket,
    )?)))
}

/// Bucket and secret named by a storage spec
pub fn require_location(storage: &SnapshotStorageSpec) -> Result<(&str, &str)> {
    let secret = storage
        .storage_secret_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ValidationError("missing storageSecretName".to_string()))?;
    let bucket = storage
        .bucket_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::ValidationError("missing bucketName".to_string()))?;
    Ok((secret, bucket))
}

/// Write and remove a marker object to prove the bucket is usable
pub async fn check_bucket_access(container: &dyn Container) -> Result<()> {
    container
        .put(ACCESS_CHECK_KEY, Bytes::from_static(ACCESS_CHECK_BODY.as_bytes()))
        .await?;
    container.remove(ACCESS_CHECK_KEY).await
}

fn location(prefix: Option<&str>, namespace: &str, database: &str, snapshot: &str) -> String {
    let base = format!("{DATABASE_NAME_PREFIX}/{namespace}/{database}/{snapshot}");
    match prefix.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}/{base}"),
        None => base,
    }
}

/// `[prefix/]kubedb/<namespace>/<database>/<snapshot>`
pub fn snapshot_location(snapshot: &Snapshot) -> String {
    location(
        snapshot.spec.storage.prefix.as_deref(),
        &snapshot.namespace().unwrap_or_default(),
        &snapshot.spec.database_name,
        &snapshot.name_any(),
    )
}

/// Remove every object of a snapshot; returns how many were deleted
pub async fn delete_snapshot_data(container: &dyn Container, snapshot: &Snapshot) -> Result<usize> {
    let keys = container.list(&snapshot_location(snapshot)).await?;
    for key in &keys {
        container.remove(key).await?;
    }
    debug!(
        snapshot = %snapshot.name_any(),
        objects = keys.len(),
        "deleted snapshot data"
    );
    Ok(keys.len())
}

pub fn osm_secret_name(snapshot: &Snapshot) -> String {
    format!("osm-{}", snapshot.name_any())
}

#[derive(Serialize)]
struct OsmConfig<'a> {
    provider: Provider,
    bucket: &'a str,
    prefix: String,
    options: &'a BTreeMap<String, String>,
}

/// Credential secret mounted by backup and restore jobs
///
/// Lives next to the snapshot it serves and is owned by it.
pub fn osm_secret(snapshot: &Snapshot, storage_secret: &Secret) -> Result<Secret> {
    let (_, bucket) = require_location(&snapshot.spec.storage)?;
    let config = StorageConfig::from_secret(storage_secret)?;
    let body = serde_yaml::to_string(&OsmConfig {
        provider: config.provider,
        bucket,
        prefix: snapshot_location(snapshot),
        options: &config.options,
    })?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(osm_secret_name(snapshot)),
            namespace: snapshot.namespace(),
            owner_references: Some(vec![snapshot_owner_reference(snapshot)]),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONFIG_KEY.to_string(),
            ByteString(body.into_bytes()),
        )])),
        ..Default::default()
    })
}
