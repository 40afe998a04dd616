//! Backup and restore Jobs running the dump/restore tools image

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecretKeySelector, SecretVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::crd::{Elasticsearch, Snapshot, StorageSpec};
use crate::resources::common::{database_selector, owner_reference};
use crate::resources::secret::auth_secret_name;
use crate::storage::{osm_secret_name, snapshot_location};

pub const LABEL_JOB_TYPE: &str = "job.kubedb.com/type";
pub const JOB_TYPE_BACKUP: &str = "backup";
pub const JOB_TYPE_RESTORE: &str = "restore";

const OSM_MOUNT_PATH: &str = "/etc/osm";
const SCRATCH_MOUNT_PATH: &str = "/var/data";
const BACKOFF_LIMIT: i32 = 5;

/// Which way a job moves data
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Backup,
    Restore,
}

impl JobKind {
    fn label(&self) -> &'static str {
        match self {
            JobKind::Backup => JOB_TYPE_BACKUP,
            JobKind::Restore => JOB_TYPE_RESTORE,
        }
    }
}

pub fn restore_job_name(es: &Elasticsearch) -> String {
    format!("{}-restore", es.name_any())
}

pub fn backup_job_name(snapshot: &Snapshot) -> String {
    format!("{}-backup", snapshot.name_any())
}

/// Labels on jobs and scratch claims of a database
pub fn job_labels(database: &str, kind: JobKind) -> BTreeMap<String, String> {
    let mut labels = database_selector(database);
    labels.insert(LABEL_JOB_TYPE.to_string(), kind.label().to_string());
    labels
}

pub fn snapshot_owner_reference(snapshot: &Snapshot) -> OwnerReference {
    OwnerReference {
        api_version: Snapshot::api_version(&()).to_string(),
        kind: Snapshot::kind(&()).to_string(),
        name: snapshot.name_any(),
        uid: snapshot.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Scratch claim for a job, when the snapshot asks for one
pub fn scratch_claim(
    name: &str,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    storage: &StorageSpec,
) -> PersistentVolumeClaim {
    let access_modes = if storage.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        storage.access_modes.clone()
    };
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace,
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(access_modes),
            storage_class_name: storage.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn credential_env(auth_secret: &str) -> Vec<EnvVar> {
    [("DB_USER", "ADMIN_USERNAME"), ("DB_PASSWORD", "ADMIN_PASSWORD")]
        .into_iter()
        .map(|(name, key)| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: auth_secret.to_string(),
                    key: key.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

struct JobParts {
    name: String,
    namespace: Option<String>,
    labels: BTreeMap<String, String>,
    owner: OwnerReference,
    image: String,
    args: Vec<String>,
    auth_secret: String,
    osm_secret: String,
    scratch: Option<String>,
}

fn build_job(parts: JobParts) -> Job {
    let scratch_volume = match parts.scratch {
        Some(claim) => Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim,
                ..Default::default()
            }),
            ..Default::default()
        },
        None => Volume {
            name: "data".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    };

    let container = Container {
        name: parts.labels
            .get(LABEL_JOB_TYPE)
            .cloned()
            .unwrap_or_else(|| "job".to_string()),
        image: Some(parts.image),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(parts.args),
        env: Some(credential_env(&parts.auth_secret)),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "osm".to_string(),
                mount_path: OSM_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: SCRATCH_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(parts.name),
            namespace: parts.namespace,
            labels: Some(parts.labels.clone()),
            owner_references: Some(vec![parts.owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(parts.labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    restart_policy: Some("OnFailure".to_string()),
                    volumes: Some(vec![
                        Volume {
                            name: "osm".to_string(),
                            secret: Some(SecretVolumeSource {
                                secret_name: Some(parts.osm_secret),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        scratch_volume,
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tool_args(verb: &str, host: &str, snapshot: &Snapshot) -> Vec<String> {
    vec![
        verb.to_string(),
        format!("--host={host}"),
        format!(
            "--bucket={}",
            snapshot.spec.storage.bucket_name.clone().unwrap_or_default()
        ),
        format!("--folder={}", snapshot_location(snapshot)),
        format!("--snapshot={}", snapshot.name_any()),
        format!("--osm-config={OSM_MOUNT_PATH}/config"),
        format!("--data-dir={SCRATCH_MOUNT_PATH}"),
    ]
}

/// Job restoring `snapshot` into `es`
///
/// `scratch` names the claim to mount, if one was created.
pub fn generate_restore_job(
    es: &Elasticsearch,
    snapshot: &Snapshot,
    tools_image: &str,
    scratch: Option<String>,
) -> Job {
    build_job(JobParts {
        name: restore_job_name(es),
        namespace: es.namespace(),
        labels: job_labels(&es.name_any(), JobKind::Restore),
        owner: owner_reference(es),
        image: tools_image.to_string(),
        args: tool_args("restore", &es.name_any(), snapshot),
        auth_secret: auth_secret_name(es),
        osm_secret: osm_secret_name(snapshot),
        scratch,
    })
}

/// Job dumping `es` into `snapshot`
pub fn generate_backup_job(
    es: &Elasticsearch,
    snapshot: &Snapshot,
    tools_image: &str,
    scratch: Option<String>,
) -> Job {
    build_job(JobParts {
        name: backup_job_name(snapshot),
        namespace: snapshot.namespace(),
        labels: job_labels(&es.name_any(), JobKind::Backup),
        owner: snapshot_owner_reference(snapshot),
        image: tools_image.to_string(),
        args: tool_args("backup", &es.name_any(), snapshot),
        auth_secret: auth_secret_name(es),
        osm_secret: osm_secret_name(snapshot),
        scratch,
    })
}

/// Outcome of a job as far as the operator cares
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Running,
    Succeeded,
    Failed,
}

pub fn job_outcome(job: &Job) -> JobOutcome {
    let status = job.status.as_ref();
    let succeeded = status.and_then(|s| s.succeeded).unwrap_or(0);
    let failed = status.and_then(|s| s.failed).unwrap_or(0);
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(BACKOFF_LIMIT);

    if succeeded > 0 {
        JobOutcome::Succeeded
    } else if failed > backoff_limit {
        JobOutcome::Failed
    } else {
        JobOutcome::Running
    }
}
