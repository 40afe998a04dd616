use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{SnapshotStorageSpec, StorageSpec};

/// A point-in-time dump of a database into an object store
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "Snapshot",
    plural = "snapshots",
    shortname = "snap",
    namespaced,
    status = "SnapshotStatus",
    printcolumn = r#"{"name":"DatabaseName", "type":"string", "jsonPath":".spec.databaseName"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    pub database_name: String,

    #[serde(flatten)]
    pub storage: SnapshotStorageSpec,

    /// Scratch volume for the backup/restore job; emptyDir when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_volume_claim_spec: Option<StorageSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStatus {
    #[serde(default)]
    pub phase: SnapshotPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SnapshotPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for SnapshotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotPhase::Pending => write!(f, "Pending"),
            SnapshotPhase::Running => write!(f, "Running"),
            SnapshotPhase::Succeeded => write!(f, "Succeeded"),
            SnapshotPhase::Failed => write!(f, "Failed"),
        }
    }
}

impl SnapshotPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SnapshotPhase::Succeeded | SnapshotPhase::Failed)
    }
}

impl Snapshot {
    pub fn phase(&self) -> SnapshotPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }
}
