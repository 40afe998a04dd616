use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::elasticsearch::ElasticsearchSpec;

/// Frozen configuration of a deleted database that can be resumed later
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    plural = "dormantdatabases",
    shortname = "drmn",
    namespaced,
    status = "DormantDatabaseStatus",
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    pub origin: Origin,

    /// Delete volumes and snapshots, then the record itself
    #[serde(default)]
    pub wipe_out: bool,

    /// Recreate the database from the origin, then delete the record
    #[serde(default)]
    pub resume: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    pub metadata: OriginMeta,
    pub spec: OriginSpec,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OriginMeta {
    pub name: String,
    pub namespace: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OriginSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<ElasticsearchSpec>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    #[serde(default)]
    pub phase: DormantDatabasePhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiped_out_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DormantDatabasePhase {
    #[default]
    Halting,
    Halted,
    Resuming,
    WipingOut,
    WipedOut,
    Failed,
}

impl std::fmt::Display for DormantDatabasePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DormantDatabasePhase::Halting => write!(f, "Halting"),
            DormantDatabasePhase::Halted => write!(f, "Halted"),
            DormantDatabasePhase::Resuming => write!(f, "Resuming"),
            DormantDatabasePhase::WipingOut => write!(f, "WipingOut"),
            DormantDatabasePhase::WipedOut => write!(f, "WipedOut"),
            DormantDatabasePhase::Failed => write!(f, "Failed"),
        }
    }
}

impl DormantDatabase {
    pub fn phase(&self) -> DormantDatabasePhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    pub fn origin_elasticsearch(&self) -> Option<&ElasticsearchSpec> {
        self.spec.origin.spec.elasticsearch.as_ref()
    }
}
