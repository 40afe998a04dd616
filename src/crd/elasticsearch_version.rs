use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Catalog entry mapping a version name to images and a security plugin
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "ElasticsearchVersion",
    plural = "elasticsearchversions",
    shortname = "esversion",
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Deprecated", "type":"boolean", "jsonPath":".spec.deprecated"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchVersionSpec {
    pub version: String,
    pub db: ImageRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter: Option<ImageRef>,

    /// Dump/restore tooling used by snapshot jobs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ImageRef>,

    #[serde(default)]
    pub auth_plugin: AuthPlugin,

    #[serde(default)]
    pub deprecated: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ImageRef {
    pub image: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum AuthPlugin {
    #[default]
    SearchGuard,
    XPack,
    OpenDistro,
}
