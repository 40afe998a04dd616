//! StatefulSets running Elasticsearch nodes
//!
//! Topology mode produces one StatefulSet per role (client, master, data),
//! combined mode a single StatefulSet carrying all three role labels.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    LocalObjectReference, ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PodSpec, PodTemplateSpec, ResourceRequirements as K8sResources, SecretKeySelector,
    SecretVolumeSource,
    SecurityContext, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::config::Images;
use crate::crd::{
    CertificateAlias, Elasticsearch, ResourceList, ResourceRequirements, StorageSpec, StorageType,
};
use crate::resources::certificate::{KEY_PASS, alias_secret_name, cert_secret_name};
use crate::resources::common::{
    LABEL_ROLE_CLIENT, LABEL_ROLE_DATA, LABEL_ROLE_MASTER, ROLE_SET, merged_labels,
    offshoot_labels, owner_reference,
};
use crate::resources::monitor::DEFAULT_EXPORTER_PORT;
use crate::resources::secret::config_secret_name;
use crate::resources::service::{
    EXPORTER_PORT_NAME, HTTP_PORT, HTTP_PORT_NAME, TRANSPORT_PORT, TRANSPORT_PORT_NAME,
    master_service_name,
};

pub const CONTAINER_NAME: &str = "elasticsearch";
pub const EXPORTER_CONTAINER_NAME: &str = "exporter";

const CERTS_MOUNT_PATH: &str = "/elasticsearch/config/certs";
const ALIAS_CERTS_MOUNT_ROOT: &str = "/usr/share/elasticsearch/config/certs";
const SGCONFIG_MOUNT_PATH: &str = "/elasticsearch/plugins/search-guard-5/sgconfig";
const TEMP_CONFIG_MOUNT_PATH: &str = "/elasticsearch/temp-config";
const DATA_MOUNT_PATH: &str = "/data";
const JAVA_OPTS: &str = "-Xms512m -Xmx512m";

/// Role a node group plays in the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Client,
    Master,
    Data,
    /// One group serving every role
    Combined,
}

impl NodeRole {
    pub fn serves_http(&self) -> bool {
        matches!(self, NodeRole::Client | NodeRole::Combined)
    }

    fn role_labels(&self) -> Vec<&'static str> {
        match self {
            NodeRole::Client => vec![LABEL_ROLE_CLIENT],
            NodeRole::Master => vec![LABEL_ROLE_MASTER],
            NodeRole::Data => vec![LABEL_ROLE_DATA],
            NodeRole::Combined => vec![LABEL_ROLE_CLIENT, LABEL_ROLE_MASTER, LABEL_ROLE_DATA],
        }
    }
}

/// One StatefulSet's worth of nodes
#[derive(Clone, Debug, PartialEq)]
pub struct NodeGroup {
    pub role: NodeRole,
    pub name: String,
    /// Never negative
    pub replicas: i32,
    pub storage: Option<StorageSpec>,
    pub resources: ResourceRequirements,
}

impl NodeGroup {
    pub fn labels(&self, es: &Elasticsearch) -> BTreeMap<String, String> {
        let mut labels = offshoot_labels(&es.name_any());
        for role in self.role.role_labels() {
            labels.insert(role.to_string(), ROLE_SET.to_string());
        }
        labels
    }
}

/// `floor(replicas / 2) + 1`
pub fn number_of_masters(replicas: i32) -> i32 {
    replicas.max(0) / 2 + 1
}

fn group_name(prefix: Option<&str>, base: &str) -> String {
    match prefix.filter(|p| !p.is_empty()) {
        Some(p) => format!("{p}-{base}"),
        None => base.to_string(),
    }
}

/// Node groups in apply order: client, master, data (or one combined group)
pub fn node_groups(es: &Elasticsearch) -> Vec<NodeGroup> {
    let base = es.name_any();
    match &es.spec.topology {
        Some(topology) => [
            (NodeRole::Client, &topology.client),
            (NodeRole::Master, &topology.master),
            (NodeRole::Data, &topology.data),
        ]
        .into_iter()
        .map(|(role, node)| NodeGroup {
            role,
            name: group_name(node.prefix.as_deref(), &base),
            replicas: node.replicas.unwrap_or(1).max(0),
            storage: node.storage.clone().or_else(|| es.spec.storage.clone()),
            resources: node.resources.clone(),
        })
        .collect(),
        None => vec![NodeGroup {
            role: NodeRole::Combined,
            name: base,
            replicas: es.spec.replicas.unwrap_or(1).max(0),
            storage: es.spec.storage.clone(),
            resources: es.spec.pod_template.spec.resources.clone(),
        }],
    }
}

/// Whether the certificate bundle is generated and mounted
pub fn uses_certificates(es: &Elasticsearch) -> bool {
    es.spec.enable_ssl || !es.spec.disable_security
}

/// TLS aliases whose secrets the nodes mount
pub fn required_aliases(es: &Elasticsearch) -> Vec<CertificateAlias> {
    let mut aliases = Vec::new();
    if !es.spec.disable_security {
        aliases.push(CertificateAlias::Transport);
        if es.spec.enable_ssl {
            aliases.push(CertificateAlias::Http);
            aliases.push(CertificateAlias::Admin);
        }
    }
    if let Some(tls) = &es.spec.tls {
        for cert in &tls.certificates {
            if !aliases.contains(&cert.alias) {
                aliases.push(cert.alias);
            }
        }
    }
    aliases
}

fn env(name: &str, value: impl ToString) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

fn role_env(group: &NodeGroup) -> Vec<EnvVar> {
    let masters = number_of_masters(group.replicas);
    match group.role {
        NodeRole::Client => vec![
            env("NODE_MASTER", false),
            env("NODE_DATA", false),
            env("MODE", "client"),
        ],
        NodeRole::Master => vec![
            env("NODE_DATA", false),
            env("NODE_INGEST", false),
            env("HTTP_ENABLE", false),
            env("NUMBER_OF_MASTERS", masters),
        ],
        NodeRole::Data => vec![
            env("NODE_MASTER", false),
            env("NODE_INGEST", false),
            env("HTTP_ENABLE", false),
        ],
        NodeRole::Combined => vec![env("NUMBER_OF_MASTERS", masters), env("MODE", "client")],
    }
}

fn container_env(es: &Elasticsearch, group: &NodeGroup) -> Vec<EnvVar> {
    let mut vars = vec![
        env("CLUSTER_NAME", es.name_any()),
        EnvVar {
            name: "NODE_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env("ES_JAVA_OPTS", JAVA_OPTS),
        env("DISCOVERY_SERVICE", master_service_name(es)),
        env("SSL_ENABLE", es.spec.enable_ssl),
    ];
    if uses_certificates(es) {
        // user-supplied bundles may not carry a password
        vars.push(EnvVar {
            name: "KEY_PASS".to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: cert_secret_name(es),
                    key: KEY_PASS.to_string(),
                    optional: Some(true),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    vars.extend(role_env(group));
    vars
}

fn quantities(list: &ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

fn to_k8s_resources(resources: &ResourceRequirements) -> Option<K8sResources> {
    if resources.limits.is_none() && resources.requests.is_none() {
        return None;
    }
    Some(K8sResources {
        limits: resources.limits.as_ref().map(quantities),
        requests: resources.requests.as_ref().map(quantities),
        ..Default::default()
    })
}

fn secret_volume(name: &str, secret_name: String) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn data_claim(es: &Elasticsearch, storage: &StorageSpec) -> PersistentVolumeClaim {
    let access_modes = if storage.access_modes.is_empty() {
        vec!["ReadWriteOnce".to_string()]
    } else {
        storage.access_modes.clone()
    };
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            labels: Some(offshoot_labels(&es.name_any())),
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

fn exporter_container(es: &Elasticsearch, images: &Images) -> Option<Container> {
    let monitor = es.prometheus_monitor()?;
    let port = monitor.exporter_port().unwrap_or(DEFAULT_EXPORTER_PORT);
    Some(Container {
        name: EXPORTER_CONTAINER_NAME.to_string(),
        image: Some(images.exporter.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        args: Some(vec![
            "export".to_string(),
            format!("--address=:{port}"),
            "--v=3".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some(EXPORTER_PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// Settings that come from the operator rather than the database
#[derive(Clone, Copy, Debug)]
pub struct WorkloadSettings<'a> {
    pub governing_service: &'a str,
    pub enable_rbac: bool,
    pub images: &'a Images,
}

/// Build the StatefulSet for one node group
pub fn generate_statefulset(
    es: &Elasticsearch,
    group: &NodeGroup,
    settings: &WorkloadSettings<'_>,
) -> StatefulSet {
    let labels = group.labels(es);
    let pod_labels = merged_labels(&es.name_any(), &es.spec.pod_template.metadata.labels)
        .into_iter()
        .chain(labels.clone())
        .collect::<BTreeMap<_, _>>();

    let mut ports = vec![ContainerPort {
        name: Some(TRANSPORT_PORT_NAME.to_string()),
        container_port: TRANSPORT_PORT,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    if group.role.serves_http() {
        ports.push(ContainerPort {
            name: Some(HTTP_PORT_NAME.to_string()),
            container_port: HTTP_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }

    let mut volumes = vec![secret_volume("config", config_secret_name(es))];
    let mut mounts = vec![mount("config", TEMP_CONFIG_MOUNT_PATH)];

    if uses_certificates(es) {
        volumes.push(secret_volume("certs", cert_secret_name(es)));
        mounts.push(mount("certs", CERTS_MOUNT_PATH));
    }
    for alias in required_aliases(es) {
        let volume = format!("{alias}-certs");
        volumes.push(secret_volume(&volume, alias_secret_name(es, alias)));
        mounts.push(mount(&volume, &format!("{ALIAS_CERTS_MOUNT_ROOT}/{alias}")));
    }
    if group.role.serves_http() {
        volumes.push(secret_volume("sgconfig", config_secret_name(es)));
        mounts.push(mount("sgconfig", SGCONFIG_MOUNT_PATH));
    }

    mounts.push(mount("data", DATA_MOUNT_PATH));
    let durable_storage = group
        .storage
        .as_ref()
        .filter(|_| es.spec.storage_type == StorageType::Durable);
    let volume_claim_templates = match durable_storage {
        Some(storage) => Some(vec![data_claim(es, storage)]),
        None => {
            volumes.push(Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
            None
        }
    };

    let mut containers = vec![Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(settings.images.database.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        env: Some(container_env(es, group)),
        ports: Some(ports),
        volume_mounts: Some(mounts),
        resources: to_k8s_resources(&group.resources),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            capabilities: Some(Capabilities {
                add: Some(vec!["IPC_LOCK".to_string(), "SYS_RESOURCE".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }];
    if group.role.serves_http() {
        containers.extend(exporter_container(es, settings.images));
    }

    let init_sysctl = Container {
        name: "init-sysctl".to_string(),
        image: Some("busybox".to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "sysctl".to_string(),
            "-w".to_string(),
            "vm.max_map_count=262144".to_string(),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let overrides = &es.spec.pod_template.spec;
    let pod_spec = PodSpec {
        init_containers: Some(vec![init_sysctl]),
        containers,
        volumes: Some(volumes),
        service_account_name: settings.enable_rbac.then(|| es.name_any()),
        node_selector: (!overrides.node_selector.is_empty()).then(|| overrides.node_selector.clone()),
        priority_class_name: overrides.priority_class_name.clone(),
        image_pull_secrets: (!overrides.image_pull_secrets.is_empty()).then(|| {
            overrides
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect()
        }),
        ..Default::default()
    };

    let pod_annotations = &es.spec.pod_template.metadata.annotations;

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(group.name.clone()),
            namespace: es.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner_reference(es)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(group.replicas),
            service_name: Some(settings.governing_service.to_string()),
            selector: LabelSelector {
                match_labels: Some(labels),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: (!pod_annotations.is_empty()).then(|| pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates,
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
