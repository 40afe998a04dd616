//! ServiceAccount, Role and RoleBinding for database pods

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::Elasticsearch;
use crate::resources::common::{offshoot_labels, owner_reference};
use crate::resources::statefulset::node_groups;

fn meta(es: &Elasticsearch) -> ObjectMeta {
    ObjectMeta {
        name: Some(es.name_any()),
        namespace: es.namespace(),
        labels: Some(offshoot_labels(&es.name_any())),
        owner_references: Some(vec![owner_reference(es)]),
        ..Default::default()
    }
}

/// Service account named after the database
pub fn generate_service_account(es: &Elasticsearch) -> ServiceAccount {
    ServiceAccount {
        metadata: meta(es),
        ..Default::default()
    }
}

/// Read access to the database's own StatefulSets and pods
pub fn generate_role(es: &Elasticsearch) -> Role {
    let statefulsets = node_groups(es).into_iter().map(|g| g.name).collect();

    Role {
        metadata: meta(es),
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["apps".to_string()]),
                resources: Some(vec!["statefulsets".to_string()]),
                resource_names: Some(statefulsets),
                verbs: vec!["get".to_string()],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["pods".to_string()]),
                verbs: vec!["get".to_string(), "list".to_string()],
                ..Default::default()
            },
        ]),
    }
}

pub fn generate_role_binding(es: &Elasticsearch) -> RoleBinding {
    RoleBinding {
        metadata: meta(es),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: es.name_any(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: es.name_any(),
            namespace: es.namespace(),
            ..Default::default()
        }]),
    }
}
