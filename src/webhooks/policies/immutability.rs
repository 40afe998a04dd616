//! Immutability policies
//!
//! Fields that shape volumes, node layout or credentials cannot change once
//! the database exists:
//! - `storageType` and `storage`
//! - node group `prefix` and `storage` under `topology`, and whether
//!   `topology` is set at all
//! - `authSecret` once it names a secret
//! - `init` after `init.initialized` is set

use super::{ValidationContext, ValidationResult};
use crate::crd::{ElasticsearchClusterTopology, ElasticsearchNode, StorageSpec};

fn immutable(field: &str) -> ValidationResult {
    ValidationResult::denied(
        "ImmutableField",
        &format!("spec.{field} cannot be changed after creation"),
    )
}

type NodeLayout<'a> = (Option<&'a str>, Option<&'a StorageSpec>);

fn layout(node: &ElasticsearchNode) -> NodeLayout<'_> {
    (node.prefix.as_deref(), node.storage.as_ref())
}

fn topology_layout(t: &ElasticsearchClusterTopology) -> [NodeLayout<'_>; 3] {
    [layout(&t.client), layout(&t.master), layout(&t.data)]
}

pub fn validate_immutability(ctx: &ValidationContext) -> ValidationResult {
    let Some(old) = ctx.old else {
        return ValidationResult::allowed();
    };
    let (old, new) = (&old.spec, &ctx.es.spec);

    if old.storage_type != new.storage_type {
        return immutable("storageType");
    }
    if old.storage != new.storage {
        return immutable("storage");
    }
    if old.topology.as_ref().map(topology_layout) != new.topology.as_ref().map(topology_layout) {
        return immutable("topology");
    }
    if old.auth_secret.is_some() && old.auth_secret != new.auth_secret {
        return immutable("authSecret");
    }

    let initialized = old.init.as_ref().is_some_and(|i| i.initialized);
    if initialized && old.init != new.init {
        return immutable("init");
    }

    ValidationResult::allowed()
}
