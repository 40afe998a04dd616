//! Storage policies
//!
//! - Durable databases need a volume claim template for every node group
//! - Referenced storage classes must exist

use super::{ValidationContext, ValidationResult};
use crate::crd::StorageType;
use crate::resources::statefulset::node_groups;

pub fn validate_storage(ctx: &ValidationContext) -> ValidationResult {
    let es = ctx.es;

    if es.spec.storage_type == StorageType::Durable {
        for group in node_groups(es) {
            match &group.storage {
                None => {
                    return ValidationResult::denied(
                        "MissingStorage",
                        &format!(
                            "storage is required for Durable StorageType (node group {})",
                            group.name
                        ),
                    );
                }
                Some(storage) if storage.size.trim().is_empty() => {
                    return ValidationResult::denied(
                        "MissingStorageSize",
                        &format!("storage size of node group {} is empty", group.name),
                    );
                }
                Some(_) => {}
            }
        }
    } else if es.spec.storage.is_some() {
        return ValidationResult::denied(
            "StorageNotAllowed",
            "storage must be empty for Ephemeral StorageType",
        );
    }

    if let Some(class) = ctx.facts.unknown_storage_classes.first() {
        return ValidationResult::denied(
            "UnknownStorageClass",
            &format!("StorageClass {class} not found"),
        );
    }

    ValidationResult::allowed()
}
