//! Resource policies
//!
//! The JVM cannot start below a minimum heap, so every node group's memory
//! request must reach the configured floor.

use super::{ValidationContext, ValidationResult};
use crate::controller::validation::parse_quantity;
use crate::resources::statefulset::node_groups;

pub fn validate_memory(ctx: &ValidationContext) -> ValidationResult {
    let floor = match parse_quantity(ctx.min_memory) {
        Ok(v) => v,
        Err(e) => return ValidationResult::denied("InvalidConfig", &e.to_string()),
    };

    for group in node_groups(ctx.es) {
        let Some(request) = group.resources.memory_request() else {
            continue;
        };
        let bytes = match parse_quantity(request) {
            Ok(v) => v,
            Err(e) => return ValidationResult::denied("InvalidQuantity", &e.to_string()),
        };
        if bytes < floor {
            return ValidationResult::denied(
                "InsufficientMemory",
                &format!(
                    "memory request {request} of node group {} is below the minimum {}",
                    group.name, ctx.min_memory
                ),
            );
        }
    }

    ValidationResult::allowed()
}
