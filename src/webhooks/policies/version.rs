//! Version policy
//!
//! `spec.version` must name an ElasticsearchVersion that is not deprecated.

use super::{ValidationContext, ValidationResult};

pub fn validate_version(ctx: &ValidationContext) -> ValidationResult {
    let version = &ctx.es.spec.version;
    if version.is_empty() {
        return ValidationResult::denied("MissingVersion", "spec.version is missing");
    }

    match &ctx.facts.version {
        None => ValidationResult::denied(
            "UnknownVersion",
            &format!("ElasticsearchVersion {version} not found"),
        ),
        Some(record) if record.spec.deprecated => {
            // Objects created before the deprecation keep working
            let unchanged = ctx.old.is_some_and(|old| &old.spec.version == version);
            if unchanged {
                ValidationResult::allowed()
            } else {
                ValidationResult::denied(
                    "DeprecatedVersion",
                    &format!("ElasticsearchVersion {version} is deprecated"),
                )
            }
        }
        Some(_) => ValidationResult::allowed(),
    }
}

#[cfg(test)]
mod tests {
    use super::super::ValidationFacts;
    use super::super::fixtures::{facts, sample, version};
    use super::*;

    #[test]
    fn test_known_version_allowed() {
        let es = sample();
        let facts = facts();
        assert!(validate_version(&ValidationContext::new(&es, None, &facts, "256Mi")).allowed);
    }

    #[test]
    fn test_unknown_version_denied() {
        let mut es = sample();
        es.spec.version = "3.0".to_string();
        let facts = ValidationFacts::default();
        let result = validate_version(&ValidationContext::new(&es, None, &facts, "256Mi"));
        assert!(!result.allowed);
        assert_eq!(
            result.message.as_deref(),
            Some("ElasticsearchVersion 3.0 not found")
        );
    }

    #[test]
    fn test_deprecated_version_only_for_new_objects() {
        let es = sample();
        let mut record = version("5.6");
        record.spec.deprecated = true;
        let facts = ValidationFacts {
            version: Some(record),
            ..Default::default()
        };
        let create = validate_version(&ValidationContext::new(&es, None, &facts, "256Mi"));
        assert_eq!(create.reason.as_deref(), Some("DeprecatedVersion"));

        let old = sample();
        let update = validate_version(&ValidationContext::new(&es, Some(&old), &facts, "256Mi"));
        assert!(update.allowed);
    }
}
