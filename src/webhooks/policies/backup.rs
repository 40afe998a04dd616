//! Backup and initialization policies
//!
//! - A backup schedule needs a parseable cron expression and a complete
//!   storage location
//! - A snapshot source must name a snapshot

use super::{ValidationContext, ValidationResult};
use crate::controller::cron::Schedule;
use crate::storage::require_location;

pub fn validate_backup(ctx: &ValidationContext) -> ValidationResult {
    let spec = &ctx.es.spec;

    if let Some(schedule) = &spec.backup_schedule {
        if let Err(e) = schedule.cron_expression.parse::<Schedule>() {
            return ValidationResult::denied("InvalidBackupSchedule", &e.to_string());
        }
        if let Err(e) = require_location(&schedule.storage) {
            return ValidationResult::denied("InvalidBackupSchedule", &e.to_string());
        }
    }

    if let Some(source) = spec.init.as_ref().and_then(|i| i.snapshot_source.as_ref())
        && source.name.is_empty()
    {
        return ValidationResult::denied(
            "InvalidSnapshotSource",
            "init.snapshotSource.name is missing",
        );
    }

    ValidationResult::allowed()
}
