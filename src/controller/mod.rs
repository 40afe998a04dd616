pub mod context;
pub mod cron;
pub mod dependents;
pub mod dormant;
pub mod dormant_reconciler;
pub mod error;
pub mod events;
pub mod probe;
pub mod reconciler;
pub mod restore;
pub mod snapshots;
pub mod state_machine;
pub mod status;
pub mod validation;

pub use context::{CONTROLLER_NAME, Context};
pub use cron::CronEngine;
pub use dormant_reconciler::{dormant_error_policy, reconcile_dormant};
pub use error::{BackoffConfig, Error, Result};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use snapshots::{reconcile_snapshot, snapshot_error_policy};
pub use state_machine::{DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager, spec_changed};
pub use validation::{ClusterLookup, KubeLookup};
