pub mod backup_reconciler;
pub mod backup_state_machine;
pub mod conditions;
pub mod context;
pub mod deployment_reconciler;
pub mod error;
pub mod features;
pub mod member_status;
pub mod observed;
pub mod plan_builder;
pub mod plan_executor;
pub mod platform;
pub mod validation;

pub use backup_reconciler::{BACKUP_FINALIZER, BACKUP_KIND, backup_error_policy, reconcile_backup};
pub use backup_state_machine::{BackupEvent, BackupStateMachine, StepOutcome, step};
pub use context::Context;
pub use deployment_reconciler::{DeploymentOutcome, error_policy, reconcile, reconcile_deployment};
pub use error::{BackoffConfig, Error, ErrorClass, Result, classify};
pub use plan_builder::{Plan, PlanNote, PlanRule, build_plan};
pub use plan_executor::{PlanExecutor, PlanProgress};
pub use platform::{KubePlatform, KubeStatusWriter, Platform, StatusWriter};
pub use validation::{validate_spec, validate_spec_change};
