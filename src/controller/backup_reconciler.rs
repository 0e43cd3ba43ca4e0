//! Reconciliation of ArangoBackup resources
//!
//! Each pass runs one step of the backup state machine and writes the
//! resulting status. A finalizer removes the backup from the database before
//! the object goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::config::OperatorConfig;
use crate::controller::backup_state_machine::{BackupEvent, deletion_status, step};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, ErrorClass, Result};
use crate::crd::{ArangoBackup, ArangoDeployment, BackupStatus};
use crate::resources::FIELD_MANAGER;

pub const BACKUP_FINALIZER: &str = "backup.arangodb.com/delete-backup";

pub const BACKUP_KIND: &str = "ArangoBackup";

/// Requeue after a state change that needs no waiting
const NEXT_STEP_DELAY: Duration = Duration::from_secs(1);

/// When to look at a backup again, `None` waits for a change of the object
pub fn requeue_after(
    event: Option<BackupEvent>,
    status: &BackupStatus,
    config: &OperatorConfig,
    backoff: &BackoffConfig,
) -> Option<Duration> {
    match event {
        None => None,
        Some(BackupEvent::TemporaryFailure) => {
            Some(backoff.delay_for_attempt(status.retry_count.saturating_sub(1)))
        }
        Some(BackupEvent::TransferProgressed) => Some(config.member_poll_interval),
        Some(_) if status.state.is_terminal() => None,
        Some(_) if status.state == crate::crd::BackupState::Ready => Some(config.ready_poll_interval),
        Some(_) => Some(NEXT_STEP_DELAY),
    }
}

#[instrument(skip(backup, ctx), fields(name = %backup.name_any(), namespace = backup.namespace().unwrap_or_default()))]
pub async fn reconcile_backup(backup: Arc<ArangoBackup>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = backup
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = backup.name_any();
    let api: Api<ArangoBackup> = Api::namespaced(ctx.client.clone(), &ns);

    if backup.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&backup, &ctx, &api, &ns).await;
    }

    if !has_finalizer(&backup) {
        add_finalizer(&backup, &api).await?;
        return Ok(Action::requeue(NEXT_STEP_DELAY));
    }

    debug!(state = %backup.state(), "Reconciling ArangoBackup");

    let deployments: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), &ns);
    let deployment = deployments.get_opt(&backup.spec.deployment.name).await?;

    let result = step(
        &backup,
        deployment.as_ref(),
        ctx.factory.as_ref(),
        ctx.config.backup_max_retries,
        Utc::now(),
    )
    .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.record_error(BACKUP_KIND, &ns, &name);
            return Err(e);
        }
    };

    let mut status = outcome.status;
    status.observed_generation = backup.metadata.generation;
    write_status(&api, &backup, &status).await?;

    if let Some(state) = &ctx.health_state {
        state.metrics.set_backup_state(&ns, &name, status.state);
    }
    ctx.record_reconcile(BACKUP_KIND, &ns, &name, started.elapsed().as_secs_f64());

    Ok(
        match requeue_after(outcome.event, &status, &ctx.config, &ctx.backoff) {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        },
    )
}

pub fn backup_error_policy(backup: Arc<ArangoBackup>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = backup.name_any();
    let retry_count = backup.status.as_ref().map(|s| s.retry_count).unwrap_or(0);

    match error.classify() {
        ErrorClass::Temporary => {
            let delay = ctx.backoff.delay_for_attempt(retry_count);
            warn!(
                "Temporary error for backup {}: {}, requeuing in {:?}",
                name, error, delay
            );
            Action::requeue(delay)
        }
        ErrorClass::Permanent => {
            error!("Permanent error for backup {}: {}", name, error);
            Action::await_change()
        }
    }
}

/// Replace the status subresource, guarded by the resourceVersion that was read
async fn write_status(api: &Api<ArangoBackup>, backup: &ArangoBackup, status: &BackupStatus) -> Result<()> {
    if backup.status.as_ref() == Some(status) {
        return Ok(());
    }
    let mut next = backup.clone();
    next.status = Some(status.clone());
    next.metadata.managed_fields = None;

    api.replace_status(
        &backup.name_any(),
        &PostParams::default(),
        serde_json::to_vec(&next)?,
    )
    .await?;
    Ok(())
}

async fn handle_deletion(
    backup: &ArangoBackup,
    ctx: &Context,
    api: &Api<ArangoBackup>,
    ns: &str,
) -> Result<Action> {
    if !has_finalizer(backup) {
        ctx.forget(BACKUP_KIND, ns, &backup.name_any());
        return Ok(Action::await_change());
    }

    if let Some(id) = backup.status.as_ref().and_then(|s| s.backup.as_ref()).map(|b| b.id.clone()) {
        let deployments: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), ns);
        match deployments.get_opt(&backup.spec.deployment.name).await? {
            Some(deployment) => {
                let client = ctx.factory.backup_client(&deployment).await?;
                match client.delete_backup(&id).await {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                }
                info!(id = %id, "Deleted backup from database");
            }
            None => warn!(
                deployment = %backup.spec.deployment.name,
                "Deployment not found, leaving backup data in place"
            ),
        }
    }

    if let Some(status) = deletion_status(backup, &Utc::now()) {
        if let Err(e) = write_status(api, backup, &status).await {
            debug!(error = %e, "Could not record deletion in status");
        }
    }

    remove_finalizer(backup, api).await?;
    ctx.forget(BACKUP_KIND, ns, &backup.name_any());
    Ok(Action::await_change())
}

fn has_finalizer(backup: &ArangoBackup) -> bool {
    backup.finalizers().iter().any(|f| f == BACKUP_FINALIZER)
}

async fn add_finalizer(backup: &ArangoBackup, api: &Api<ArangoBackup>) -> Result<()> {
    let mut finalizers = backup.finalizers().to_vec();
    finalizers.push(BACKUP_FINALIZER.to_string());
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &backup.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

async fn remove_finalizer(backup: &ArangoBackup, api: &Api<ArangoBackup>) -> Result<()> {
    let finalizers: Vec<&String> = backup
        .finalizers()
        .iter()
        .filter(|f| *f != BACKUP_FINALIZER)
        .collect();
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(
        &backup.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}
