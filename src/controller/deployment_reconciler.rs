//! Reconciliation of ArangoDeployment resources
//!
//! One pass validates the spec, refreshes the member records from the
//! platform, builds a plan and executes as much of it as possible. The pass
//! itself lives in [`reconcile_deployment`], which only depends on the
//! platform, status writer and client factory traits.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::{Api, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::arangod::ClientFactory;
use crate::config::OperatorConfig;
use crate::controller::conditions::{remove_condition, set_condition};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, ErrorClass, Result};
use crate::controller::features::discover_image;
use crate::controller::member_status::{record_initial_secret_hashes, track};
use crate::controller::observed::collect;
use crate::controller::plan_builder::{PlanRule, build_plan};
use crate::controller::plan_executor::{PlanExecutor, PlanProgress};
use crate::controller::platform::{KubePlatform, KubeStatusWriter, Platform, StatusWriter};
use crate::controller::validation::{validate_spec, validate_spec_change};
use crate::crd::{
    ActionType, ArangoDeployment, ConditionType, DeploymentPhase, DeploymentStatus, ImageInfo,
    MemberPhase,
};
use crate::resources::KIND;
use crate::resources::secret::generate_jwt_secret;

/// Requeue after a plan finished, to compute the next one
const NEXT_PLAN_DELAY: Duration = Duration::from_secs(1);

/// Result of one reconciliation pass
#[derive(Debug, Clone)]
pub struct DeploymentOutcome {
    pub status: DeploymentStatus,
    pub progress: PlanProgress,
    /// Rule the plan came from, `None` when nothing was left to do
    pub rule: Option<PlanRule>,
    pub executed: Vec<ActionType>,
}

impl DeploymentOutcome {
    /// When the deployment should be looked at again
    pub fn requeue_after(&self, config: &OperatorConfig) -> Duration {
        match (&self.progress, self.rule) {
            (PlanProgress::RetryAfter(delay), _) => *delay,
            (PlanProgress::Waiting, _) => config.member_poll_interval,
            (PlanProgress::Completed, Some(_)) => NEXT_PLAN_DELAY,
            (PlanProgress::Completed, None) => config.ready_poll_interval,
        }
    }
}

/// Run one reconciliation pass against a deployment
pub async fn reconcile_deployment(
    deployment: &ArangoDeployment,
    platform: &dyn Platform,
    writer: &mut dyn StatusWriter,
    factory: &dyn ClientFactory,
    backoff: &BackoffConfig,
    now: DateTime<Utc>,
) -> Result<DeploymentOutcome> {
    let name = deployment.name_any();
    let spec = &deployment.spec;
    let mut status = deployment.status.clone().unwrap_or_default();

    if let Err(e) = validate(deployment, &status) {
        warn!(error = %e, "Spec rejected");
        set_condition(
            &mut status.conditions,
            ConditionType::SpecInvalid,
            true,
            "ValidationFailed",
            &e.to_string(),
            &now,
        );
        status.last_error = Some(e.to_string());
        writer.write(&status).await?;
        return Err(e);
    }
    remove_condition(&mut status.conditions, ConditionType::SpecInvalid);
    status.accepted_spec = Some(spec.clone());
    status.observed_generation = deployment.metadata.generation;

    let image = discover_image(spec.image())?;
    record_image(&mut status, &image);

    if let Some(secret_name) = spec.jwt_secret_name(&name) {
        if platform.get_secret(&secret_name).await?.is_none() {
            info!(secret = %secret_name, "Creating JWT secret");
            platform
                .create_secret(&generate_jwt_secret(deployment, &secret_name))
                .await?;
        }
    }

    let observed = collect(platform, deployment, &status, now).await?;
    track(&mut status, &observed);
    record_initial_secret_hashes(&mut status, &observed);

    let plan = match build_plan(spec, &status, &observed) {
        Ok(plan) => plan,
        Err(e) => {
            error!(error = %e, "Cannot plan towards the desired state");
            status.phase = DeploymentPhase::Failed;
            status.last_error = Some(e.to_string());
            set_condition(
                &mut status.conditions,
                ConditionType::UpToDate,
                false,
                e.reason(),
                &e.to_string(),
                &now,
            );
            writer.write(&status).await?;
            return Err(e);
        }
    };

    if plan.notes.is_empty() {
        remove_condition(&mut status.conditions, ConditionType::SecurityRotationBlocked);
    } else {
        let reasons: Vec<&str> = plan.notes.iter().map(|n| n.reason.as_str()).collect();
        let messages: Vec<&str> = plan.notes.iter().map(|n| n.message.as_str()).collect();
        for note in &plan.notes {
            warn!(rule = %note.rule, reason = %note.reason, "{}", note.message);
        }
        set_condition(
            &mut status.conditions,
            ConditionType::SecurityRotationBlocked,
            true,
            &reasons.join(","),
            &messages.join("; "),
            &now,
        );
    }

    for rule in PlanRule::ALL {
        if let Some(condition) = rule.progress_condition() {
            if plan.rule == Some(rule) {
                set_condition(&mut status.conditions, condition, true, "PlanRunning", "", &now);
            } else {
                remove_condition(&mut status.conditions, condition);
            }
        }
    }

    if plan.is_empty() {
        set_condition(&mut status.conditions, ConditionType::UpToDate, true, "PlanEmpty", "", &now);
        status.current_image = Some(image.clone());
        status.phase = DeploymentPhase::Running;
    } else {
        let rule = plan.rule.map(|r| r.to_string()).unwrap_or_default();
        info!(rule = %rule, actions = plan.len(), "Executing plan");
        set_condition(
            &mut status.conditions,
            ConditionType::UpToDate,
            false,
            &rule,
            &format!("{} actions pending", plan.len()),
            &now,
        );
        if status.phase == DeploymentPhase::None {
            status.phase = DeploymentPhase::Running;
        }
    }

    let members_ready = status
        .members
        .iter()
        .filter(|(_, m)| m.phase != MemberPhase::Failed && !m.is_leaving())
        .all(|(_, m)| m.is_ready());
    let ready = members_ready && !status.members.is_empty();
    set_condition(
        &mut status.conditions,
        ConditionType::Ready,
        ready,
        if ready { "AllMembersReady" } else { "MembersNotReady" },
        "",
        &now,
    );

    status.plan = carry_over(&status.plan, plan.actions);
    writer.write(&status).await?;

    let mut executor = PlanExecutor::new(platform, factory, deployment, &image, backoff, now);
    let (status, progress) = executor.execute(status, writer).await;
    let executed = executor.executed().to_vec();

    Ok(DeploymentOutcome {
        status,
        progress: progress?,
        rule: plan.rule,
        executed,
    })
}

fn validate(deployment: &ArangoDeployment, status: &DeploymentStatus) -> Result<()> {
    validate_spec(&deployment.spec)?;
    if let Some(accepted) = &status.accepted_spec {
        validate_spec_change(accepted, &deployment.spec)?;
    }
    Ok(())
}

fn record_image(status: &mut DeploymentStatus, image: &ImageInfo) {
    if !status.images.iter().any(|i| i.image == image.image) {
        debug!(image = %image.image, version = %image.arangodb_version, "Recording image");
        status.images.push(image.clone());
    }
}

/// Keep the start time of actions that survived from the previous plan
fn carry_over(
    previous: &[crate::crd::Action],
    next: Vec<crate::crd::Action>,
) -> Vec<crate::crd::Action> {
    next.into_iter()
        .map(|mut action| {
            if let Some(old) = previous.iter().find(|p| p.same_as(&action)) {
                action.start_time = old.start_time.clone();
            }
            action
        })
        .collect()
}

/// Main reconciliation function
#[instrument(skip(deployment, ctx), fields(name = %deployment.name_any(), namespace = deployment.namespace().unwrap_or_default()))]
pub async fn reconcile(deployment: Arc<ArangoDeployment>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let ns = deployment
        .namespace()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = deployment.name_any();

    if deployment.metadata.deletion_timestamp.is_some() {
        debug!("Deployment is being deleted, owned objects are garbage collected");
        ctx.forget(KIND, &ns, &name);
        return Ok(Action::await_change());
    }

    info!("Reconciling ArangoDeployment");

    let platform = KubePlatform::new(ctx.client.clone(), &ns);
    let api: Api<ArangoDeployment> = Api::namespaced(ctx.client.clone(), &ns);
    let mut writer = KubeStatusWriter::new(api, deployment.as_ref().clone());

    let result = reconcile_deployment(
        &deployment,
        &platform,
        &mut writer,
        ctx.factory.as_ref(),
        &ctx.backoff,
        Utc::now(),
    )
    .await;

    match result {
        Ok(outcome) => {
            if let Some(state) = &ctx.health_state {
                state.metrics.set_plan_length(&ns, &name, outcome.status.plan.len());
                state.metrics.record_actions(&outcome.executed);
            }
            ctx.record_reconcile(KIND, &ns, &name, started.elapsed().as_secs_f64());
            let delay = outcome.requeue_after(&ctx.config);
            debug!(progress = ?outcome.progress, "Requeue in {:?}", delay);
            Ok(Action::requeue(delay))
        }
        Err(e) => {
            ctx.record_error(KIND, &ns, &name);
            Err(e)
        }
    }
}

/// Error policy: temporary failures back off, permanent ones wait for a change
pub fn error_policy(deployment: Arc<ArangoDeployment>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = deployment.name_any();
    let retry_count = deployment
        .status
        .as_ref()
        .map(|s| s.retry_count)
        .unwrap_or(0);

    match error.classify() {
        ErrorClass::Temporary => {
            let delay = ctx.backoff.delay_for_attempt(retry_count);
            warn!(
                "Temporary error for {}: {}, requeuing in {:?}",
                name, error, delay
            );
            Action::requeue(delay)
        }
        ErrorClass::Permanent => {
            error!(
                "Permanent error for {}: {}, waiting for a change",
                name, error
            );
            Action::await_change()
        }
    }
}
