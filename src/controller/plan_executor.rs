//! Plan Executor
//!
//! Runs the actions of `status.plan` strictly in order. Every completed
//! action is removed from the plan and the status is persisted before the
//! next one starts, so a crash or a conflict never repeats more than the
//! action that was running.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::arangod::{ClientFactory, MemberClient};
use crate::controller::conditions::{remove_condition, set_condition, timestamp};
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::member_status::{add_member, remove_member, reset_member};
use crate::controller::observed::{ObservedPod, OrphanKind};
use crate::controller::plan_builder::{
    PARAM_EXPIRES_AT, PARAM_HASH, PARAM_KIND, PARAM_NAME, PARAM_SECRET, PARAM_SIZE, PARAM_USER,
};
use crate::controller::platform::{Platform, StatusWriter};
use crate::crd::{
    Action, ActionType, ArangoDeployment, ConditionType, DeploymentMode, DeploymentStatus,
    ImageInfo, MemberPhase, MemberStatus, ServerGroup,
};
use crate::resources::common::{
    ANNOTATION_TLS_EXPIRES_AT, member_pod_name, member_tls_secret_name,
};
use crate::resources::pod::{build_member_pod, template_hash};
use crate::resources::pvc::{build_member_pvc, member_claim_name};
use crate::resources::secret::{SECRET_KEY_PASSWORD, secret_string};

/// How far a plan got in one pass
#[derive(Debug, Clone, PartialEq)]
pub enum PlanProgress {
    /// Every action finished
    Completed,
    /// An action has not converged yet, poll again later
    Waiting,
    /// An action failed temporarily, retry after the delay
    RetryAfter(Duration),
}

/// Result of running a single action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Waiting,
}

/// Executes plans against one deployment
pub struct PlanExecutor<'a> {
    platform: &'a dyn Platform,
    factory: &'a dyn ClientFactory,
    deployment: &'a ArangoDeployment,
    image: &'a ImageInfo,
    backoff: &'a BackoffConfig,
    now: DateTime<Utc>,
    client: Option<Arc<dyn MemberClient>>,
    executed: Vec<ActionType>,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        factory: &'a dyn ClientFactory,
        deployment: &'a ArangoDeployment,
        image: &'a ImageInfo,
        backoff: &'a BackoffConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            platform,
            factory,
            deployment,
            image,
            backoff,
            now,
            client: None,
            executed: Vec::new(),
        }
    }

    /// Types of the actions completed so far
    pub fn executed(&self) -> &[ActionType] {
        &self.executed
    }

    /// Run `status.plan` until it is empty, an action waits or an action fails
    ///
    /// The returned status is the last one handed to the writer. Only status
    /// write failures and permanent action failures are returned as errors.
    pub async fn execute(
        &mut self,
        mut status: DeploymentStatus,
        writer: &mut dyn StatusWriter,
    ) -> (DeploymentStatus, Result<PlanProgress>) {
        while let Some(first) = status.plan.first_mut() {
            if first.start_time.is_none() {
                first.start_time = Some(timestamp(&self.now));
            }
            let action = first.clone();
            debug!(action = %action.type_, id = %action.id, member = ?action.member_id, "Running action");

            match self.run(&action, &mut status).await {
                Ok(Outcome::Done) => {
                    info!(action = %action.type_, member = ?action.member_id, "Action completed");
                    status.plan.remove(0);
                    status.retry_count = 0;
                    status.last_error = None;
                    self.clear_member_failure(&action, &mut status);
                    self.executed.push(action.type_);
                    if let Err(e) = writer.write(&status).await {
                        return (status, Err(e));
                    }
                }
                Ok(Outcome::Waiting) => {
                    debug!(action = %action.type_, member = ?action.member_id, "Action waiting");
                    let result = writer.write(&status).await.map(|_| PlanProgress::Waiting);
                    return (status, result);
                }
                Err(e) if e.is_temporary() => {
                    let delay = self.backoff.delay_for_attempt(status.retry_count);
                    status.retry_count += 1;
                    status.last_error = Some(format!("{}: {}", action.type_, e));
                    warn!(
                        action = %action.type_,
                        member = ?action.member_id,
                        retry_count = status.retry_count,
                        error = %e,
                        "Action failed temporarily, retrying in {:?}",
                        delay
                    );
                    let result = writer
                        .write(&status)
                        .await
                        .map(|_| PlanProgress::RetryAfter(delay));
                    return (status, result);
                }
                Err(e) => {
                    warn!(action = %action.type_, member = ?action.member_id, error = %e, "Action failed");
                    status.last_error = Some(format!("{}: {}", action.type_, e));
                    self.mark_member_failed(&action, &mut status, &e);
                    if let Err(write_error) = writer.write(&status).await {
                        warn!(error = %write_error, "Failed to persist action failure");
                    }
                    return (status, Err(e));
                }
            }
        }
        (status, Ok(PlanProgress::Completed))
    }

    fn mark_member_failed(&self, action: &Action, status: &mut DeploymentStatus, error: &Error) {
        let (Some(group), Some(id)) = (action.group, action.member_id.as_deref()) else {
            return;
        };
        if let Some(member) = status.members.find_mut(group, id) {
            set_condition(
                &mut member.conditions,
                ConditionType::Failed,
                true,
                error.reason(),
                &format!("{} failed: {}", action.type_, error),
                &self.now,
            );
        }
    }

    fn clear_member_failure(&self, action: &Action, status: &mut DeploymentStatus) {
        let (Some(group), Some(id)) = (action.group, action.member_id.as_deref()) else {
            return;
        };
        if let Some(member) = status.members.find_mut(group, id) {
            if member.phase != MemberPhase::Failed {
                remove_condition(&mut member.conditions, ConditionType::Failed);
            }
        }
    }

    async fn client(&mut self) -> Result<Arc<dyn MemberClient>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = self.factory.member_client(self.deployment).await?;
        self.client = Some(client.clone());
        Ok(client)
    }

    async fn run(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        match action.type_ {
            ActionType::AddMember => self.add_member(action, status).await,
            ActionType::RemoveMember => self.remove_member(action, status).await,
            ActionType::RecreateMember => self.recreate_member(action, status).await,
            ActionType::RecreateMemberPod => self.recreate_member_pod(action, status).await,
            ActionType::RemoveOrphan => self.remove_orphan(action).await,
            ActionType::CleanOutMember => self.clean_out_member(action, status).await,
            ActionType::ShutdownMember => self.shutdown_member(action, status).await,
            ActionType::WaitForMemberUp => self.wait_for_member_up(action, status).await,
            ActionType::RotateMember | ActionType::UpgradeMember => {
                self.replace_member_pod(action, status).await
            }
            ActionType::ResizeVolume => self.resize_volume(action, status).await,
            ActionType::RenewTlsCertificate => self.renew_tls_certificate(action).await,
            ActionType::RefreshJwtSecret => self.refresh_jwt_secret(action, status).await,
            ActionType::UpdateUserPassword => self.update_user_password(action, status).await,
        }
    }

    fn deployment_name(&self) -> String {
        self.deployment.name_any()
    }

    fn pod_name(&self, group: ServerGroup, member: &MemberStatus) -> String {
        member
            .pod_name
            .clone()
            .unwrap_or_else(|| member_pod_name(&self.deployment_name(), group, &member.id))
    }

    async fn create_member_objects(
        &self,
        status: &mut DeploymentStatus,
        group: ServerGroup,
        member: &MemberStatus,
    ) -> Result<()> {
        if group.has_volume() {
            let claim = member_claim_name(&self.deployment_name(), group, member);
            if self.platform.get_pvc(&claim).await?.is_none() {
                self.platform
                    .create_pvc(&build_member_pvc(self.deployment, group, member))
                    .await?;
            }
        }
        let pod = build_member_pod(self.deployment, status, group, member, self.image);
        self.platform.create_pod(&pod).await?;
        if let Some(m) = status.members.find_mut(group, &member.id) {
            m.image = Some(self.image.clone());
        }
        Ok(())
    }

    async fn add_member(&self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let member = add_member(status, &self.deployment_name(), group, id, &self.now).clone();
        info!(member = %id, group = %group, "Adding member");
        self.create_member_objects(status, group, &member).await?;
        Ok(Outcome::Done)
    }

    async fn remove_member(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };

        let in_cluster = self.deployment.spec.mode() == DeploymentMode::Cluster
            && matches!(group, ServerGroup::DbServers | ServerGroup::Coordinators);
        if in_cluster && member.initialized {
            let client = self.client().await?;
            match client.remove_server(id).await {
                Err(e) if e.is_not_found() => {}
                other => other?,
            }
        }

        self.platform.delete_pod(&self.pod_name(group, &member)).await?;
        if group.has_volume() {
            self.platform
                .delete_pvc(&member_claim_name(&self.deployment_name(), group, &member))
                .await?;
        }
        remove_member(status, group, id);
        info!(member = %id, group = %group, "Removed member");
        Ok(Outcome::Done)
    }

    async fn recreate_member(&self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };

        let pod_name = self.pod_name(group, &member);
        if self.platform.get_pod(&pod_name).await?.is_some() {
            self.platform.delete_pod(&pod_name).await?;
            return Ok(Outcome::Waiting);
        }
        if group.has_volume() {
            let claim = member_claim_name(&self.deployment_name(), group, &member);
            if self.platform.get_pvc(&claim).await?.is_some() {
                self.platform.delete_pvc(&claim).await?;
                return Ok(Outcome::Waiting);
            }
        }

        let Some(entry) = status.members.find_mut(group, id) else {
            return Ok(Outcome::Done);
        };
        reset_member(entry, &self.now);
        let member = entry.clone();
        info!(member = %id, group = %group, "Recreating member");
        self.create_member_objects(status, group, &member).await?;
        Ok(Outcome::Done)
    }

    async fn recreate_member_pod(&self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        let pod_name = self.pod_name(group, &member);

        match self.platform.get_pod(&pod_name).await? {
            Some(pod) => {
                let observed = ObservedPod::from_pod(&pod);
                if observed.terminating {
                    Ok(Outcome::Waiting)
                } else if observed.terminated {
                    self.platform.delete_pod(&pod_name).await?;
                    Ok(Outcome::Waiting)
                } else {
                    Ok(Outcome::Done)
                }
            }
            None => {
                info!(member = %id, group = %group, "Creating missing member pod");
                self.create_member_objects(status, group, &member).await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn remove_orphan(&self, action: &Action) -> Result<Outcome> {
        let kind = action
            .param(PARAM_KIND)
            .and_then(OrphanKind::parse)
            .ok_or_else(|| Error::PermanentError(format!("action {} has no valid kind", action.id)))?;
        let name = required_param(action, PARAM_NAME)?;
        info!(kind = kind.as_str(), name = %name, "Removing orphaned object");
        match kind {
            OrphanKind::Pod => self.platform.delete_pod(name).await?,
            OrphanKind::Volume => self.platform.delete_pvc(name).await?,
        }
        Ok(Outcome::Done)
    }

    async fn clean_out_member(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        if matches!(member.phase, MemberPhase::CleanedOut | MemberPhase::ShutDown) {
            return Ok(Outcome::Done);
        }

        let client = self.client().await?;
        if member.phase != MemberPhase::CleaningOut {
            info!(member = %id, "Cleaning out db-server");
            client.clean_out_server(id).await?;
            if let Some(m) = status.members.find_mut(group, id) {
                m.phase = MemberPhase::CleaningOut;
            }
        }

        if !client.is_cleaned_out(id).await? {
            return Ok(Outcome::Waiting);
        }
        if let Some(m) = status.members.find_mut(group, id) {
            m.phase = MemberPhase::CleanedOut;
            set_condition(
                &mut m.conditions,
                ConditionType::CleanedOut,
                true,
                "CleanOutCompleted",
                "",
                &self.now,
            );
        }
        Ok(Outcome::Done)
    }

    async fn shutdown_member(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        let pod_name = self.pod_name(group, &member);

        let Some(pod) = self.platform.get_pod(&pod_name).await? else {
            if let Some(m) = status.members.find_mut(group, id) {
                m.phase = MemberPhase::ShutDown;
            }
            return Ok(Outcome::Done);
        };

        let observed = ObservedPod::from_pod(&pod);
        if !observed.terminating {
            if observed.ready {
                let client = self.client().await?;
                match client.shutdown_member(group, id).await {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                }
            }
            self.platform.delete_pod(&pod_name).await?;
            info!(member = %id, group = %group, "Shutting down member");
        }
        if let Some(m) = status.members.find_mut(group, id) {
            m.phase = MemberPhase::ShutDown;
        }
        Ok(Outcome::Waiting)
    }

    async fn wait_for_member_up(&self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        let ready = self
            .platform
            .get_pod(&self.pod_name(group, &member))
            .await?
            .map(|pod| ObservedPod::from_pod(&pod))
            .is_some_and(|p| p.ready && !p.terminating);
        if !ready {
            return Ok(Outcome::Waiting);
        }

        if let Some(m) = status.members.find_mut(group, id) {
            set_condition(&mut m.conditions, ConditionType::Ready, true, "PodReady", "", &self.now);
            m.initialized = true;
            if matches!(
                m.phase,
                MemberPhase::None | MemberPhase::Rotating | MemberPhase::Upgrading
            ) {
                m.phase = MemberPhase::Created;
            }
        }
        Ok(Outcome::Done)
    }

    /// Replace a member pod whose template or image is out of date
    async fn replace_member_pod(&self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        let pod_name = self.pod_name(group, &member);
        let hash = template_hash(&self.deployment.spec, group, &member, self.image);

        let Some(pod) = self.platform.get_pod(&pod_name).await? else {
            self.create_member_objects(status, group, &member).await?;
            return Ok(Outcome::Done);
        };

        let observed = ObservedPod::from_pod(&pod);
        if observed.terminating {
            return Ok(Outcome::Waiting);
        }
        if observed.template_hash.as_deref() == Some(hash.as_str()) {
            if let Some(m) = status.members.find_mut(group, id) {
                m.image = Some(self.image.clone());
            }
            return Ok(Outcome::Done);
        }

        let phase = if action.type_ == ActionType::UpgradeMember {
            MemberPhase::Upgrading
        } else {
            MemberPhase::Rotating
        };
        info!(
            member = %id,
            group = %group,
            expected = action.param(PARAM_HASH).unwrap_or_default(),
            "Replacing member pod ({})",
            phase
        );
        self.platform.delete_pod(&pod_name).await?;
        if let Some(m) = status.members.find_mut(group, id) {
            m.phase = phase;
        }
        Ok(Outcome::Waiting)
    }

    async fn resize_volume(&self, action: &Action, status: &DeploymentStatus) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let Some(member) = find_member(status, group, id) else {
            return Ok(Outcome::Done);
        };
        let size = required_param(action, PARAM_SIZE)?;
        let claim = member_claim_name(&self.deployment_name(), group, &member);
        info!(member = %id, pvc = %claim, size = %size, "Resizing member volume");
        self.platform.resize_pvc(&claim, size).await?;
        Ok(Outcome::Done)
    }

    async fn renew_tls_certificate(&mut self, action: &Action) -> Result<Outcome> {
        let (group, id) = target(action)?;
        let stale = required_param(action, PARAM_EXPIRES_AT)?;
        let secret_name = member_tls_secret_name(&self.deployment_name(), group, id);

        let Some(secret) = self.platform.get_secret(&secret_name).await? else {
            debug!(secret = %secret_name, "Waiting for renewed certificate");
            return Ok(Outcome::Waiting);
        };
        if secret.annotations().get(ANNOTATION_TLS_EXPIRES_AT).map(String::as_str) == Some(stale) {
            info!(member = %id, secret = %secret_name, "Deleting expiring certificate");
            self.platform.delete_secret(&secret_name).await?;
            return Ok(Outcome::Waiting);
        }

        let client = self.client().await?;
        client.refresh_tls(group, id).await?;
        Ok(Outcome::Done)
    }

    async fn refresh_jwt_secret(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let hash = required_param(action, PARAM_HASH)?;
        let members: Vec<(ServerGroup, String)> = status
            .members
            .iter()
            .filter(|(_, m)| m.is_ready() && !m.is_leaving() && m.phase != MemberPhase::Failed)
            .map(|(group, m)| (group, m.id.clone()))
            .collect();

        let client = self.client().await?;
        for (group, id) in &members {
            client.refresh_jwt(*group, id).await?;
        }
        info!(members = members.len(), "Reloaded JWT secret");
        status.secret_hashes.auth_jwt = Some(hash.to_string());
        Ok(Outcome::Done)
    }

    async fn update_user_password(&mut self, action: &Action, status: &mut DeploymentStatus) -> Result<Outcome> {
        let user = required_param(action, PARAM_USER)?;
        let secret_name = required_param(action, PARAM_SECRET)?;
        let hash = required_param(action, PARAM_HASH)?;

        let secret = self
            .platform
            .get_secret(secret_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("password secret {}", secret_name)))?;
        let password = secret_string(&secret, SECRET_KEY_PASSWORD).ok_or_else(|| {
            Error::PermanentError(format!(
                "secret {} has no {} key",
                secret_name, SECRET_KEY_PASSWORD
            ))
        })?;

        let client = self.client().await?;
        client.set_user_password(user, &password).await?;
        info!(user = %user, "Updated user password");
        status
            .secret_hashes
            .users
            .insert(user.to_string(), hash.to_string());
        Ok(Outcome::Done)
    }
}

fn target(action: &Action) -> Result<(ServerGroup, &str)> {
    match (action.group, action.member_id.as_deref()) {
        (Some(group), Some(id)) => Ok((group, id)),
        _ => Err(Error::PermanentError(format!(
            "{} action {} names no member",
            action.type_, action.id
        ))),
    }
}

fn required_param<'b>(action: &'b Action, key: &str) -> Result<&'b str> {
    action.param(key).ok_or_else(|| {
        Error::PermanentError(format!(
            "{} action {} is missing parameter {}",
            action.type_, action.id, key
        ))
    })
}

fn find_member(status: &DeploymentStatus, group: ServerGroup, id: &str) -> Option<MemberStatus> {
    status
        .members
        .group(group)
        .iter()
        .find(|m| m.id == id)
        .cloned()
}
