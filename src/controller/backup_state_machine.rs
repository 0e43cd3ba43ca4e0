//! Finite state machine for the ArangoBackup lifecycle
//!
//! Every reconciliation runs the handler of the current state once. The
//! handler talks to the database and reports an event; the transition table
//! decides the next state. Failures of any handler go through
//! [`route_error`], which keeps temporary failures in place until the retry
//! budget is spent.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::arangod::{
    BackupClient, BackupMeta, ClientFactory, CreateBackupRequest, TransferProgress, TransferTarget,
};
use crate::controller::conditions::timestamp;
use crate::controller::error::{Error, Result};
use crate::crd::{
    ArangoBackup, ArangoDeployment, BackupDetails, BackupProgress, BackupState, BackupStatus,
};

/// Events that move a backup between states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupEvent {
    /// A new backup object was seen
    Accepted,
    /// The backup is fetched from a remote repository instead of created
    DownloadRequested,
    CreateRequested,
    /// The database finished creating the backup
    Created,
    /// Created, and the spec asks for an upload
    CreatedForUpload,
    /// An upload or download job is still running
    TransferProgressed,
    Downloaded,
    Uploaded,
    /// The upload target was dropped from the spec
    UploadRemoved,
    /// An upload target was added to a ready backup
    UploadRequested,
    /// The backup still exists in the database
    Verified,
    /// The database no longer knows the backup
    BackupMissing,
    /// A temporary failure within the retry budget
    TemporaryFailure,
    /// A permanent failure or an exhausted retry budget
    Failure,
    /// The spec changed after the backup failed
    SpecChanged,
    /// The backup object is being deleted
    DeletionRequested,
}

impl fmt::Display for BackupEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    /// The object generation moved past the last observed one
    pub spec_changed: bool,
    /// The spec names an upload target
    pub upload_requested: bool,
}

impl TransitionContext {
    pub fn for_backup(backup: &ArangoBackup) -> Self {
        let observed = backup.status.as_ref().and_then(|s| s.observed_generation);
        Self {
            spec_changed: matches!(
                (backup.metadata.generation, observed),
                (Some(generation), Some(observed)) if generation > observed
            ),
            upload_requested: backup.spec.upload.is_some(),
        }
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: BackupState,
    pub to: BackupState,
    pub event: BackupEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: BackupState,
        to: BackupState,
        event: BackupEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug, PartialEq)]
pub enum TransitionResult {
    Success {
        from: BackupState,
        to: BackupState,
        event: BackupEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: BackupState,
        event: BackupEvent,
    },
    GuardFailed {
        from: BackupState,
        to: BackupState,
        event: BackupEvent,
        reason: String,
    },
}

/// Transition table of the backup lifecycle
pub struct BackupStateMachine {
    transitions: Vec<Transition>,
}

impl Default for BackupStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupStateMachine {
    pub fn new() -> Self {
        use BackupEvent as E;
        use BackupState as S;

        let mut transitions = vec![
            // === None ===
            Transition::new(S::None, S::Scheduled, E::Accepted, "Backup accepted"),
            // === Scheduled ===
            Transition::new(
                S::Scheduled,
                S::Download,
                E::DownloadRequested,
                "Fetching backup from remote repository",
            ),
            Transition::new(S::Scheduled, S::Create, E::CreateRequested, "Creating backup"),
            // === Create ===
            Transition::new(S::Create, S::Ready, E::Created, "Backup created"),
            Transition::new(
                S::Create,
                S::Upload,
                E::CreatedForUpload,
                "Backup created, starting upload",
            ),
            // === Download ===
            Transition::new(S::Download, S::Download, E::TransferProgressed, "Download running"),
            Transition::new(S::Download, S::Ready, E::Downloaded, "Download completed"),
            // === Upload ===
            Transition::new(S::Upload, S::Upload, E::TransferProgressed, "Upload running"),
            Transition::new(S::Upload, S::Ready, E::Uploaded, "Upload completed"),
            Transition::new(
                S::Upload,
                S::Ready,
                E::UploadRemoved,
                "Upload target removed during upload",
            ),
            // === Ready ===
            Transition::new(S::Ready, S::Ready, E::Verified, "Backup present"),
            Transition::new(
                S::Ready,
                S::Ready,
                E::UploadRemoved,
                "Upload target removed, remote copy left in place",
            ),
            Transition::new(S::Ready, S::Upload, E::UploadRequested, "Upload target added"),
            Transition::new(S::Ready, S::Deleted, E::BackupMissing, "Backup gone from database"),
            Transition::new(S::Ready, S::Deleted, E::DeletionRequested, "Backup object deleted"),
            // === Failed ===
            Transition::new(S::Failed, S::Scheduled, E::SpecChanged, "Restarting after spec change"),
            Transition::new(S::Failed, S::Deleted, E::DeletionRequested, "Failed backup deleted"),
        ];

        // Every active state retries in place or fails
        for state in [S::Scheduled, S::Create, S::Download, S::Upload, S::Ready] {
            transitions.push(Transition::new(
                state,
                state,
                E::TemporaryFailure,
                "Temporary failure, retrying",
            ));
            transitions.push(Transition::new(state, S::Failed, E::Failure, "Backup failed"));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: BackupState,
        event: BackupEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        match self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            Some(t) => match self.check_guard(t, ctx) {
                Some(reason) => TransitionResult::GuardFailed {
                    from: t.from,
                    to: t.to,
                    event,
                    reason,
                },
                None => TransitionResult::Success {
                    from: t.from,
                    to: t.to,
                    event,
                    description: t.description,
                },
            },
            None => TransitionResult::InvalidTransition { current, event },
        }
    }

    pub fn can_transition(&self, from: BackupState, event: BackupEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == from && t.event == event)
    }

    pub fn valid_events(&self, state: BackupState) -> Vec<BackupEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == state)
            .map(|t| t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            BackupEvent::SpecChanged if !ctx.spec_changed => {
                Some("Spec generation has not changed".to_string())
            }
            BackupEvent::UploadRequested if !ctx.upload_requested => {
                Some("No upload target in spec".to_string())
            }
            _ => None,
        }
    }
}

/// Outcome of one handler run
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: BackupStatus,
    /// `None` when the backup sits in a terminal state
    pub event: Option<BackupEvent>,
}

/// Label under which the database backup of an object is created
///
/// Derived from the object uid so a retried create finds the earlier attempt.
pub fn backup_label(backup: &ArangoBackup) -> String {
    backup
        .metadata
        .uid
        .clone()
        .unwrap_or_else(|| backup.name_any())
}

/// Run the handler of the current state and apply the resulting transition
pub async fn step(
    backup: &ArangoBackup,
    deployment: Option<&ArangoDeployment>,
    factory: &dyn ClientFactory,
    max_retries: u32,
    now: DateTime<Utc>,
) -> Result<StepOutcome> {
    let machine = BackupStateMachine::new();
    let current = backup.status.clone().unwrap_or_default();
    let state = current.state;

    let handled = match state {
        BackupState::None => Ok(Some(accept(current.clone()))),
        BackupState::Deleted => Ok(None),
        BackupState::Failed => Ok(restart_after_spec_change(backup, current.clone())),
        _ => handle_active(backup, deployment, factory, current.clone(), max_retries, &now)
            .await
            .map(Some),
    };

    let (event, mut status) = match handled {
        Ok(Some(result)) => result,
        Ok(None) => {
            return Ok(StepOutcome {
                status: current,
                event: None,
            });
        }
        Err(e) => route_error(current, &e, max_retries, &now),
    };

    // A restarted transfer job keeps the retry budget of the one that failed
    if !matches!(
        event,
        BackupEvent::TemporaryFailure | BackupEvent::Failure | BackupEvent::TransferProgressed
    ) {
        status.retry_count = 0;
        status.first_failure_time = None;
        status.message = None;
    }

    let ctx = TransitionContext::for_backup(backup);
    match machine.transition(state, event, &ctx) {
        TransitionResult::Success { to, description, .. } => {
            if to != state {
                info!(from = %state, to = %to, event = %event, "{}", description);
                status.time = Some(timestamp(&now));
            } else {
                debug!(state = %state, event = %event, "{}", description);
            }
            status.state = to;
            if to == BackupState::Failed || to == BackupState::Deleted {
                status.available = false;
                status.progress = None;
            }
            Ok(StepOutcome {
                status,
                event: Some(event),
            })
        }
        TransitionResult::InvalidTransition { current, event } => Err(Error::PermanentError(
            format!("event {} is not valid in backup state {}", event, current),
        )),
        TransitionResult::GuardFailed { reason, event, .. } => Err(Error::PermanentError(format!(
            "transition on {} refused: {}",
            event, reason
        ))),
    }
}

/// Status for a backup object whose deletion was requested
///
/// Returns `None` when the current state has no deletion transition.
pub fn deletion_status(backup: &ArangoBackup, now: &DateTime<Utc>) -> Option<BackupStatus> {
    let machine = BackupStateMachine::new();
    let mut status = backup.status.clone().unwrap_or_default();
    match machine.transition(
        status.state,
        BackupEvent::DeletionRequested,
        &TransitionContext::for_backup(backup),
    ) {
        TransitionResult::Success { to, .. } => {
            status.state = to;
            status.available = false;
            status.time = Some(timestamp(now));
            Some(status)
        }
        _ => None,
    }
}

/// Record a failure; temporary failures stay in place while retries remain
pub fn route_error(
    mut status: BackupStatus,
    error: &Error,
    max_retries: u32,
    now: &DateTime<Utc>,
) -> (BackupEvent, BackupStatus) {
    let ts = timestamp(now);
    status.last_failure_time = Some(ts.clone());
    if status.first_failure_time.is_none() {
        status.first_failure_time = Some(ts);
    }

    if error.is_temporary() {
        status.retry_count += 1;
        if status.retry_count <= max_retries {
            warn!(
                state = %status.state,
                retry_count = status.retry_count,
                error = %error,
                "Backup step failed temporarily"
            );
            status.message = Some(error.to_string());
            return (BackupEvent::TemporaryFailure, status);
        }
        status.message = Some(format!(
            "giving up after {} retries: {}",
            max_retries, error
        ));
    } else {
        status.message = Some(error.to_string());
    }

    warn!(state = %status.state, error = %error, "Backup failed");
    (BackupEvent::Failure, status)
}

fn accept(mut status: BackupStatus) -> (BackupEvent, BackupStatus) {
    status.available = false;
    (BackupEvent::Accepted, status)
}

fn restart_after_spec_change(
    backup: &ArangoBackup,
    status: BackupStatus,
) -> Option<(BackupEvent, BackupStatus)> {
    if !TransitionContext::for_backup(backup).spec_changed {
        return None;
    }
    info!(backup = %backup.name_any(), "Spec changed after failure, starting over");
    Some((
        BackupEvent::SpecChanged,
        BackupStatus {
            observed_generation: status.observed_generation,
            ..Default::default()
        },
    ))
}

async fn handle_active(
    backup: &ArangoBackup,
    deployment: Option<&ArangoDeployment>,
    factory: &dyn ClientFactory,
    status: BackupStatus,
    max_retries: u32,
    now: &DateTime<Utc>,
) -> Result<(BackupEvent, BackupStatus)> {
    let deployment = deployment.ok_or_else(|| {
        Error::NotFound(format!("ArangoDeployment {}", backup.spec.deployment.name))
    })?;

    if status.state == BackupState::Scheduled {
        let event = if backup.spec.download.is_some() {
            BackupEvent::DownloadRequested
        } else {
            BackupEvent::CreateRequested
        };
        return Ok((event, status));
    }

    let client = factory.backup_client(deployment).await?;
    match status.state {
        BackupState::Create => create(backup, client.as_ref(), status).await,
        BackupState::Download => download(backup, client.as_ref(), status, max_retries, now).await,
        BackupState::Upload => upload(backup, client.as_ref(), status, max_retries, now).await,
        BackupState::Ready => verify(backup, client.as_ref(), status).await,
        other => Err(Error::PermanentError(format!(
            "no handler for backup state {}",
            other
        ))),
    }
}

fn details_from(meta: &BackupMeta, previous: Option<&BackupDetails>) -> BackupDetails {
    BackupDetails {
        id: meta.id.clone(),
        version: meta.version.clone(),
        potentially_inconsistent: Some(meta.potentially_inconsistent),
        size_in_bytes: meta.size_in_bytes,
        number_of_dbservers: meta.number_of_dbservers,
        creation_timestamp: meta.datetime.clone(),
        uploaded: previous.and_then(|p| p.uploaded),
        downloaded: previous.and_then(|p| p.downloaded),
    }
}

fn running(job_id: String, percent: u8) -> Option<BackupProgress> {
    Some(BackupProgress {
        job_id,
        progress: format!("{}%", percent),
    })
}

async fn create(
    backup: &ArangoBackup,
    client: &dyn BackupClient,
    mut status: BackupStatus,
) -> Result<(BackupEvent, BackupStatus)> {
    let label = backup_label(backup);
    let meta = match client.find_backup(&label).await? {
        Some(existing) => {
            debug!(label = %label, id = %existing.id, "Found backup from earlier attempt");
            existing
        }
        None => {
            let options = backup.spec.options.clone().unwrap_or_default();
            client
                .create_backup(&CreateBackupRequest {
                    label,
                    timeout: options.timeout,
                    allow_inconsistent: options.allow_inconsistent.unwrap_or(false),
                })
                .await?
        }
    };

    info!(id = %meta.id, "Backup created");
    status.backup = Some(details_from(&meta, None));
    status.available = true;
    if backup.spec.upload.is_some() {
        Ok((BackupEvent::CreatedForUpload, status))
    } else {
        Ok((BackupEvent::Created, status))
    }
}

async fn download(
    backup: &ArangoBackup,
    client: &dyn BackupClient,
    mut status: BackupStatus,
    max_retries: u32,
    now: &DateTime<Utc>,
) -> Result<(BackupEvent, BackupStatus)> {
    let source = backup
        .spec
        .download
        .as_ref()
        .ok_or_else(|| Error::ValidationError("download target removed during download".to_string()))?;

    let Some(progress) = status.progress.clone() else {
        let target = TransferTarget {
            repository_url: source.repository_url.clone(),
            credentials_secret_name: source.credentials_secret_name.clone(),
        };
        let job_id = client.download_backup(&source.id, &target).await?;
        info!(id = %source.id, job = %job_id, "Download started");
        status.progress = running(job_id, 0);
        return Ok((BackupEvent::TransferProgressed, status));
    };

    match client.download_progress(&progress.job_id).await? {
        TransferProgress::Running { percent } => {
            status.progress = running(progress.job_id, percent);
            Ok((BackupEvent::TransferProgressed, status))
        }
        TransferProgress::Completed => {
            let meta = client.get_backup(&source.id).await?;
            let mut details = details_from(&meta, None);
            details.downloaded = Some(true);
            status.backup = Some(details);
            status.progress = None;
            status.available = true;
            Ok((BackupEvent::Downloaded, status))
        }
        TransferProgress::Failed { message } => {
            // Next attempt starts a new job
            status.progress = None;
            Ok(route_error(
                status,
                &Error::TransientError(format!("download failed: {}", message)),
                max_retries,
                now,
            ))
        }
    }
}

async fn upload(
    backup: &ArangoBackup,
    client: &dyn BackupClient,
    mut status: BackupStatus,
    max_retries: u32,
    now: &DateTime<Utc>,
) -> Result<(BackupEvent, BackupStatus)> {
    let Some(target) = backup.spec.upload.as_ref() else {
        status.progress = None;
        if let Some(details) = status.backup.as_mut() {
            details.uploaded = None;
        }
        return Ok((BackupEvent::UploadRemoved, status));
    };
    let id = status
        .backup
        .as_ref()
        .map(|b| b.id.clone())
        .ok_or_else(|| Error::PermanentError("no backup recorded to upload".to_string()))?;

    let Some(progress) = status.progress.clone() else {
        let target = TransferTarget {
            repository_url: target.repository_url.clone(),
            credentials_secret_name: target.credentials_secret_name.clone(),
        };
        let job_id = client.upload_backup(&id, &target).await?;
        info!(id = %id, job = %job_id, "Upload started");
        status.progress = running(job_id, 0);
        return Ok((BackupEvent::TransferProgressed, status));
    };

    match client.upload_progress(&progress.job_id).await? {
        TransferProgress::Running { percent } => {
            status.progress = running(progress.job_id, percent);
            Ok((BackupEvent::TransferProgressed, status))
        }
        TransferProgress::Completed => {
            if let Some(details) = status.backup.as_mut() {
                details.uploaded = Some(true);
            }
            status.progress = None;
            Ok((BackupEvent::Uploaded, status))
        }
        TransferProgress::Failed { message } => {
            status.progress = None;
            Ok(route_error(
                status,
                &Error::TransientError(format!("upload failed: {}", message)),
                max_retries,
                now,
            ))
        }
    }
}

async fn verify(
    backup: &ArangoBackup,
    client: &dyn BackupClient,
    mut status: BackupStatus,
) -> Result<(BackupEvent, BackupStatus)> {
    let id = status
        .backup
        .as_ref()
        .map(|b| b.id.clone())
        .ok_or_else(|| Error::PermanentError("ready backup has no id".to_string()))?;

    let meta = match client.get_backup(&id).await {
        Ok(meta) => meta,
        Err(e) if e.is_not_found() => {
            info!(id = %id, "Backup no longer exists in database");
            status.available = false;
            return Ok((BackupEvent::BackupMissing, status));
        }
        Err(e) => return Err(e.into()),
    };

    let details = details_from(&meta, status.backup.as_ref());
    let uploaded = details.uploaded == Some(true);
    status.backup = Some(details);

    if backup.spec.upload.is_some() && !uploaded {
        return Ok((BackupEvent::UploadRequested, status));
    }
    if backup.spec.upload.is_none() && uploaded {
        if let Some(details) = status.backup.as_mut() {
            details.uploaded = None;
        }
        return Ok((BackupEvent::UploadRemoved, status));
    }
    Ok((BackupEvent::Verified, status))
}
