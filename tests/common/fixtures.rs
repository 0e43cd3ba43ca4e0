//! Test fixtures for ArangoDeployment and ArangoBackup resources
//!
//! Deployments built here have authentication and TLS disabled unless a test
//! asks for them, so no secrets need to exist up front.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let deployment = DeploymentBuilder::cluster("db", "default")
//!     .with_count(ServerGroup::DbServers, 3)
//!     .build();
//! let status = ready_cluster_status(3, 3, 3);
//! let observed = converged_observed(&deployment.spec, &status);
//! ```
//!
//! The reconciliation core only talks to the outside world through traits,
//! so the fakes below stand in for the orchestration platform, the status
//! subresource and the ArangoDB administrative API.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::{ErrorResponse, ObjectMeta};

use arango_operator::arangod::{
    ArangoError, ArangoResult, BackupClient, BackupMeta, ClientFactory, CreateBackupRequest,
    MemberClient, TransferProgress, TransferTarget,
};
use arango_operator::controller::features::discover_image;
use arango_operator::controller::observed::{
    ObservedMember, ObservedPod, ObservedState, ObservedVolume,
};
use arango_operator::controller::plan_builder::member_id;
use arango_operator::controller::{Error, Platform, Result, StatusWriter};
use arango_operator::crd::{
    ArangoBackup, ArangoDeployment, BackupDownload, BackupSpec, BackupState, BackupStatus,
    BackupUpload, Condition, ConditionType, DeploymentMode, DeploymentRef, DeploymentSpec,
    DeploymentStatus, ImageInfo, MemberPhase, MemberStatus, SECRET_NAME_NONE, ServerGroup,
};
use arango_operator::resources::pod::template_hash;
use arango_operator::resources::pvc::{DEFAULT_VOLUME_SIZE, parse_quantity};

pub const TEST_UID: &str = "6f1c2a8e-3b4d-4e5f-9a0b-1c2d3e4f5a6b";
pub const TEST_IMAGE: &str = "arangodb/arangodb:3.7.10";
pub const ENTERPRISE_IMAGE: &str = "arangodb/enterprise:3.7.10";

/// Fixed clock used by all tests
pub fn test_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn image_info(image: &str) -> ImageInfo {
    discover_image(image).unwrap()
}

// =============================================================================
// ArangoDeployment
// =============================================================================

pub struct DeploymentBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    spec: DeploymentSpec,
    status: Option<DeploymentStatus>,
}

impl DeploymentBuilder {
    pub fn new(name: &str, namespace: &str, mode: DeploymentMode) -> Self {
        let mut spec = DeploymentSpec {
            mode: Some(mode),
            image: Some(TEST_IMAGE.to_string()),
            ..Default::default()
        };
        spec.authentication.jwt_secret_name = Some(SECRET_NAME_NONE.to_string());
        spec.tls.ca_secret_name = Some(SECRET_NAME_NONE.to_string());

        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(TEST_UID.to_string()),
            generation: Some(1),
            spec,
            status: None,
        }
    }

    pub fn cluster(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace, DeploymentMode::Cluster)
    }

    pub fn single(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace, DeploymentMode::Single)
    }

    pub fn active_failover(name: &str, namespace: &str) -> Self {
        Self::new(name, namespace, DeploymentMode::ActiveFailover)
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.spec.image = Some(image.to_string());
        self
    }

    pub fn with_count(mut self, group: ServerGroup, count: i32) -> Self {
        self.group_mut(group).count = Some(count);
        self
    }

    pub fn with_min_count(mut self, group: ServerGroup, min: i32) -> Self {
        self.group_mut(group).min_count = Some(min);
        self
    }

    pub fn with_volume_size(mut self, group: ServerGroup, size: &str) -> Self {
        self.group_mut(group).volume_size = Some(size.to_string());
        self
    }

    pub fn with_args(mut self, group: ServerGroup, args: &[&str]) -> Self {
        self.group_mut(group).args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Authenticate with the default JWT secret name `<name>-jwt`
    pub fn with_authentication(mut self) -> Self {
        self.spec.authentication.jwt_secret_name = None;
        self
    }

    /// Enable TLS with the default CA secret name `<name>-ca`
    pub fn with_tls(mut self, ttl: &str) -> Self {
        self.spec.tls.ca_secret_name = None;
        self.spec.tls.ttl = Some(ttl.to_string());
        self
    }

    pub fn with_password_secret(mut self, user: &str, secret: &str) -> Self {
        self.spec
            .bootstrap
            .password_secret_names
            .insert(user.to_string(), secret.to_string());
        self
    }

    pub fn with_sync(mut self) -> Self {
        self.spec.sync.enabled = Some(true);
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn with_status(mut self, status: DeploymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn group_mut(&mut self, group: ServerGroup) -> &mut arango_operator::crd::ServerGroupSpec {
        match group {
            ServerGroup::Single => &mut self.spec.single,
            ServerGroup::Agents => &mut self.spec.agents,
            ServerGroup::DbServers => &mut self.spec.dbservers,
            ServerGroup::Coordinators => &mut self.spec.coordinators,
            ServerGroup::SyncMasters => &mut self.spec.syncmasters,
            ServerGroup::SyncWorkers => &mut self.spec.syncworkers,
        }
    }

    pub fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    pub fn build(self) -> ArangoDeployment {
        let mut deployment = ArangoDeployment::new(&self.name, self.spec);
        deployment.metadata = ObjectMeta {
            name: Some(self.name),
            namespace: Some(self.namespace),
            uid: self.uid,
            generation: self.generation,
            ..Default::default()
        };
        deployment.status = self.status;
        deployment
    }
}

// =============================================================================
// Member status
// =============================================================================

pub fn ready_condition(ready: bool) -> Condition {
    Condition {
        type_: ConditionType::Ready,
        status: ready,
        reason: Some(if ready { "PodReady" } else { "PodNotReady" }.to_string()),
        message: None,
        last_update_time: Some("2024-05-01T11:00:00Z".to_string()),
        last_transition_time: Some("2024-05-01T11:00:00Z".to_string()),
    }
}

/// An initialized member whose pod is ready
pub fn ready_member(id: &str) -> MemberStatus {
    MemberStatus {
        id: id.to_string(),
        phase: MemberPhase::Created,
        created_at: "2024-05-01T10:00:00Z".to_string(),
        initialized: true,
        conditions: vec![ready_condition(true)],
        ..Default::default()
    }
}

/// A member that was added but never became ready
pub fn pending_member(id: &str) -> MemberStatus {
    MemberStatus {
        id: id.to_string(),
        phase: MemberPhase::None,
        created_at: "2024-05-01T11:00:00Z".to_string(),
        ..Default::default()
    }
}

pub fn member_with_phase(id: &str, phase: MemberPhase) -> MemberStatus {
    MemberStatus {
        phase,
        ..ready_member(id)
    }
}

pub fn status_with(members: Vec<(ServerGroup, MemberStatus)>) -> DeploymentStatus {
    let mut status = DeploymentStatus::default();
    for (group, member) in members {
        status.members.group_mut(group).push(member);
    }
    status
}

/// Ids a deployment with [`TEST_UID`] gives its first members
pub fn member_ids(group: ServerGroup, count: u32) -> Vec<String> {
    (0..count).map(|i| member_id(TEST_UID, group, i)).collect()
}

/// Cluster status with the given number of ready members per group
pub fn ready_cluster_status(agents: u32, dbservers: u32, coordinators: u32) -> DeploymentStatus {
    let mut members = Vec::new();
    for (group, count) in [
        (ServerGroup::Agents, agents),
        (ServerGroup::DbServers, dbservers),
        (ServerGroup::Coordinators, coordinators),
    ] {
        for id in member_ids(group, count) {
            members.push((group, ready_member(&id)));
        }
    }
    status_with(members)
}

/// Observed state matching the status exactly: every member has an up to
/// date pod (ready when the member is) and a volume of the requested size
pub fn converged_observed(spec: &DeploymentSpec, status: &DeploymentStatus) -> ObservedState {
    let image = image_info(spec.image());
    let mut observed = ObservedState {
        deployment_name: "db".to_string(),
        deployment_uid: TEST_UID.to_string(),
        now: test_now(),
        ..Default::default()
    };

    for (group, member) in status.members.iter() {
        let pod = ObservedPod {
            name: format!("db-{}-{}", group.role(), member.id.to_lowercase()),
            ready: member.is_ready(),
            image: Some(image.image.clone()),
            template_hash: Some(template_hash(spec, group, member, &image)),
            ..Default::default()
        };
        let volume = group.has_volume().then(|| {
            let size = spec
                .group_spec(group)
                .volume_size
                .clone()
                .unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string());
            ObservedVolume {
                name: pod.name.clone(),
                size_bytes: parse_quantity(&size),
            }
        });
        observed.members.insert(
            member.id.clone(),
            ObservedMember {
                pod: Some(pod),
                volume,
                tls_expires_at: None,
            },
        );
    }
    observed
}

// =============================================================================
// ArangoBackup
// =============================================================================

pub struct BackupBuilder {
    name: String,
    namespace: String,
    uid: Option<String>,
    generation: Option<i64>,
    spec: BackupSpec,
    status: Option<BackupStatus>,
}

impl BackupBuilder {
    pub fn new(name: &str, namespace: &str, deployment: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            uid: Some(format!("backup-uid-{}", name)),
            generation: Some(1),
            spec: BackupSpec {
                deployment: DeploymentRef {
                    name: deployment.to_string(),
                },
                ..Default::default()
            },
            status: None,
        }
    }

    pub fn with_upload(mut self, repository_url: &str) -> Self {
        self.spec.upload = Some(BackupUpload {
            repository_url: repository_url.to_string(),
            credentials_secret_name: Some("backup-credentials".to_string()),
        });
        self
    }

    pub fn with_download(mut self, repository_url: &str, id: &str) -> Self {
        self.spec.download = Some(BackupDownload {
            repository_url: repository_url.to_string(),
            credentials_secret_name: Some("backup-credentials".to_string()),
            id: id.to_string(),
        });
        self
    }

    pub fn with_state(mut self, state: BackupState) -> Self {
        let mut status = self.status.unwrap_or_default();
        status.state = state;
        status.observed_generation = self.generation;
        self.status = Some(status);
        self
    }

    pub fn with_status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_generation(mut self, generation: i64) -> Self {
        self.generation = Some(generation);
        self
    }

    pub fn build(self) -> ArangoBackup {
        let mut backup = ArangoBackup::new(&self.name, self.spec);
        backup.metadata = ObjectMeta {
            name: Some(self.name),
            namespace: Some(self.namespace),
            uid: self.uid,
            generation: self.generation,
            ..Default::default()
        };
        backup.status = self.status;
        backup
    }
}

pub fn backup_meta(id: &str) -> BackupMeta {
    BackupMeta {
        id: id.to_string(),
        version: "3.7.10".to_string(),
        datetime: "2024-05-01T12:00:00Z".to_string(),
        size_in_bytes: Some(1024),
        number_of_dbservers: Some(3),
        potentially_inconsistent: false,
    }
}

// =============================================================================
// Errors
// =============================================================================

pub fn api_error(code: u16) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "test".to_string(),
        reason: "Test".to_string(),
        code,
    }))
}

pub fn conflict_error() -> Error {
    api_error(409)
}

pub fn arango_unavailable() -> ArangoError {
    ArangoError::Response {
        code: 503,
        error_num: 503,
        message: "service unavailable".to_string(),
    }
}

pub fn arango_unauthorized() -> ArangoError {
    ArangoError::Response {
        code: 401,
        error_num: 11,
        message: "not authorized".to_string(),
    }
}

pub fn backup_not_found() -> ArangoError {
    ArangoError::Response {
        code: 404,
        error_num: 7008,
        message: "backup not found".to_string(),
    }
}

// =============================================================================
// Platform fake
// =============================================================================

fn matches_selector(labels: &BTreeMap<String, String>, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(term),
        })
}

pub fn secret(name: &str, key: &str, value: &str) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            key.to_string(),
            ByteString(value.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

pub fn annotated_secret(name: &str, annotations: &[(&str, &str)]) -> Secret {
    let mut secret = secret(name, "tls.keyfile", "certificate");
    secret.metadata.annotations = Some(
        annotations
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    );
    secret
}

/// Namespace of pods, volume claims and secrets kept in memory
///
/// Deletes take effect immediately. New pods start not ready; tests flip
/// them with [`FakePlatform::set_pod_ready`].
#[derive(Default)]
pub struct FakePlatform {
    pods: Mutex<BTreeMap<String, Pod>>,
    pvcs: Mutex<BTreeMap<String, PersistentVolumeClaim>>,
    secrets: Mutex<BTreeMap<String, Secret>>,
    pub deleted_pods: Mutex<Vec<String>>,
    pub resized: Mutex<Vec<(String, String)>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().cloned().collect()
    }

    pub fn pvc_names(&self) -> Vec<String> {
        self.pvcs.lock().unwrap().keys().cloned().collect()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.pods.lock().unwrap().get(name).cloned()
    }

    pub fn pvc(&self, name: &str) -> Option<PersistentVolumeClaim> {
        self.pvcs.lock().unwrap().get(name).cloned()
    }

    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.secrets.lock().unwrap().get(name).cloned()
    }

    pub fn insert_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod.name_any(), pod);
    }

    pub fn insert_pvc(&self, pvc: PersistentVolumeClaim) {
        self.pvcs.lock().unwrap().insert(pvc.name_any(), pvc);
    }

    pub fn insert_secret(&self, secret: Secret) {
        self.secrets.lock().unwrap().insert(secret.name_any(), secret);
    }

    pub fn set_pod_ready(&self, name: &str, ready: bool) {
        if let Some(pod) = self.pods.lock().unwrap().get_mut(name) {
            pod.status = Some(PodStatus {
                phase: Some("Running".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            });
        }
    }

    pub fn set_all_pods_ready(&self) {
        for name in self.pod_names() {
            self.set_pod_ready(&name, true);
        }
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pod(name))
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        self.pods
            .lock()
            .unwrap()
            .entry(pod.name_any())
            .or_insert_with(|| pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        if self.pods.lock().unwrap().remove(name).is_some() {
            self.deleted_pods.lock().unwrap().push(name.to_string());
        }
        Ok(())
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| matches_selector(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvc(name))
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.pvcs
            .lock()
            .unwrap()
            .entry(pvc.name_any())
            .or_insert_with(|| pvc.clone());
        Ok(())
    }

    async fn resize_pvc(&self, name: &str, size: &str) -> Result<()> {
        let mut pvcs = self.pvcs.lock().unwrap();
        let pvc = pvcs
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("pvc {}", name)))?;
        if let Some(requests) = pvc
            .spec
            .as_mut()
            .and_then(|s| s.resources.as_mut())
            .and_then(|r| r.requests.as_mut())
        {
            requests.insert("storage".to_string(), Quantity(size.to_string()));
        }
        self.resized
            .lock()
            .unwrap()
            .push((name.to_string(), size.to_string()));
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        self.pvcs.lock().unwrap().remove(name);
        Ok(())
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        Ok(self
            .pvcs
            .lock()
            .unwrap()
            .values()
            .filter(|p| matches_selector(p.labels(), selector))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.secret(name))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        // The API server folds stringData into data
        let mut stored = secret.clone();
        if let Some(string_data) = stored.string_data.take() {
            let data = stored.data.get_or_insert_with(BTreeMap::new);
            for (key, value) in string_data {
                data.insert(key, ByteString(value.into_bytes()));
            }
        }
        self.secrets
            .lock()
            .unwrap()
            .entry(stored.name_any())
            .or_insert(stored);
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        self.secrets.lock().unwrap().remove(name);
        Ok(())
    }
}

// =============================================================================
// Status writer fake
// =============================================================================

/// Records every written status, optionally failing with a conflict
#[derive(Default)]
pub struct RecordingStatusWriter {
    pub writes: Vec<DeploymentStatus>,
    /// Number of writes that succeed before every further write conflicts
    pub conflict_after: Option<usize>,
}

impl RecordingStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conflicting_after(writes: usize) -> Self {
        Self {
            writes: Vec::new(),
            conflict_after: Some(writes),
        }
    }

    pub fn last(&self) -> Option<&DeploymentStatus> {
        self.writes.last()
    }
}

#[async_trait]
impl StatusWriter for RecordingStatusWriter {
    async fn write(&mut self, status: &DeploymentStatus) -> Result<()> {
        if self.conflict_after.is_some_and(|n| self.writes.len() >= n) {
            return Err(conflict_error());
        }
        self.writes.push(status.clone());
        Ok(())
    }
}

// =============================================================================
// ArangoDB client fakes
// =============================================================================

/// Member administration calls, recorded as "<call> <member>"
#[derive(Default)]
pub struct FakeMemberClient {
    calls: Mutex<Vec<String>>,
    failures: Mutex<VecDeque<ArangoError>>,
    pub cleaned_out: AtomicBool,
}

impl FakeMemberClient {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Fail the next call with the given error
    pub fn fail_next(&self, error: ArangoError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn record(&self, call: String) -> ArangoResult<()> {
        self.calls.lock().unwrap().push(call);
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MemberClient for FakeMemberClient {
    async fn clean_out_server(&self, member_id: &str) -> ArangoResult<()> {
        self.record(format!("clean_out {}", member_id))
    }

    async fn is_cleaned_out(&self, member_id: &str) -> ArangoResult<bool> {
        self.record(format!("is_cleaned_out {}", member_id))?;
        Ok(self.cleaned_out.load(Ordering::SeqCst))
    }

    async fn shutdown_member(&self, _group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        self.record(format!("shutdown {}", member_id))
    }

    async fn remove_server(&self, member_id: &str) -> ArangoResult<()> {
        self.record(format!("remove_server {}", member_id))
    }

    async fn refresh_jwt(&self, _group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        self.record(format!("refresh_jwt {}", member_id))
    }

    async fn refresh_tls(&self, _group: ServerGroup, member_id: &str) -> ArangoResult<()> {
        self.record(format!("refresh_tls {}", member_id))
    }

    async fn set_user_password(&self, user: &str, _password: &str) -> ArangoResult<()> {
        self.record(format!("set_password {}", user))
    }
}

struct Job {
    backup_id: String,
    script: VecDeque<TransferProgress>,
}

/// Hot backups kept in memory
///
/// Transfer jobs report the scripted progress one poll at a time and then
/// `Completed`. A finished download makes the backup exist locally.
#[derive(Default)]
pub struct FakeBackupClient {
    backups: Mutex<BTreeMap<String, BackupMeta>>,
    labels: Mutex<BTreeMap<String, String>>,
    jobs: Mutex<BTreeMap<String, Job>>,
    next_script: Mutex<VecDeque<TransferProgress>>,
    failures: Mutex<VecDeque<ArangoError>>,
    next_job: AtomicU32,
    pub creates: AtomicU32,
}

impl FakeBackupClient {
    pub fn insert_backup(&self, meta: BackupMeta) {
        self.backups.lock().unwrap().insert(meta.id.clone(), meta);
    }

    pub fn remove_backup(&self, id: &str) {
        self.backups.lock().unwrap().remove(id);
    }

    pub fn has_backup(&self, id: &str) -> bool {
        self.backups.lock().unwrap().contains_key(id)
    }

    pub fn create_count(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    /// Progress the next started job reports before completing
    pub fn script_next_job(&self, progress: Vec<TransferProgress>) {
        *self.next_script.lock().unwrap() = progress.into();
    }

    pub fn fail_next(&self, error: ArangoError) {
        self.failures.lock().unwrap().push_back(error);
    }

    fn check(&self) -> ArangoResult<()> {
        match self.failures.lock().unwrap().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn start_job(&self, kind: &str, backup_id: &str) -> String {
        let job_id = format!("{}-{}", kind, self.next_job.fetch_add(1, Ordering::SeqCst));
        let script = std::mem::take(&mut *self.next_script.lock().unwrap());
        self.jobs.lock().unwrap().insert(
            job_id.clone(),
            Job {
                backup_id: backup_id.to_string(),
                script,
            },
        );
        job_id
    }

    fn poll_job(&self, job_id: &str) -> ArangoResult<(String, TransferProgress)> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs.get_mut(job_id).ok_or_else(|| ArangoError::Response {
            code: 404,
            error_num: 1202,
            message: format!("job {} not found", job_id),
        })?;
        let progress = job
            .script
            .pop_front()
            .unwrap_or(TransferProgress::Completed);
        Ok((job.backup_id.clone(), progress))
    }
}

#[async_trait]
impl BackupClient for FakeBackupClient {
    async fn get_backup(&self, id: &str) -> ArangoResult<BackupMeta> {
        self.check()?;
        self.backups
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(backup_not_found)
    }

    async fn find_backup(&self, label: &str) -> ArangoResult<Option<BackupMeta>> {
        self.check()?;
        let id = self.labels.lock().unwrap().get(label).cloned();
        Ok(id.and_then(|id| self.backups.lock().unwrap().get(&id).cloned()))
    }

    async fn create_backup(&self, request: &CreateBackupRequest) -> ArangoResult<BackupMeta> {
        self.check()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let meta = backup_meta(&format!("2024-05-01T12.00.00Z_{}", request.label));
        self.labels
            .lock()
            .unwrap()
            .insert(request.label.clone(), meta.id.clone());
        self.insert_backup(meta.clone());
        Ok(meta)
    }

    async fn upload_backup(&self, id: &str, _target: &TransferTarget) -> ArangoResult<String> {
        self.check()?;
        if !self.has_backup(id) {
            return Err(backup_not_found());
        }
        Ok(self.start_job("upload", id))
    }

    async fn download_backup(&self, id: &str, _source: &TransferTarget) -> ArangoResult<String> {
        self.check()?;
        Ok(self.start_job("download", id))
    }

    async fn upload_progress(&self, job_id: &str) -> ArangoResult<TransferProgress> {
        self.check()?;
        Ok(self.poll_job(job_id)?.1)
    }

    async fn download_progress(&self, job_id: &str) -> ArangoResult<TransferProgress> {
        self.check()?;
        let (backup_id, progress) = self.poll_job(job_id)?;
        if progress == TransferProgress::Completed && !self.has_backup(&backup_id) {
            self.insert_backup(backup_meta(&backup_id));
        }
        Ok(progress)
    }

    async fn delete_backup(&self, id: &str) -> ArangoResult<()> {
        self.check()?;
        match self.backups.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(backup_not_found()),
        }
    }
}

/// Hands out the shared fakes; `unreachable` makes every client lookup fail
#[derive(Default)]
pub struct FakeClientFactory {
    pub members: Arc<FakeMemberClient>,
    pub backups: Arc<FakeBackupClient>,
    pub unreachable: AtomicBool,
}

impl FakeClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn reachable(&self) -> ArangoResult<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ArangoError::Connection("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ClientFactory for FakeClientFactory {
    async fn member_client(
        &self,
        _deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn MemberClient>> {
        self.reachable()?;
        let client: Arc<dyn MemberClient> = self.members.clone();
        Ok(client)
    }

    async fn backup_client(
        &self,
        _deployment: &ArangoDeployment,
    ) -> ArangoResult<Arc<dyn BackupClient>> {
        self.reachable()?;
        let client: Arc<dyn BackupClient> = self.backups.clone();
        Ok(client)
    }
}
