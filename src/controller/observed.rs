//! Snapshot of the platform objects belonging to a deployment
//!
//! The snapshot is taken once per reconciliation pass and handed to the
//! member status tracker and the plan builder, which never do I/O themselves.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use crate::controller::error::Result;
use crate::controller::platform::Platform;
use crate::crd::{ArangoDeployment, DeploymentStatus, SecretHashes, ServerGroup};
use crate::resources::common::{
    ANNOTATION_TEMPLATE_HASH, ANNOTATION_TLS_EXPIRES_AT, LABEL_MEMBER_ID, LABEL_ROLE,
    deployment_selector, member_tls_secret_name,
};
use crate::resources::pvc::requested_bytes;
use crate::resources::secret::hash_secret;

/// Main container of a member pod
const SERVER_CONTAINER: &str = "server";

/// What the platform reports about a member pod
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedPod {
    pub name: String,
    pub ready: bool,
    /// The server container exited and will not be restarted
    pub terminated: bool,
    /// Deletion was requested and the pod is shutting down
    pub terminating: bool,
    /// RFC3339 time the server container last exited
    pub last_termination_at: Option<String>,
    pub template_hash: Option<String>,
    pub image: Option<String>,
}

impl ObservedPod {
    pub fn from_pod(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = status.and_then(|s| s.phase.as_deref());

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| {
                conds
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            })
            .unwrap_or(false);

        let server = status
            .and_then(|s| s.container_statuses.as_ref())
            .and_then(|cs| cs.iter().find(|c| c.name == SERVER_CONTAINER));

        let current_termination = server
            .and_then(|c| c.state.as_ref())
            .and_then(|s| s.terminated.as_ref());
        let last_termination = server
            .and_then(|c| c.last_state.as_ref())
            .and_then(|s| s.terminated.as_ref());

        let last_termination_at = current_termination
            .or(last_termination)
            .and_then(|t| t.finished_at.as_ref())
            .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true));

        let terminated = matches!(phase, Some("Failed") | Some("Succeeded"))
            || current_termination.is_some();

        Self {
            name: pod.name_any(),
            ready: ready && !terminated,
            terminated,
            terminating: pod.metadata.deletion_timestamp.is_some(),
            last_termination_at,
            template_hash: pod.annotations().get(ANNOTATION_TEMPLATE_HASH).cloned(),
            image: pod
                .spec
                .as_ref()
                .and_then(|s| s.containers.iter().find(|c| c.name == SERVER_CONTAINER))
                .and_then(|c| c.image.clone()),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedVolume {
    pub name: String,
    pub size_bytes: Option<u64>,
}

impl ObservedVolume {
    pub fn from_pvc(pvc: &PersistentVolumeClaim) -> Self {
        Self {
            name: pvc.name_any(),
            size_bytes: requested_bytes(pvc),
        }
    }
}

/// Platform objects of one member
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedMember {
    pub pod: Option<ObservedPod>,
    pub volume: Option<ObservedVolume>,
    /// Expiry of the member certificate, when TLS is enabled
    pub tls_expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrphanKind {
    Pod,
    Volume,
}

impl OrphanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrphanKind::Pod => "pod",
            OrphanKind::Volume => "volume",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pod" => Some(OrphanKind::Pod),
            "volume" => Some(OrphanKind::Volume),
            _ => None,
        }
    }
}

/// A labelled object that belongs to no member
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Orphan {
    pub kind: OrphanKind,
    pub name: String,
    pub group: Option<ServerGroup>,
}

/// Everything the plan builder knows about the live deployment
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ObservedState {
    pub deployment_name: String,
    pub deployment_uid: String,
    pub now: DateTime<Utc>,
    /// Keyed by member id
    pub members: BTreeMap<String, ObservedMember>,
    pub orphans: Vec<Orphan>,
    /// Digests of the secrets as they are now
    pub secret_hashes: SecretHashes,
}

impl ObservedState {
    pub fn member(&self, id: &str) -> Option<&ObservedMember> {
        self.members.get(id)
    }

    pub fn pod(&self, id: &str) -> Option<&ObservedPod> {
        self.members.get(id).and_then(|m| m.pod.as_ref())
    }
}

fn member_of(labels: &BTreeMap<String, String>) -> (Option<String>, Option<ServerGroup>) {
    (
        labels.get(LABEL_MEMBER_ID).cloned(),
        labels.get(LABEL_ROLE).and_then(|r| ServerGroup::from_role(r)),
    )
}

async fn secret_hash(platform: &dyn Platform, name: &str) -> Result<Option<String>> {
    Ok(platform.get_secret(name).await?.map(|s| hash_secret(&s)))
}

/// Read the pods, volumes and secrets of a deployment
pub async fn collect(
    platform: &dyn Platform,
    deployment: &ArangoDeployment,
    status: &DeploymentStatus,
    now: DateTime<Utc>,
) -> Result<ObservedState> {
    let name = deployment.name_any();
    let spec = &deployment.spec;
    let selector = deployment_selector(&name);

    let mut observed = ObservedState {
        deployment_name: name.clone(),
        deployment_uid: deployment.metadata.uid.clone().unwrap_or_default(),
        now,
        ..Default::default()
    };

    for (_, member) in status.members.iter() {
        observed.members.insert(member.id.clone(), ObservedMember::default());
    }

    for pod in platform.list_pods(&selector).await? {
        let (id, group) = member_of(pod.labels());
        match id.and_then(|id| observed.members.get_mut(&id)) {
            Some(entry) => entry.pod = Some(ObservedPod::from_pod(&pod)),
            None if pod.metadata.deletion_timestamp.is_none() => observed.orphans.push(Orphan {
                kind: OrphanKind::Pod,
                name: pod.name_any(),
                group,
            }),
            None => {}
        }
    }

    for pvc in platform.list_pvcs(&selector).await? {
        let (id, group) = member_of(pvc.labels());
        match id.and_then(|id| observed.members.get_mut(&id)) {
            Some(entry) => entry.volume = Some(ObservedVolume::from_pvc(&pvc)),
            None if pvc.metadata.deletion_timestamp.is_none() => observed.orphans.push(Orphan {
                kind: OrphanKind::Volume,
                name: pvc.name_any(),
                group,
            }),
            None => {}
        }
    }
    observed.orphans.sort();

    if spec.is_secure() {
        for (group, member) in status.members.iter() {
            let secret_name = member_tls_secret_name(&name, group, &member.id);
            let expires_at = platform
                .get_secret(&secret_name)
                .await?
                .and_then(|s| s.annotations().get(ANNOTATION_TLS_EXPIRES_AT).cloned())
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc));
            if let Some(entry) = observed.members.get_mut(&member.id) {
                entry.tls_expires_at = expires_at;
            }
        }
    }

    if let Some(jwt) = spec.jwt_secret_name(&name) {
        observed.secret_hashes.auth_jwt = secret_hash(platform, &jwt).await?;
    }
    if let Some(ca) = spec.tls_ca_secret_name(&name) {
        observed.secret_hashes.tls_ca = secret_hash(platform, &ca).await?;
    }
    for (user, secret_name) in &spec.bootstrap.password_secret_names {
        if let Some(hash) = secret_hash(platform, secret_name).await? {
            observed.secret_hashes.users.insert(user.clone(), hash);
        }
    }

    Ok(observed)
}
