use std::collections::BTreeMap;
use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeploymentSpec, ServerGroup};

/// Number of termination timestamps kept per member
pub const MAX_RECENT_TERMINATIONS: usize = 10;

/// Status of an ArangoDeployment, owned by the operator
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    #[serde(default)]
    pub phase: DeploymentPhase,

    #[serde(default)]
    pub members: DeploymentMembers,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Actions still to run from the plan being executed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<Action>,

    /// Last spec that passed validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_spec: Option<DeploymentSpec>,

    #[serde(default)]
    pub secret_hashes: SecretHashes,

    /// Images whose ArangoDB version has been discovered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageInfo>,

    /// Image the members currently run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_image: Option<ImageInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Consecutive temporary failures of the reconciliation
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Running,
    Failed,
}

impl fmt::Display for DeploymentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentPhase::None => write!(f, "None"),
            DeploymentPhase::Running => write!(f, "Running"),
            DeploymentPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Members per server group, each list in creation order
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMembers {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub single: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dbservers: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinators: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syncmasters: Vec<MemberStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub syncworkers: Vec<MemberStatus>,
}

impl DeploymentMembers {
    pub fn group(&self, group: ServerGroup) -> &[MemberStatus] {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DbServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    pub fn group_mut(&mut self, group: ServerGroup) -> &mut Vec<MemberStatus> {
        match group {
            ServerGroup::Single => &mut self.single,
            ServerGroup::Agents => &mut self.agents,
            ServerGroup::DbServers => &mut self.dbservers,
            ServerGroup::Coordinators => &mut self.coordinators,
            ServerGroup::SyncMasters => &mut self.syncmasters,
            ServerGroup::SyncWorkers => &mut self.syncworkers,
        }
    }

    /// All members in role priority order, then by id
    pub fn iter(&self) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> {
        ServerGroup::ALL.into_iter().flat_map(move |group| {
            let mut members: Vec<&MemberStatus> = self.group(group).iter().collect();
            members.sort_by(|a, b| a.id.cmp(&b.id));
            members.into_iter().map(move |m| (group, m))
        })
    }

    pub fn find(&self, id: &str) -> Option<(ServerGroup, &MemberStatus)> {
        self.iter().find(|(_, m)| m.id == id)
    }

    pub fn find_mut(&mut self, group: ServerGroup, id: &str) -> Option<&mut MemberStatus> {
        self.group_mut(group).iter_mut().find(|m| m.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    pub fn len(&self) -> usize {
        ServerGroup::ALL.iter().map(|g| self.group(*g).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle state of a single member
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    pub id: String,

    #[serde(default)]
    pub phase: MemberPhase,

    /// RFC3339 creation time of the member entry
    #[serde(default)]
    pub created_at: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    /// Set once the member has joined the cluster and served traffic
    #[serde(default)]
    pub initialized: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImageInfo>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// RFC3339 times of recent container terminations, oldest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recent_terminations: Vec<String>,

    /// Sidecar container name to image override
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub side_car_specs: BTreeMap<String, String>,
}

impl MemberStatus {
    pub fn is_ready(&self) -> bool {
        condition_is_true(&self.conditions, ConditionType::Ready)
    }

    /// Members on their way out of the cluster
    pub fn is_leaving(&self) -> bool {
        matches!(
            self.phase,
            MemberPhase::CleaningOut | MemberPhase::CleanedOut | MemberPhase::ShutDown
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum MemberPhase {
    #[default]
    #[serde(rename = "")]
    None,
    Created,
    Failed,
    CleaningOut,
    CleanedOut,
    ShutDown,
    Rotating,
    Upgrading,
}

impl fmt::Display for MemberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberPhase::None => "None",
            MemberPhase::Created => "Created",
            MemberPhase::Failed => "Failed",
            MemberPhase::CleaningOut => "CleaningOut",
            MemberPhase::CleanedOut => "CleanedOut",
            MemberPhase::ShutDown => "ShutDown",
            MemberPhase::Rotating => "Rotating",
            MemberPhase::Upgrading => "Upgrading",
        };
        f.write_str(s)
    }
}

/// A named boolean fact with transition history
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ConditionType {
    /// Member pod is running and ready
    Ready,
    /// Member pod terminated
    Terminated,
    /// Deployment or member can not make progress without intervention
    Failed,
    /// Member has been cleaned out of the cluster
    CleanedOut,
    /// Plan is empty, deployment matches its spec
    UpToDate,
    ScaleUpInProgress,
    ScaleDownInProgress,
    RotationInProgress,
    /// A security rotation was required but the version does not support it
    SecurityRotationBlocked,
    /// Spec was rejected as invalid or as an unsafe change
    SpecInvalid,
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn condition_is_true(conditions: &[Condition], type_: ConditionType) -> bool {
    conditions.iter().any(|c| c.type_ == type_ && c.status)
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// One idempotent step of a plan
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Stable id derived from the action content
    pub id: String,

    #[serde(rename = "type")]
    pub type_: ActionType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<ServerGroup>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,

    /// Set by the executor when the action first runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

impl Action {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Same action ignoring executor bookkeeping
    pub fn same_as(&self, other: &Action) -> bool {
        self.id == other.id
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ActionType {
    /// Add a member entry and create its volume and pod
    AddMember,
    /// Drop a member entry and delete its pod and volume
    RemoveMember,
    /// Wipe a failed member and start it again under the same id
    RecreateMember,
    /// Create the pod of an existing member
    RecreateMemberPod,
    /// Delete a labelled pod or volume that belongs to no member
    RemoveOrphan,
    CleanOutMember,
    ShutdownMember,
    WaitForMemberUp,
    /// Replace the pod because its template changed
    RotateMember,
    /// Replace the pod with a new image version
    UpgradeMember,
    ResizeVolume,
    RenewTlsCertificate,
    RefreshJwtSecret,
    UpdateUserPassword,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// SHA-256 digests of security relevant secrets
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretHashes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_jwt: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_ca: Option<String>,

    /// User name to password secret digest
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<String, String>,
}

/// Result of discovering what an image runs
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageInfo {
    pub image: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,

    pub arangodb_version: String,

    #[serde(default)]
    pub enterprise: bool,
}
