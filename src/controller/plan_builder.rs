//! Plan Builder
//!
//! Computes the ordered list of actions that moves a deployment one step
//! closer to its spec. The builder is a pure function of the spec, the
//! recorded status and the observed platform state: it performs no I/O and
//! only fails permanently, on a desired state it cannot reach.
//!
//! Rules are evaluated in a fixed priority order and the first rule that
//! produces actions wins. Within a rule, members are visited in role
//! priority order and then by id, so identical inputs give identical plans.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Duration;
use sha2::{Digest, Sha256};

use crate::controller::conditions::timestamp;
use crate::controller::error::{Error, Result};
use crate::controller::features::{ArangoVersion, Feature, discover_image, validate_version_change};
use crate::controller::observed::ObservedState;
use crate::crd::{
    Action, ActionType, ConditionType, DeploymentMode, DeploymentSpec, DeploymentStatus,
    ImageInfo, MemberPhase, MemberStatus, ServerGroup, parse_duration_secs,
};
use crate::resources::pod::template_hash;
use crate::resources::pvc::{DEFAULT_VOLUME_SIZE, parse_quantity};

pub const PARAM_IMAGE: &str = "image";
pub const PARAM_HASH: &str = "hash";
pub const PARAM_SIZE: &str = "size";
pub const PARAM_KIND: &str = "kind";
pub const PARAM_NAME: &str = "name";
pub const PARAM_USER: &str = "user";
pub const PARAM_SECRET: &str = "secret";
pub const PARAM_EXPIRES_AT: &str = "expiresAt";

/// Plan rules in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanRule {
    /// Failed members, missing or terminated pods, orphaned objects
    Cleanup,
    /// TLS certificate renewal, JWT secret rotation, user passwords
    SecurityRotation,
    ScaleDown,
    ScaleUp,
    /// Image, pod template and volume size changes, one member at a time
    Rotation,
}

impl PlanRule {
    pub const ALL: [PlanRule; 5] = [
        PlanRule::Cleanup,
        PlanRule::SecurityRotation,
        PlanRule::ScaleDown,
        PlanRule::ScaleUp,
        PlanRule::Rotation,
    ];

    /// Condition reported while a plan produced by this rule runs
    pub fn progress_condition(&self) -> Option<ConditionType> {
        match self {
            PlanRule::ScaleDown => Some(ConditionType::ScaleDownInProgress),
            PlanRule::ScaleUp => Some(ConditionType::ScaleUpInProgress),
            PlanRule::Rotation => Some(ConditionType::RotationInProgress),
            PlanRule::Cleanup | PlanRule::SecurityRotation => None,
        }
    }

    fn evaluate(&self, input: &PlanInput<'_>, notes: &mut Vec<PlanNote>) -> Result<Vec<Action>> {
        match self {
            PlanRule::Cleanup => Ok(cleanup(input)),
            PlanRule::SecurityRotation => Ok(security_rotation(input, notes)),
            PlanRule::ScaleDown => Ok(scale_down(input)),
            PlanRule::ScaleUp => Ok(scale_up(input)),
            PlanRule::Rotation => rotation(input),
        }
    }
}

impl fmt::Display for PlanRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a rule that should have fired was skipped
#[derive(Debug, Clone, PartialEq)]
pub struct PlanNote {
    pub rule: PlanRule,
    /// Condition the reconciler records the note under
    pub condition: ConditionType,
    pub reason: String,
    pub message: String,
}

/// Result of one planning pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Rule that produced the actions, `None` for an empty plan
    pub rule: Option<PlanRule>,
    pub notes: Vec<PlanNote>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

struct PlanInput<'a> {
    spec: &'a DeploymentSpec,
    status: &'a DeploymentStatus,
    observed: &'a ObservedState,
    image: ImageInfo,
}

/// Compute the plan for one reconciliation pass
pub fn build_plan(
    spec: &DeploymentSpec,
    status: &DeploymentStatus,
    observed: &ObservedState,
) -> Result<Plan> {
    let input = PlanInput {
        spec,
        status,
        observed,
        image: discover_image(spec.image())?,
    };

    let mut notes = Vec::new();
    for rule in PlanRule::ALL {
        let actions = rule.evaluate(&input, &mut notes)?;
        if !actions.is_empty() {
            return Ok(Plan {
                actions,
                rule: Some(rule),
                notes,
            });
        }
    }

    Ok(Plan {
        actions: Vec::new(),
        rule: None,
        notes,
    })
}

/// Content derived action id, stable across passes
fn action_id(
    type_: ActionType,
    group: Option<ServerGroup>,
    member_id: Option<&str>,
    params: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(type_.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(group.map(|g| g.as_str()).unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(member_id.unwrap_or("").as_bytes());
    for (key, value) in params {
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hex::encode(&hasher.finalize()[..8])
}

pub fn new_action(
    type_: ActionType,
    group: Option<ServerGroup>,
    member_id: Option<&str>,
    reason: &str,
    params: &[(&str, String)],
) -> Action {
    let params: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Action {
        id: action_id(type_, group, member_id, &params),
        type_,
        group,
        member_id: member_id.map(str::to_string),
        reason: (!reason.is_empty()).then(|| reason.to_string()),
        params,
        start_time: None,
    }
}

fn member_action(type_: ActionType, group: ServerGroup, member: &MemberStatus, reason: &str) -> Action {
    new_action(type_, Some(group), Some(&member.id), reason, &[])
}

/// Members that take part in normal operation
fn active_members(status: &DeploymentStatus) -> impl Iterator<Item = (ServerGroup, &MemberStatus)> {
    status
        .members
        .iter()
        .filter(|(_, m)| m.phase != MemberPhase::Failed && !m.is_leaving())
}

fn cleanup(input: &PlanInput<'_>) -> Vec<Action> {
    let mut actions = Vec::new();

    for (group, member) in input.status.members.iter() {
        if member.phase == MemberPhase::Failed {
            if group == ServerGroup::Agents || !member.initialized {
                actions.push(member_action(
                    ActionType::RecreateMember,
                    group,
                    member,
                    "member failed",
                ));
            } else {
                actions.push(member_action(
                    ActionType::RemoveMember,
                    group,
                    member,
                    "member failed",
                ));
            }
            continue;
        }
        if member.is_leaving() {
            continue;
        }
        match input.observed.pod(&member.id) {
            None => actions.push(member_action(
                ActionType::RecreateMemberPod,
                group,
                member,
                "pod missing",
            )),
            Some(pod) if pod.terminated => actions.push(member_action(
                ActionType::RecreateMemberPod,
                group,
                member,
                "pod terminated",
            )),
            Some(_) => {}
        }
    }

    for orphan in &input.observed.orphans {
        actions.push(new_action(
            ActionType::RemoveOrphan,
            orphan.group,
            None,
            "object belongs to no member",
            &[
                (PARAM_KIND, orphan.kind.as_str().to_string()),
                (PARAM_NAME, orphan.name.clone()),
            ],
        ));
    }

    actions
}

/// Whether users can be managed, i.e. a coordinator or single server is ready
fn cluster_serving(status: &DeploymentStatus) -> bool {
    active_members(status).any(|(group, m)| {
        matches!(group, ServerGroup::Coordinators | ServerGroup::Single) && m.is_ready()
    })
}

fn blocked(feature: Feature, image: &ImageInfo, what: String) -> PlanNote {
    PlanNote {
        rule: PlanRule::SecurityRotation,
        condition: ConditionType::SecurityRotationBlocked,
        reason: format!("{}-unsupported", feature.name()),
        message: format!(
            "{}; {} requires ArangoDB 3.7.0 Enterprise, image runs {} {}",
            what,
            feature.name(),
            image.arangodb_version,
            if image.enterprise {
                "Enterprise"
            } else {
                "Community"
            }
        ),
    }
}

fn security_rotation(input: &PlanInput<'_>, notes: &mut Vec<PlanNote>) -> Vec<Action> {
    let spec = input.spec;
    let status = input.status;
    let observed = input.observed;
    let mut actions = Vec::new();

    if spec.is_secure() {
        let ttl = parse_duration_secs(spec.tls_ttl()).unwrap_or(0);
        let threshold = Duration::seconds(ttl / 3);
        let expiring: Vec<(ServerGroup, &MemberStatus, String)> = active_members(status)
            .filter_map(|(group, m)| {
                let expires = observed.member(&m.id)?.tls_expires_at?;
                (expires - observed.now < threshold).then(|| (group, m, timestamp(&expires)))
            })
            .collect();

        if !expiring.is_empty() {
            if Feature::TlsRotation.supported_by(&input.image) {
                for (group, member, expires_at) in expiring {
                    actions.push(new_action(
                        ActionType::RenewTlsCertificate,
                        Some(group),
                        Some(&member.id),
                        "certificate expires soon",
                        &[(PARAM_EXPIRES_AT, expires_at)],
                    ));
                }
            } else {
                notes.push(blocked(
                    Feature::TlsRotation,
                    &input.image,
                    format!("{} member certificates expire soon", expiring.len()),
                ));
            }
        }
    }

    if spec.is_authenticated() {
        if let (Some(recorded), Some(current)) = (
            status.secret_hashes.auth_jwt.as_ref(),
            observed.secret_hashes.auth_jwt.as_ref(),
        ) {
            if recorded != current {
                if Feature::JwtRotation.supported_by(&input.image) {
                    actions.push(new_action(
                        ActionType::RefreshJwtSecret,
                        None,
                        None,
                        "JWT secret changed",
                        &[(PARAM_HASH, current.clone())],
                    ));
                } else {
                    notes.push(blocked(
                        Feature::JwtRotation,
                        &input.image,
                        "JWT secret changed".to_string(),
                    ));
                }
            }
        }
    }

    if cluster_serving(status) {
        for (user, secret) in &spec.bootstrap.password_secret_names {
            let Some(current) = observed.secret_hashes.users.get(user) else {
                continue;
            };
            if status.secret_hashes.users.get(user) != Some(current) {
                actions.push(new_action(
                    ActionType::UpdateUserPassword,
                    None,
                    None,
                    "password secret changed",
                    &[
                        (PARAM_USER, user.clone()),
                        (PARAM_SECRET, secret.clone()),
                        (PARAM_HASH, current.clone()),
                    ],
                ));
            }
        }
    }

    actions
}

/// Steps that take a member out of the cluster, depending on how far it got
pub fn removal_steps(group: ServerGroup, member: &MemberStatus, reason: &str) -> Vec<Action> {
    let mut steps = Vec::new();
    match member.phase {
        MemberPhase::ShutDown => {}
        MemberPhase::CleanedOut => {
            steps.push(member_action(ActionType::ShutdownMember, group, member, reason));
        }
        _ => {
            if group.requires_clean_out() {
                steps.push(member_action(ActionType::CleanOutMember, group, member, reason));
            }
            steps.push(member_action(ActionType::ShutdownMember, group, member, reason));
        }
    }
    steps.push(member_action(ActionType::RemoveMember, group, member, reason));
    steps
}

fn scale_down(input: &PlanInput<'_>) -> Vec<Action> {
    let spec = input.spec;

    for group in ServerGroup::ALL {
        let members = input.status.members.group(group);
        let desired = spec.group_count(group).max(0) as usize;
        if members.len() <= desired {
            continue;
        }
        let min = if spec.uses_group(group) {
            spec.group_min_count(group).max(0) as usize
        } else {
            0
        };
        if members.len() <= min {
            continue;
        }

        // Members already on their way out first, then the newest
        let victim = members
            .iter()
            .filter(|m| m.initialized && m.phase != MemberPhase::Failed)
            .max_by(|a, b| {
                (a.is_leaving(), &a.created_at, &a.id).cmp(&(b.is_leaving(), &b.created_at, &b.id))
            });
        if let Some(victim) = victim {
            return removal_steps(group, victim, "scale down");
        }
    }

    Vec::new()
}

/// Deterministic id of the member created for an ordinal of a group
pub fn member_id(deployment_uid: &str, group: ServerGroup, ordinal: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}/{}/{}", deployment_uid, group.as_str(), ordinal).as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", group.id_prefix(), &digest[..8])
}

/// Ids for `count` new members, using the lowest ordinals not taken yet
pub fn new_member_ids(
    deployment_uid: &str,
    group: ServerGroup,
    existing: &[MemberStatus],
    count: usize,
) -> Vec<String> {
    (0u32..)
        .map(|ordinal| member_id(deployment_uid, group, ordinal))
        .filter(|id| !existing.iter().any(|m| &m.id == id))
        .take(count)
        .collect()
}

fn scale_up(input: &PlanInput<'_>) -> Vec<Action> {
    let spec = input.spec;
    let status = input.status;

    let agent_ready = status
        .members
        .group(ServerGroup::Agents)
        .iter()
        .any(|m| m.is_ready());
    let single_ready = status
        .members
        .group(ServerGroup::Single)
        .iter()
        .any(|m| m.is_ready());

    let mut actions = Vec::new();
    for group in ServerGroup::ALL {
        if !spec.uses_group(group) {
            continue;
        }
        let members = status.members.group(group);
        let desired = spec.group_count(group).max(0) as usize;
        if members.len() >= desired {
            continue;
        }

        let gated = match group {
            ServerGroup::Agents => false,
            ServerGroup::Single => spec.mode() == DeploymentMode::ActiveFailover && !agent_ready,
            _ => group.needs_bootstrap_peer() && !(agent_ready || single_ready),
        };
        if gated {
            continue;
        }

        for id in new_member_ids(
            &input.observed.deployment_uid,
            group,
            members,
            desired - members.len(),
        ) {
            actions.push(new_action(
                ActionType::AddMember,
                Some(group),
                Some(&id),
                "scale up",
                &[],
            ));
        }
    }
    actions
}

fn check_image_change(current: &ImageInfo, target: &ImageInfo) -> Result<()> {
    if current.enterprise && !target.enterprise {
        return Err(Error::UnsupportedUpgrade(format!(
            "cannot change from Enterprise image {} to Community image {}",
            current.image, target.image
        )));
    }
    if current.arangodb_version == target.arangodb_version {
        return Ok(());
    }
    let parse = |v: &str| {
        ArangoVersion::parse(v)
            .ok_or_else(|| Error::ValidationError(format!("unknown ArangoDB version {:?}", v)))
    };
    validate_version_change(
        parse(&current.arangodb_version)?,
        parse(&target.arangodb_version)?,
    )
}

fn rotation(input: &PlanInput<'_>) -> Result<Vec<Action>> {
    let spec = input.spec;
    let target = &input.image;

    if let Some(current) = &input.status.current_image {
        check_image_change(current, target)?;
    }

    if let Some((group, member)) = active_members(input.status).find(|(_, m)| !m.is_ready()) {
        return Ok(vec![member_action(
            ActionType::WaitForMemberUp,
            group,
            member,
            "member not ready",
        )]);
    }

    for (group, member) in active_members(input.status) {
        let Some(pod) = input.observed.pod(&member.id) else {
            continue;
        };
        let hash = template_hash(spec, group, member, target);
        let wait = member_action(ActionType::WaitForMemberUp, group, member, "after restart");

        if pod.image.as_deref() != Some(target.image.as_str()) {
            return Ok(vec![
                new_action(
                    ActionType::UpgradeMember,
                    Some(group),
                    Some(&member.id),
                    "image changed",
                    &[(PARAM_IMAGE, target.image.clone()), (PARAM_HASH, hash)],
                ),
                wait,
            ]);
        }

        if pod.template_hash.as_deref() != Some(hash.as_str()) {
            return Ok(vec![
                new_action(
                    ActionType::RotateMember,
                    Some(group),
                    Some(&member.id),
                    "pod template changed",
                    &[(PARAM_HASH, hash)],
                ),
                wait,
            ]);
        }

        if group.has_volume() {
            let size = spec
                .group_spec(group)
                .volume_size
                .clone()
                .unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string());
            let desired = parse_quantity(&size);
            let current = input
                .observed
                .member(&member.id)
                .and_then(|m| m.volume.as_ref())
                .and_then(|v| v.size_bytes);
            // Shrinking is not supported by the platform and is ignored
            if let (Some(desired), Some(current)) = (desired, current) {
                if current < desired {
                    return Ok(vec![
                        new_action(
                            ActionType::ResizeVolume,
                            Some(group),
                            Some(&member.id),
                            "volume size increased",
                            &[(PARAM_SIZE, size)],
                        ),
                        wait,
                    ]);
                }
            }
        }
    }

    Ok(Vec::new())
}
