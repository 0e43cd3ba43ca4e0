//! Member Status Tracker
//!
//! Keeps the per-member records in the deployment status in line with what
//! the platform reports: readiness and termination conditions, the bounded
//! termination history and crash-loop detection. Members are only added and
//! removed through the plan executor.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::controller::conditions::{remove_condition, set_condition, timestamp};
use crate::controller::observed::ObservedState;
use crate::crd::{
    ConditionType, DeploymentStatus, MAX_RECENT_TERMINATIONS, MemberPhase, MemberStatus,
    ServerGroup,
};
use crate::resources::common::{member_pod_name, member_pvc_name};

/// Terminations within [`CRASH_LOOP_WINDOW_MINUTES`] that mark a member failed
pub const CRASH_LOOP_THRESHOLD: usize = 5;
pub const CRASH_LOOP_WINDOW_MINUTES: i64 = 10;

/// Add a member entry in phase None, returns the new entry
///
/// Adding an id that already exists returns the existing entry untouched.
pub fn add_member<'a>(
    status: &'a mut DeploymentStatus,
    deployment_name: &str,
    group: ServerGroup,
    id: &str,
    now: &DateTime<Utc>,
) -> &'a mut MemberStatus {
    let members = status.members.group_mut(group);
    let index = match members.iter().position(|m| m.id == id) {
        Some(index) => index,
        None => {
            members.push(MemberStatus {
                id: id.to_string(),
                phase: MemberPhase::None,
                created_at: timestamp(now),
                pod_name: Some(member_pod_name(deployment_name, group, id)),
                persistent_volume_claim_name: group
                    .has_volume()
                    .then(|| member_pvc_name(deployment_name, group, id)),
                ..Default::default()
            });
            members.len() - 1
        }
    };
    &mut members[index]
}

pub fn remove_member(
    status: &mut DeploymentStatus,
    group: ServerGroup,
    id: &str,
) -> Option<MemberStatus> {
    let members = status.members.group_mut(group);
    let index = members.iter().position(|m| m.id == id)?;
    Some(members.remove(index))
}

/// Reset a member to a fresh start under the same id
pub fn reset_member(member: &mut MemberStatus, now: &DateTime<Utc>) {
    member.phase = MemberPhase::None;
    member.initialized = false;
    member.conditions.clear();
    member.recent_terminations.clear();
    member.image = None;
    member.created_at = timestamp(now);
}

/// Record a termination time, keeping at most [`MAX_RECENT_TERMINATIONS`]
///
/// Returns false if the time was already recorded.
pub fn record_termination(member: &mut MemberStatus, at: &str) -> bool {
    if member.recent_terminations.iter().any(|t| t == at) {
        return false;
    }
    member.recent_terminations.push(at.to_string());
    member.recent_terminations.sort();
    let excess = member
        .recent_terminations
        .len()
        .saturating_sub(MAX_RECENT_TERMINATIONS);
    member.recent_terminations.drain(..excess);
    true
}

/// Number of recorded terminations inside the crash-loop window
pub fn recent_termination_count(member: &MemberStatus, now: &DateTime<Utc>) -> usize {
    let since = *now - Duration::minutes(CRASH_LOOP_WINDOW_MINUTES);
    member
        .recent_terminations
        .iter()
        .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
        .filter(|t| t.with_timezone(&Utc) >= since)
        .count()
}

pub fn is_crash_looping(member: &MemberStatus, now: &DateTime<Utc>) -> bool {
    recent_termination_count(member, now) >= CRASH_LOOP_THRESHOLD
}

/// Update member records from the observed platform state
///
/// Returns whether any member record changed.
pub fn track(status: &mut DeploymentStatus, observed: &ObservedState) -> bool {
    let now = observed.now;
    let mut changed = false;

    for group in ServerGroup::ALL {
        for member in status.members.group_mut(group).iter_mut() {
            let pod = observed.pod(&member.id);

            let ready = pod.map(|p| p.ready).unwrap_or(false);
            let reason = match pod {
                Some(p) if p.ready => "PodReady",
                Some(_) => "PodNotReady",
                None => "PodMissing",
            };
            changed |= set_condition(&mut member.conditions, ConditionType::Ready, ready, reason, "", &now);

            let terminated = pod.map(|p| p.terminated).unwrap_or(false);
            if terminated {
                changed |= set_condition(
                    &mut member.conditions,
                    ConditionType::Terminated,
                    true,
                    "ContainerTerminated",
                    "",
                    &now,
                );
            } else {
                changed |= remove_condition(&mut member.conditions, ConditionType::Terminated);
            }

            if let Some(at) = pod.and_then(|p| p.last_termination_at.as_deref()) {
                if record_termination(member, at) {
                    info!(member = %member.id, group = %group, at = %at, "Member terminated");
                    changed = true;
                }
            }

            if ready && !member.initialized {
                member.initialized = true;
                changed = true;
            }
            if ready && member.phase == MemberPhase::None {
                member.phase = MemberPhase::Created;
                changed = true;
            }

            if member.phase != MemberPhase::Failed
                && !member.is_leaving()
                && is_crash_looping(member, &now)
            {
                warn!(
                    member = %member.id,
                    group = %group,
                    terminations = member.recent_terminations.len(),
                    "Member is crash looping, marking it failed"
                );
                member.phase = MemberPhase::Failed;
                set_condition(
                    &mut member.conditions,
                    ConditionType::Failed,
                    true,
                    "CrashLoop",
                    &format!(
                        "terminated {} times within {} minutes",
                        CRASH_LOOP_THRESHOLD, CRASH_LOOP_WINDOW_MINUTES
                    ),
                    &now,
                );
                changed = true;
            }
        }
    }

    changed
}

/// Adopt secret digests that have never been recorded
///
/// The JWT and CA digests are taken over on first sight; user password
/// digests are only recorded once the password has been applied.
pub fn record_initial_secret_hashes(status: &mut DeploymentStatus, observed: &ObservedState) -> bool {
    let mut changed = false;
    if status.secret_hashes.auth_jwt.is_none() && observed.secret_hashes.auth_jwt.is_some() {
        status.secret_hashes.auth_jwt = observed.secret_hashes.auth_jwt.clone();
        changed = true;
    }
    if status.secret_hashes.tls_ca != observed.secret_hashes.tls_ca {
        status.secret_hashes.tls_ca = observed.secret_hashes.tls_ca.clone();
        changed = true;
    }
    changed
}
