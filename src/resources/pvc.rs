use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use kube::core::ObjectMeta;

use crate::crd::{ArangoDeployment, MemberStatus, ServerGroup};
use crate::resources::common::{member_labels, member_pvc_name, owner_reference};

/// Volume size used when the group spec names none
pub const DEFAULT_VOLUME_SIZE: &str = "8Gi";

/// Requested volume size of a group
pub fn desired_volume_size(deployment: &ArangoDeployment, group: ServerGroup) -> String {
    deployment
        .spec
        .group_spec(group)
        .volume_size
        .clone()
        .unwrap_or_else(|| DEFAULT_VOLUME_SIZE.to_string())
}

/// Name of the claim backing a member, preferring the one recorded in status
pub fn member_claim_name(deployment_name: &str, group: ServerGroup, member: &MemberStatus) -> String {
    member
        .persistent_volume_claim_name
        .clone()
        .unwrap_or_else(|| member_pvc_name(deployment_name, group, &member.id))
}

/// Generate the data volume claim of a member
pub fn build_member_pvc(
    deployment: &ArangoDeployment,
    group: ServerGroup,
    member: &MemberStatus,
) -> PersistentVolumeClaim {
    let name = deployment.name_any();
    let group_spec = deployment.spec.group_spec(group);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(member_claim_name(&name, group, member)),
            namespace: deployment.namespace(),
            labels: Some(member_labels(&name, group, &member.id)),
            owner_references: Some(vec![owner_reference(deployment)]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: group_spec.storage_class_name.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(desired_volume_size(deployment, group)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Requested storage of a claim in bytes
pub fn requested_bytes(pvc: &PersistentVolumeClaim) -> Option<u64> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .and_then(|q| parse_quantity(&q.0))
}

/// Parse a Kubernetes storage quantity such as "8Gi", "500M" or "1024" into bytes
pub fn parse_quantity(value: &str) -> Option<u64> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, suffix) = value.split_at(split);
    let number: f64 = number.parse().ok()?;
    let factor: f64 = match suffix {
        "" => 1.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "Pi" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let bytes = number * factor;
    if !bytes.is_finite() || bytes < 0.0 {
        return None;
    }
    Some(bytes.round() as u64)
}
