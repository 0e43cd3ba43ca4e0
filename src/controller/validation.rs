//! Validation of ArangoDeployment specs
//!
//! Covers the spec on its own and changes against the last accepted spec:
//! - Member counts and their bounds per server group
//! - Image, TLS lifetime, volume sizes and enum-like string fields
//! - Fields that cannot change once the deployment was bootstrapped

use crate::controller::error::{Error, Result};
use crate::controller::features::{ArangoVersion, discover_image};
use crate::crd::{
    DeploymentMode, DeploymentSpec, ServerGroup, StorageEngine, parse_duration_secs,
};
use crate::resources::pvc::parse_quantity;

/// Upper bound for members of one group
pub const MAX_MEMBERS: i32 = 100;

const EXTERNAL_ACCESS_TYPES: [&str; 4] = ["Auto", "None", "LoadBalancer", "NodePort"];
const PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Validate a deployment spec
pub fn validate_spec(spec: &DeploymentSpec) -> Result<()> {
    validate_image(spec)?;
    for group in ServerGroup::ALL {
        if spec.uses_group(group) {
            validate_group(spec, group)?;
        }
    }
    validate_tls(spec)?;
    validate_enums(spec)?;
    Ok(())
}

fn validate_image(spec: &DeploymentSpec) -> Result<()> {
    let image = discover_image(spec.image())?;
    if spec.storage_engine() == StorageEngine::MmFiles {
        let version = ArangoVersion::parse(&image.arangodb_version);
        if version.is_some_and(|v| v >= ArangoVersion::new(3, 7, 0)) {
            return Err(Error::ValidationError(format!(
                "storage engine MMFiles is not available in ArangoDB {}",
                image.arangodb_version
            )));
        }
    }
    Ok(())
}

fn validate_group(spec: &DeploymentSpec, group: ServerGroup) -> Result<()> {
    let group_spec = spec.group_spec(group);
    let count = spec.group_count(group);
    let min = spec.group_min_count(group);

    if count < min {
        return Err(Error::ValidationError(format!(
            "{}.count {} is below the minimum of {}",
            group, count, min
        )));
    }
    if count > MAX_MEMBERS {
        return Err(Error::ValidationError(format!(
            "{}.count {} exceeds the maximum of {}",
            group, count, MAX_MEMBERS
        )));
    }
    if let Some(max) = group_spec.max_count {
        if count > max {
            return Err(Error::ValidationError(format!(
                "{}.count {} exceeds {}.maxCount {}",
                group, count, group, max
            )));
        }
        if min > max {
            return Err(Error::ValidationError(format!(
                "{}.minCount {} exceeds {}.maxCount {}",
                group, min, group, max
            )));
        }
    }

    match (spec.mode(), group) {
        (DeploymentMode::Single, ServerGroup::Single) if count != 1 => {
            return Err(Error::ValidationError(format!(
                "single.count must be 1 in Single mode, got {}",
                count
            )));
        }
        (DeploymentMode::ActiveFailover, ServerGroup::Single) if count < 2 => {
            return Err(Error::ValidationError(format!(
                "single.count must be at least 2 in ActiveFailover mode, got {}",
                count
            )));
        }
        _ => {}
    }

    if let Some(size) = &group_spec.volume_size {
        if parse_quantity(size).is_none_or(|bytes| bytes == 0) {
            return Err(Error::ValidationError(format!(
                "{}.volumeSize {:?} is not a valid quantity",
                group, size
            )));
        }
    }

    Ok(())
}

fn validate_tls(spec: &DeploymentSpec) -> Result<()> {
    if !spec.is_secure() {
        return Ok(());
    }
    match parse_duration_secs(spec.tls_ttl()) {
        Some(secs) if secs > 0 => Ok(()),
        _ => Err(Error::ValidationError(format!(
            "tls.ttl {:?} is not a valid duration",
            spec.tls_ttl()
        ))),
    }
}

fn validate_enums(spec: &DeploymentSpec) -> Result<()> {
    if let Some(type_) = spec
        .external_access
        .as_ref()
        .and_then(|e| e.type_.as_deref())
    {
        if !EXTERNAL_ACCESS_TYPES.contains(&type_) {
            return Err(Error::ValidationError(format!(
                "externalAccess.type {:?} must be one of {:?}",
                type_, EXTERNAL_ACCESS_TYPES
            )));
        }
    }
    if let Some(policy) = spec.image_pull_policy.as_deref() {
        if !PULL_POLICIES.contains(&policy) {
            return Err(Error::ValidationError(format!(
                "imagePullPolicy {:?} must be one of {:?}",
                policy, PULL_POLICIES
            )));
        }
    }
    Ok(())
}

/// Reject changes to fields fixed when the deployment was bootstrapped
pub fn validate_spec_change(accepted: &DeploymentSpec, spec: &DeploymentSpec) -> Result<()> {
    if accepted.mode() != spec.mode() {
        return Err(Error::ValidationError(format!(
            "mode cannot change from {:?} to {:?}",
            accepted.mode(),
            spec.mode()
        )));
    }
    if accepted.storage_engine() != spec.storage_engine() {
        return Err(Error::ValidationError(format!(
            "storageEngine cannot change from {:?} to {:?}",
            accepted.storage_engine(),
            spec.storage_engine()
        )));
    }
    let accepted_agents = accepted.group_count(ServerGroup::Agents);
    let agents = spec.group_count(ServerGroup::Agents);
    if accepted_agents != agents {
        return Err(Error::ValidationError(format!(
            "agents.count cannot change from {} to {}",
            accepted_agents, agents
        )));
    }
    Ok(())
}
