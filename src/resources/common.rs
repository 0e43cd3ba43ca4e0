//! Names, labels and owner references shared by all generated objects

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use crate::crd::{ArangoDeployment, ServerGroup};

/// API version for ArangoDeployment CRD
pub const API_VERSION: &str = "database.arangodb.com/v1";

/// Kind for ArangoDeployment CRD
pub const KIND: &str = "ArangoDeployment";

/// Operator field manager name for server-side apply
pub const FIELD_MANAGER: &str = "arango-operator";

pub const LABEL_DEPLOYMENT: &str = "arangodb.com/deployment";
pub const LABEL_ROLE: &str = "arangodb.com/role";
pub const LABEL_MEMBER_ID: &str = "arangodb.com/member-id";

/// Hash of the inputs a member pod was built from
pub const ANNOTATION_TEMPLATE_HASH: &str = "arangodb.com/template-hash";

/// RFC3339 expiry of the certificate stored in a member TLS secret
pub const ANNOTATION_TLS_EXPIRES_AT: &str = "arangodb.com/tls-expires-at";

/// Generate an owner reference for an ArangoDeployment
///
/// Pods, volumes and secrets created for the deployment are garbage
/// collected with it.
pub fn owner_reference(deployment: &ArangoDeployment) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: KIND.to_string(),
        name: deployment.name_any(),
        uid: deployment.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels carried by every object belonging to a deployment
pub fn standard_labels(deployment_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "arangodb".to_string(),
        ),
        (
            "app.kubernetes.io/instance".to_string(),
            deployment_name.to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
        (LABEL_DEPLOYMENT.to_string(), deployment_name.to_string()),
    ])
}

/// Labels of the pod and volume of one member
pub fn member_labels(
    deployment_name: &str,
    group: ServerGroup,
    member_id: &str,
) -> BTreeMap<String, String> {
    let mut labels = standard_labels(deployment_name);
    labels.insert(LABEL_ROLE.to_string(), group.role().to_string());
    labels.insert(LABEL_MEMBER_ID.to_string(), member_id.to_string());
    labels
}

/// Label selector matching everything created for a deployment
pub fn deployment_selector(deployment_name: &str) -> String {
    format!("{}={}", LABEL_DEPLOYMENT, deployment_name)
}

pub fn member_pod_name(deployment_name: &str, group: ServerGroup, member_id: &str) -> String {
    format!(
        "{}-{}-{}",
        deployment_name,
        group.role(),
        member_id.to_lowercase()
    )
}

pub fn member_pvc_name(deployment_name: &str, group: ServerGroup, member_id: &str) -> String {
    format!(
        "{}-{}-{}",
        deployment_name,
        group.role(),
        member_id.to_lowercase()
    )
}

pub fn member_tls_secret_name(
    deployment_name: &str,
    group: ServerGroup,
    member_id: &str,
) -> String {
    format!(
        "{}-{}-{}-tls",
        deployment_name,
        group.role(),
        member_id.to_lowercase()
    )
}

/// Name of the headless service members are registered under
pub fn internal_service_name(deployment_name: &str) -> String {
    format!("{}-int", deployment_name)
}

pub fn member_dns_name(
    deployment_name: &str,
    namespace: &str,
    group: ServerGroup,
    member_id: &str,
) -> String {
    format!(
        "{}.{}.{}.svc",
        member_pod_name(deployment_name, group, member_id),
        internal_service_name(deployment_name),
        namespace
    )
}

/// DNS name of the client facing service (coordinators or single servers)
pub fn deployment_dns_name(deployment_name: &str, namespace: &str) -> String {
    format!("{}.{}.svc", deployment_name, namespace)
}
