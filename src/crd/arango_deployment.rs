use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{DeploymentStatus, ServerGroup};

/// Image used when the spec does not name one
pub const DEFAULT_IMAGE: &str = "arangodb/arangodb:3.7.10";

/// Secret name value that disables authentication or TLS
pub const SECRET_NAME_NONE: &str = "None";

/// Default lifetime of generated TLS certificates
pub const DEFAULT_TLS_TTL: &str = "2610h";

/// ArangoDeployment is the Schema for the arangodeployments API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "database.arangodb.com",
    version = "v1",
    kind = "ArangoDeployment",
    plural = "arangodeployments",
    shortname = "arangodb",
    namespaced,
    status = "DeploymentStatus",
    printcolumn = r#"{"name":"Mode", "type":"string", "jsonPath":".spec.mode"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Deployment topology (defaults to Cluster)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<DeploymentMode>,

    /// Development or Production; Production enforces anti-affinity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,

    /// Storage engine the cluster is bootstrapped with (defaults to RocksDB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_engine: Option<StorageEngine>,

    /// ArangoDB image, e.g. "arangodb/arangodb:3.7.10"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Allow operations that take the deployment down temporarily
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downtime_allowed: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_access: Option<ExternalAccessSpec>,

    #[serde(default)]
    pub authentication: AuthenticationSpec,

    #[serde(default)]
    pub tls: TlsSpec,

    #[serde(default)]
    pub license: LicenseSpec,

    #[serde(default)]
    pub bootstrap: BootstrapSpec,

    #[serde(default)]
    pub sync: SyncSpec,

    #[serde(default)]
    pub single: ServerGroupSpec,

    #[serde(default)]
    pub agents: ServerGroupSpec,

    #[serde(default)]
    pub dbservers: ServerGroupSpec,

    #[serde(default)]
    pub coordinators: ServerGroupSpec,

    #[serde(default)]
    pub syncmasters: ServerGroupSpec,

    #[serde(default)]
    pub syncworkers: ServerGroupSpec,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum DeploymentMode {
    Single,
    ActiveFailover,
    #[default]
    Cluster,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum StorageEngine {
    #[serde(rename = "MMFiles")]
    MmFiles,
    #[default]
    RocksDB,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccessSpec {
    /// Auto, None, LoadBalancer or NodePort
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Secret holding the cluster JWT secret; "None" disables authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the CA certificate; "None" disables TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,

    /// Lifetime of member certificates, e.g. "2610h"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LicenseSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapSpec {
    /// Database user name to the secret holding its password
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub password_secret_names: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Settings shared by all members of one server group
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    /// Requested size of each member volume, e.g. "8Gi"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size: Option<String>,

    /// Extra command line arguments for the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_detected_total_memory: Option<bool>,
}

/// Resource requirements for member pods
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// CPU and memory quantities
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl DeploymentSpec {
    pub fn mode(&self) -> DeploymentMode {
        self.mode.unwrap_or_default()
    }

    pub fn environment(&self) -> Environment {
        self.environment.unwrap_or_default()
    }

    pub fn storage_engine(&self) -> StorageEngine {
        self.storage_engine.unwrap_or_default()
    }

    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    pub fn downtime_allowed(&self) -> bool {
        self.downtime_allowed.unwrap_or(false)
    }

    pub fn sync_enabled(&self) -> bool {
        self.sync.enabled.unwrap_or(false)
    }

    /// Name of the JWT secret, `None` when authentication is disabled
    pub fn jwt_secret_name(&self, deployment_name: &str) -> Option<String> {
        match self.authentication.jwt_secret_name.as_deref() {
            Some(SECRET_NAME_NONE) => None,
            Some(name) => Some(name.to_string()),
            None => Some(format!("{}-jwt", deployment_name)),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authentication.jwt_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }

    /// Name of the TLS CA secret, `None` when TLS is disabled
    pub fn tls_ca_secret_name(&self, deployment_name: &str) -> Option<String> {
        match self.tls.ca_secret_name.as_deref() {
            Some(SECRET_NAME_NONE) => None,
            Some(name) => Some(name.to_string()),
            None => Some(format!("{}-ca", deployment_name)),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.tls.ca_secret_name.as_deref() != Some(SECRET_NAME_NONE)
    }

    pub fn tls_ttl(&self) -> &str {
        self.tls.ttl.as_deref().unwrap_or(DEFAULT_TLS_TTL)
    }

    /// Whether the deployment mode runs members of the given group
    pub fn uses_group(&self, group: ServerGroup) -> bool {
        match (self.mode(), group) {
            (DeploymentMode::Single, ServerGroup::Single) => true,
            (DeploymentMode::ActiveFailover, ServerGroup::Single | ServerGroup::Agents) => true,
            (
                DeploymentMode::Cluster,
                ServerGroup::Agents | ServerGroup::DbServers | ServerGroup::Coordinators,
            ) => true,
            (DeploymentMode::Cluster, ServerGroup::SyncMasters | ServerGroup::SyncWorkers) => {
                self.sync_enabled()
            }
            _ => false,
        }
    }

    pub fn group_spec(&self, group: ServerGroup) -> &ServerGroupSpec {
        match group {
            ServerGroup::Single => &self.single,
            ServerGroup::Agents => &self.agents,
            ServerGroup::DbServers => &self.dbservers,
            ServerGroup::Coordinators => &self.coordinators,
            ServerGroup::SyncMasters => &self.syncmasters,
            ServerGroup::SyncWorkers => &self.syncworkers,
        }
    }

    /// Desired member count of a group, applying mode defaults
    pub fn group_count(&self, group: ServerGroup) -> i32 {
        if !self.uses_group(group) {
            return 0;
        }
        if let Some(count) = self.group_spec(group).count {
            return count;
        }
        match (self.mode(), group) {
            (DeploymentMode::Single, _) => 1,
            (DeploymentMode::ActiveFailover, ServerGroup::Single) => 2,
            _ => 3,
        }
    }

    /// Lowest member count scale-down may reach for a group
    pub fn group_min_count(&self, group: ServerGroup) -> i32 {
        let spec_min = self.group_spec(group).min_count.unwrap_or(0);
        spec_min.max(group.minimum_count())
    }
}

/// Parse a duration such as "2610h", "90d", "30m" or "45s" into seconds
pub fn parse_duration_secs(value: &str) -> Option<i64> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = value.split_at(split);
    let number: i64 = number.parse().ok()?;
    let factor = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        _ => return None,
    };
    number.checked_mul(factor)
}
