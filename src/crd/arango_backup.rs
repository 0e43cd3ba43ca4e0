use std::fmt;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ArangoBackup is the Schema for the arangobackups API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "backup.arangodb.com",
    version = "v1",
    kind = "ArangoBackup",
    plural = "arangobackups",
    shortname = "arangobackup",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Deployment", "type":"string", "jsonPath":".spec.deployment.name"}"#,
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Available", "type":"boolean", "jsonPath":".status.available"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Deployment the backup is taken from (same namespace)
    pub deployment: DeploymentRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<BackupOptions>,

    /// Restore an existing backup from a remote repository instead of creating one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<BackupDownload>,

    /// Copy the backup to a remote repository once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<BackupUpload>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupOptions {
    /// Seconds the database may spend acquiring the global lock
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_inconsistent: Option<bool>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupUpload {
    #[serde(rename = "repositoryURL")]
    pub repository_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupDownload {
    #[serde(rename = "repositoryURL")]
    pub repository_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_secret_name: Option<String>,

    /// Id of the backup in the remote repository
    pub id: String,
}

/// Status of an ArangoBackup
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub state: BackupState,

    /// RFC3339 time the state was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Progress of a running upload or download job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<BackupProgress>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupDetails>,

    /// Whether the backup can be restored on the deployment
    #[serde(default)]
    pub available: bool,

    /// Consecutive temporary failures in the current state
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<String>,

    /// Spec generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupProgress {
    #[serde(rename = "jobID")]
    pub job_id: String,

    /// Percent done, "0%" to "100%"
    #[serde(default)]
    pub progress: String,
}

/// Metadata of the backup stored on the database
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupDetails {
    pub id: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub potentially_inconsistent: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_in_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number_of_dbservers: Option<u32>,

    /// RFC3339 creation time reported by the database
    #[serde(default)]
    pub creation_timestamp: String,

    /// Set once the backup has been copied to the upload repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded: Option<bool>,

    /// Set when the backup was obtained from a remote repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded: Option<bool>,
}

/// Position of a backup in its lifecycle
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum BackupState {
    #[default]
    #[serde(rename = "")]
    None,
    Scheduled,
    Download,
    Create,
    Upload,
    Ready,
    Deleted,
    Failed,
}

impl BackupState {
    pub const ALL: [BackupState; 8] = [
        BackupState::None,
        BackupState::Scheduled,
        BackupState::Download,
        BackupState::Create,
        BackupState::Upload,
        BackupState::Ready,
        BackupState::Deleted,
        BackupState::Failed,
    ];

    /// States no handler moves out of on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupState::Deleted | BackupState::Failed)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupState::None => write!(f, "None"),
            other => write!(f, "{:?}", other),
        }
    }
}

impl ArangoBackup {
    pub fn state(&self) -> BackupState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
